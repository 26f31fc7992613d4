//! Dispatch loop, opcode handlers, and the `Vm` entry points, per spec §4.3,
//! §4.4, §4.6 and §6.
//!
//! The teacher dispatches method calls through `runtime::class::MethodTable`
//! slots; the same shape here is a `[Handler; NUM_OPCODES]` array indexed by
//! the raw opcode byte, which is the literal reading of spec §4.3's "table
//! of per-opcode handlers."

use crate::constants;
use crate::error::{VmError, VmResult};
use crate::globals::Globals;
use crate::intern::{StringInterner, MAX_STRING_LEN};
use crate::object::Obj;
use crate::opcode::Opcode;
use crate::stack::{Stack, STACK_MAX};
use crate::upvalue::Upvalue;
use crate::value::{ValTag, Value, EPSILON};
use log::{debug, trace};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::time::Instant;

const NUM_OPCODES: usize = 53;

/// Resource bounds, per spec §5. The hard defaults match the spec exactly;
/// the CLI may loosen `stack_max` / `string_table_initial_capacity` for
/// experimentation (SPEC_FULL §5), never the one-byte-encoded limits
/// (globals/constants/string-length/jump-offset width).
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub stack_max: usize,
    pub string_table_initial_capacity: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            stack_max: STACK_MAX,
            string_table_initial_capacity: 8,
        }
    }
}

/// Per spec §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    HaltedOk,
    HaltedErr,
}

/// The VM instance. Resources here persist across `execute` calls and are
/// released in the order spec §5 mandates: heap objects, then the intern
/// table, then the VM itself (the constant pool lives per-execution, see
/// `Exec`, so there is nothing left to free for it at this point).
pub struct Vm {
    heap: Vec<Rc<Obj>>,
    interner: StringInterner,
    globals: Globals,
    limits: Limits,
    start: Instant,
    state: RunState,
}

impl Vm {
    /// `init()`.
    pub fn init() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Vm {
            heap: Vec::new(),
            interner: StringInterner::with_initial_capacity(limits.string_table_initial_capacity),
            globals: Globals::new(),
            limits,
            start: Instant::now(),
            state: RunState::Running,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn alloc(&mut self, obj: Obj) -> Rc<Obj> {
        let rc = Rc::new(obj);
        self.heap.push(rc.clone());
        rc
    }

    /// `execute(vm, bytes, length)`. Loads the constant pool header, then
    /// runs the dispatch loop until end-of-buffer or a handler error.
    pub fn execute(&mut self, bytes: &[u8]) -> VmResult<()> {
        self.state = RunState::Running;
        let (constants, start) = constants::load(bytes, &mut self.interner)?;
        debug!("loaded {} constants, code starts at offset {}", constants.len(), start);

        let stack_max = self.limits.stack_max;
        let mut exec = Exec {
            vm: self,
            code: bytes,
            ip: start,
            instr_offset: start,
            fp: 0,
            stack: Stack::with_max(stack_max),
            return_reg: Value::Nil,
            constants,
        };
        let result = exec.run();
        self.state = match &result {
            Ok(()) => RunState::HaltedOk,
            Err(_) => RunState::HaltedErr,
        };
        result
    }

    /// `teardown(vm)`. Explicit so the drop order documented in spec §5
    /// does not depend on field declaration order surviving refactors.
    pub fn teardown(self) {
        let Vm { heap, interner, globals, .. } = self;
        drop(heap);
        drop(interner);
        drop(globals);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::init()
    }
}

/// Per-execution registers and working state: `ip`/`fp`/`sp` (the stack
/// carries `sp`), the return-value register, and the constant pool loaded
/// from this particular buffer's header. Borrows the persistent `Vm` for
/// the duration of one `execute` call.
struct Exec<'a> {
    vm: &'a mut Vm,
    code: &'a [u8],
    ip: usize,
    /// Offset of the opcode byte currently being handled, for diagnostics.
    instr_offset: usize,
    fp: usize,
    stack: Stack,
    return_reg: Value,
    constants: Vec<Value>,
}

type Handler = fn(&mut Exec) -> VmResult<()>;

static HANDLERS: [Handler; NUM_OPCODES] = [
    op_push_const,
    op_push_true,
    op_push_false,
    op_push_nil,
    op_set_global,
    op_push_global,
    op_set_local,
    op_push_local,
    op_int,
    op_bool,
    op_num,
    op_str,
    op_clock,
    op_print,
    op_pop,
    op_squash,
    op_int_neg,
    op_num_neg,
    op_int_add,
    op_int_sub,
    op_int_mul,
    op_int_div,
    op_num_add,
    op_num_sub,
    op_num_mul,
    op_num_div,
    op_str_cat,
    op_not,
    op_int_less,
    op_int_greater,
    op_num_less,
    op_num_greater,
    op_equal,
    op_jump,
    op_jump_if_false,
    op_loop,
    op_function,
    op_call,
    op_load_ip,
    op_load_fp,
    op_set_return,
    op_push_return,
    op_struct,
    op_destruct,
    op_get_field,
    op_extract_field,
    op_set_field,
    op_insert_field,
    op_ref_local,
    op_deref,
    op_set_ref,
    op_is_val_type,
    op_is_obj_type,
];

impl<'a> Exec<'a> {
    fn fetch_u8(&mut self) -> VmResult<u8> {
        let b = *self
            .code
            .get(self.ip)
            .ok_or_else(|| VmError::decode(self.ip, "truncated buffer fetching immediate"))?;
        self.ip += 1;
        Ok(b)
    }

    fn jump_forward(&mut self, off: usize) -> VmResult<()> {
        let target = self.ip + off;
        if target > self.code.len() {
            return Err(VmError::range(self.instr_offset, "jump target out of range"));
        }
        self.ip = target;
        Ok(())
    }

    fn jump_backward(&mut self, off: usize) -> VmResult<()> {
        let target = self
            .ip
            .checked_sub(off)
            .ok_or_else(|| VmError::range(self.instr_offset, "loop target out of range"))?;
        self.ip = target;
        Ok(())
    }

    /// Fetch-decode-execute, per spec §4.3 and §4.6.
    fn run(&mut self) -> VmResult<()> {
        loop {
            if self.ip >= self.code.len() {
                return Ok(());
            }
            self.instr_offset = self.ip;
            let raw = self.fetch_u8()?;
            let opcode = Opcode::from_u8(raw)
                .ok_or_else(|| VmError::decode(self.instr_offset, format!("unknown opcode {}", raw)))?;
            trace!("{:06} {:?}", self.instr_offset, opcode);
            let handler = HANDLERS[raw as usize];
            handler(self)?;
        }
    }

    fn pop_int(&mut self) -> VmResult<i32> {
        match self.stack.pop_raw(self.instr_offset)? {
            Value::Int(i) => Ok(i),
            other => Err(VmError::ty(self.instr_offset, format!("expected int, got {:?}", other.tag()))),
        }
    }

    fn pop_num(&mut self) -> VmResult<f64> {
        match self.stack.pop_raw(self.instr_offset)? {
            Value::Num(n) => Ok(n),
            other => Err(VmError::ty(self.instr_offset, format!("expected num, got {:?}", other.tag()))),
        }
    }

    fn pop_bool(&mut self) -> VmResult<bool> {
        match self.stack.pop_raw(self.instr_offset)? {
            Value::Bool(b) => Ok(b),
            other => Err(VmError::ty(self.instr_offset, format!("expected bool, got {:?}", other.tag()))),
        }
    }

    fn pop_str_bytes(&mut self) -> VmResult<String> {
        let v = self.stack.pop_raw(self.instr_offset)?;
        match v.as_obj().and_then(|o| o.as_str()) {
            Some(s) => Ok(s.to_string()),
            None => Err(VmError::ty(self.instr_offset, "expected string")),
        }
    }

    fn pop_struct_fields(&mut self) -> VmResult<Vec<Value>> {
        let v = self.stack.pop_raw(self.instr_offset)?;
        match v.as_obj().and_then(|o| o.as_struct()) {
            Some(fields) => Ok(fields.borrow().clone()),
            None => Err(VmError::ty(self.instr_offset, "expected struct")),
        }
    }
}

// ---------------------------------------------------------------------
// Constants and literals
// ---------------------------------------------------------------------

fn op_push_const(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let i = e.fetch_u8()? as usize;
    let value = e
        .constants
        .get(i)
        .cloned()
        .ok_or_else(|| VmError::range(off, format!("constant index {} out of range", i)))?;
    e.stack.push(value, off)
}

fn op_push_true(e: &mut Exec) -> VmResult<()> {
    e.stack.push(Value::Bool(true), e.instr_offset)
}

fn op_push_false(e: &mut Exec) -> VmResult<()> {
    e.stack.push(Value::Bool(false), e.instr_offset)
}

fn op_push_nil(e: &mut Exec) -> VmResult<()> {
    e.stack.push(Value::Nil, e.instr_offset)
}

// ---------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------

fn op_set_global(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let i = e.fetch_u8()?;
    let value = e.stack.pop_raw(off)?;
    e.vm.globals.set(i, value, off)
}

fn op_push_global(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let i = e.fetch_u8()?;
    let value = e.vm.globals.get(i, off)?;
    e.stack.push(value, off)
}

fn op_set_local(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let i = e.fetch_u8()?;
    let value = e.stack.pop_raw(off)?;
    e.stack.set_local(e.fp, i, value, off)
}

fn op_push_local(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let i = e.fetch_u8()?;
    let value = e.stack.get_local(e.fp, i, off)?;
    e.stack.push(value, off)
}

// ---------------------------------------------------------------------
// Type conversions
// ---------------------------------------------------------------------

fn op_int(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let slot = e.stack.peek_mut(0, off)?;
    *slot = match slot {
        Value::Bool(b) => Value::Int(*b as i32),
        Value::Int(i) => Value::Int(*i),
        Value::Nil => Value::Int(0),
        Value::Num(n) => Value::Int(*n as i32),
        _ => return Err(VmError::ty(off, "INT does not accept objects")),
    };
    Ok(())
}

fn op_bool(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let slot = e.stack.peek_mut(0, off)?;
    // spec §4.4 fixes this exactly as "num -> |x| < epsilon", not the usual
    // "nonzero is truthy" — an intentional quirk, not a typo.
    *slot = match slot {
        Value::Bool(b) => Value::Bool(*b),
        Value::Int(i) => Value::Bool(*i != 0),
        Value::Nil => Value::Bool(false),
        Value::Num(n) => Value::Bool(n.abs() < EPSILON),
        _ => return Err(VmError::ty(off, "BOOL does not accept objects")),
    };
    Ok(())
}

fn op_num(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let slot = e.stack.peek_mut(0, off)?;
    *slot = match slot {
        Value::Bool(b) => Value::Num(if *b { 1.0 } else { 0.0 }),
        Value::Int(i) => Value::Num(*i as f64),
        Value::Nil => Value::Num(0.0),
        Value::Num(n) => Value::Num(*n),
        _ => return Err(VmError::ty(off, "NUM does not accept objects")),
    };
    Ok(())
}

fn op_str(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let printed = e.stack.peek(0, off)?.print();
    if printed.len() > MAX_STRING_LEN {
        return Err(VmError::range(off, format!("STR result length {} exceeds {}", printed.len(), MAX_STRING_LEN)));
    }
    let interned = e.vm.interner.intern(printed.as_bytes());
    *e.stack.peek_mut(0, off)? = Value::Obj(interned);
    Ok(())
}

// ---------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------

fn op_clock(e: &mut Exec) -> VmResult<()> {
    let secs = e.vm.start.elapsed().as_secs_f64();
    e.stack.push(Value::Num(secs), e.instr_offset)
}

fn op_print(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let s = e.pop_str_bytes()?;
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{}", s).map_err(|err| VmError::io(off, err.to_string()))
}

// ---------------------------------------------------------------------
// Stack discipline
// ---------------------------------------------------------------------

fn op_pop(e: &mut Exec) -> VmResult<()> {
    e.stack.close_and_pop(e.instr_offset).map(|_| ())
}

fn op_squash(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let top = e.stack.pop_raw(off)?;
    *e.stack.peek_mut(0, off)? = top;
    Ok(())
}

// ---------------------------------------------------------------------
// Arithmetic and string
// ---------------------------------------------------------------------

fn op_int_neg(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let v = e.pop_int()?;
    e.stack.push(Value::Int(v.wrapping_neg()), off)
}

fn op_num_neg(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let v = e.pop_num()?;
    e.stack.push(Value::Num(-v), off)
}

fn op_int_add(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let b = e.pop_int()?;
    let a = e.pop_int()?;
    e.stack.push(Value::Int(a.wrapping_add(b)), off)
}

fn op_int_sub(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let b = e.pop_int()?;
    let a = e.pop_int()?;
    e.stack.push(Value::Int(a.wrapping_sub(b)), off)
}

fn op_int_mul(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let b = e.pop_int()?;
    let a = e.pop_int()?;
    e.stack.push(Value::Int(a.wrapping_mul(b)), off)
}

fn op_int_div(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let b = e.pop_int()?;
    let a = e.pop_int()?;
    if b == 0 {
        return Err(VmError::arith(off, "integer division by zero"));
    }
    e.stack.push(Value::Int(a.wrapping_div(b)), off)
}

fn op_num_add(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let b = e.pop_num()?;
    let a = e.pop_num()?;
    e.stack.push(Value::Num(a + b), off)
}

fn op_num_sub(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let b = e.pop_num()?;
    let a = e.pop_num()?;
    e.stack.push(Value::Num(a - b), off)
}

fn op_num_mul(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let b = e.pop_num()?;
    let a = e.pop_num()?;
    e.stack.push(Value::Num(a * b), off)
}

fn op_num_div(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let b = e.pop_num()?;
    let a = e.pop_num()?;
    // IEEE-754 division by zero yields +-inf/NaN, not an error (spec §4.4).
    e.stack.push(Value::Num(a / b), off)
}

fn op_str_cat(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let b = e.pop_str_bytes()?;
    let a = e.pop_str_bytes()?;
    let concatenated = a + &b;
    if concatenated.len() > MAX_STRING_LEN {
        return Err(VmError::range(off, format!("STR_CAT result length {} exceeds {}", concatenated.len(), MAX_STRING_LEN)));
    }
    let interned = e.vm.interner.intern(concatenated.as_bytes());
    e.stack.push(Value::Obj(interned), off)
}

fn op_not(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let b = e.pop_bool()?;
    e.stack.push(Value::Bool(!b), off)
}

// ---------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------

fn op_int_less(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let b = e.pop_int()?;
    let a = e.pop_int()?;
    e.stack.push(Value::Bool(a < b), off)
}

fn op_int_greater(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let b = e.pop_int()?;
    let a = e.pop_int()?;
    e.stack.push(Value::Bool(a > b), off)
}

fn op_num_less(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let b = e.pop_num()?;
    let a = e.pop_num()?;
    e.stack.push(Value::Bool(a < b - EPSILON), off)
}

fn op_num_greater(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let b = e.pop_num()?;
    let a = e.pop_num()?;
    e.stack.push(Value::Bool(a > b + EPSILON), off)
}

fn op_equal(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let b = e.stack.pop_raw(off)?;
    let a = e.stack.pop_raw(off)?;
    e.stack.push(Value::Bool(a.equal(&b)), off)
}

// ---------------------------------------------------------------------
// Control flow
// ---------------------------------------------------------------------

fn op_jump(e: &mut Exec) -> VmResult<()> {
    let off = e.fetch_u8()? as usize;
    e.jump_forward(off)
}

fn op_jump_if_false(e: &mut Exec) -> VmResult<()> {
    let off = e.fetch_u8()? as usize;
    let cond = e.pop_bool()?;
    if !cond {
        e.jump_forward(off)?;
    }
    Ok(())
}

fn op_loop(e: &mut Exec) -> VmResult<()> {
    let off = e.fetch_u8()? as usize;
    e.jump_backward(off)
}

// ---------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------

fn op_function(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let jump_off = e.fetch_u8()? as usize;
    let after_immediate = e.ip;
    e.stack.push(Value::Ip(after_immediate), off)?;
    e.jump_forward(jump_off)
}

fn op_call(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let n = e.fetch_u8()?;
    let callee = match e.stack.pop_raw(off)? {
        Value::Ip(ip) => ip,
        other => return Err(VmError::ty(off, format!("CALL expects an ip callee, got {:?}", other.tag()))),
    };
    if callee > e.code.len() {
        return Err(VmError::range(off, "call target out of range"));
    }
    let mut args = Vec::with_capacity(n as usize);
    for _ in 0..n {
        args.push(e.stack.pop_raw(off)?);
    }
    args.reverse();
    e.stack.push(Value::Ip(e.ip), off)?;
    e.stack.push(Value::Fp(e.fp), off)?;
    e.fp = e.stack.len();
    for arg in args {
        e.stack.push(arg, off)?;
    }
    e.ip = callee;
    Ok(())
}

fn op_load_ip(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    match e.stack.pop_raw(off)? {
        Value::Ip(ip) => {
            if ip > e.code.len() {
                return Err(VmError::range(off, "LOAD_IP target out of range"));
            }
            e.ip = ip;
            Ok(())
        }
        other => Err(VmError::ty(off, format!("LOAD_IP expects an ip value, got {:?}", other.tag()))),
    }
}

fn op_load_fp(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    match e.stack.pop_raw(off)? {
        Value::Fp(fp) => {
            if fp > e.stack.len() {
                return Err(VmError::range(off, "LOAD_FP target out of range"));
            }
            e.fp = fp;
            Ok(())
        }
        other => Err(VmError::ty(off, format!("LOAD_FP expects an fp value, got {:?}", other.tag()))),
    }
}

fn op_set_return(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    e.return_reg = e.stack.pop_raw(off)?;
    Ok(())
}

fn op_push_return(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let v = e.return_reg.clone();
    e.stack.push(v, off)
}

// ---------------------------------------------------------------------
// Structs
// ---------------------------------------------------------------------

fn op_struct(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let n = e.fetch_u8()? as usize;
    let mut fields = Vec::with_capacity(n);
    for _ in 0..n {
        fields.push(e.stack.pop_raw(off)?);
    }
    let obj = e.vm.alloc(Obj::Struct(RefCell::new(fields)));
    e.stack.push(Value::Obj(obj), off)
}

fn op_destruct(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let k = e.fetch_u8()? as usize;
    let fields = e.pop_struct_fields()?;
    if k > fields.len() {
        return Err(VmError::range(off, format!("DESTRUCT skip {} exceeds field count {}", k, fields.len())));
    }
    for field in &fields[k..] {
        e.stack.push(field.clone(), off)?;
    }
    Ok(())
}

fn op_get_field(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let i = e.fetch_u8()? as usize;
    let fields = e.pop_struct_fields()?;
    let value = fields
        .get(i)
        .cloned()
        .ok_or_else(|| VmError::range(off, format!("field index {} out of range", i)))?;
    e.stack.push(value, off)
}

fn op_extract_field(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let depth = e.fetch_u8()? as usize;
    let i = e.fetch_u8()? as usize;
    let target = e.stack.peek(depth, off)?.clone();
    let fields = target
        .as_obj()
        .and_then(|o| o.as_struct())
        .ok_or_else(|| VmError::ty(off, "EXTRACT_FIELD expects a struct"))?
        .borrow();
    let value = fields
        .get(i)
        .cloned()
        .ok_or_else(|| VmError::range(off, format!("field index {} out of range", i)))?;
    drop(fields);
    e.stack.push(value, off)
}

fn op_set_field(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let i = e.fetch_u8()? as usize;
    let value = e.stack.pop_raw(off)?;
    let target = e.stack.peek(0, off)?.clone();
    let fields = target
        .as_obj()
        .and_then(|o| o.as_struct())
        .ok_or_else(|| VmError::ty(off, "SET_FIELD expects a struct"))?;
    let mut fields = fields.borrow_mut();
    if i >= fields.len() {
        return Err(VmError::range(off, format!("field index {} out of range", i)));
    }
    fields[i] = value;
    Ok(())
}

fn op_insert_field(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let depth = e.fetch_u8()? as usize;
    let i = e.fetch_u8()? as usize;
    let value = e.stack.pop_raw(off)?;
    let target = e.stack.peek(depth, off)?.clone();
    let fields = target
        .as_obj()
        .and_then(|o| o.as_struct())
        .ok_or_else(|| VmError::ty(off, "INSERT_FIELD expects a struct"))?;
    let mut fields = fields.borrow_mut();
    if i >= fields.len() {
        return Err(VmError::range(off, format!("field index {} out of range", i)));
    }
    fields[i] = value;
    Ok(())
}

// ---------------------------------------------------------------------
// Upvalues and references
// ---------------------------------------------------------------------

fn op_ref_local(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let i = e.fetch_u8()?;
    let abs_index = e.fp + i as usize;
    let up = e.vm.alloc(Obj::Upvalue(RefCell::new(Upvalue::new_open(abs_index))));
    e.stack.attach_upvalue(e.fp, i, up.clone(), off)?;
    e.stack.push(Value::Obj(up), off)
}

fn op_deref(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let top = e.stack.peek(0, off)?.clone();
    let up_cell = top
        .as_obj()
        .and_then(|o| o.as_upvalue())
        .ok_or_else(|| VmError::ty(off, "DEREF expects an upvalue reference"))?;
    let value = match &*up_cell.borrow() {
        Upvalue::Open(idx) => e.stack.read_at(*idx, off)?,
        Upvalue::Closed(v) => v.clone(),
    };
    *e.stack.peek_mut(0, off)? = value;
    Ok(())
}

fn op_set_ref(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let reference = e.stack.pop_raw(off)?;
    let value = e.stack.pop_raw(off)?;
    let up_cell = reference
        .as_obj()
        .and_then(|o| o.as_upvalue())
        .ok_or_else(|| VmError::ty(off, "SET_REF expects an upvalue reference"))?;
    let idx = match &*up_cell.borrow() {
        Upvalue::Open(idx) => Some(*idx),
        Upvalue::Closed(_) => None,
    };
    match idx {
        Some(idx) => e.stack.write_at(idx, value, off),
        None => {
            *up_cell.borrow_mut() = Upvalue::Closed(value);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------
// Type tests
// ---------------------------------------------------------------------

fn op_is_val_type(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let t = e.fetch_u8()?;
    let want = ValTag::from_u8(t).ok_or_else(|| VmError::range(off, format!("unknown value tag {}", t)))?;
    let actual = e.stack.peek(0, off)?.tag();
    e.stack.push(Value::Bool(actual as u8 == want as u8), off)
}

fn op_is_obj_type(e: &mut Exec) -> VmResult<()> {
    let off = e.instr_offset;
    let t = e.fetch_u8()?;
    let want = crate::object::ObjTag::from_u8(t)
        .ok_or_else(|| VmError::range(off, format!("unknown object tag {}", t)))?;
    let top = e.stack.peek(0, off)?;
    let result = match top.as_obj() {
        Some(obj) => obj.tag() as u8 == want as u8,
        None => false,
    };
    e.stack.push(Value::Bool(result), off)
}
