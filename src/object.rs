//! Heap object model, per spec §3.
//!
//! The teacher (`runtime::js_cell` / `heap::header`) reaches every heap
//! object through an intrusive singly-linked list threaded through a GC
//! header, because its engine needs precise tracing. Spec §9 points out
//! that "an arena owning all objects of the VM is simpler" for a VM with no
//! GC — so the VM's object list here is just `Vec<Rc<Obj>>`: push on
//! allocation, drop the whole vector at teardown. Invariant 2 (every heap
//! object reachable until teardown) falls out of that for free, and
//! invariant 1 (one heap string per byte sequence) is the string intern
//! table's job (`intern.rs`), not this module's.

use crate::upvalue::Upvalue;
use std::cell::RefCell;
use std::rc::Rc;

use crate::value::Value;

/// One-byte tag used by `IS_OBJ_TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjTag {
    Str = 0,
    Struct = 1,
    Proto = 2,
    Closure = 3,
    Upvalue = 4,
}

impl ObjTag {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => ObjTag::Str,
            1 => ObjTag::Struct,
            2 => ObjTag::Proto,
            3 => ObjTag::Closure,
            4 => ObjTag::Upvalue,
            _ => return None,
        })
    }
}

/// A contiguous slice of bytecode describing a function body. No opcode in
/// spec §4.4 allocates one directly today (`FUNCTION` yields a bare `Ip`
/// value); it exists so `IS_OBJ_TYPE`'s tag space matches spec §3's full
/// heap-object taxonomy and so a richer compiler has somewhere to land a
/// first-class function value without changing the object model.
#[derive(Debug, Clone, Copy)]
pub struct Proto {
    pub start: usize,
    pub end: usize,
}

/// A prototype plus its captured upvalues. See `Proto`'s doc comment: the
/// current opcode set builds closures out of plain structs (an ip value
/// plus upvalue references packed with `STRUCT`), so this variant is part
/// of the object model's tag space rather than something any handler
/// constructs today.
#[derive(Clone)]
pub struct Closure {
    pub proto: Rc<Obj>,
    /// Each entry is an `Obj::Upvalue`, the same representation `REF_LOCAL`
    /// pushes onto the value stack — never a bare `Upvalue` — so a closed-
    /// over slot and its upvalue value agree on one underlying cell.
    pub upvalues: Vec<Rc<Obj>>,
}

pub enum Obj {
    Str(String),
    Struct(RefCell<Vec<Value>>),
    Proto(Proto),
    Closure(Closure),
    Upvalue(RefCell<Upvalue>),
}

impl Obj {
    pub fn tag(&self) -> ObjTag {
        match self {
            Obj::Str(_) => ObjTag::Str,
            Obj::Struct(_) => ObjTag::Struct,
            Obj::Proto(_) => ObjTag::Proto,
            Obj::Closure(_) => ObjTag::Closure,
            Obj::Upvalue(_) => ObjTag::Upvalue,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Obj::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&RefCell<Vec<Value>>> {
        match self {
            Obj::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_upvalue(&self) -> Option<&RefCell<Upvalue>> {
        match self {
            Obj::Upvalue(cell) => Some(cell),
            _ => None,
        }
    }

    pub fn print(&self) -> String {
        match self {
            Obj::Str(s) => s.clone(),
            Obj::Struct(fields) => {
                let fields = fields.borrow();
                let parts: Vec<String> = fields.iter().map(Value::print).collect();
                format!("{{{}}}", parts.join(", "))
            }
            Obj::Proto(p) => format!("<fn {}..{}>", p.start, p.end),
            Obj::Closure(c) => format!("<closure {} upvalues>", c.upvalues.len()),
            Obj::Upvalue(_) => "<upvalue>".to_string(),
        }
    }
}
