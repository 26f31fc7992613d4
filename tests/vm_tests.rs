//! End-to-end scenarios, one per behavior spec §8 calls out: a literal
//! print, integer arithmetic, an iterative loop, a closure capturing a
//! local, string interning identity, and a fatal type mismatch.

mod common;

use clearvm::{RunState, Vm};
use common::*;

fn run(bytes: &[u8]) -> clearvm::VmResult<()> {
    let mut vm = Vm::init();
    let result = vm.execute(bytes);
    assert_eq!(vm.state(), if result.is_ok() { RunState::HaltedOk } else { RunState::HaltedErr });
    vm.teardown();
    result
}

#[test]
fn literal_print_runs_to_completion() {
    let mut p = Program::new();
    let idx = p.const_str("hello, clearvm");
    p.op1(PUSH_CONST, idx).op(PRINT);
    run(&p.build()).expect("printing a string constant should not fault");
}

#[test]
fn integer_arithmetic_computes_expected_value() {
    // (2 + 3) * 4 == 20, stored to global 0, then printed via STR+PRINT.
    let mut p = Program::new();
    let two = p.const_int(2);
    let three = p.const_int(3);
    let four = p.const_int(4);
    p.op1(PUSH_CONST, two)
        .op1(PUSH_CONST, three)
        .op(INT_ADD)
        .op1(PUSH_CONST, four)
        .op(INT_MUL)
        .op1(SET_GLOBAL, 0)
        .op1(PUSH_GLOBAL, 0)
        .op(STR)
        .op(PRINT);
    run(&p.build()).expect("pure integer arithmetic should not fault");
}

#[test]
fn iterative_loop_counts_down_to_zero() {
    // global 0 = 3; while global0 > 0 { global0 = global0 - 1 }
    let mut p = Program::new();
    let three = p.const_int(3);
    let one = p.const_int(1);
    let zero = p.const_int(0);
    p.op1(PUSH_CONST, three).op1(SET_GLOBAL, 0);

    let loop_start = p.here();
    p.op1(PUSH_GLOBAL, 0).op1(PUSH_CONST, zero).op(INT_GREATER);
    let exit_patch = p.reserve_jump(JUMP_IF_FALSE);
    p.op1(PUSH_GLOBAL, 0).op1(PUSH_CONST, one).op(INT_SUB).op1(SET_GLOBAL, 0);
    p.loop_to(loop_start);
    p.patch_forward(exit_patch);

    run(&p.build()).expect("a bounded countdown loop should terminate cleanly");
}

#[test]
fn closure_capture_sees_writes_to_its_local() {
    // local 0 = 10; ref = REF_LOCAL 0 (local 1); SET_LOCAL 0 (20); the
    // value read back through the reference must observe the later write.
    let mut p = Program::new();
    let ten = p.const_int(10);
    let twenty = p.const_int(20);
    p.op1(PUSH_CONST, ten)
        .op1(REF_LOCAL, 0)
        .op1(PUSH_CONST, twenty)
        .op1(SET_LOCAL, 0)
        .op1(PUSH_LOCAL, 1)
        .op(DEREF)
        .op(STR)
        .op(PRINT);
    run(&p.build()).expect("a closed-over local visible through an upvalue should not fault");
}

#[test]
fn string_interning_gives_pointer_identical_constants() {
    // Two constant-pool entries with identical text intern to the same
    // object, so EQUAL on them is true via pointer identity.
    let mut p = Program::new();
    let a = p.const_str("shared");
    let b = p.const_str("shared");
    p.op1(PUSH_CONST, a).op1(PUSH_CONST, b).op(EQUAL).op1(SET_GLOBAL, 0);
    run(&p.build()).expect("comparing two equal interned strings should not fault");
}

#[test]
fn type_mismatch_is_a_fatal_error() {
    let mut p = Program::new();
    let s = p.const_str("not an int");
    p.op1(PUSH_CONST, s).op(INT_NEG);
    let err = run(&p.build()).expect_err("negating a string should be a type error");
    assert!(matches!(err, clearvm::VmError::Type { .. }));
}

#[test]
fn stack_underflow_is_reported_with_an_offset() {
    let mut p = Program::new();
    p.op(INT_ADD);
    let err = run(&p.build()).expect_err("adding on an empty stack should underflow");
    assert!(matches!(err, clearvm::VmError::Underflow { .. }));
    assert_eq!(err.offset(), 1); // one byte past the constant-count header
}

#[test]
fn division_by_zero_is_an_arithmetic_error() {
    let mut p = Program::new();
    let ten = p.const_int(10);
    let zero = p.const_int(0);
    p.op1(PUSH_CONST, ten).op1(PUSH_CONST, zero).op(INT_DIV);
    let err = run(&p.build()).expect_err("integer division by zero should fault");
    assert!(matches!(err, clearvm::VmError::Arith { .. }));
}

#[test]
fn struct_round_trips_through_get_and_set_field() {
    let mut p = Program::new();
    let a = p.const_int(1);
    let b = p.const_int(2);
    let replacement = p.const_int(99);
    p.op1(PUSH_CONST, a)
        .op1(PUSH_CONST, b)
        .op1(STRUCT, 2) // fields: [b, a] (field 0 = last pushed = first popped)
        .op1(SET_GLOBAL, 0)
        .op1(PUSH_GLOBAL, 0)
        .op1(PUSH_CONST, replacement)
        .op1(SET_FIELD, 0)
        .op1(PUSH_GLOBAL, 0)
        .op1(GET_FIELD, 0)
        .op(POP);
    run(&p.build()).expect("struct field get/set should round-trip");
}
