use std::cell::RefCell;
use std::rc::Rc;

use sprig_asm::{ExceptionKind, OpClass, Opcode};

use crate::primops::PrimOp;
use crate::util::test_helpers::TestMachine;
use crate::value::{Bytes, Value};

/// Register a two-slot `point` record type with the accessors the object
/// layer would normally synthesize.
fn define_point(tm: &mut TestMachine) {
    let globals = tm.machine.globals();
    let mut g = globals.borrow_mut();
    let td = g.types.define_record_type("point", None);
    let index = Value::Fixnum(td.index as i64);

    let ctor = PrimOp::new("make-point", OpClass::Constructor, Opcode::Make, 0)
        .with_data(index.clone())
        .with_data2(Value::Fixnum(2));
    let x_ref = PrimOp::new("point-x", OpClass::Getter, Opcode::SlotRef, 1)
        .with_data(index.clone())
        .with_data2(Value::Fixnum(0));
    let x_set = PrimOp::new("point-x-set!", OpClass::Setter, Opcode::SlotSet, 2)
        .with_data(index)
        .with_data2(Value::Fixnum(0));

    g.define("point".into(), Value::Type(td));
    g.define("make-point".into(), Value::PrimOp(Rc::new(ctor)));
    g.define("point-x".into(), Value::PrimOp(Rc::new(x_ref)));
    g.define("point-x-set!".into(), Value::PrimOp(Rc::new(x_set)));
}

#[test]
fn records_allocate_and_access_slots() {
    let mut tm = TestMachine::new();
    define_point(&mut tm);
    tm.eval("(define p (make-point))");
    tm.eval("(point-x-set! p 7)");
    assert_eq!(tm.eval_fixnum("(point-x p)"), 7);
    assert_eq!(tm.eval_fixnum("(slot-ref point p 0)"), 7);
    tm.eval("(slot-set! point p 1 9)");
    assert_eq!(tm.eval_fixnum("(slot-ref point p 1)"), 9);
}

#[test]
fn slot_access_checks_the_precedence_chain() {
    let mut tm = TestMachine::new();
    define_point(&mut tm);
    assert!(matches!(tm.eval("(is-a? (make-point) point)"), Value::Boolean(true)));
    assert!(matches!(tm.eval("(is-a? 5 point)"), Value::Boolean(false)));
    let e = tm.eval_exception("(point-x 5)");
    assert_eq!(e.kind, ExceptionKind::Type);
    assert!(e.message.contains("slot-ref"));
    let e = tm.eval_exception("(slot-ref point 5 0)");
    assert_eq!(e.kind, ExceptionKind::Type);
}

#[test]
fn byte_vectors_are_bounds_and_range_checked() {
    let mut tm = TestMachine::new();
    tm.machine.define(
        "b",
        Value::Bytes(Rc::new(RefCell::new(Bytes {
            data: vec![1, 2, 3],
            immutable: false,
        }))),
    );
    assert_eq!(tm.eval_fixnum("(bytes-length b)"), 3);
    assert_eq!(tm.eval_fixnum("(bytes-ref b 1)"), 2);
    tm.eval("(bytes-set! b 0 255)");
    assert_eq!(tm.eval_fixnum("(bytes-ref b 0)"), 255);
    let e = tm.eval_exception("(bytes-ref b 9)");
    assert_eq!(e.kind, ExceptionKind::IndexOutOfRange);
    let e = tm.eval_exception("(bytes-set! b 0 999)");
    assert_eq!(e.kind, ExceptionKind::Type);
}

#[test]
fn immutable_objects_reject_mutation() {
    let mut tm = TestMachine::new();
    let pair = Value::cons(Value::Fixnum(1), Value::Fixnum(2));
    if let Value::Pair(p) = &pair {
        p.borrow_mut().immutable = true;
    }
    tm.machine.define("frozen", pair);
    let e = tm.eval_exception("(set-car! frozen 9)");
    assert_eq!(e.kind, ExceptionKind::Immutable);
}
