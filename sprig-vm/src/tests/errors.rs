use sprig_asm::ExceptionKind;

use crate::util::test_helpers::TestMachine;
use crate::value::Value;

#[test]
fn out_of_range_vector_access() {
    let mut tm = TestMachine::new();
    let e = tm.eval_exception("(vector-ref (make-vector 3 'a) 5)");
    assert_eq!(e.kind, ExceptionKind::IndexOutOfRange);
    assert!(e.message.contains("vector-ref"));
}

#[test]
fn division_by_zero() {
    let mut tm = TestMachine::new();
    let e = tm.eval_exception("(/ 1 0)");
    assert_eq!(e.kind, ExceptionKind::DivideByZero);
}

#[test]
fn type_errors_name_the_operation() {
    let mut tm = TestMachine::new();
    let e = tm.eval_exception("(car 5)");
    assert_eq!(e.kind, ExceptionKind::Type);
    assert!(e.message.contains("car"));
    let e = tm.eval_exception("(+ 'a 1)");
    assert_eq!(e.kind, ExceptionKind::Type);
    assert!(e.message.contains('+'));
}

#[test]
fn undefined_variable_read() {
    let mut tm = TestMachine::new();
    let e = tm.eval_exception("never-bound-anywhere");
    assert_eq!(e.kind, ExceptionKind::UndefinedVariable);
}

#[test]
fn arity_mismatches() {
    let mut tm = TestMachine::new();
    let e = tm.eval_exception("((lambda (x y) x) 1)");
    assert_eq!(e.kind, ExceptionKind::NotEnoughArgs);
    let e = tm.eval_exception("((lambda (x) x) 1 2)");
    assert_eq!(e.kind, ExceptionKind::TooManyArgs);
}

#[test]
fn applying_a_non_procedure() {
    let mut tm = TestMachine::new();
    let e = tm.eval_exception("(7 8)");
    assert_eq!(e.kind, ExceptionKind::NotAProcedure);
}

#[test]
fn a_type_check_failure_aborts_the_rest_of_the_call() {
    let (mut tm, sink) = TestMachine::with_captured_output();
    let e = tm.eval_exception("(begin (car 5) (display \"unreachable\"))");
    assert_eq!(e.kind, ExceptionKind::Type);
    assert_eq!(sink.contents(), "");
}

#[test]
fn handler_receives_the_exception_and_its_result_resumes() {
    let mut tm = TestMachine::new();
    let handler = tm.eval("(lambda (e) 99)");
    assert!(matches!(handler, Value::Procedure(_)));
    tm.machine.set_error_handler(handler);
    // The handler runs on the same stack; returning normally resumes the
    // raising site with the handler's value as the operation's result.
    assert_eq!(tm.eval_fixnum("(car 5)"), 99);
    assert_eq!(tm.eval_fixnum("(+ 1 (car 5))"), 100);
}

#[test]
fn raise_enters_the_handler_with_arbitrary_values() {
    let mut tm = TestMachine::new();
    let handler = tm.eval("(lambda (e) (if (fixnum? e) (+ e 1) 'other))");
    tm.machine.set_error_handler(handler);
    assert_eq!(tm.eval_fixnum("(raise 41)"), 42);
}

#[test]
fn without_a_handler_the_exception_is_the_result() {
    let mut tm = TestMachine::new();
    let e = tm.eval_exception("(raise (make-exception 'user-error \"boom\" '() #f #f))");
    assert_eq!(e.kind, ExceptionKind::User);
    assert_eq!(e.message, "boom");
}

#[test]
fn exceptions_record_the_raising_procedure() {
    let mut tm = TestMachine::new();
    let e = tm.eval_exception("(define (oops) (car 5)) (oops)");
    let procedure = e.procedure.borrow();
    match &*procedure {
        Value::Procedure(p) => assert_eq!(p.name(), Some("oops")),
        other => panic!("expected procedure attribution, got {other}"),
    }
}

#[test]
fn exception_predicate_sees_exception_values() {
    let mut tm = TestMachine::new();
    let handler = tm.eval("(lambda (e) (exception? e))");
    tm.machine.set_error_handler(handler);
    assert!(matches!(tm.eval("(car 5)"), Value::Boolean(true)));
}

#[test]
fn deep_recursion_overflows_gracefully() {
    let mut tm = TestMachine::new();
    // Non-tail recursion must hit the stack ceiling, not abort the host.
    let e = tm.eval_exception(
        "(letrec ((grow (lambda (n) (if (= n 0) 0 (+ 1 (grow (- n 1))))))) (grow 1000000))",
    );
    assert_eq!(e.kind, ExceptionKind::OutOfStack);
}

#[test]
fn stack_trace_names_the_call_chain() {
    let mut tm = TestMachine::new();
    // The inner call sits in operand position so the caller's frame is
    // preserved (a tail call would reuse it and drop out of the trace).
    let e = tm.eval_exception(
        "(define (inner) (car 5))
         (define (outer) (+ 1 (inner)))
         (outer)",
    );
    assert_eq!(e.kind, ExceptionKind::Type);
    let mut buf = Vec::new();
    tm.machine.stack_trace(&mut buf).unwrap();
    let trace = String::from_utf8(buf).unwrap();
    assert!(trace.contains("called from outer"), "trace was: {trace}");

}

#[test]
fn stack_dump_marks_the_frame_pointer() {
    let mut tm = TestMachine::new();
    let proc = match tm.eval("(lambda () 1)") {
        Value::Procedure(p) => p,
        other => panic!("expected procedure, got {other}"),
    };
    // A freshly spawned thread holds only the sentinel frame.
    let ctx = tm.machine.spawn(proc);
    let mut dump = Vec::new();
    crate::backtrace::print_stack(&ctx, &mut dump).unwrap();
    let dump = String::from_utf8(dump).unwrap();
    assert_eq!(dump.lines().count(), 4);
    assert!(dump.lines().next().unwrap().starts_with('*'));
}

#[test]
fn stack_trace_includes_source_attributes() {
    use crate::ast::{Ast, LambdaNode};
    use crate::util::test_helpers::{Analyzer, parse};

    let mut tm = TestMachine::new();
    tm.eval("(define (helper) (car 5))");
    // A lambda carrying a source attribute, with the failure one call
    // deeper in operand position so its own frame stays on the chain.
    let lam = LambdaNode::new(vec![], None);
    *lam.name.borrow_mut() = Some("broken".into());
    *lam.source.borrow_mut() = Some(("demo.scm".into(), 3));
    let body = Analyzer::new(tm.machine.globals()).analyze(&parse("(+ 0 (helper))"));
    *lam.body.borrow_mut() = body;
    let call = Ast::App(vec![Ast::Lambda(lam)]);
    let v = tm.machine.eval(&call).unwrap();
    assert!(matches!(v, Value::Exception(_)));

    let mut buf = Vec::new();
    tm.machine.stack_trace(&mut buf).unwrap();
    let trace = String::from_utf8(buf).unwrap();
    assert!(
        trace.contains("on line 3 of file demo.scm"),
        "trace was: {trace}"
    );
}
