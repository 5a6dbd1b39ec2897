use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::context::Context;
use crate::util::test_helpers::TestMachine;
use crate::value::Value;

fn spawn_thread(tm: &mut TestMachine, src: &str) -> Rc<RefCell<Context>> {
    let proc = match tm.eval(src) {
        Value::Procedure(p) => p,
        other => panic!("expected procedure, got {other}"),
    };
    tm.machine.spawn(proc)
}

/// Round-robin over the spawned threads; falls back to the root once every
/// child has been cancelled or finished.
fn install_round_robin(tm: &mut TestMachine, threads: Vec<Rc<RefCell<Context>>>) {
    let queue = Rc::new(RefCell::new(VecDeque::from(threads)));
    tm.machine.set_scheduler(Box::new(move |root| {
        let mut q = queue.borrow_mut();
        while let Some(c) = q.pop_front() {
            if c.borrow().refuel > 0 {
                q.push_back(c.clone());
                return c;
            }
        }
        root.clone()
    }));
}

#[test]
fn yield_interleaves_cooperating_threads() {
    let (mut tm, sink) = TestMachine::with_captured_output();
    let a = spawn_thread(
        &mut tm,
        "(lambda () (display \"a\") (yield) (display \"A\"))",
    );
    let b = spawn_thread(
        &mut tm,
        "(lambda () (display \"b\") (yield) (display \"B\"))",
    );
    install_round_robin(&mut tm, vec![a, b]);
    // The root yields once; children run to completion in scheduler order.
    tm.eval("(yield)");
    assert_eq!(sink.contents(), "abAB");
}

#[test]
fn children_never_return_to_the_host() {
    let (mut tm, sink) = TestMachine::with_captured_output();
    let a = spawn_thread(&mut tm, "(lambda () (display \"child\") 'child-result)");
    install_round_robin(&mut tm, vec![a.clone()]);
    let v = tm.eval("(begin (yield) 'root-result)");
    // The child's return value is swallowed; the root's comes back.
    match v {
        Value::Symbol(s) => assert_eq!(s.as_str(), "root-result"),
        other => panic!("expected root-result, got {other}"),
    }
    assert_eq!(sink.contents(), "child");
    assert!(a.borrow().refuel <= 0);
}

#[test]
fn fuel_exhaustion_preempts_without_explicit_yields() {
    let (mut tm, sink) = TestMachine::with_captured_output();
    // A long-running child that never yields still hands control back when
    // its fuel quantum runs out.
    let a = spawn_thread(
        &mut tm,
        "(lambda ()
           (letrec ((spin (lambda (n) (if (= n 0) 'done (spin (- n 1))))))
             (spin 10000))
           (display \"done\"))",
    );
    install_round_robin(&mut tm, vec![a]);
    tm.eval("(yield)");
    assert_eq!(sink.contents(), "done");
}

#[test]
fn cancelled_threads_are_never_resumed() {
    let (mut tm, sink) = TestMachine::with_captured_output();
    let a = spawn_thread(
        &mut tm,
        "(lambda () (display \"1\") (yield) (display \"2\"))",
    );
    // Cancellation is the scheduler refusing to resume: zero the quantum.
    a.borrow_mut().refuel = 0;
    install_round_robin(&mut tm, vec![a]);
    tm.eval("(yield)");
    assert_eq!(sink.contents(), "");
}

#[test]
fn scheduler_sees_the_root_thread() {
    let mut tm = TestMachine::new();
    let seen_root = Rc::new(RefCell::new(false));
    let seen = seen_root.clone();
    let root = tm.machine.root();
    tm.machine.set_scheduler(Box::new(move |r| {
        *seen.borrow_mut() = Rc::ptr_eq(r, &root);
        r.clone()
    }));
    tm.eval("(yield)");
    assert!(*seen_root.borrow());
}

#[test]
fn thread_state_survives_a_context_switch() {
    let (mut tm, sink) = TestMachine::with_captured_output();
    // The child builds local state across two scheduling points.
    let a = spawn_thread(
        &mut tm,
        "(lambda ()
           ((lambda (n)
              (yield)
              (set! n (+ n 1))
              (yield)
              (if (= n 42) (display \"ok\") (display \"lost\")))
            41))",
    );
    install_round_robin(&mut tm, vec![a]);
    tm.eval("(begin (yield) (yield) (yield))");
    assert_eq!(sink.contents(), "ok");
}
