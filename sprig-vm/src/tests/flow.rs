use test_case::test_case;

use crate::util::test_helpers::TestMachine;
use crate::value::Value;

#[test_case("((lambda (x) (+ x 1)) 41)" => 42 ; "unary application")]
#[test_case("((lambda (x y) (- x y)) 50 8)" => 42 ; "binary application")]
#[test_case("(if #t 1 2)" => 1 ; "conditional consequent")]
#[test_case("(if #f 1 2)" => 2 ; "conditional alternate")]
#[test_case("(if 0 1 2)" => 1 ; "only false is false")]
#[test_case("(begin 1 2 3)" => 3 ; "sequence keeps the last value")]
#[test_case("(let ((x 40) (y 2)) (+ x y))" => 42 ; "let binds in parallel")]
#[test_case("((lambda (x) (set! x 7) x) 3)" => 7 ; "mutation boxes the parameter")]
#[test_case(
    "(let f ((xs '(10 20 30)) (acc 0)) (if (null? xs) acc (f (cdr xs) (+ acc (car xs)))))"
    => 60 ; "named let loop")]
#[test_case("(car '(1 2 3))" => 1 ; "car")]
#[test_case("(vector-ref (make-vector 3 9) 2)" => 9 ; "vector access")]
#[test_case("(length '(1 2 3 4))" => 4 ; "foreign call")]
#[test_case("(apply + '(1 2 3))" => 6 ; "apply splays its list")]
#[test_case("((lambda (f) (f 20 22)) +)" => 42 ; "primitive as a value")]
fn scenario(src: &str) -> i64 {
    TestMachine::new().eval_fixnum(src)
}

#[test]
fn variadic_rest_list() {
    let mut tm = TestMachine::new();
    let v = tm.eval("((lambda args args) 1 2 3)");
    assert_eq!(v.to_string(), "(1 2 3)");
    let v = tm.eval("((lambda (x . rest) rest) 1 2 3)");
    assert_eq!(v.to_string(), "(2 3)");
    let v = tm.eval("((lambda (x . rest) rest) 1)");
    assert!(matches!(v, Value::Nil));
}

#[test]
fn iterative_tail_calls_run_in_constant_space() {
    let mut tm = TestMachine::new();
    // A million iterations on an 8k-slot stack only finishes if tail calls
    // reuse the current frame.
    let v = tm.eval(
        "(letrec ((loop (lambda (n) (if (= n 0) 'done (loop (- n 1)))))) (loop 1000000))",
    );
    match v {
        Value::Symbol(s) => assert_eq!(s.as_str(), "done"),
        other => panic!("expected done, got {other}"),
    }
}

#[test]
fn mutual_recursion_in_tail_position() {
    let mut tm = TestMachine::new();
    let v = tm.eval(
        "(letrec ((even? (lambda (n) (if (= n 0) #t (odd? (- n 1)))))
                  (odd?  (lambda (n) (if (= n 0) #f (even? (- n 1))))))
           (even? 100000))",
    );
    assert!(matches!(v, Value::Boolean(true)));
}

#[test]
fn chained_comparisons_consume_their_operands() {
    let mut tm = TestMachine::new();
    assert!(matches!(tm.eval("(< 1 2 3)"), Value::Boolean(true)));
    assert!(matches!(tm.eval("(< 1 3 2)"), Value::Boolean(false)));
    assert!(matches!(tm.eval("(<= 1 1 2 2)"), Value::Boolean(true)));
    // The chain leaves exactly one value: usable in argument position.
    assert_eq!(tm.eval_fixnum("(if (< 1 2 3) 42 0)"), 42);
    assert_eq!(tm.eval_fixnum("((lambda (a b) (if a b 0)) (< 1 2 3) 42)"), 42);
}

#[test]
fn quoted_data_round_trips_identically() {
    let mut tm = TestMachine::new();
    assert!(matches!(tm.eval("'42"), Value::Fixnum(42)));
    assert!(matches!(tm.eval("'#t"), Value::Boolean(true)));
    assert!(matches!(tm.eval("'()"), Value::Nil));
    assert!(matches!(tm.eval("'#\\a"), Value::Char('a')));
    match tm.eval("'sym") {
        Value::Symbol(s) => assert_eq!(s.as_str(), "sym"),
        other => panic!("expected symbol, got {other}"),
    }
    match tm.eval("'1.5") {
        Value::Flonum(x) => assert_eq!(x, 1.5),
        other => panic!("expected flonum, got {other}"),
    }
}

#[test]
fn toplevel_defines_bind_globals() {
    let mut tm = TestMachine::new();
    assert_eq!(
        tm.eval_fixnum("(define (double x) (+ x x)) (double 21)"),
        42
    );
    assert_eq!(tm.eval_fixnum("(define forty 40) (+ forty 2)"), 42);
}

#[test]
fn type_predicates() {
    let mut tm = TestMachine::new();
    for (src, expect) in [
        ("(null? '())", true),
        ("(null? '(1))", false),
        ("(pair? '(1))", true),
        ("(pair? 1)", false),
        ("(fixnum? 3)", true),
        ("(fixnum? 'x)", false),
        ("(symbol? 'x)", true),
        ("(char? #\\x)", true),
        ("(string? \"x\")", true),
        ("(vector? (make-vector 1 0))", true),
        ("(procedure? (lambda (x) x))", true),
        ("(procedure? 'x)", false),
        ("(eof-object? 'x)", false),
    ] {
        match tm.eval(src) {
            Value::Boolean(b) => assert_eq!(b, expect, "{src}"),
            other => panic!("{src} gave {other}"),
        }
    }
}

#[test]
fn pair_mutation() {
    let mut tm = TestMachine::new();
    assert_eq!(
        tm.eval_fixnum("(define p (cons 1 2)) (set-car! p 41) (set-cdr! p 1) (+ (car p) (cdr p))"),
        42
    );
}

#[test]
fn eq_is_identity() {
    let mut tm = TestMachine::new();
    assert!(matches!(tm.eval("(eq? 'a 'a)"), Value::Boolean(true)));
    assert!(matches!(tm.eval("(eq? '(1) '(1))"), Value::Boolean(false)));
    assert!(matches!(
        tm.eval("((lambda (x) (eq? x x)) '(1 2))"),
        Value::Boolean(true)
    ));
}
