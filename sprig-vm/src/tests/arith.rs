use num_bigint::BigInt;
use quickcheck_macros::quickcheck;
use test_case::test_case;

use crate::consts::{FIXNUM_MAX, FIXNUM_MIN};
use crate::interpreter::alu;
use crate::util::test_helpers::TestMachine;
use crate::value::Value;

fn clamp(n: i64) -> i64 {
    n >> 2
}

fn as_bigint(v: &Value) -> BigInt {
    match v {
        Value::Fixnum(n) => BigInt::from(*n),
        Value::Bignum(b) => (**b).clone(),
        other => panic!("not an exact integer: {other}"),
    }
}

#[quickcheck]
fn addition_is_total_over_fixnums(a: i64, b: i64) -> bool {
    let (a, b) = (clamp(a), clamp(b));
    let v = alu::add(&Value::Fixnum(a), &Value::Fixnum(b)).unwrap();
    as_bigint(&v) == BigInt::from(a) + BigInt::from(b)
}

#[quickcheck]
fn subtraction_is_total_over_fixnums(a: i64, b: i64) -> bool {
    let (a, b) = (clamp(a), clamp(b));
    let v = alu::sub(&Value::Fixnum(a), &Value::Fixnum(b)).unwrap();
    as_bigint(&v) == BigInt::from(a) - BigInt::from(b)
}

#[quickcheck]
fn multiplication_is_total_over_fixnums(a: i64, b: i64) -> bool {
    let (a, b) = (clamp(a), clamp(b));
    let v = alu::mul(&Value::Fixnum(a), &Value::Fixnum(b)).unwrap();
    as_bigint(&v) == BigInt::from(a) * BigInt::from(b)
}

#[test_case("(+ 1 2)" => 3 ; "binary add")]
#[test_case("(+)" => 0 ; "nullary add")]
#[test_case("(+ 7)" => 7 ; "unary add")]
#[test_case("(+ 1 2 3 4)" => 10 ; "folded add")]
#[test_case("(- 5 2)" => 3 ; "binary sub")]
#[test_case("(- 5 2 1)" => 2 ; "folded sub")]
#[test_case("(- 5)" => -5 ; "unary negate")]
#[test_case("(*)" => 1 ; "nullary mul")]
#[test_case("(* 2 3 7)" => 42 ; "folded mul")]
#[test_case("(/ 84 2)" => 42 ; "exact division")]
#[test_case("(quotient 85 2)" => 42 ; "quotient truncates")]
#[test_case("(remainder 85 2)" => 1 ; "remainder")]
#[test_case("(quotient -7 2)" => -3 ; "quotient truncates toward zero")]
#[test_case("(remainder -7 2)" => -1 ; "remainder keeps the dividend sign")]
fn arithmetic(src: &str) -> i64 {
    TestMachine::new().eval_fixnum(src)
}

#[test]
fn unary_divide_inverts() {
    let mut tm = TestMachine::new();
    match tm.eval("(/ 4)") {
        Value::Flonum(x) => assert_eq!(x, 0.25),
        other => panic!("expected flonum, got {other}"),
    }
}

#[test]
fn inexact_division_produces_flonums() {
    let mut tm = TestMachine::new();
    match tm.eval("(/ 1 3)") {
        Value::Flonum(x) => assert!((x - 1.0 / 3.0).abs() < f64::EPSILON),
        other => panic!("expected flonum, got {other}"),
    }
}

#[test]
fn overflow_promotes_through_the_vm() {
    let mut tm = TestMachine::new();
    tm.machine.define("big", Value::Fixnum(FIXNUM_MAX));
    let v = tm.eval("(+ big big)");
    assert!(matches!(v, Value::Bignum(_)));
    assert_eq!(
        as_bigint(&v),
        BigInt::from(FIXNUM_MAX) + BigInt::from(FIXNUM_MAX)
    );
    // And demotion on the way back down.
    tm.machine.define("bignum", v);
    let back = tm.eval("(- bignum big)");
    assert!(matches!(back, Value::Fixnum(n) if n == FIXNUM_MAX));
}

#[test]
fn fixnum_range_is_symmetric_enough() {
    assert!(FIXNUM_MIN < -(1 << 60));
    assert!(FIXNUM_MAX > (1 << 60));
}

#[test]
fn comparisons_mix_representations() {
    let mut tm = TestMachine::new();
    assert!(matches!(tm.eval("(< 1 1.5)"), Value::Boolean(true)));
    assert!(matches!(tm.eval("(= 2 2.0)"), Value::Boolean(true)));
    assert!(matches!(tm.eval("(> 3 2 1)"), Value::Boolean(true)));
    assert!(matches!(tm.eval("(>= 3 3 2)"), Value::Boolean(true)));
}

#[test]
fn exactness_conversions() {
    let mut tm = TestMachine::new();
    match tm.eval("(exact->inexact 2)") {
        Value::Flonum(x) => assert_eq!(x, 2.0),
        other => panic!("expected flonum, got {other}"),
    }
    assert_eq!(tm.eval_fixnum("(inexact->exact 7.0)"), 7);
    let e = tm.eval_exception("(inexact->exact 7.5)");
    assert!(e.message.contains("inexact->exact"));
}
