//! The numeric tower: fixnum arithmetic with bignum promotion and flonum
//! contagion.
//!
//! Fixnum results that leave the tagged range promote to bignums; any
//! flonum operand promotes the operation to double precision; everything
//! else is a type error named after the surface operator.

use std::rc::Rc;

use num_bigint::BigInt;
use num_traits::{FromPrimitive, ToPrimitive, Zero};
use sprig_asm::ExceptionKind;

use crate::consts::{FIXNUM_MAX, FIXNUM_MIN};
use crate::error::{OpResult, Raised};
use crate::value::Value;

/// Demote a bignum back to a fixnum when it fits the tagged range.
pub(crate) fn normalize(n: BigInt) -> Value {
    match n.to_i64() {
        Some(i) if (FIXNUM_MIN..=FIXNUM_MAX).contains(&i) => Value::Fixnum(i),
        _ => Value::Bignum(Rc::new(n)),
    }
}

fn in_fixnum_range(n: i128) -> bool {
    n >= FIXNUM_MIN as i128 && n <= FIXNUM_MAX as i128
}

enum Num {
    Fix(i64),
    Flo(f64),
    Big(Rc<BigInt>),
}

fn classify(v: &Value) -> Option<Num> {
    match v {
        Value::Fixnum(n) => Some(Num::Fix(*n)),
        Value::Flonum(x) => Some(Num::Flo(*x)),
        Value::Bignum(b) => Some(Num::Big(b.clone())),
        _ => None,
    }
}

fn as_f64(n: &Num) -> f64 {
    match n {
        Num::Fix(i) => *i as f64,
        Num::Flo(x) => *x,
        Num::Big(b) => b.to_f64().unwrap_or(f64::INFINITY),
    }
}

fn as_big(n: &Num) -> BigInt {
    match n {
        Num::Fix(i) => BigInt::from(*i),
        Num::Big(b) => (**b).clone(),
        Num::Flo(_) => BigInt::zero(),
    }
}

fn not_a_number(name: &str, a: &Value, b: &Value) -> Raised {
    Raised::error(
        ExceptionKind::Type,
        format!("{name}: not a number"),
        Value::list([a.clone(), b.clone()]),
    )
}

fn binary(name: &str, a: &Value, b: &Value) -> OpResult<(Num, Num)> {
    match (classify(a), classify(b)) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(not_a_number(name, a, b)),
    }
}

pub(crate) fn add(a: &Value, b: &Value) -> OpResult<Value> {
    match binary("+", a, b)? {
        (Num::Fix(x), Num::Fix(y)) => {
            let sum = x as i128 + y as i128;
            if in_fixnum_range(sum) {
                Ok(Value::Fixnum(sum as i64))
            } else {
                Ok(normalize(BigInt::from(sum)))
            }
        }
        (x @ Num::Flo(_), y) | (x, y @ Num::Flo(_)) => Ok(Value::Flonum(as_f64(&x) + as_f64(&y))),
        (x, y) => Ok(normalize(as_big(&x) + as_big(&y))),
    }
}

pub(crate) fn sub(a: &Value, b: &Value) -> OpResult<Value> {
    match binary("-", a, b)? {
        (Num::Fix(x), Num::Fix(y)) => {
            let diff = x as i128 - y as i128;
            if in_fixnum_range(diff) {
                Ok(Value::Fixnum(diff as i64))
            } else {
                Ok(normalize(BigInt::from(diff)))
            }
        }
        (x @ Num::Flo(_), y) | (x, y @ Num::Flo(_)) => Ok(Value::Flonum(as_f64(&x) - as_f64(&y))),
        (x, y) => Ok(normalize(as_big(&x) - as_big(&y))),
    }
}

pub(crate) fn mul(a: &Value, b: &Value) -> OpResult<Value> {
    match binary("*", a, b)? {
        (Num::Fix(x), Num::Fix(y)) => {
            let prod = x as i128 * y as i128;
            if in_fixnum_range(prod) {
                Ok(Value::Fixnum(prod as i64))
            } else {
                Ok(normalize(BigInt::from(prod)))
            }
        }
        (x @ Num::Flo(_), y) | (x, y @ Num::Flo(_)) => Ok(Value::Flonum(as_f64(&x) * as_f64(&y))),
        (x, y) => Ok(normalize(as_big(&x) * as_big(&y))),
    }
}

fn divide_by_zero() -> Raised {
    Raised::error(ExceptionKind::DivideByZero, "divide by zero", Value::Nil)
}

pub(crate) fn div(a: &Value, b: &Value) -> OpResult<Value> {
    // An exact zero divisor raises, except for the flonum-zero dividend.
    if matches!(b, Value::Fixnum(0)) {
        return match a {
            Value::Flonum(x) if *x == 0.0 => Ok(Value::Flonum(0.0)),
            _ => Err(divide_by_zero()),
        };
    }
    match binary("/", a, b)? {
        (Num::Fix(x), Num::Fix(y)) => {
            if x % y == 0 {
                Ok(Value::Fixnum(x / y))
            } else {
                Ok(Value::Flonum(x as f64 / y as f64))
            }
        }
        (x @ Num::Flo(_), y) | (x, y @ Num::Flo(_)) => Ok(Value::Flonum(as_f64(&x) / as_f64(&y))),
        (x, y) => {
            let (xb, yb) = (as_big(&x), as_big(&y));
            if (&xb % &yb).is_zero() {
                Ok(normalize(xb / yb))
            } else {
                Ok(Value::Flonum(as_f64(&x) / as_f64(&y)))
            }
        }
    }
}

fn not_an_integer(name: &str, a: &Value, b: &Value) -> Raised {
    Raised::error(
        ExceptionKind::Type,
        format!("{name}: not an integer"),
        Value::list([a.clone(), b.clone()]),
    )
}

pub(crate) fn quotient(a: &Value, b: &Value) -> OpResult<Value> {
    match (classify(a), classify(b)) {
        (Some(Num::Fix(x)), Some(Num::Fix(y))) => {
            if y == 0 {
                Err(divide_by_zero())
            } else {
                Ok(Value::Fixnum(x / y))
            }
        }
        (Some(Num::Flo(_)), _) | (_, Some(Num::Flo(_))) | (None, _) | (_, None) => {
            Err(not_an_integer("quotient", a, b))
        }
        (Some(x), Some(y)) => {
            let yb = as_big(&y);
            if yb.is_zero() {
                Err(divide_by_zero())
            } else {
                Ok(normalize(as_big(&x) / yb))
            }
        }
    }
}

pub(crate) fn remainder(a: &Value, b: &Value) -> OpResult<Value> {
    match (classify(a), classify(b)) {
        (Some(Num::Fix(x)), Some(Num::Fix(y))) => {
            if y == 0 {
                Err(divide_by_zero())
            } else {
                Ok(Value::Fixnum(x % y))
            }
        }
        (Some(Num::Flo(_)), _) | (_, Some(Num::Flo(_))) | (None, _) | (_, None) => {
            Err(not_an_integer("remainder", a, b))
        }
        (Some(x), Some(y)) => {
            let yb = as_big(&y);
            if yb.is_zero() {
                Err(divide_by_zero())
            } else {
                Ok(normalize(as_big(&x) % yb))
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Lt,
    Le,
    Eq,
}

fn compare(name: &str, which: Cmp, a: &Value, b: &Value) -> OpResult<bool> {
    let (x, y) = binary(name, a, b)?;
    let ord = match (&x, &y) {
        (Num::Fix(p), Num::Fix(q)) => p.partial_cmp(q),
        (Num::Big(p), Num::Big(q)) => p.partial_cmp(q),
        (Num::Big(p), Num::Fix(q)) => (**p).partial_cmp(&BigInt::from(*q)),
        (Num::Fix(p), Num::Big(q)) => BigInt::from(*p).partial_cmp(q),
        // Flonum contagion; NaN compares as nothing.
        _ => as_f64(&x).partial_cmp(&as_f64(&y)),
    };
    Ok(match (which, ord) {
        (Cmp::Lt, Some(core::cmp::Ordering::Less)) => true,
        (Cmp::Le, Some(core::cmp::Ordering::Less | core::cmp::Ordering::Equal)) => true,
        (Cmp::Eq, Some(core::cmp::Ordering::Equal)) => true,
        _ => false,
    })
}

pub(crate) fn lt(a: &Value, b: &Value) -> OpResult<bool> {
    compare("<", Cmp::Lt, a, b)
}

pub(crate) fn le(a: &Value, b: &Value) -> OpResult<bool> {
    compare("<=", Cmp::Le, a, b)
}

pub(crate) fn num_eq(a: &Value, b: &Value) -> OpResult<bool> {
    compare("=", Cmp::Eq, a, b)
}

pub(crate) fn fix_to_flo(v: &Value) -> OpResult<Value> {
    match v {
        Value::Fixnum(n) => Ok(Value::Flonum(*n as f64)),
        Value::Bignum(b) => Ok(Value::Flonum(b.to_f64().unwrap_or(f64::INFINITY))),
        Value::Flonum(_) => Ok(v.clone()),
        _ => Err(Raised::error(
            ExceptionKind::Type,
            "exact->inexact: not a number",
            Value::list([v.clone()]),
        )),
    }
}

pub(crate) fn flo_to_fix(v: &Value) -> OpResult<Value> {
    match v {
        Value::Flonum(x) => {
            if !x.is_finite() || *x != x.trunc() {
                Err(Raised::error(
                    ExceptionKind::Type,
                    "inexact->exact: not an integer",
                    Value::list([v.clone()]),
                ))
            } else if *x > FIXNUM_MAX as f64 || *x < FIXNUM_MIN as f64 {
                match BigInt::from_f64(*x) {
                    Some(b) => Ok(Value::Bignum(Rc::new(b))),
                    None => Err(Raised::error(
                        ExceptionKind::Type,
                        "inexact->exact: not an integer",
                        Value::list([v.clone()]),
                    )),
                }
            } else {
                Ok(Value::Fixnum(*x as i64))
            }
        }
        Value::Fixnum(_) | Value::Bignum(_) => Ok(v.clone()),
        _ => Err(Raised::error(
            ExceptionKind::Type,
            "inexact->exact: not a number",
            Value::list([v.clone()]),
        )),
    }
}
