//! Primitive-opcode descriptors and the core registration table.
//!
//! A [`PrimOp`] is a static but first-class record describing a primitive:
//! its class selects the code-generation coda, its `code` is the opcode the
//! compiler inlines, and `data`/`data2` carry the class-specific extras
//! (default values, parameter cells, type and slot indices, converters).
//! When a primitive is applied through the generic call path the factory in
//! `codegen` wraps it in a real procedure, cached here when the arity
//! matches the declaration.

use std::cell::RefCell;
use std::rc::Rc;

use sprig_asm::{ExceptionKind, OpClass, Opcode};

use crate::types::{TYPE_EXCEPTION, TYPE_PAIR, TYPE_PROCEDURE, TYPE_STRING, TYPE_VECTOR};
use crate::value::{Procedure, Value};

/// A foreign function callable from `FCALL*`: receives its own descriptor
/// and the arguments first-operand-first, returns a value or an exception
/// value to short-circuit to the handler.
pub type ForeignFn = fn(&Rc<PrimOp>, &[Value]) -> Value;

/// Descriptor of a primitive opcode.
#[derive(Debug)]
pub struct PrimOp {
    /// Surface name.
    pub name: &'static str,
    /// Class driving the compilation coda.
    pub class: OpClass,
    /// Opcode the compiler emits.
    pub code: Opcode,
    /// Declared minimum arity.
    pub num_args: usize,
    /// Whether a trailing argument is optional / foldable.
    pub variadic: bool,
    /// Compile arguments in source order instead of reversed.
    pub inverse: bool,
    /// The default datum is a parameter whose current binding supplies the
    /// omitted trailing argument.
    pub opt_param: bool,
    /// Class-specific datum: default value, parameter cell, or type index.
    pub data: Option<Value>,
    /// Second datum: slot index or parameter converter.
    pub data2: Option<Value>,
    /// Foreign-call target, for `OpClass::Foreign`.
    pub func: Option<ForeignFn>,
    /// Cached procedure wrapper of the declared arity.
    pub proc: RefCell<Option<Rc<Procedure>>>,
}

impl PrimOp {
    /// A descriptor with no extras.
    pub fn new(name: &'static str, class: OpClass, code: Opcode, num_args: usize) -> Self {
        PrimOp {
            name,
            class,
            code,
            num_args,
            variadic: false,
            inverse: false,
            opt_param: false,
            data: None,
            data2: None,
            func: None,
            proc: RefCell::new(None),
        }
    }

    /// Mark the last parameter optional / the operator foldable.
    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    /// Compile arguments in source order.
    pub fn inverse(mut self) -> Self {
        self.inverse = true;
        self
    }

    /// The default datum names a dynamic parameter.
    pub fn opt_param(mut self) -> Self {
        self.opt_param = true;
        self
    }

    /// Attach the class-specific datum.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach the second datum.
    pub fn with_data2(mut self, data2: Value) -> Self {
        self.data2 = Some(data2);
        self
    }

    /// Attach the foreign-call target.
    pub fn with_func(mut self, func: ForeignFn) -> Self {
        self.func = Some(func);
        self
    }

    fn rc(self) -> Rc<Self> {
        Rc::new(self)
    }
}

/// A dynamic-parameter descriptor with a fresh default cell holding
/// `default`.
pub fn make_parameter(name: &'static str, default: Value) -> Rc<PrimOp> {
    let cell = Value::cons(Value::symbol(name), default);
    PrimOp::new(name, OpClass::Parameter, Opcode::ParameterRef, 0)
        .variadic()
        .with_data(cell)
        .rc()
}

/// The dynamic parameters every runtime carries.
#[derive(Debug, Clone)]
pub struct CoreParameters {
    /// `current-input-port`.
    pub cur_in: Rc<PrimOp>,
    /// `current-output-port`.
    pub cur_out: Rc<PrimOp>,
    /// `current-exception-handler`.
    pub err_handler: Rc<PrimOp>,
}

/// Build the core primitive table. Returns the `(name, descriptor)` pairs to
/// enter into the globals table plus the distinguished parameters.
pub fn core_bindings() -> (Vec<(&'static str, Rc<PrimOp>)>, CoreParameters) {
    use OpClass::*;
    use Opcode::*;

    let cur_in = make_parameter("current-input-port", Value::Void);
    let cur_out = make_parameter("current-output-port", Value::Void);
    let err_handler = make_parameter("current-exception-handler", Value::Boolean(false));
    let in_op = Value::PrimOp(cur_in.clone());
    let out_op = Value::PrimOp(cur_out.clone());

    let table: Vec<(&'static str, Rc<PrimOp>)> = vec![
        ("+", PrimOp::new("+", Arithmetic, Add, 0).variadic().with_data(Value::Fixnum(0)).rc()),
        ("-", PrimOp::new("-", Arithmetic, Sub, 1).variadic().inverse().with_data(Value::Fixnum(0)).rc()),
        ("*", PrimOp::new("*", Arithmetic, Mul, 0).variadic().with_data(Value::Fixnum(1)).rc()),
        ("/", PrimOp::new("/", Arithmetic, Div, 1).variadic().inverse().with_data(Value::Fixnum(1)).rc()),
        ("quotient", PrimOp::new("quotient", Arithmetic, Quotient, 2).rc()),
        ("remainder", PrimOp::new("remainder", Arithmetic, Remainder, 2).rc()),
        ("<", PrimOp::new("<", ArithmeticCmp, Lt, 2).variadic().rc()),
        ("<=", PrimOp::new("<=", ArithmeticCmp, Le, 2).variadic().rc()),
        (">", PrimOp::new(">", ArithmeticCmp, Lt, 2).variadic().inverse().rc()),
        (">=", PrimOp::new(">=", ArithmeticCmp, Le, 2).variadic().inverse().rc()),
        ("=", PrimOp::new("=", ArithmeticCmp, NumEq, 2).variadic().rc()),
        ("eq?", PrimOp::new("eq?", Generic, Eq, 2).rc()),
        ("cons", PrimOp::new("cons", Constructor, Cons, 2).rc()),
        ("car", PrimOp::new("car", Getter, Car, 1).rc()),
        ("cdr", PrimOp::new("cdr", Getter, Cdr, 1).rc()),
        ("set-car!", PrimOp::new("set-car!", Setter, SetCar, 2).rc()),
        ("set-cdr!", PrimOp::new("set-cdr!", Setter, SetCdr, 2).rc()),
        ("null?", PrimOp::new("null?", TypePredicate, IsNull, 1).rc()),
        ("eof-object?", PrimOp::new("eof-object?", TypePredicate, IsEof, 1).rc()),
        ("fixnum?", PrimOp::new("fixnum?", TypePredicate, IsFixnum, 1).rc()),
        ("symbol?", PrimOp::new("symbol?", TypePredicate, IsSymbol, 1).rc()),
        ("char?", PrimOp::new("char?", TypePredicate, IsChar, 1).rc()),
        ("pair?", PrimOp::new("pair?", TypePredicate, IsType, 1).with_data(Value::Fixnum(TYPE_PAIR as i64)).rc()),
        ("string?", PrimOp::new("string?", TypePredicate, IsType, 1).with_data(Value::Fixnum(TYPE_STRING as i64)).rc()),
        ("vector?", PrimOp::new("vector?", TypePredicate, IsType, 1).with_data(Value::Fixnum(TYPE_VECTOR as i64)).rc()),
        ("procedure?", PrimOp::new("procedure?", TypePredicate, IsType, 1).with_data(Value::Fixnum(TYPE_PROCEDURE as i64)).rc()),
        ("exception?", PrimOp::new("exception?", TypePredicate, IsType, 1).with_data(Value::Fixnum(TYPE_EXCEPTION as i64)).rc()),
        ("is-a?", PrimOp::new("is-a?", Generic, IsA, 2).rc()),
        ("make-vector", PrimOp::new("make-vector", Constructor, MakeVector, 1).variadic().with_data(Value::Void).rc()),
        ("vector-ref", PrimOp::new("vector-ref", Getter, VectorRef, 2).rc()),
        ("vector-set!", PrimOp::new("vector-set!", Setter, VectorSet, 3).rc()),
        ("vector-length", PrimOp::new("vector-length", Getter, VectorLength, 1).rc()),
        ("string-ref", PrimOp::new("string-ref", Getter, StringRef, 2).rc()),
        ("string-set!", PrimOp::new("string-set!", Setter, StringSet, 3).rc()),
        ("string-length", PrimOp::new("string-length", Getter, StringLength, 1).rc()),
        ("bytes-ref", PrimOp::new("bytes-ref", Getter, BytesRef, 2).rc()),
        ("bytes-set!", PrimOp::new("bytes-set!", Setter, BytesSet, 3).rc()),
        ("bytes-length", PrimOp::new("bytes-length", Getter, BytesLength, 1).rc()),
        ("make-exception", PrimOp::new("make-exception", Constructor, MakeException, 5).rc()),
        ("slot-ref", PrimOp::new("slot-ref", Getter, SlotnRef, 3).rc()),
        ("slot-set!", PrimOp::new("slot-set!", Setter, SlotnSet, 4).rc()),
        ("char->integer", PrimOp::new("char->integer", Generic, CharToInt, 1).rc()),
        ("integer->char", PrimOp::new("integer->char", Generic, IntToChar, 1).rc()),
        ("char-upcase", PrimOp::new("char-upcase", Generic, CharUpcase, 1).rc()),
        ("char-downcase", PrimOp::new("char-downcase", Generic, CharDowncase, 1).rc()),
        ("exact->inexact", PrimOp::new("exact->inexact", Generic, FixToFlo, 1).rc()),
        ("inexact->exact", PrimOp::new("inexact->exact", Generic, FloToFix, 1).rc()),
        ("write-char", PrimOp::new("write-char", Generic, WriteChar, 1).variadic().opt_param().with_data(out_op.clone()).rc()),
        ("newline", PrimOp::new("newline", Generic, Newline, 0).variadic().opt_param().with_data(out_op.clone()).rc()),
        ("read-char", PrimOp::new("read-char", Generic, ReadChar, 0).variadic().opt_param().with_data(in_op.clone()).rc()),
        ("peek-char", PrimOp::new("peek-char", Generic, PeekChar, 0).variadic().opt_param().with_data(in_op).rc()),
        ("yield", PrimOp::new("yield", Generic, Yield, 0).rc()),
        ("apply", PrimOp::new("apply", Generic, Apply1, 2).rc()),
        ("raise", PrimOp::new("raise", Generic, Raise, 1).rc()),
        ("call/cc", PrimOp::new("call/cc", Generic, CallCc, 1).rc()),
        (
            "call-with-current-continuation",
            PrimOp::new("call-with-current-continuation", Generic, CallCc, 1).rc(),
        ),
        ("length", PrimOp::new("length", Foreign, FCall1, 1).with_func(length_fn).rc()),
        ("reverse", PrimOp::new("reverse", Foreign, FCall1, 1).with_func(reverse_fn).rc()),
        (
            "display",
            PrimOp::new("display", Foreign, FCall2, 1)
                .variadic()
                .opt_param()
                .with_data(out_op)
                .with_func(display_fn)
                .rc(),
        ),
        ("current-input-port", cur_in.clone()),
        ("current-output-port", cur_out.clone()),
        ("current-exception-handler", err_handler.clone()),
    ];

    (
        table,
        CoreParameters {
            cur_in,
            cur_out,
            err_handler,
        },
    )
}

fn length_fn(op: &Rc<PrimOp>, args: &[Value]) -> Value {
    match args[0].list_len() {
        Some(n) => Value::Fixnum(n as i64),
        None => Value::exception(
            ExceptionKind::Type,
            format!("{}: not a list", op.name),
            Value::list([args[0].clone()]),
        ),
    }
}

fn reverse_fn(op: &Rc<PrimOp>, args: &[Value]) -> Value {
    let mut out = Value::Nil;
    let mut cur = args[0].clone();
    loop {
        match cur {
            Value::Nil => return out,
            Value::Pair(p) => {
                let inner = p.borrow();
                out = Value::cons(inner.car.clone(), out);
                cur = inner.cdr.clone();
            }
            _ => {
                return Value::exception(
                    ExceptionKind::Type,
                    format!("{}: not a list", op.name),
                    Value::list([args[0].clone()]),
                )
            }
        }
    }
}

fn display_fn(op: &Rc<PrimOp>, args: &[Value]) -> Value {
    let text = match &args[0] {
        Value::String(s) => s.borrow().as_str().to_string(),
        Value::Char(c) => c.to_string(),
        other => other.to_string(),
    };
    let Value::Port(port) = &args[1] else {
        return Value::exception(
            ExceptionKind::Type,
            format!("{}: not an output-port", op.name),
            Value::list([args[1].clone()]),
        );
    };
    match port.borrow_mut().write_str(&text) {
        Ok(()) => Value::Void,
        Err(e) => Value::exception(
            ExceptionKind::Type,
            format!("{}: {e}", op.name),
            Value::list([args[1].clone()]),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_table_names_match_descriptors() {
        let (table, params) = core_bindings();
        for (name, op) in &table {
            assert_eq!(*name, op.name);
        }
        assert_eq!(params.err_handler.name, "current-exception-handler");
    }

    #[test]
    fn subtraction_carries_an_identity_for_negation() {
        let (table, _) = core_bindings();
        let minus = &table.iter().find(|(n, _)| *n == "-").unwrap().1;
        assert!(minus.variadic && minus.inverse);
        assert!(matches!(minus.data, Some(Value::Fixnum(0))));
    }

    #[test]
    fn length_rejects_improper_lists() {
        let (table, _) = core_bindings();
        let len = table.iter().find(|(n, _)| *n == "length").unwrap().1.clone();
        let improper = Value::cons(Value::Fixnum(1), Value::Fixnum(2));
        assert!(matches!(length_fn(&len, &[improper]), Value::Exception(_)));
    }
}
