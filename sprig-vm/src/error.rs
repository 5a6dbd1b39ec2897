//! Error types of the compiler and interpreter.
//!
//! Runtime errors are first-class exception values on their way to the
//! installed handler; [`Raised`] is the transport the dispatch loop threads
//! through `?`. Compile-time rejections are a typed [`CompileError`] that
//! converts into an exception value at the VM boundary.

use derive_more::Display;
use sprig_asm::ExceptionKind;

use crate::value::Value;

/// The code generator rejected its input.
#[derive(Debug, Clone, Display)]
#[display(fmt = "compile error: {}", message)]
pub struct CompileError {
    /// Error taxonomy tag.
    pub kind: ExceptionKind,
    /// Human-readable message.
    pub message: String,
}

impl CompileError {
    /// A compile error of the given kind.
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        CompileError {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for the common `compile-error` kind.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::Compile, message)
    }
}

impl std::error::Error for CompileError {}

impl From<CompileError> for Value {
    fn from(e: CompileError) -> Value {
        Value::exception(e.kind, e.message, Value::Nil)
    }
}

/// An exception in flight to the error handler.
#[derive(Debug)]
#[must_use]
pub struct Raised(pub Value);

impl Raised {
    /// Raise a fresh exception.
    pub fn error(kind: ExceptionKind, message: impl Into<String>, irritants: Value) -> Self {
        Raised(Value::exception(kind, message, irritants))
    }

    /// Raise an existing exception value.
    pub fn from_value(exn: Value) -> Self {
        Raised(exn)
    }
}

impl From<CompileError> for Raised {
    fn from(e: CompileError) -> Self {
        Raised(e.into())
    }
}

/// Result of an operation that may divert to the error handler.
pub type OpResult<T> = Result<T, Raised>;
