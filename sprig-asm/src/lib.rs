//! Atomic types of the Sprig VM instruction set.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]
#![deny(
    clippy::arithmetic_side_effects,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::string_slice
)]

mod exception_kind;
mod flags;
mod op_class;
mod opcode;

pub use exception_kind::ExceptionKind;
pub use flags::ProcedureFlags;
pub use op_class::OpClass;
pub use opcode::{InvalidOpcode, Opcode};
