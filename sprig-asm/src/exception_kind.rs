use core::fmt;

/// Classification of the exceptions surfaced by the core.
///
/// Exceptions themselves are first-class runtime values; this is the `kind`
/// tag they carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[non_exhaustive]
pub enum ExceptionKind {
    /// A global was read before being bound.
    UndefinedVariable,
    /// The operator position of a call held a non-procedure.
    NotAProcedure,
    /// A call supplied fewer arguments than the procedure declares.
    NotEnoughArgs,
    /// A call supplied more arguments than a non-variadic procedure declares.
    TooManyArgs,
    /// An operand failed an opcode's type check.
    Type,
    /// An index was outside the bounds of a vector, string or byte-vector.
    IndexOutOfRange,
    /// A mutating opcode was applied to a write-protected object.
    Immutable,
    /// Integer division by zero.
    DivideByZero,
    /// The dispatch loop decoded an unknown opcode byte.
    UnknownOpcode,
    /// The value stack high-water mark was exceeded.
    OutOfStack,
    /// The code generator rejected its input.
    Compile,
    /// Raised by user code.
    User,
}

impl ExceptionKind {
    /// Look a kind up by its printed name.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "undefined-variable" => Self::UndefinedVariable,
            "not-a-procedure" => Self::NotAProcedure,
            "not-enough-args" => Self::NotEnoughArgs,
            "too-many-args" => Self::TooManyArgs,
            "type-error" => Self::Type,
            "index-out-of-range" => Self::IndexOutOfRange,
            "immutable-object" => Self::Immutable,
            "divide-by-zero" => Self::DivideByZero,
            "unknown-opcode" => Self::UnknownOpcode,
            "out-of-stack" => Self::OutOfStack,
            "compile-error" => Self::Compile,
            "user-error" => Self::User,
            _ => return None,
        })
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UndefinedVariable => "undefined-variable",
            Self::NotAProcedure => "not-a-procedure",
            Self::NotEnoughArgs => "not-enough-args",
            Self::TooManyArgs => "too-many-args",
            Self::Type => "type-error",
            Self::IndexOutOfRange => "index-out-of-range",
            Self::Immutable => "immutable-object",
            Self::DivideByZero => "divide-by-zero",
            Self::UnknownOpcode => "unknown-opcode",
            Self::OutOfStack => "out-of-stack",
            Self::Compile => "compile-error",
            Self::User => "user-error",
        };
        f.write_str(name)
    }
}

impl std::error::Error for ExceptionKind {}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn names_round_trip() {
        for k in ExceptionKind::iter() {
            assert_eq!(ExceptionKind::from_name(&k.to_string()), Some(k));
        }
    }

    #[test]
    fn display_names_are_distinct() {
        let names: Vec<String> = ExceptionKind::iter().map(|k| k.to_string()).collect();
        let mut dedup = names.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(names.len(), dedup.len());
    }
}
