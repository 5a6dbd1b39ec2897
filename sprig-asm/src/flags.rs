#![allow(missing_docs)]

use bitflags::bitflags;

bitflags! {
    /// Flag bits carried by a procedure.
    pub struct ProcedureFlags: u64 {
        /// The last declared parameter collects surplus arguments as a list.
        const VARIADIC = 0x01;
    }
}

impl ProcedureFlags {
    /// Flags encoded as a fixnum payload for the `MAKE_PROCEDURE` operand.
    #[allow(clippy::cast_possible_wrap)]
    pub const fn to_word(self) -> i64 {
        self.bits() as i64
    }

    /// Decode flags from a fixnum payload, ignoring unknown bits.
    #[allow(clippy::cast_sign_loss)]
    pub const fn from_word(w: i64) -> Self {
        Self::from_bits_truncate(w as u64)
    }
}
