//! VM parameters

use core::mem;

/// Number of value slots in a thread's stack.
pub const STACK_SIZE: usize = 8 * 1024;

/// Slots kept free below the stack ceiling so that the out-of-stack
/// exception can still be delivered through a handler frame.
pub const STACK_HEADROOM: usize = 16;

/// Slots in an activation-frame header.
pub const FRAME_SIZE: usize = 4;

/// Bytes per inline operand word.
pub const WORD_SIZE: usize = mem::size_of::<u64>();

/// Fuel quantum handed to a thread when it is scheduled.
pub const DEFAULT_REFUEL: i64 = 500;

/// Smallest value representable as a fixnum; two tag bits are reserved.
pub const FIXNUM_MIN: i64 = -(1 << 61);

/// Largest value representable as a fixnum.
pub const FIXNUM_MAX: i64 = (1 << 61) - 1;

static_assertions::const_assert!(STACK_SIZE > 4 * STACK_HEADROOM);
static_assertions::const_assert!(FIXNUM_MIN < 0 && FIXNUM_MAX > 0);
