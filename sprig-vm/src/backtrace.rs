//! Interpreter-level stack traces.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use crate::context::Context;
use crate::value::Value;

/// Walk the frame-pointer chain of `ctx` and print one line per activation
/// whose procedure is known, using the bytecode's source attribute when
/// present.
pub fn stack_trace<W: io::Write>(ctx: &Rc<RefCell<Context>>, out: &mut W) -> io::Result<()> {
    let c = ctx.borrow();
    let mut i = c.last_fp;
    while i > 4 {
        if let Value::Procedure(p) = &c.stack[i + 2] {
            write!(out, "  called from {}", p.name().unwrap_or("<anonymous>"))?;
            if let Some((file, line)) = &p.code.source {
                write!(out, " on line {line} of file {file}")?;
            }
            writeln!(out)?;
        }
        match c.stack[i + 3] {
            Value::Fixnum(n) if n >= 0 => i = n as usize,
            _ => break,
        }
    }
    Ok(())
}

/// Dump the live stack slots, marking the frame pointer. Debug aid.
pub fn print_stack<W: io::Write>(ctx: &Rc<RefCell<Context>>, out: &mut W) -> io::Result<()> {
    let c = ctx.borrow();
    for i in 0..c.top {
        let marker = if i == c.last_fp { '*' } else { ' ' };
        writeln!(out, "{marker}{i:02}: {}", c.stack[i])?;
    }
    Ok(())
}
