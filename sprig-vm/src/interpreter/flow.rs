//! Frame transitions: calls, tail calls, returns, continuations and the
//! error-handler protocol.
//!
//! An activation frame is four consecutive stack slots at `fp`: the boxed
//! argument count, the boxed return offset, the caller procedure and the
//! boxed caller frame pointer. Arguments sit below the frame, first
//! argument nearest to it.

use std::cell::RefCell;
use std::rc::Rc;

use sprig_asm::{ExceptionKind, ProcedureFlags};

use crate::codegen::make_opcode_procedure;
use crate::consts::STACK_HEADROOM;
use crate::context::Context;
use crate::error::{OpResult, Raised};
use crate::interpreter::{executor, Regs};
use crate::value::{Procedure, Value, Vector};

/// Outcome of one dispatch step.
pub(crate) enum Flow {
    /// Keep executing.
    Continue,
    /// Leave the dispatch loop.
    Halt,
}

impl Regs {
    /// The shared tail of every call: arity adjustment, frame push, entry
    /// into the callee. `ret_ip` is where the caller resumes.
    pub(crate) fn make_call(&mut self, n: usize, operator: Value, ret_ip: usize) -> OpResult<()> {
        let mut f = operator;
        if let Value::PrimOp(op) = &f {
            // Compile non-inlined primitive applications on the fly.
            match make_opcode_procedure(op, n) {
                Ok(p) => f = Value::Procedure(p),
                Err(e) => return Err(e.into()),
            }
        }
        let p = match f {
            Value::Procedure(p) => p,
            other => {
                return Err(Raised::error(
                    ExceptionKind::NotAProcedure,
                    "non procedure application",
                    Value::list([other]),
                ))
            }
        };

        let mut i = n;
        let declared = p.num_args;
        if i < declared {
            return Err(Raised::error(
                ExceptionKind::NotEnoughArgs,
                "not enough args",
                Value::list([Value::Procedure(p), Value::Fixnum(i as i64)]),
            ));
        }
        let surplus = i - declared;
        if surplus > 0 {
            if !p.variadic() {
                return Err(Raised::error(
                    ExceptionKind::TooManyArgs,
                    "too many args",
                    Value::list([Value::Procedure(p), Value::Fixnum(i as i64)]),
                ));
            }
            // Collapse the surplus arguments (and the one declared rest
            // argument) into a list in the rest slot, then close the gap.
            let base = self.top - i - 1;
            let mut rest = Value::cons(self.stack[base].clone(), Value::Nil);
            for k in (self.top - i)..(self.top - declared - 1) {
                rest = Value::cons(self.stack[k].clone(), rest);
            }
            self.stack[base] = rest;
            for k in (self.top - declared - 1)..self.top {
                self.stack[k - surplus + 1] = self.stack[k].clone();
            }
            self.top -= surplus - 1;
            i -= surplus - 1;
        } else if p.variadic() {
            // Exact arity into a variadic procedure: insert `()`.
            for k in ((self.top - i)..=self.top).rev() {
                self.stack[k] = self.stack[k - 1].clone();
            }
            self.stack[self.top - i - 1] = Value::Nil;
            self.top += 1;
            i += 1;
        }

        self.set_arg(1, Value::Fixnum(i as i64));
        self.stack[self.top] = Value::Fixnum(ret_ip as i64);
        self.stack[self.top + 1] = Value::Procedure(self.self_.clone());
        self.stack[self.top + 2] = Value::Fixnum(self.fp as i64);
        self.top += 3;
        self.bc = p.code.clone();
        self.cp = p.closure.clone();
        self.self_ = p;
        self.ip = 0;
        self.fp = self.top - 4;
        Ok(())
    }

    fn frame_proc(&self, idx: usize) -> OpResult<Rc<Procedure>> {
        match &self.stack[idx] {
            Value::Procedure(p) => Ok(p.clone()),
            other => Err(Raised::error(
                ExceptionKind::Type,
                "corrupt activation frame",
                Value::list([other.clone()]),
            )),
        }
    }

    /// `TAIL_CALL n`: overwrite the current activation with the new
    /// arguments, restore the caller's registers, then re-enter as a call.
    pub(crate) fn tail_call(&mut self, i: usize) -> OpResult<()> {
        let f = self.stack[self.top - 1].clone();
        let caller_fp = self.fix_at(self.fp + 3)? as usize;
        let j = self.fix_at(self.fp)? as usize;
        let ret_ip = self.fix_at(self.fp + 1)? as usize;
        let caller = self.frame_proc(self.fp + 2)?;
        self.bc = caller.code.clone();
        self.cp = caller.closure.clone();
        self.self_ = caller;
        for k in 0..i {
            self.stack[self.fp - j + k] = self.stack[self.top - 1 - i + k].clone();
        }
        self.top = self.fp + i - j + 1;
        self.fp = caller_fp;
        self.make_call(i, f, ret_ip)
    }

    /// `RET`: copy the return value over the deepest argument slot and
    /// restore the caller's registers from the frame header.
    pub(crate) fn ret_op(&mut self) -> OpResult<()> {
        let n = self.fix_at(self.fp)? as usize;
        let result = self.stack[self.top - 1].clone();
        self.stack[self.fp - n] = result;
        self.top = self.fp - n + 1;
        let caller = self.frame_proc(self.fp + 2)?;
        self.ip = self.fix_at(self.fp + 1)? as usize;
        let caller_fp = self.fix_at(self.fp + 3)? as usize;
        self.bc = caller.code.clone();
        self.cp = caller.closure.clone();
        self.self_ = caller;
        self.fp = caller_fp;
        Ok(())
    }

    /// `CALLCC`: capture the stack up to a reserved resumption frame,
    /// build a continuation procedure over the shared `RESUMECC` bytecode
    /// and apply the receiver to it.
    pub(crate) fn call_cc(&mut self) -> OpResult<()> {
        self.stack[self.top] = Value::Fixnum(1);
        self.stack[self.top + 1] = Value::Fixnum(self.ip as i64);
        self.stack[self.top + 2] = Value::Procedure(self.self_.clone());
        self.stack[self.top + 3] = Value::Fixnum(self.fp as i64);
        let f = self.stack[self.top - 1].clone();
        let image = Value::vector(self.stack[..self.top + 4].to_vec());
        let resumecc = self.globals.borrow().resumecc.clone();
        let cont = Value::Procedure(Rc::new(Procedure {
            flags: ProcedureFlags::empty(),
            num_args: 1,
            code: resumecc,
            closure: Vector::shared(vec![image]),
        }));
        self.set_arg(1, cont);
        self.top += 1;
        self.make_call(1, f, self.ip)
    }

    /// `RESUMECC`: restore the captured stack image and resume the saved
    /// activation with the continuation's argument as the result.
    pub(crate) fn resume_cc(&mut self) -> OpResult<()> {
        let value = self.stack[self.fp - 1].clone();
        let image = match self.cp.borrow().items.first() {
            Some(Value::Vector(v)) => v.clone(),
            _ => {
                return Err(Raised::error(
                    ExceptionKind::Type,
                    "corrupt continuation",
                    Value::Nil,
                ))
            }
        };
        {
            let image = image.borrow();
            let len = image.items.len();
            self.stack[..len].clone_from_slice(&image.items);
            self.top = len;
        }
        let new_fp = self.fix_at(self.top - 1)? as usize;
        let caller = self.frame_proc(self.top - 2)?;
        self.ip = self.fix_at(self.top - 3)? as usize;
        self.top -= 4;
        self.fp = new_fp;
        self.bc = caller.code.clone();
        self.cp = caller.closure.clone();
        self.self_ = caller;
        self.set_arg(1, value);
        Ok(())
    }

    /// `APPLY1`: splay the argument list so the first element is topmost
    /// and fall through to the call path.
    pub(crate) fn apply1_op(&mut self) -> OpResult<()> {
        let f = self.stack[self.top - 1].clone();
        let xs = self.stack[self.top - 2].clone();
        let Some(n) = xs.list_len() else {
            return Err(Raised::error(
                ExceptionKind::Type,
                "apply: not a list",
                Value::list([xs]),
            ));
        };
        let base = self.top - 2;
        if base + n + 4 + STACK_HEADROOM >= self.stack.len() {
            let oos = self.globals.borrow().oos_error.clone();
            return Err(Raised::from_value(oos));
        }
        for (k, item) in xs.iter_list().enumerate() {
            self.stack[base + n - 1 - k] = item;
        }
        self.top = base + n + 1;
        self.make_call(n, f, self.ip)
    }

    /// Deliver an exception to the installed error handler, entering it
    /// like a one-argument call on the same stack; without a handler the
    /// VM halts with the exception as its result.
    pub(crate) fn deliver(&mut self, exn: Value, attribute: bool) -> Flow {
        if attribute {
            if let Value::Exception(e) = &exn {
                let mut owner = e.procedure.borrow_mut();
                if matches!(&*owner, Value::Boolean(false)) {
                    *owner = Value::Procedure(self.self_.clone());
                }
            }
        }
        let op = self.globals.borrow().params.err_handler.clone();
        let handler = self.ctx.borrow().parameter_ref(&op);
        self.ctx.borrow_mut().last_fp = self.fp;
        self.push(exn);
        match handler {
            Value::Procedure(h) => {
                self.stack[self.top] = Value::Fixnum(1);
                self.stack[self.top + 1] = Value::Fixnum(self.ip as i64);
                self.stack[self.top + 2] = Value::Procedure(self.self_.clone());
                self.stack[self.top + 3] = Value::Fixnum(self.fp as i64);
                self.top += 4;
                self.fp = self.top - 4;
                self.bc = h.code.clone();
                self.cp = h.closure.clone();
                self.self_ = h;
                self.ip = 0;
                Flow::Continue
            }
            _ => Flow::Halt,
        }
    }

    /// Leave the loop: the root thread returns its top of stack; child
    /// threads are parked (they never return to the host).
    pub(crate) fn end_loop(&mut self) -> Option<Value> {
        if !Rc::ptr_eq(&self.ctx, &self.root) {
            if self.root.borrow().refuel > 0 {
                self.ctx.borrow_mut().refuel = 0;
                self.fuel = 0;
                return None;
            }
            if self.top > 0 {
                self.stack[self.top - 1] = Value::Void;
            }
        }
        self.save();
        let c = self.ctx.borrow();
        Some(if c.top > 0 {
            c.stack[c.top - 1].clone()
        } else {
            Value::Void
        })
    }
}

/// Apply `f` to a list of arguments on `ctx`, installing the final-resumer
/// sentinel as the outermost caller. Returns the result or an exception
/// value.
pub(crate) fn apply(ctx: &Rc<RefCell<Context>>, f: Value, args: Value) -> Value {
    let Some(len) = args.list_len() else {
        return Value::exception(ExceptionKind::Type, "apply: not a list", Value::list([args]));
    };
    let mut f = f;
    if let Value::PrimOp(op) = &f {
        match make_opcode_procedure(op, len) {
            Ok(p) => f = Value::Procedure(p),
            Err(e) => return e.into(),
        }
    }
    let p = match f {
        Value::Procedure(p) => p,
        other => {
            return Value::exception(
                ExceptionKind::NotAProcedure,
                "non procedure application",
                Value::list([other]),
            )
        }
    };

    let top0 = {
        let mut c = ctx.borrow_mut();
        let top = c.top;
        if top + len + 4 + STACK_HEADROOM >= c.stack.len() {
            return c.globals.borrow().oos_error.clone();
        }
        let resumer = c.globals.borrow().final_resumer.clone();
        for (k, arg) in args.iter_list().enumerate() {
            c.stack[top + len - 1 - k] = arg;
        }
        c.stack[top + len] = Value::Fixnum(len as i64);
        c.stack[top + len + 1] = Value::Fixnum(0);
        c.stack[top + len + 2] = Value::Procedure(resumer);
        c.stack[top + len + 3] = Value::Fixnum(0);
        c.top = top + len + 4;
        top
    };
    let result = executor::run(ctx.clone(), p);
    ctx.borrow_mut().top = top0;
    result
}

/// One-argument apply with the foreign-call fast path.
pub(crate) fn apply1(ctx: &Rc<RefCell<Context>>, f: Value, x: Value) -> Value {
    if let Value::PrimOp(op) = &f {
        if op.num_args == 1 {
            if let Some(func) = op.func {
                return func(op, &[x]);
            }
        }
    }
    apply(ctx, f, Value::list([x]))
}
