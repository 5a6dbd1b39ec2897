//! The virtual machine.
//!
//! [`Machine`] is the host-facing facade: it owns the globals table and the
//! root thread context and exposes `compile`, `vm`, `apply` and the handler
//! and scheduler installation points. The dispatch loop itself lives in
//! [`executor`]; frame transitions, continuations and the error-handler
//! protocol in [`flow`]; the numeric tower in [`alu`].

use std::cell::RefCell;
use std::io;
use std::mem;
use std::rc::Rc;

use sprig_asm::ExceptionKind;

use crate::ast::Ast;
use crate::backtrace;
use crate::bytecode::BytecodeObject;
use crate::codegen;
use crate::consts::FRAME_SIZE;
use crate::context::{BlockerFn, Context, Globals, MachineParams, SchedulerFn};
use crate::error::{CompileError, OpResult, Raised};
use crate::ports::Port;
use crate::primops::PrimOp;
use crate::value::{Procedure, Value, Vector};

pub(crate) mod alu;
pub(crate) mod executor;
pub(crate) mod flow;

/// A complete runtime: globals plus the root thread.
#[derive(Debug)]
pub struct Machine {
    params: MachineParams,
    globals: Rc<RefCell<Globals>>,
    root: Rc<RefCell<Context>>,
}

impl Default for Machine {
    fn default() -> Self {
        Machine::new(MachineParams::default())
    }
}

impl Machine {
    /// A runtime with the core primitives bound and the standard streams
    /// installed as the default ports.
    pub fn new(params: MachineParams) -> Self {
        let globals = Globals::new();
        let root = Context::new(globals.clone(), &params);
        let machine = Machine {
            params,
            globals,
            root,
        };
        machine.install_port_default(true, Port::input(Box::new(io::stdin())));
        machine.install_port_default(false, Port::output(Box::new(io::stdout())));
        machine
    }

    fn install_port_default(&self, input: bool, port: Port) {
        let g = self.globals.borrow();
        let op = if input {
            g.params.cur_in.clone()
        } else {
            g.params.cur_out.clone()
        };
        drop(g);
        if let Some(cell) = op.data.as_ref().and_then(|d| d.as_pair().cloned()) {
            cell.borrow_mut().cdr = Value::Port(Rc::new(RefCell::new(port)));
        }
    }

    /// Replace the default port of `current-input-port` (`input: true`) or
    /// `current-output-port`.
    pub fn set_default_port(&self, input: bool, port: Port) {
        self.install_port_default(input, port);
    }

    /// The shared globals table.
    pub fn globals(&self) -> Rc<RefCell<Globals>> {
        self.globals.clone()
    }

    /// The root thread context.
    pub fn root(&self) -> Rc<RefCell<Context>> {
        self.root.clone()
    }

    /// Runtime parameters this machine was built with.
    pub fn params(&self) -> &MachineParams {
        &self.params
    }

    /// Bind `name` at top level.
    pub fn define(&self, name: &str, value: Value) {
        self.globals
            .borrow_mut()
            .define(crate::value::Symbol::new(name), value);
    }

    /// Compile an analyzed expression to bytecode.
    pub fn compile(&self, ast: &Ast) -> Result<Rc<BytecodeObject>, CompileError> {
        codegen::compile(ast)
    }

    /// Compile an analyzed expression and run it on the root thread.
    pub fn eval(&mut self, ast: &Ast) -> Result<Value, CompileError> {
        let proc = codegen::compile_procedure(ast)?;
        Ok(self.apply(Value::Procedure(proc), Value::Nil))
    }

    /// Enter the dispatch loop on the root thread. The caller has prepared
    /// the stack: arguments and an activation frame ending at `top`.
    pub fn vm(&mut self, proc: Rc<Procedure>) -> Value {
        executor::run(self.root.clone(), proc)
    }

    /// Apply a procedure (or primitive descriptor) to a list of arguments,
    /// with the final-resumer sentinel as the outermost caller.
    pub fn apply(&mut self, f: Value, args: Value) -> Value {
        flow::apply(&self.root, f, args)
    }

    /// One-argument apply with the primitive fast path.
    pub fn apply1(&mut self, f: Value, x: Value) -> Value {
        flow::apply1(&self.root, f, x)
    }

    /// Install `handler` as the error handler on the root thread's dynamic
    /// environment.
    pub fn set_error_handler(&mut self, handler: Value) {
        let op = self.globals.borrow().params.err_handler.clone();
        self.root.borrow_mut().bind_parameter(&op, handler);
    }

    /// Install the cooperative-scheduler hook.
    pub fn set_scheduler(&mut self, scheduler: SchedulerFn) {
        self.globals.borrow_mut().scheduler = Some(scheduler);
    }

    /// Install the blocking-I/O parking hook.
    pub fn set_blocker(&mut self, blocker: BlockerFn) {
        self.globals.borrow_mut().blocker = Some(blocker);
    }

    /// A runnable child thread for `proc`.
    pub fn spawn(&self, proc: Rc<Procedure>) -> Rc<RefCell<Context>> {
        Context::spawn(self.globals.clone(), &self.params, proc)
    }

    /// Print the call chain of the root thread.
    pub fn stack_trace<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        backtrace::stack_trace(&self.root, out)
    }
}

/// The dispatch registers: the local mirror of one thread's execution state.
///
/// The stack is moved out of the context while the loop runs and spilled
/// back at scheduling points, keeping the context object the only coupling
/// point with the scheduler.
pub(crate) struct Regs {
    pub root: Rc<RefCell<Context>>,
    pub ctx: Rc<RefCell<Context>>,
    pub globals: Rc<RefCell<Globals>>,
    pub stack: Vec<Value>,
    pub top: usize,
    pub fp: usize,
    pub ip: usize,
    pub self_: Rc<Procedure>,
    pub bc: Rc<BytecodeObject>,
    pub cp: Rc<RefCell<Vector>>,
    pub fuel: i64,
}

impl Regs {
    /// Begin executing `proc` on `root`, whose stack already holds the
    /// arguments and activation frame.
    pub(crate) fn enter(root: Rc<RefCell<Context>>, proc: Rc<Procedure>) -> Regs {
        let globals = root.borrow().globals.clone();
        let (stack, top, fuel) = {
            let mut c = root.borrow_mut();
            (mem::take(&mut c.stack), c.top, c.refuel)
        };
        Regs {
            ctx: root.clone(),
            root,
            globals,
            stack,
            top,
            fp: top.saturating_sub(FRAME_SIZE),
            ip: 0,
            bc: proc.code.clone(),
            cp: proc.closure.clone(),
            self_: proc,
            fuel,
        }
    }

    /// Spill the registers into the current context.
    pub(crate) fn save(&mut self) {
        let mut c = self.ctx.borrow_mut();
        c.stack = mem::take(&mut self.stack);
        c.top = self.top;
        c.ip = self.ip;
        c.last_fp = self.fp;
        c.proc = Some(self.self_.clone());
    }

    /// Adopt another context as the running thread, reloading every
    /// register from it.
    pub(crate) fn adopt(&mut self, next: Rc<RefCell<Context>>) {
        self.ctx = next;
        let mut c = self.ctx.borrow_mut();
        self.stack = mem::take(&mut c.stack);
        self.top = c.top;
        self.ip = c.ip;
        self.fp = c.last_fp;
        if let Some(p) = c.proc.clone() {
            self.bc = p.code.clone();
            self.cp = p.closure.clone();
            self.self_ = p;
        }
    }

    pub(crate) fn push(&mut self, v: Value) {
        self.stack[self.top] = v;
        self.top += 1;
    }

    pub(crate) fn pop(&mut self) -> Value {
        self.top -= 1;
        mem::replace(&mut self.stack[self.top], Value::Void)
    }

    /// The `k`-th value from the top, 1-based like the original's `_ARGk`.
    pub(crate) fn arg(&self, k: usize) -> &Value {
        &self.stack[self.top - k]
    }

    pub(crate) fn set_arg(&mut self, k: usize, v: Value) {
        self.stack[self.top - k] = v;
    }

    /// Read one word-aligned unsigned operand and advance past it.
    pub(crate) fn read_word(&mut self) -> OpResult<u64> {
        match self.bc.word_at(self.ip) {
            Some((w, next)) => {
                self.ip = next;
                Ok(w)
            }
            None => Err(Raised::error(
                ExceptionKind::UnknownOpcode,
                "truncated operand",
                Value::Nil,
            )),
        }
    }

    /// Read one word-aligned signed operand.
    pub(crate) fn read_sword(&mut self) -> OpResult<i64> {
        self.read_word().map(|w| w as i64)
    }

    /// Read a value operand through the literal list.
    pub(crate) fn read_lit(&mut self) -> OpResult<Value> {
        let idx = self.read_word()?;
        self.bc.literal(idx).cloned().ok_or_else(|| {
            Raised::error(
                ExceptionKind::UnknownOpcode,
                "literal index out of range",
                Value::Nil,
            )
        })
    }

    /// Unbox a frame-header fixnum.
    pub(crate) fn fix_at(&self, idx: usize) -> OpResult<i64> {
        match &self.stack[idx] {
            Value::Fixnum(n) => Ok(*n),
            other => Err(Raised::error(
                ExceptionKind::Type,
                "corrupt activation frame",
                Value::list([other.clone()]),
            )),
        }
    }

    /// The primitive descriptor behind a literal operand.
    pub(crate) fn read_primop(&mut self) -> OpResult<Rc<PrimOp>> {
        match self.read_lit()? {
            Value::PrimOp(op) => Ok(op),
            other => Err(Raised::error(
                ExceptionKind::Type,
                "operand is not a primitive descriptor",
                Value::list([other]),
            )),
        }
    }
}
