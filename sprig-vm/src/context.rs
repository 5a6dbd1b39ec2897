//! Thread contexts and the process-wide globals table.
//!
//! A [`Context`] owns one thread's value stack and saved dispatch registers;
//! the VM spills into it at scheduling points and reloads from whatever
//! context the scheduler hands back. The [`Globals`] table is shared by all
//! threads of a runtime: top-level binding cells, the type registry, the
//! distinguished parameters, the scheduler and blocker hooks, and the
//! pinned bytecode singletons.

use core::fmt;
use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashMap;
use sprig_asm::{ExceptionKind, Opcode, ProcedureFlags};

use crate::bytecode::{BytecodeBuffer, BytecodeObject};
use crate::consts::{DEFAULT_REFUEL, FRAME_SIZE, STACK_SIZE};
use crate::primops::{core_bindings, CoreParameters, PrimOp};
use crate::types::TypeRegistry;
use crate::value::{Pair, Procedure, Symbol, Value, Vector};

/// Host scheduler callback: given the root thread, returns the context to
/// run next.
pub type SchedulerFn = Box<dyn FnMut(&Rc<RefCell<Context>>) -> Rc<RefCell<Context>>>;

/// Host blocker callback: parks the current thread on the port it would
/// block on.
pub type BlockerFn = Box<dyn FnMut(&Value)>;

/// Tunable runtime parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineParams {
    /// Value-stack slots per thread.
    pub stack_size: usize,
    /// Fuel quantum handed to a thread when scheduled.
    pub refuel: i64,
}

impl Default for MachineParams {
    fn default() -> Self {
        MachineParams {
            stack_size: STACK_SIZE,
            refuel: DEFAULT_REFUEL,
        }
    }
}

/// Process-wide shared state.
pub struct Globals {
    /// Top-level binding cells, keyed by name. Each cell is a live
    /// `(name . value)` pair; `#!undef` in the cdr means unbound.
    pub bindings: HashMap<Symbol, Rc<RefCell<Pair>>>,
    /// Type registry for `ISA`/`TYPEP` and the slot accessors.
    pub types: TypeRegistry,
    /// Distinguished dynamic parameters.
    pub params: CoreParameters,
    /// The shared one-instruction continuation-restore bytecode.
    pub resumecc: Rc<BytecodeObject>,
    /// Sentinel procedure installed as the outermost caller by `apply`.
    pub final_resumer: Rc<Procedure>,
    /// Pre-allocated out-of-stack exception, deliverable without allocating.
    pub oos_error: Value,
    /// Cooperative scheduler hook.
    pub scheduler: Option<SchedulerFn>,
    /// Blocking-I/O parking hook.
    pub blocker: Option<BlockerFn>,
}

impl Globals {
    /// A globals table with the core primitives bound and the bytecode
    /// singletons pinned.
    pub fn new() -> Rc<RefCell<Globals>> {
        let (table, params) = core_bindings();

        let mut resumecc = BytecodeBuffer::new();
        resumecc.emit(Opcode::ResumeCc);
        let resumecc = resumecc.finalize(Some("*resumecc*".into()), None);

        let mut done = BytecodeBuffer::new();
        done.emit(Opcode::Done);
        let done = done.finalize(Some("*final-resumer*".into()), None);
        let final_resumer = Rc::new(Procedure {
            flags: ProcedureFlags::empty(),
            num_args: 0,
            code: done,
            closure: Vector::shared(Vec::new()),
        });

        let globals = Rc::new(RefCell::new(Globals {
            bindings: HashMap::new(),
            types: TypeRegistry::new(),
            params,
            resumecc,
            final_resumer,
            oos_error: Value::exception(ExceptionKind::OutOfStack, "out of stack space", Value::Nil),
            scheduler: None,
            blocker: None,
        }));

        {
            let mut g = globals.borrow_mut();
            for (name, op) in table {
                g.define(Symbol::new(name), Value::PrimOp(op));
            }
        }
        globals
    }

    /// The binding cell for `name`, created unbound when absent.
    pub fn global_cell(&mut self, name: Symbol) -> Rc<RefCell<Pair>> {
        self.bindings
            .entry(name.clone())
            .or_insert_with(|| {
                Rc::new(RefCell::new(Pair {
                    car: Value::Symbol(name),
                    cdr: Value::Undef,
                    immutable: false,
                }))
            })
            .clone()
    }

    /// Bind `name` to `value` at top level.
    pub fn define(&mut self, name: Symbol, value: Value) {
        let cell = self.global_cell(name);
        cell.borrow_mut().cdr = value;
    }

    /// Current top-level value of `name`, if bound.
    pub fn lookup(&self, name: &Symbol) -> Option<Value> {
        let cell = self.bindings.get(name)?;
        match &cell.borrow().cdr {
            Value::Undef => None,
            v => Some(v.clone()),
        }
    }
}

impl fmt::Debug for Globals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Globals")
            .field("bindings", &self.bindings.len())
            .field("scheduler", &self.scheduler.is_some())
            .field("blocker", &self.blocker.is_some())
            .finish()
    }
}

/// One cooperative thread: stack, saved registers and dynamic bindings.
pub struct Context {
    /// The value stack; uniformly scannable, every slot is a value.
    pub stack: Vec<Value>,
    /// Slots in use.
    pub top: usize,
    /// Saved instruction pointer (byte offset into the current bytecode).
    pub ip: usize,
    /// Frame pointer at the last spill; also the anchor for stack traces.
    pub last_fp: usize,
    /// Procedure the thread is executing.
    pub proc: Option<Rc<Procedure>>,
    /// Fuel quantum granted on each reschedule; non-positive cancels the
    /// thread.
    pub refuel: i64,
    /// Dynamic-parameter alist: a Scheme list of `(descriptor . value)`
    /// pairs.
    pub params: Value,
    /// The shared globals table.
    pub globals: Rc<RefCell<Globals>>,
}

impl Context {
    /// An idle context with an empty stack.
    pub fn new(globals: Rc<RefCell<Globals>>, params: &MachineParams) -> Rc<RefCell<Context>> {
        Rc::new(RefCell::new(Context {
            stack: vec![Value::Void; params.stack_size],
            top: 0,
            ip: 0,
            last_fp: 0,
            proc: None,
            refuel: params.refuel,
            params: Value::Nil,
            globals,
        }))
    }

    /// A runnable context for `proc`, with the final-resumer sentinel frame
    /// pre-installed so the thread terminates cleanly when `proc` returns.
    pub fn spawn(
        globals: Rc<RefCell<Globals>>,
        machine_params: &MachineParams,
        proc: Rc<Procedure>,
    ) -> Rc<RefCell<Context>> {
        let ctx = Context::new(globals.clone(), machine_params);
        {
            let mut c = ctx.borrow_mut();
            let resumer = globals.borrow().final_resumer.clone();
            c.stack[0] = Value::Fixnum(0);
            c.stack[1] = Value::Fixnum(0);
            c.stack[2] = Value::Procedure(resumer);
            c.stack[3] = Value::Fixnum(0);
            c.top = FRAME_SIZE;
            c.last_fp = 0;
            c.ip = 0;
            c.proc = Some(proc);
        }
        ctx
    }

    /// The current binding pair of a dynamic parameter for this thread:
    /// the innermost alist entry, or the descriptor's default cell.
    pub fn parameter_cell(&self, op: &Rc<PrimOp>) -> Value {
        let key = Value::PrimOp(op.clone());
        for entry in self.params.iter_list() {
            if let Some(pair) = entry.as_pair() {
                if pair.borrow().car.eq_identity(&key) {
                    return entry;
                }
            }
        }
        op.data.clone().unwrap_or(Value::Void)
    }

    /// The current value of a dynamic parameter for this thread.
    pub fn parameter_ref(&self, op: &Rc<PrimOp>) -> Value {
        self.parameter_cell(op).cdr().unwrap_or(Value::Void)
    }

    /// Install a thread-local binding for a dynamic parameter.
    pub fn bind_parameter(&mut self, op: &Rc<PrimOp>, value: Value) {
        let entry = Value::cons(Value::PrimOp(op.clone()), value);
        self.params = Value::cons(entry, self.params.clone());
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("top", &self.top)
            .field("ip", &self.ip)
            .field("last_fp", &self.last_fp)
            .field("refuel", &self.refuel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globals_create_unbound_cells_on_demand() {
        let globals = Globals::new();
        let mut g = globals.borrow_mut();
        let cell = g.global_cell(Symbol::new("x"));
        assert!(matches!(cell.borrow().cdr, Value::Undef));
        assert!(g.lookup(&Symbol::new("x")).is_none());
        g.define(Symbol::new("x"), Value::Fixnum(1));
        assert!(matches!(g.lookup(&Symbol::new("x")), Some(Value::Fixnum(1))));
    }

    #[test]
    fn parameter_lookup_prefers_thread_bindings() {
        let globals = Globals::new();
        let op = globals.borrow().params.cur_out.clone();
        let ctx = Context::new(globals, &MachineParams::default());
        let default_cell = ctx.borrow().parameter_cell(&op);
        assert!(default_cell.as_pair().is_some());
        ctx.borrow_mut().bind_parameter(&op, Value::Fixnum(7));
        assert!(matches!(ctx.borrow().parameter_ref(&op), Value::Fixnum(7)));
    }

    #[test]
    fn core_primitives_are_bound() {
        let globals = Globals::new();
        let g = globals.borrow();
        for name in ["+", "car", "call/cc", "apply", "vector-ref"] {
            assert!(g.lookup(&Symbol::new(name)).is_some(), "{name} unbound");
        }
    }
}
