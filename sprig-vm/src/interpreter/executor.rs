//! The dispatch loop.
//!
//! One iteration: pay one unit of fuel (rescheduling at exhaustion), decode
//! one opcode, execute it. Opcodes that raise return `Err(Raised)`; the
//! loop delivers the exception to the installed handler through the normal
//! calling convention.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use sprig_asm::{ExceptionKind, Opcode, ProcedureFlags};

use crate::bytecode::align_up;
use crate::consts::STACK_HEADROOM;
use crate::context::Context;
use crate::error::{OpResult, Raised};
use crate::interpreter::flow::Flow;
use crate::interpreter::{alu, Regs};
use crate::value::{make_procedure, Exception, Pair, Procedure, Record, Value, Vector};

/// Execute `proc` on `ctx` until the VM halts; returns the top of stack or
/// the exception that terminated execution.
pub(crate) fn run(ctx: Rc<RefCell<Context>>, proc: Rc<Procedure>) -> Value {
    let mut r = Regs::enter(ctx, proc);
    loop {
        r.fuel -= 1;
        if r.fuel <= 0 {
            let has_scheduler = r.globals.borrow().scheduler.is_some();
            if has_scheduler {
                r.save();
                let taken = r.globals.borrow_mut().scheduler.take();
                if let Some(mut scheduler) = taken {
                    let next = scheduler(&r.root);
                    r.globals.borrow_mut().scheduler = Some(scheduler);
                    r.adopt(next);
                }
            }
            r.fuel = r.ctx.borrow().refuel;
            if r.fuel <= 0 {
                match r.end_loop() {
                    Some(v) => return v,
                    None => continue,
                }
            }
        }
        let flow = match r.step() {
            Ok(flow) => flow,
            Err(Raised(exn)) => r.deliver(exn, true),
        };
        if matches!(flow, Flow::Halt) {
            if let Some(v) = r.end_loop() {
                return v;
            }
        }
    }
}

impl Regs {
    fn type_err(&self, who: &str, what: &str, v: &Value) -> Raised {
        Raised::error(
            ExceptionKind::Type,
            format!("{who}: {what}"),
            Value::list([v.clone()]),
        )
    }

    fn want_pair(&self, k: usize, who: &str) -> OpResult<Rc<RefCell<Pair>>> {
        match self.arg(k) {
            Value::Pair(p) => Ok(p.clone()),
            other => Err(self.type_err(who, "not a pair", other)),
        }
    }

    fn want_vector(&self, k: usize, who: &str) -> OpResult<Rc<RefCell<Vector>>> {
        match self.arg(k) {
            Value::Vector(v) => Ok(v.clone()),
            other => Err(self.type_err(who, "not a vector", other)),
        }
    }

    fn want_string(&self, k: usize, who: &str) -> OpResult<Rc<RefCell<crate::value::SchemeString>>> {
        match self.arg(k) {
            Value::String(s) => Ok(s.clone()),
            other => Err(self.type_err(who, "not a string", other)),
        }
    }

    fn want_bytes(&self, k: usize, who: &str) -> OpResult<Rc<RefCell<crate::value::Bytes>>> {
        match self.arg(k) {
            Value::Bytes(b) => Ok(b.clone()),
            other => Err(self.type_err(who, "not a byte-vector", other)),
        }
    }

    fn want_fixnum(&self, k: usize, who: &str) -> OpResult<i64> {
        match self.arg(k) {
            Value::Fixnum(n) => Ok(*n),
            other => Err(self.type_err(who, "not an integer", other)),
        }
    }

    fn want_char(&self, k: usize, who: &str) -> OpResult<char> {
        match self.arg(k) {
            Value::Char(c) => Ok(*c),
            other => Err(self.type_err(who, "not a character", other)),
        }
    }

    fn want_port(&self, k: usize, who: &str, input: bool) -> OpResult<Rc<RefCell<crate::ports::Port>>> {
        match self.arg(k) {
            Value::Port(p) if p.borrow().is_input() == input => Ok(p.clone()),
            other => Err(self.type_err(
                who,
                if input {
                    "not an input-port"
                } else {
                    "not an output-port"
                },
                other,
            )),
        }
    }

    fn check_index(&self, who: &str, n: i64, len: usize, obj: &Value) -> OpResult<usize> {
        if n < 0 || n as usize >= len {
            Err(Raised::error(
                ExceptionKind::IndexOutOfRange,
                format!("{who}: index out of range"),
                Value::list([obj.clone(), Value::Fixnum(n)]),
            ))
        } else {
            Ok(n as usize)
        }
    }

    fn check_immutable(&self, who: &str, what: &str, immutable: bool, v: &Value) -> OpResult<()> {
        if immutable {
            Err(Raised::error(
                ExceptionKind::Immutable,
                format!("{who}: immutable {what}"),
                Value::list([v.clone()]),
            ))
        } else {
            Ok(())
        }
    }

    fn type_descriptor(&self, index: usize, who: &str) -> OpResult<Rc<crate::types::TypeDescriptor>> {
        self.globals.borrow().types.get(index).cloned().ok_or_else(|| {
            Raised::error(
                ExceptionKind::Type,
                format!("{who}: unknown type"),
                Value::list([Value::Fixnum(index as i64)]),
            )
        })
    }

    /// Place a foreign-call result, short-circuiting exception results to
    /// the handler.
    fn fcall(&mut self, argc: usize) -> OpResult<()> {
        let op = self.read_primop()?;
        let Some(func) = op.func else {
            return Err(Raised::error(
                ExceptionKind::Type,
                format!("{}: not a foreign procedure", op.name),
                Value::list([Value::PrimOp(op.clone())]),
            ));
        };
        let args: Vec<Value> = (1..=argc).map(|k| self.arg(k).clone()).collect();
        let result = func(&op, &args);
        if argc == 0 {
            self.push(result);
        } else {
            self.top -= argc - 1;
            self.set_arg(1, result);
        }
        if matches!(self.arg(1), Value::Exception(_)) {
            let e = self.pop();
            return Err(Raised::from_value(e));
        }
        Ok(())
    }

    /// Decode and execute one instruction.
    pub(crate) fn step(&mut self) -> OpResult<Flow> {
        let Some(byte) = self.bc.byte_at(self.ip) else {
            return Err(Raised::error(
                ExceptionKind::UnknownOpcode,
                "ran off the end of bytecode",
                Value::Nil,
            ));
        };
        self.ip += 1;
        let Ok(op) = Opcode::try_from(byte) else {
            return Err(Raised::error(
                ExceptionKind::UnknownOpcode,
                "unknown opcode",
                Value::list([Value::Fixnum(byte as i64)]),
            ));
        };
        tracing::trace!(ip = self.ip - 1, top = self.top, fp = self.fp, "{op}");

        match op {
            Opcode::Noop => {}

            Opcode::Raise => {
                let e = self.pop();
                return Ok(self.deliver(e, false));
            }

            Opcode::ResumeCc => self.resume_cc()?,

            Opcode::CallCc => self.call_cc()?,

            Opcode::Apply1 => self.apply1_op()?,

            Opcode::TailCall => {
                let n = self.read_word()? as usize;
                self.tail_call(n)?;
            }

            Opcode::Call => {
                let n = self.read_word()? as usize;
                if self.top + STACK_HEADROOM >= self.stack.len() {
                    let oos = self.globals.borrow().oos_error.clone();
                    return Err(Raised::from_value(oos));
                }
                let f = self.arg(1).clone();
                self.make_call(n, f, self.ip)?;
            }

            Opcode::FCall0 => self.fcall(0)?,
            Opcode::FCall1 => self.fcall(1)?,
            Opcode::FCall2 => self.fcall(2)?,
            Opcode::FCall3 => self.fcall(3)?,
            Opcode::FCall4 => self.fcall(4)?,
            Opcode::FCallN => {
                let slot = align_up(self.ip);
                let argc = match self.bc.word_at(slot).and_then(|(w, _)| self.bc.literal(w)) {
                    Some(Value::PrimOp(op)) => op.num_args,
                    _ => 0,
                };
                self.fcall(argc)?;
            }

            Opcode::JumpUnless => {
                let slot = align_up(self.ip);
                let d = self.read_sword()?;
                let v = self.pop();
                if !v.is_truthy() {
                    self.ip = (slot as i64 + d) as usize;
                }
            }

            Opcode::Jump => {
                let slot = align_up(self.ip);
                let d = self.read_sword()?;
                self.ip = (slot as i64 + d) as usize;
            }

            Opcode::Push => {
                let v = self.read_lit()?;
                self.push(v);
            }

            Opcode::Drop => {
                self.pop();
            }

            Opcode::GlobalRef | Opcode::GlobalKnownRef => {
                let cell = self.read_lit()?;
                let Some(pair) = cell.as_pair() else {
                    return Err(self.type_err("global-ref", "corrupt binding cell", &cell));
                };
                let (name, value) = {
                    let p = pair.borrow();
                    (p.car.clone(), p.cdr.clone())
                };
                if op == Opcode::GlobalRef && matches!(value, Value::Undef) {
                    return Err(Raised::error(
                        ExceptionKind::UndefinedVariable,
                        "undefined variable",
                        Value::list([name]),
                    ));
                }
                self.push(value);
            }

            Opcode::ParameterRef => {
                let p = self.read_primop()?;
                let cell = self.ctx.borrow().parameter_cell(&p);
                self.push(cell);
            }

            Opcode::StackRef => {
                let k = self.read_sword()?;
                let v = self.stack[self.top - k as usize].clone();
                self.push(v);
            }

            Opcode::LocalRef => {
                let k = self.read_sword()?;
                let idx = (self.fp as i64 - 1 - k) as usize;
                let v = self.stack[idx].clone();
                self.push(v);
            }

            Opcode::LocalSet => {
                let k = self.read_sword()?;
                let idx = (self.fp as i64 - 1 - k) as usize;
                let v = core::mem::replace(&mut self.stack[self.top - 1], Value::Void);
                self.stack[idx] = v;
            }

            Opcode::ClosureRef => {
                let k = self.read_word()? as usize;
                let v = self.cp.borrow().items.get(k).cloned().ok_or_else(|| {
                    Raised::error(
                        ExceptionKind::IndexOutOfRange,
                        "closure-ref: index out of range",
                        Value::list([Value::Fixnum(k as i64)]),
                    )
                })?;
                self.push(v);
            }

            Opcode::VectorRef => {
                let vec = self.want_vector(1, "vector-ref")?;
                let n = self.want_fixnum(2, "vector-ref")?;
                let obj = self.arg(1).clone();
                let i = self.check_index("vector-ref", n, vec.borrow().items.len(), &obj)?;
                let v = vec.borrow().items[i].clone();
                self.top -= 1;
                self.set_arg(1, v);
            }

            Opcode::VectorSet => {
                let vec = self.want_vector(1, "vector-set!")?;
                let obj = self.arg(1).clone();
                self.check_immutable("vector-set!", "vector", vec.borrow().immutable, &obj)?;
                let n = self.want_fixnum(2, "vector-set!")?;
                let i = self.check_index("vector-set!", n, vec.borrow().items.len(), &obj)?;
                let v = self.arg(3).clone();
                vec.borrow_mut().items[i] = v;
                self.set_arg(3, Value::Void);
                self.top -= 2;
            }

            Opcode::VectorLength => {
                let vec = self.want_vector(1, "vector-length")?;
                let len = vec.borrow().items.len();
                self.set_arg(1, Value::Fixnum(len as i64));
            }

            Opcode::BytesRef => {
                let bytes = self.want_bytes(1, "bytes-ref")?;
                let n = self.want_fixnum(2, "bytes-ref")?;
                let obj = self.arg(1).clone();
                let i = self.check_index("bytes-ref", n, bytes.borrow().data.len(), &obj)?;
                let b = bytes.borrow().data[i];
                self.top -= 1;
                self.set_arg(1, Value::Fixnum(b as i64));
            }

            Opcode::StringRef => {
                let s = self.want_string(1, "string-ref")?;
                let n = self.want_fixnum(2, "string-ref")?;
                let obj = self.arg(1).clone();
                let i = self.check_index("string-ref", n, s.borrow().char_len(), &obj)?;
                let c = s.borrow().char_ref(i).unwrap_or(char::REPLACEMENT_CHARACTER);
                self.top -= 1;
                self.set_arg(1, Value::Char(c));
            }

            Opcode::BytesSet => {
                let bytes = self.want_bytes(1, "bytes-set!")?;
                let obj = self.arg(1).clone();
                self.check_immutable("bytes-set!", "byte-vector", bytes.borrow().immutable, &obj)?;
                let n = self.want_fixnum(2, "bytes-set!")?;
                let i = self.check_index("bytes-set!", n, bytes.borrow().data.len(), &obj)?;
                let b = self.want_fixnum(3, "bytes-set!")?;
                if !(0..=255).contains(&b) {
                    let v = self.arg(3).clone();
                    return Err(self.type_err("bytes-set!", "not a byte", &v));
                }
                bytes.borrow_mut().data[i] = b as u8;
                self.set_arg(3, Value::Void);
                self.top -= 2;
            }

            Opcode::StringSet => {
                let s = self.want_string(1, "string-set!")?;
                let obj = self.arg(1).clone();
                self.check_immutable("string-set!", "string", s.borrow().immutable, &obj)?;
                let n = self.want_fixnum(2, "string-set!")?;
                let c = self.want_char(3, "string-set!")?;
                let i = self.check_index("string-set!", n, s.borrow().char_len(), &obj)?;
                s.borrow_mut().char_set(i, c);
                self.set_arg(3, Value::Void);
                self.top -= 2;
            }

            Opcode::BytesLength => {
                let bytes = self.want_bytes(1, "bytes-length")?;
                let len = bytes.borrow().data.len();
                self.set_arg(1, Value::Fixnum(len as i64));
            }

            Opcode::StringLength => {
                let s = self.want_string(1, "string-length")?;
                let len = s.borrow().char_len();
                self.set_arg(1, Value::Fixnum(len as i64));
            }

            Opcode::MakeProcedure => {
                let flags = self.want_fixnum(1, "make-procedure")?;
                let arity = self.want_fixnum(2, "make-procedure")?;
                let code = match self.arg(3) {
                    Value::Bytecode(bc) => bc.clone(),
                    other => return Err(self.type_err("make-procedure", "not bytecode", other)),
                };
                let closure = match self.arg(4) {
                    Value::Vector(v) => v.clone(),
                    other => return Err(self.type_err("make-procedure", "not a vector", other)),
                };
                let p = make_procedure(
                    ProcedureFlags::from_word(flags),
                    arity as usize,
                    code,
                    closure,
                );
                self.top -= 3;
                self.set_arg(1, p);
            }

            Opcode::MakeVector => {
                let n = self.want_fixnum(1, "make-vector")?;
                if n < 0 {
                    let v = self.arg(1).clone();
                    return Err(self.type_err("make-vector", "negative length", &v));
                }
                let fill = self.arg(2).clone();
                let v = Value::vector(vec![fill; n as usize]);
                self.top -= 1;
                self.set_arg(1, v);
            }

            Opcode::MakeException => {
                let kind = match self.arg(1) {
                    Value::Symbol(s) => {
                        ExceptionKind::from_name(s.as_str()).unwrap_or(ExceptionKind::User)
                    }
                    _ => ExceptionKind::User,
                };
                let message = match self.arg(2) {
                    Value::String(s) => s.borrow().as_str().to_string(),
                    other => other.to_string(),
                };
                let irritants = self.arg(3).clone();
                let procedure = self.arg(4).clone();
                let source = self.arg(5).clone();
                let e = Value::Exception(Rc::new(Exception {
                    kind,
                    message,
                    irritants,
                    procedure: RefCell::new(procedure),
                    source,
                }));
                self.top -= 4;
                self.set_arg(1, e);
            }

            Opcode::And => {
                let a = self.pop();
                let b = self.arg(1).clone();
                self.set_arg(1, Value::boolean(a.is_truthy() && b.is_truthy()));
            }

            Opcode::IsEof => {
                let v = Value::boolean(matches!(self.arg(1), Value::Eof));
                self.set_arg(1, v);
            }
            Opcode::IsNull => {
                let v = Value::boolean(matches!(self.arg(1), Value::Nil));
                self.set_arg(1, v);
            }
            Opcode::IsFixnum => {
                let v = Value::boolean(matches!(self.arg(1), Value::Fixnum(_)));
                self.set_arg(1, v);
            }
            Opcode::IsSymbol => {
                let v = Value::boolean(matches!(self.arg(1), Value::Symbol(_)));
                self.set_arg(1, v);
            }
            Opcode::IsChar => {
                let v = Value::boolean(matches!(self.arg(1), Value::Char(_)));
                self.set_arg(1, v);
            }

            Opcode::IsA => {
                let obj = self.arg(1).clone();
                let t = match self.arg(2) {
                    Value::Type(t) => t.clone(),
                    other => return Err(self.type_err("is-a?", "not a type", other)),
                };
                let res = self.globals.borrow().types.check_type(&obj, &t);
                self.top -= 1;
                self.set_arg(1, Value::boolean(res));
            }

            Opcode::IsType => {
                let index = self.read_word()? as usize;
                let t = self.type_descriptor(index, "type?")?;
                let res = self.globals.borrow().types.check_type(self.arg(1), &t);
                self.set_arg(1, Value::boolean(res));
            }

            Opcode::Make => {
                let index = self.read_word()? as usize;
                let size = self.read_word()? as usize;
                self.push(Value::Record(Rc::new(RefCell::new(Record {
                    type_index: index,
                    slots: vec![Value::Void; size],
                    immutable: false,
                }))));
            }

            Opcode::SlotRef => {
                let index = self.read_word()? as usize;
                let slot = self.read_word()? as usize;
                let t = self.type_descriptor(index, "slot-ref")?;
                let obj = self.arg(1).clone();
                if !self.globals.borrow().types.check_type(&obj, &t) {
                    return Err(Raised::error(
                        ExceptionKind::Type,
                        "slot-ref: bad type",
                        Value::list([Value::string(t.name.clone()), obj]),
                    ));
                }
                let v = self.record_slot(&obj, slot, "slot-ref")?;
                self.set_arg(1, v);
            }

            Opcode::SlotSet => {
                let index = self.read_word()? as usize;
                let slot = self.read_word()? as usize;
                let t = self.type_descriptor(index, "slot-set!")?;
                let obj = self.arg(1).clone();
                if !self.globals.borrow().types.check_type(&obj, &t) {
                    return Err(Raised::error(
                        ExceptionKind::Type,
                        "slot-set!: bad type",
                        Value::list([Value::string(t.name.clone()), obj]),
                    ));
                }
                let v = self.arg(2).clone();
                self.record_slot_set(&obj, slot, v, "slot-set!")?;
                self.set_arg(2, Value::Void);
                self.top -= 1;
            }

            Opcode::SlotnRef => {
                let t = match self.arg(1) {
                    Value::Type(t) => t.clone(),
                    other => return Err(self.type_err("slot-ref", "not a record type", other)),
                };
                let obj = self.arg(2).clone();
                if !self.globals.borrow().types.check_type(&obj, &t) {
                    return Err(self.type_err("slot-ref", "bad type", &obj));
                }
                let n = self.want_fixnum(3, "slot-ref")?;
                let v = self.record_slot(&obj, n as usize, "slot-ref")?;
                self.top -= 2;
                self.set_arg(1, v);
            }

            Opcode::SlotnSet => {
                let t = match self.arg(1) {
                    Value::Type(t) => t.clone(),
                    other => return Err(self.type_err("slot-set!", "not a record type", other)),
                };
                let obj = self.arg(2).clone();
                if !self.globals.borrow().types.check_type(&obj, &t) {
                    return Err(self.type_err("slot-set!", "bad type", &obj));
                }
                let n = self.want_fixnum(3, "slot-set!")?;
                let v = self.arg(4).clone();
                self.record_slot_set(&obj, n as usize, v, "slot-set!")?;
                self.set_arg(4, Value::Void);
                self.top -= 3;
            }

            Opcode::Car => {
                let p = self.want_pair(1, "car")?;
                let v = p.borrow().car.clone();
                self.set_arg(1, v);
            }

            Opcode::Cdr => {
                let p = self.want_pair(1, "cdr")?;
                let v = p.borrow().cdr.clone();
                self.set_arg(1, v);
            }

            Opcode::SetCar => {
                let p = self.want_pair(1, "set-car!")?;
                let obj = self.arg(1).clone();
                self.check_immutable("set-car!", "pair", p.borrow().immutable, &obj)?;
                let v = self.arg(2).clone();
                p.borrow_mut().car = v;
                self.set_arg(2, Value::Void);
                self.top -= 1;
            }

            Opcode::SetCdr => {
                let p = self.want_pair(1, "set-cdr!")?;
                let obj = self.arg(1).clone();
                self.check_immutable("set-cdr!", "pair", p.borrow().immutable, &obj)?;
                let v = self.arg(2).clone();
                p.borrow_mut().cdr = v;
                self.set_arg(2, Value::Void);
                self.top -= 1;
            }

            Opcode::Cons => {
                let a = self.pop();
                let b = self.arg(1).clone();
                self.set_arg(1, Value::cons(a, b));
            }

            Opcode::Add => self.binary_numeric(alu::add)?,
            Opcode::Sub => self.binary_numeric(alu::sub)?,
            Opcode::Mul => self.binary_numeric(alu::mul)?,
            Opcode::Div => self.binary_numeric(alu::div)?,
            Opcode::Quotient => self.binary_numeric(alu::quotient)?,
            Opcode::Remainder => self.binary_numeric(alu::remainder)?,

            Opcode::Lt => self.binary_compare(alu::lt)?,
            Opcode::Le => self.binary_compare(alu::le)?,
            Opcode::NumEq => self.binary_compare(alu::num_eq)?,

            Opcode::Eq => {
                let a = self.pop();
                let b = self.arg(1).clone();
                self.set_arg(1, Value::boolean(a.eq_identity(&b)));
            }

            Opcode::FixToFlo => {
                let v = self.arg(1).clone();
                let r = alu::fix_to_flo(&v)?;
                self.set_arg(1, r);
            }

            Opcode::FloToFix => {
                let v = self.arg(1).clone();
                let r = alu::flo_to_fix(&v)?;
                self.set_arg(1, r);
            }

            Opcode::CharToInt => {
                let c = self.want_char(1, "char->integer")?;
                self.set_arg(1, Value::Fixnum(c as i64));
            }

            Opcode::IntToChar => {
                let n = self.want_fixnum(1, "integer->char")?;
                let c = u32::try_from(n).ok().and_then(char::from_u32).ok_or_else(|| {
                    Raised::error(
                        ExceptionKind::Type,
                        "integer->char: invalid character code",
                        Value::list([Value::Fixnum(n)]),
                    )
                })?;
                self.set_arg(1, Value::Char(c));
            }

            Opcode::CharUpcase => {
                let c = self.want_char(1, "char-upcase")?;
                self.set_arg(1, Value::Char(c.to_ascii_uppercase()));
            }

            Opcode::CharDowncase => {
                let c = self.want_char(1, "char-downcase")?;
                self.set_arg(1, Value::Char(c.to_ascii_lowercase()));
            }

            Opcode::WriteChar => {
                let c = self.want_char(1, "write-char")?;
                let port = self.want_port(2, "write-char", false)?;
                if port.borrow_mut().write_char(c).is_err() {
                    let pv = self.arg(2).clone();
                    return Err(self.type_err("write-char", "output error", &pv));
                }
                self.set_arg(2, Value::Void);
                self.top -= 1;
            }

            Opcode::Newline => {
                let port = self.want_port(1, "newline", false)?;
                if port.borrow_mut().newline().is_err() {
                    let pv = self.arg(1).clone();
                    return Err(self.type_err("newline", "output error", &pv));
                }
                self.set_arg(1, Value::Void);
            }

            Opcode::ReadChar => self.read_port_char(false)?,
            Opcode::PeekChar => self.read_port_char(true)?,

            Opcode::Yield => {
                self.fuel = 0;
                self.push(Value::Void);
            }

            Opcode::Ret => self.ret_op()?,

            Opcode::Done => return Ok(Flow::Halt),
        }
        Ok(Flow::Continue)
    }

    fn binary_numeric(&mut self, f: fn(&Value, &Value) -> OpResult<Value>) -> OpResult<()> {
        let a = self.arg(1).clone();
        let b = self.arg(2).clone();
        self.top -= 1;
        let r = f(&a, &b)?;
        self.set_arg(1, r);
        Ok(())
    }

    fn binary_compare(&mut self, f: fn(&Value, &Value) -> OpResult<bool>) -> OpResult<()> {
        let a = self.arg(1).clone();
        let b = self.arg(2).clone();
        self.top -= 1;
        let r = f(&a, &b)?;
        self.set_arg(1, Value::boolean(r));
        Ok(())
    }

    fn record_slot(&self, obj: &Value, slot: usize, who: &str) -> OpResult<Value> {
        let Value::Record(r) = obj else {
            return Err(self.type_err(who, "bad type", obj));
        };
        r.borrow().slots.get(slot).cloned().ok_or_else(|| {
            Raised::error(
                ExceptionKind::IndexOutOfRange,
                format!("{who}: index out of range"),
                Value::list([obj.clone(), Value::Fixnum(slot as i64)]),
            )
        })
    }

    fn record_slot_set(&self, obj: &Value, slot: usize, v: Value, who: &str) -> OpResult<()> {
        let Value::Record(r) = obj else {
            return Err(self.type_err(who, "bad type", obj));
        };
        self.check_immutable(who, "object", r.borrow().immutable, obj)?;
        let mut r = r.borrow_mut();
        if slot >= r.slots.len() {
            return Err(Raised::error(
                ExceptionKind::IndexOutOfRange,
                format!("{who}: index out of range"),
                Value::list([obj.clone(), Value::Fixnum(slot as i64)]),
            ));
        }
        r.slots[slot] = v;
        Ok(())
    }

    fn read_port_char(&mut self, peek: bool) -> OpResult<()> {
        let who = if peek { "peek-char" } else { "read-char" };
        let port = self.want_port(1, who, true)?;
        let res = {
            let mut p = port.borrow_mut();
            if peek {
                p.peek_char()
            } else {
                p.read_char()
            }
        };
        match res {
            Ok(Some(c)) => self.set_arg(1, Value::Char(c)),
            Ok(None) => self.set_arg(1, Value::Eof),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let taken = self.globals.borrow_mut().blocker.take();
                if let Some(mut blocker) = taken {
                    let pv = self.arg(1).clone();
                    blocker(&pv);
                    self.globals.borrow_mut().blocker = Some(blocker);
                    // Retry the same instruction after rescheduling.
                    self.fuel = 0;
                    self.ip -= 1;
                } else {
                    self.set_arg(1, Value::Eof);
                }
            }
            Err(_) => self.set_arg(1, Value::Eof),
        }
        Ok(())
    }
}
