//! The code generator: analyzed AST to bytecode.
//!
//! A single recursive emitter dispatches on the node variant. Codegen state
//! is an explicit [`Compiler`] value per compile: the output buffer, the
//! lambda being compiled (`None` at top level), the tail-position flag and a
//! stack-depth counter. Lambdas compile in a child `Compiler` and reach back
//! into the parent only to build their closure vector.

use std::rc::Rc;

use sprig_asm::{ExceptionKind, OpClass, Opcode, ProcedureFlags};

use crate::ast::{Ast, Binding, LambdaNode, RefNode};
use crate::bytecode::{BytecodeBuffer, BytecodeObject};
use crate::error::CompileError;
use crate::primops::PrimOp;
use crate::value::{make_procedure, Procedure, Symbol, Value, Vector};

/// Compilation context for one bytecode object.
pub struct Compiler {
    buf: BytecodeBuffer,
    lambda: Option<Rc<LambdaNode>>,
    tailp: bool,
    depth: i64,
}

/// Compile a top-level expression into a nullary procedure body.
pub fn compile(ast: &Ast) -> Result<Rc<BytecodeObject>, CompileError> {
    let mut c = Compiler::new(None);
    c.generate(ast)?;
    Ok(c.finalize(None, None))
}

/// Compile a top-level expression and wrap it as a zero-argument procedure.
pub fn compile_procedure(ast: &Ast) -> Result<Rc<Procedure>, CompileError> {
    let code = compile(ast)?;
    Ok(Rc::new(Procedure {
        flags: ProcedureFlags::empty(),
        num_args: 0,
        code,
        closure: Vector::shared(Vec::new()),
    }))
}

/// Wrap a primitive descriptor as a procedure of exactly `n` parameters,
/// caching the result on the descriptor when `n` matches the declaration.
pub fn make_opcode_procedure(op: &Rc<PrimOp>, n: usize) -> Result<Rc<Procedure>, CompileError> {
    if n == op.num_args {
        if let Some(p) = op.proc.borrow().clone() {
            return Ok(p);
        }
    } else if n < op.num_args {
        return Err(CompileError::new(
            ExceptionKind::NotEnoughArgs,
            format!("not enough args for opcode {}", op.name),
        ));
    } else if !op.variadic {
        return Err(CompileError::new(
            ExceptionKind::TooManyArgs,
            format!("too many args for opcode {}", op.name),
        ));
    }
    let params: Vec<Symbol> = (1..=n).map(|i| Symbol::new(&format!("%{i}"))).collect();
    let lam = LambdaNode::new(params.clone(), None);
    let refs: Vec<Ast> = params
        .iter()
        .map(|p| Ast::Ref(RefNode::lexical(p.clone(), &lam)))
        .collect();
    let mut c = Compiler::new(Some(lam));
    c.generate_opcode_app(op, &refs)?;
    let code = c.finalize(Some(op.name.to_string()), None);
    let proc = Rc::new(Procedure {
        flags: ProcedureFlags::empty(),
        num_args: n,
        code,
        closure: Vector::shared(Vec::new()),
    });
    if n == op.num_args {
        *op.proc.borrow_mut() = Some(proc.clone());
    }
    Ok(proc)
}

impl Compiler {
    fn new(lambda: Option<Rc<LambdaNode>>) -> Self {
        Compiler {
            buf: BytecodeBuffer::new(),
            lambda,
            tailp: false,
            depth: 0,
        }
    }

    fn finalize(mut self, name: Option<String>, source: Option<(String, u64)>) -> Rc<BytecodeObject> {
        self.buf.emit(Opcode::Ret);
        self.buf.finalize(name, source)
    }

    fn generate(&mut self, ast: &Ast) -> Result<(), CompileError> {
        match ast {
            Ast::Lit(v) => {
                self.buf.emit_push(v.clone());
                self.depth += 1;
                Ok(())
            }
            Ast::Ref(r) => self.generate_ref(r, true),
            Ast::Set { var, value } => self.generate_set(var, value),
            Ast::Cond { test, pass, fail } => self.generate_cond(test, pass, fail),
            Ast::Seq(items) => self.generate_seq(items),
            Ast::Lambda(lam) => self.generate_lambda(lam),
            Ast::App(items) => self.generate_app(items),
        }
    }

    fn generate_ref(&mut self, r: &Rc<RefNode>, unbox: bool) -> Result<(), CompileError> {
        match &r.binding {
            Binding::Global(cell) => {
                if unbox {
                    let known = !matches!(cell.borrow().cdr, Value::Undef);
                    self.buf.emit(if known {
                        Opcode::GlobalKnownRef
                    } else {
                        Opcode::GlobalRef
                    });
                    self.buf.emit_lit_operand(Value::Pair(cell.clone()));
                } else {
                    self.buf.emit_push(Value::Pair(cell.clone()));
                }
                self.depth += 1;
                Ok(())
            }
            Binding::Lexical(_) => {
                let loc = r
                    .binding
                    .lambda()
                    .ok_or_else(|| CompileError::msg(format!("dangling binding for {}", r.name)))?;
                self.generate_non_global_ref(&r.name, &loc, unbox)
            }
        }
    }

    /// Emit a lexical reference relative to the compiler's current lambda:
    /// `LOCAL_REF` when `loc` is the current lambda, `CLOSURE_REF` into the
    /// free-variable list otherwise, plus `CDR` to unbox mutated variables.
    fn generate_non_global_ref(
        &mut self,
        name: &Symbol,
        loc: &Rc<LambdaNode>,
        unbox: bool,
    ) -> Result<(), CompileError> {
        let lam = self
            .lambda
            .clone()
            .ok_or_else(|| CompileError::msg(format!("lexical reference to {name} at top level")))?;
        if Rc::ptr_eq(loc, &lam) {
            let k = lam
                .param_index(name)
                .ok_or_else(|| CompileError::msg(format!("unknown local {name}")))?;
            self.buf.emit(Opcode::LocalRef);
            self.buf.emit_sword(k);
        } else {
            let idx = {
                let fv = lam.free_vars.borrow();
                fv.iter().position(|f| {
                    f.name == *name
                        && f.binding
                            .lambda()
                            .map_or(false, |l| Rc::ptr_eq(&l, loc))
                })
            }
            .ok_or_else(|| CompileError::msg(format!("{name} missing from free-variable list")))?;
            self.buf.emit(Opcode::ClosureRef);
            self.buf.emit_word(idx as u64);
        }
        if unbox && loc.is_set_var(name) {
            self.buf.emit(Opcode::Cdr);
        }
        self.depth += 1;
        Ok(())
    }

    fn generate_set(&mut self, var: &Rc<RefNode>, value: &Ast) -> Result<(), CompileError> {
        self.tailp = false;
        if let Ast::Lambda(lam) = value {
            if lam.name.borrow().is_none() {
                *lam.name.borrow_mut() = Some(var.name.to_string());
            }
        }
        self.generate(value)?;
        match &var.binding {
            Binding::Global(cell) => {
                self.buf.emit_push(Value::Pair(cell.clone()));
                self.buf.emit(Opcode::SetCdr);
            }
            Binding::Lexical(_) => {
                let loc = var
                    .binding
                    .lambda()
                    .ok_or_else(|| CompileError::msg(format!("dangling binding for {}", var.name)))?;
                if loc.is_set_var(&var.name) {
                    // Mutated variables are boxed; write through the box.
                    self.generate_ref(var, false)?;
                    self.buf.emit(Opcode::SetCdr);
                } else {
                    let k = loc.param_index(&var.name).ok_or_else(|| {
                        CompileError::msg(format!("unknown local {}", var.name))
                    })?;
                    self.buf.emit(Opcode::LocalSet);
                    self.buf.emit_sword(k);
                }
            }
        }
        self.depth -= 1;
        Ok(())
    }

    fn generate_cond(&mut self, test: &Ast, pass: &Ast, fail: &Ast) -> Result<(), CompileError> {
        let tailp = self.tailp;
        self.tailp = false;
        self.generate(test)?;
        self.tailp = tailp;
        self.buf.emit(Opcode::JumpUnless);
        self.depth -= 1;
        let label1 = self.buf.make_label();
        self.generate(pass)?;
        self.tailp = tailp;
        self.buf.emit(Opcode::Jump);
        self.depth -= 1;
        let label2 = self.buf.make_label();
        self.buf.patch_label(label1);
        self.generate(fail)?;
        self.buf.patch_label(label2);
        Ok(())
    }

    fn generate_seq(&mut self, items: &[Ast]) -> Result<(), CompileError> {
        let Some((last, init)) = items.split_last() else {
            self.buf.emit_push(Value::Void);
            self.depth += 1;
            return Ok(());
        };
        let tailp = self.tailp;
        self.tailp = false;
        for item in init {
            // Bare literals in effect position compile to nothing.
            if matches!(item, Ast::Lit(_)) {
                continue;
            }
            self.generate(item)?;
            self.buf.emit(Opcode::Drop);
            self.depth -= 1;
        }
        self.tailp = tailp;
        self.generate(last)
    }

    fn generate_app(&mut self, items: &[Ast]) -> Result<(), CompileError> {
        let (head, args) = items
            .split_first()
            .ok_or_else(|| CompileError::msg("empty application"))?;
        if let Ast::Lit(Value::PrimOp(op)) = head {
            let op = op.clone();
            self.generate_opcode_app(&op, args)
        } else {
            self.generate_general_app(head, args)
        }
    }

    fn generate_general_app(&mut self, head: &Ast, args: &[Ast]) -> Result<(), CompileError> {
        let tailp = self.tailp;
        self.tailp = false;

        // Arguments in reverse so the first ends up topmost, operator last.
        for arg in args.iter().rev() {
            self.generate(arg)?;
        }
        self.generate(head)?;

        self.buf.emit(if tailp { Opcode::TailCall } else { Opcode::Call });
        self.buf.emit_word(args.len() as u64);

        self.tailp = tailp;
        self.depth -= args.len() as i64;
        Ok(())
    }

    fn generate_opcode_app(&mut self, op: &Rc<PrimOp>, args: &[Ast]) -> Result<(), CompileError> {
        let mut num_args = args.len();
        if op.class == OpClass::Parameter {
            if num_args > 1 {
                return Err(CompileError::new(
                    ExceptionKind::TooManyArgs,
                    format!("too many args for opcode {}", op.name),
                ));
            }
        } else {
            if num_args < op.num_args {
                return Err(CompileError::new(
                    ExceptionKind::NotEnoughArgs,
                    format!("not enough args for opcode {}", op.name),
                ));
            }
            if num_args > op.num_args && !op.variadic {
                return Err(CompileError::new(
                    ExceptionKind::TooManyArgs,
                    format!("too many args for opcode {}", op.name),
                ));
            }
        }

        self.tailp = false;
        let mut inv_default = false;

        if op.class != OpClass::Parameter {
            // Maybe inject the default for an omitted optional argument.
            if num_args == op.num_args && op.variadic && op.data.is_some() {
                if op.inverse {
                    inv_default = true;
                } else {
                    let data = op.data.clone().unwrap_or(Value::Void);
                    if op.opt_param {
                        self.buf.emit(Opcode::ParameterRef);
                        self.buf.emit_lit_operand(data);
                        self.buf.emit(Opcode::Cdr);
                    } else {
                        self.buf.emit_push(data);
                    }
                    self.depth += 1;
                    num_args += 1;
                }
            }

            // Arguments are reversed so the first operand is topmost, except
            // for inverse opcodes; arithmetic always reverses to enable the
            // fold below.
            let forward = op.inverse && op.class != OpClass::Arithmetic;
            if forward {
                for arg in args {
                    self.generate(arg)?;
                }
            } else {
                for arg in args.iter().rev() {
                    self.generate(arg)?;
                }
            }
        }

        // Inverse opcodes take their default on top of the arguments.
        if inv_default {
            let data = op.data.clone().unwrap_or(Value::Void);
            self.buf.emit_push(data);
            if op.opt_param {
                self.buf.emit(Opcode::Cdr);
            }
            self.depth += 1;
            num_args += 1;
        }

        match op.class {
            OpClass::Arithmetic => {
                for _ in 1..num_args {
                    self.buf.emit(op.code);
                }
            }
            OpClass::ArithmeticCmp => {
                if num_args > 2 {
                    self.buf.emit(Opcode::StackRef);
                    self.buf.emit_sword(2);
                    self.buf.emit(Opcode::StackRef);
                    self.buf.emit_sword(2);
                    self.buf.emit(op.code);
                    self.buf.emit(Opcode::And);
                    for _ in 0..num_args - 2 {
                        self.buf.emit(Opcode::StackRef);
                        self.buf.emit_sword(3);
                        self.buf.emit(Opcode::StackRef);
                        self.buf.emit_sword(3);
                        self.buf.emit(op.code);
                        self.buf.emit(Opcode::And);
                        self.buf.emit(Opcode::And);
                    }
                    // The deepest operand is still below the running result.
                    self.buf.emit(Opcode::And);
                } else {
                    self.buf.emit(op.code);
                }
            }
            OpClass::Foreign => {
                self.buf.emit(op.code);
                self.buf.emit_lit_operand(Value::PrimOp(op.clone()));
            }
            OpClass::TypePredicate | OpClass::Getter | OpClass::Setter | OpClass::Constructor => {
                self.buf.emit(op.code);
                if op.class != OpClass::Constructor || op.code == Opcode::Make {
                    if let Some(Value::Fixnum(w)) = &op.data {
                        self.buf.emit_word(*w as u64);
                    }
                    if let Some(Value::Fixnum(w)) = &op.data2 {
                        self.buf.emit_word(*w as u64);
                    }
                }
            }
            OpClass::Parameter => {
                if num_args > 0 {
                    match &op.data2 {
                        Some(conv @ (Value::Procedure(_) | Value::PrimOp(_))) => {
                            let wrapped = Ast::App(vec![Ast::Lit(conv.clone()), args[0].clone()]);
                            self.generate(&wrapped)?;
                        }
                        _ => self.generate(&args[0])?,
                    }
                }
                self.buf.emit(Opcode::ParameterRef);
                self.buf.emit_lit_operand(Value::PrimOp(op.clone()));
                self.buf.emit(if num_args == 0 {
                    Opcode::Cdr
                } else {
                    Opcode::SetCdr
                });
            }
            OpClass::Generic => self.buf.emit(op.code),
        }

        self.depth -= num_args as i64 - 1;
        Ok(())
    }

    fn generate_lambda(&mut self, lam: &Rc<LambdaNode>) -> Result<(), CompileError> {
        let mut child = Compiler::new(Some(lam.clone()));

        // Reserve slots for internally defined locals.
        for _ in lam.locals.borrow().iter() {
            child.buf.emit_push(Value::Void);
        }

        // Box every set-variable so shared closures observe updates.
        for name in lam.set_vars.borrow().iter() {
            let k = lam
                .param_index(name)
                .ok_or_else(|| CompileError::msg(format!("set-variable {name} is not bound here")))?;
            child.buf.emit(Opcode::LocalRef);
            child.buf.emit_sword(k);
            child.buf.emit_push(Value::Symbol(name.clone()));
            child.buf.emit(Opcode::Cons);
            child.buf.emit(Opcode::LocalSet);
            child.buf.emit_sword(k);
            child.buf.emit(Opcode::Drop);
        }

        child.tailp = true;
        let body = lam.body.borrow().clone();
        child.generate(&body)?;

        let flags = if lam.rest.is_some() {
            ProcedureFlags::VARIADIC
        } else {
            ProcedureFlags::empty()
        };
        let num_args = lam.declared_arity();
        let code = child.finalize(lam.name.borrow().clone(), lam.source.borrow().clone());

        let fv = lam.free_vars.borrow();
        if fv.is_empty() {
            // Combinator: build the procedure now and pin it as a literal.
            let proc = make_procedure(flags, num_args, code, Vector::shared(Vec::new()));
            self.buf.emit_push(proc);
            self.depth += 1;
        } else {
            self.buf.emit_push(Value::Void);
            self.buf.emit_push(Value::Fixnum(fv.len() as i64));
            self.buf.emit(Opcode::MakeVector);
            self.depth += 1;
            for (k, r) in fv.iter().enumerate() {
                let loc = r.binding.lambda().ok_or_else(|| {
                    CompileError::msg(format!("free variable {} has no lexical home", r.name))
                })?;
                self.generate_non_global_ref(&r.name, &loc, false)?;
                self.buf.emit_push(Value::Fixnum(k as i64));
                self.buf.emit(Opcode::StackRef);
                self.buf.emit_sword(3);
                self.buf.emit(Opcode::VectorSet);
                self.buf.emit(Opcode::Drop);
                self.depth -= 1;
            }
            self.buf.emit_push(Value::Bytecode(code));
            self.buf.emit_push(Value::Fixnum(num_args as i64));
            self.buf.emit_push(Value::Fixnum(flags.to_word()));
            self.buf.emit(Opcode::MakeProcedure);
        }
        Ok(())
    }
}
