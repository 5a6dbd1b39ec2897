//! Analyzed abstract syntax accepted by the code generator.
//!
//! The reader, macro expander and semantic analyzer are external
//! collaborators; they hand the compiler nodes of this shape with scoping
//! already resolved: every reference carries its binding site, every lambda
//! carries its locals, set-variables and free-variable list.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::value::{Pair, Symbol, Value};

/// An analyzed expression.
#[derive(Debug, Clone)]
pub enum Ast {
    /// Self-evaluating literal.
    Lit(Value),
    /// Variable reference.
    Ref(Rc<RefNode>),
    /// `set!`.
    Set {
        /// Target binding.
        var: Rc<RefNode>,
        /// Value expression.
        value: Box<Ast>,
    },
    /// Two-armed conditional.
    Cond {
        /// Test expression, compiled in non-tail position.
        test: Box<Ast>,
        /// Consequent.
        pass: Box<Ast>,
        /// Alternate.
        fail: Box<Ast>,
    },
    /// Sequence; all but the last element are compiled for effect.
    Seq(Vec<Ast>),
    /// Lambda abstraction.
    Lambda(Rc<LambdaNode>),
    /// Application: operator followed by arguments.
    App(Vec<Ast>),
}

/// The binding site of a reference.
#[derive(Debug, Clone)]
pub enum Binding {
    /// Top-level binding: the live `(name . value)` cell, shared with the
    /// globals table. `#!undef` in the cdr means not yet bound.
    Global(Rc<RefCell<Pair>>),
    /// Lexical binding owned by a lambda. Held weakly; the analyzer keeps
    /// the AST alive for the duration of a compile.
    Lexical(Weak<LambdaNode>),
}

impl Binding {
    /// The owning lambda of a lexical binding.
    pub fn lambda(&self) -> Option<Rc<LambdaNode>> {
        match self {
            Binding::Lexical(w) => w.upgrade(),
            Binding::Global(_) => None,
        }
    }

    /// Whether two bindings denote the same site.
    pub fn same_site(&self, other: &Binding) -> bool {
        match (self, other) {
            (Binding::Global(a), Binding::Global(b)) => Rc::ptr_eq(a, b),
            (Binding::Lexical(a), Binding::Lexical(b)) => Weak::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// A variable use: the name plus its binding site.
#[derive(Debug)]
pub struct RefNode {
    /// Variable name.
    pub name: Symbol,
    /// Resolved binding site.
    pub binding: Binding,
}

impl RefNode {
    /// A reference to a global cell.
    pub fn global(name: Symbol, cell: Rc<RefCell<Pair>>) -> Rc<Self> {
        Rc::new(RefNode {
            name,
            binding: Binding::Global(cell),
        })
    }

    /// A reference to a lexical binding of `owner`.
    pub fn lexical(name: Symbol, owner: &Rc<LambdaNode>) -> Rc<Self> {
        Rc::new(RefNode {
            name,
            binding: Binding::Lexical(Rc::downgrade(owner)),
        })
    }
}

/// A lambda abstraction node.
#[derive(Debug)]
pub struct LambdaNode {
    /// Declared parameters, in order.
    pub params: Vec<Symbol>,
    /// Rest parameter collecting surplus arguments, if any.
    pub rest: Option<Symbol>,
    /// Internally defined names, in definition order.
    pub locals: RefCell<Vec<Symbol>>,
    /// Names mutated after binding; every read and write of these goes
    /// through a one-element box pair.
    pub set_vars: RefCell<Vec<Symbol>>,
    /// References captured from enclosing lambdas, in capture order.
    pub free_vars: RefCell<Vec<Rc<RefNode>>>,
    /// Name for traces, if known.
    pub name: RefCell<Option<String>>,
    /// `(file, line)` source attribute, if known.
    pub source: RefCell<Option<(String, u64)>>,
    /// Body expression; set by the analyzer after the node exists so that
    /// inner references can point back at it.
    pub body: RefCell<Ast>,
}

impl LambdaNode {
    /// A lambda node with an empty body, to be filled in by the analyzer.
    pub fn new(params: Vec<Symbol>, rest: Option<Symbol>) -> Rc<Self> {
        Rc::new(LambdaNode {
            params,
            rest,
            locals: RefCell::new(Vec::new()),
            set_vars: RefCell::new(Vec::new()),
            free_vars: RefCell::new(Vec::new()),
            name: RefCell::new(None),
            source: RefCell::new(None),
            body: RefCell::new(Ast::Lit(Value::Void)),
        })
    }

    /// Declared parameter count, excluding the rest parameter.
    pub fn declared_arity(&self) -> usize {
        self.params.len()
    }

    /// Frame-relative index of a parameter, rest parameter or local.
    ///
    /// Parameter `p` lives at `fp - 1 - p`; the rest parameter follows the
    /// declared parameters; internally defined local `j` lives above the
    /// frame header at `fp + 4 + j`, hence the index `-5 - j`.
    pub fn param_index(&self, name: &Symbol) -> Option<i64> {
        if let Some(p) = self.params.iter().position(|s| s == name) {
            return Some(p as i64);
        }
        if self.rest.as_ref() == Some(name) {
            return Some(self.params.len() as i64);
        }
        self.locals
            .borrow()
            .iter()
            .position(|s| s == name)
            .map(|j| -5 - j as i64)
    }

    /// Whether `name` is in this lambda's set-variable list.
    pub fn is_set_var(&self, name: &Symbol) -> bool {
        self.set_vars.borrow().iter().any(|s| s == name)
    }

    /// Record a name as internally defined.
    pub fn add_local(&self, name: Symbol) {
        let mut locals = self.locals.borrow_mut();
        if !locals.contains(&name) {
            locals.push(name);
        }
    }

    /// Record a name as mutated after binding.
    pub fn add_set_var(&self, name: Symbol) {
        let mut sv = self.set_vars.borrow_mut();
        if !sv.contains(&name) {
            sv.push(name);
        }
    }

    /// Record a captured reference, reusing an entry for the same site.
    pub fn add_free_var(&self, r: &Rc<RefNode>) {
        let mut fv = self.free_vars.borrow_mut();
        let present = fv
            .iter()
            .any(|f| f.name == r.name && f.binding.same_site(&r.binding));
        if !present {
            fv.push(r.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_indices_count_from_the_frame() {
        let lam = LambdaNode::new(
            vec![Symbol::new("x"), Symbol::new("y")],
            Some(Symbol::new("rest")),
        );
        lam.add_local(Symbol::new("tmp"));
        lam.add_local(Symbol::new("tmp2"));
        assert_eq!(lam.param_index(&Symbol::new("x")), Some(0));
        assert_eq!(lam.param_index(&Symbol::new("y")), Some(1));
        assert_eq!(lam.param_index(&Symbol::new("rest")), Some(2));
        assert_eq!(lam.param_index(&Symbol::new("tmp")), Some(-5));
        assert_eq!(lam.param_index(&Symbol::new("tmp2")), Some(-6));
        assert_eq!(lam.param_index(&Symbol::new("nope")), None);
    }
}
