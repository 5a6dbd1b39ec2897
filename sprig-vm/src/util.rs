//! Utilities shared by the test suite.

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    //! A miniature surface syntax for exercising the compiler and VM.
    //!
    //! The production front end (reader, macro expander, analyzer) is an
    //! external collaborator; tests still need analyzed ASTs to feed the
    //! code generator. This module provides a small S-expression reader
    //! and a scope resolver that computes the locals, set-variable and
    //! free-variable information the analyzer contract promises, plus a
    //! builder around [`Machine`] in the spirit of a test harness.

    use std::cell::RefCell;
    use std::io::{self, Write};
    use std::rc::Rc;

    use crate::ast::{Ast, Binding, LambdaNode, RefNode};
    use crate::context::{Globals, MachineParams};
    use crate::interpreter::Machine;
    use crate::ports::Port;
    use crate::value::{Symbol, Value};

    /// Parsed surface syntax.
    #[derive(Debug, Clone)]
    pub enum Sx {
        /// Exact integer literal.
        Int(i64),
        /// Inexact literal.
        Float(f64),
        /// `#t` / `#f`.
        Bool(bool),
        /// `#\x` character literal.
        Char(char),
        /// String literal.
        Str(String),
        /// Symbol.
        Sym(String),
        /// Proper list.
        List(Vec<Sx>),
        /// Improper (dotted) list.
        Improper(Vec<Sx>, Box<Sx>),
    }

    fn tokenize(src: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut chars = src.chars().peekable();
        while let Some(&c) = chars.peek() {
            match c {
                '(' | ')' | '\'' => {
                    tokens.push(c.to_string());
                    chars.next();
                }
                ';' => {
                    for c in chars.by_ref() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                '"' => {
                    let mut tok = String::from('"');
                    chars.next();
                    while let Some(c) = chars.next() {
                        if c == '\\' {
                            match chars.next() {
                                Some('n') => tok.push('\n'),
                                Some('t') => tok.push('\t'),
                                Some(other) => tok.push(other),
                                None => break,
                            }
                        } else if c == '"' {
                            break;
                        } else {
                            tok.push(c);
                        }
                    }
                    tokens.push(tok);
                }
                c if c.is_whitespace() => {
                    chars.next();
                }
                '#' => {
                    chars.next();
                    match chars.next() {
                        Some('\\') => {
                            let mut name = String::new();
                            if let Some(first) = chars.next() {
                                name.push(first);
                            }
                            while let Some(&c) = chars.peek() {
                                if c.is_alphanumeric() {
                                    name.push(c);
                                    chars.next();
                                } else {
                                    break;
                                }
                            }
                            tokens.push(format!("#\\{name}"));
                        }
                        Some(c) => tokens.push(format!("#{c}")),
                        None => {}
                    }
                }
                _ => {
                    let mut tok = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_whitespace() || matches!(c, '(' | ')' | '\'' | ';' | '"') {
                            break;
                        }
                        tok.push(c);
                        chars.next();
                    }
                    tokens.push(tok);
                }
            }
        }
        tokens
    }

    fn atom(tok: &str) -> Sx {
        match tok {
            "#t" => return Sx::Bool(true),
            "#f" => return Sx::Bool(false),
            _ => {}
        }
        if let Some(name) = tok.strip_prefix("#\\") {
            let c = match name {
                "space" => ' ',
                "newline" => '\n',
                "tab" => '\t',
                _ => name.chars().next().unwrap_or('?'),
            };
            return Sx::Char(c);
        }
        if let Some(body) = tok.strip_prefix('"') {
            return Sx::Str(body.to_string());
        }
        if let Ok(n) = tok.parse::<i64>() {
            return Sx::Int(n);
        }
        if tok.contains('.') || tok.contains('e') {
            if let Ok(x) = tok.parse::<f64>() {
                return Sx::Float(x);
            }
        }
        Sx::Sym(tok.to_string())
    }

    fn parse_one(tokens: &[String], pos: &mut usize) -> Sx {
        let tok = tokens.get(*pos).expect("unexpected end of input");
        *pos += 1;
        match tok.as_str() {
            "(" => {
                let mut items = Vec::new();
                loop {
                    match tokens.get(*pos).map(String::as_str) {
                        Some(")") => {
                            *pos += 1;
                            return Sx::List(items);
                        }
                        Some(".") => {
                            *pos += 1;
                            let tail = parse_one(tokens, pos);
                            assert_eq!(
                                tokens.get(*pos).map(String::as_str),
                                Some(")"),
                                "malformed dotted list"
                            );
                            *pos += 1;
                            return Sx::Improper(items, Box::new(tail));
                        }
                        Some(_) => items.push(parse_one(tokens, pos)),
                        None => panic!("unterminated list"),
                    }
                }
            }
            ")" => panic!("unexpected )"),
            "'" => {
                let datum = parse_one(tokens, pos);
                Sx::List(vec![Sx::Sym("quote".into()), datum])
            }
            _ => atom(tok),
        }
    }

    /// Parse the first datum of `src`.
    pub fn parse(src: &str) -> Sx {
        let tokens = tokenize(src);
        let mut pos = 0;
        parse_one(&tokens, &mut pos)
    }

    /// Parse every datum of `src`.
    pub fn parse_all(src: &str) -> Vec<Sx> {
        let tokens = tokenize(src);
        let mut pos = 0;
        let mut out = Vec::new();
        while pos < tokens.len() {
            out.push(parse_one(&tokens, &mut pos));
        }
        out
    }

    fn datum_to_value(sx: &Sx) -> Value {
        match sx {
            Sx::Int(n) => Value::Fixnum(*n),
            Sx::Float(x) => Value::Flonum(*x),
            Sx::Bool(b) => Value::Boolean(*b),
            Sx::Char(c) => Value::Char(*c),
            Sx::Str(s) => Value::string(s.clone()),
            Sx::Sym(s) => Value::symbol(s),
            Sx::List(items) => Value::list(items.iter().map(datum_to_value).collect::<Vec<_>>()),
            Sx::Improper(items, tail) => {
                let mut out = datum_to_value(tail);
                for item in items.iter().rev() {
                    out = Value::cons(datum_to_value(item), out);
                }
                out
            }
        }
    }

    /// Scope resolver: turns surface syntax into the analyzed AST the code
    /// generator accepts, computing locals, set-variables and free-variable
    /// lists on the way.
    pub struct Analyzer {
        globals: Rc<RefCell<Globals>>,
        scopes: Vec<Rc<LambdaNode>>,
    }

    impl Analyzer {
        /// A resolver against the given globals table.
        pub fn new(globals: Rc<RefCell<Globals>>) -> Self {
            Analyzer {
                globals,
                scopes: Vec::new(),
            }
        }

        /// Analyze one datum.
        pub fn analyze(&mut self, sx: &Sx) -> Ast {
            match sx {
                Sx::Int(n) => Ast::Lit(Value::Fixnum(*n)),
                Sx::Float(x) => Ast::Lit(Value::Flonum(*x)),
                Sx::Bool(b) => Ast::Lit(Value::Boolean(*b)),
                Sx::Char(c) => Ast::Lit(Value::Char(*c)),
                Sx::Str(s) => Ast::Lit(Value::string(s.clone())),
                Sx::Sym(name) => Ast::Ref(self.resolve(name)),
                Sx::Improper(..) => panic!("dotted list in expression position"),
                Sx::List(items) => self.analyze_list(items),
            }
        }

        fn analyze_list(&mut self, items: &[Sx]) -> Ast {
            let head = items.first().expect("empty application");
            if let Sx::Sym(name) = head {
                match (name.as_str(), items.len()) {
                    ("quote", 2) => return Ast::Lit(datum_to_value(&items[1])),
                    ("if", 3) => {
                        return Ast::Cond {
                            test: Box::new(self.analyze(&items[1])),
                            pass: Box::new(self.analyze(&items[2])),
                            fail: Box::new(Ast::Lit(Value::Void)),
                        }
                    }
                    ("if", 4) => {
                        return Ast::Cond {
                            test: Box::new(self.analyze(&items[1])),
                            pass: Box::new(self.analyze(&items[2])),
                            fail: Box::new(self.analyze(&items[3])),
                        }
                    }
                    ("set!", 3) => {
                        let Sx::Sym(target) = &items[1] else {
                            panic!("set!: target is not a symbol");
                        };
                        let var = self.resolve(target);
                        if let Some(owner) = var.binding.lambda() {
                            owner.add_set_var(Symbol::new(target));
                        }
                        return Ast::Set {
                            var,
                            value: Box::new(self.analyze(&items[2])),
                        };
                    }
                    ("begin", _) => {
                        return Ast::Seq(items[1..].iter().map(|s| self.analyze(s)).collect())
                    }
                    ("lambda", n) if n >= 3 => return self.lambda_form(&items[1], &items[2..]),
                    ("define", _) => return self.define_form(items),
                    ("let", n) if n >= 3 => return self.let_form(items),
                    ("letrec", n) if n >= 3 => return self.letrec_form(items),
                    _ => {}
                }
            }
            let mut parts: Vec<Ast> = items.iter().map(|s| self.analyze(s)).collect();
            // Operator positions naming a primitive resolve to the
            // descriptor itself, enabling the opcode-application path.
            let primop = match &parts[0] {
                Ast::Ref(r) => match &r.binding {
                    Binding::Global(cell) => match &cell.borrow().cdr {
                        Value::PrimOp(op) => Some(op.clone()),
                        _ => None,
                    },
                    _ => None,
                },
                _ => None,
            };
            if let Some(op) = primop {
                parts[0] = Ast::Lit(Value::PrimOp(op));
            }
            Ast::App(parts)
        }

        fn resolve(&mut self, name: &str) -> Rc<RefNode> {
            let sym = Symbol::new(name);
            for idx in (0..self.scopes.len()).rev() {
                let lam = &self.scopes[idx];
                let bound = lam.params.contains(&sym)
                    || lam.rest.as_ref() == Some(&sym)
                    || lam.locals.borrow().contains(&sym);
                if bound {
                    let r = RefNode::lexical(sym, lam);
                    for inner in &self.scopes[idx + 1..] {
                        inner.add_free_var(&r);
                    }
                    return r;
                }
            }
            let cell = self.globals.borrow_mut().global_cell(sym.clone());
            RefNode::global(sym, cell)
        }

        fn lambda_form(&mut self, params: &Sx, body: &[Sx]) -> Ast {
            let (names, rest) = match params {
                Sx::Sym(rest) => (Vec::new(), Some(Symbol::new(rest))),
                Sx::List(ps) => (ps.iter().map(param_name).collect(), None),
                Sx::Improper(ps, tail) => {
                    let Sx::Sym(rest) = tail.as_ref() else {
                        panic!("lambda: rest parameter is not a symbol");
                    };
                    (ps.iter().map(param_name).collect(), Some(Symbol::new(rest)))
                }
                _ => panic!("lambda: malformed parameter list"),
            };
            let lam = LambdaNode::new(names, rest);
            self.scopes.push(lam.clone());

            // Pre-register internal defines so sibling bodies see them.
            for form in body {
                if let Some((name, _)) = as_define(form) {
                    lam.add_local(Symbol::new(&name));
                }
            }

            let mut seq = Vec::new();
            for form in body {
                if let Some((name, value_sx)) = as_define(form) {
                    let var = self.resolve(&name);
                    if let Some(owner) = var.binding.lambda() {
                        owner.add_set_var(Symbol::new(&name));
                    }
                    let value = self.analyze(&value_sx);
                    seq.push(Ast::Set {
                        var,
                        value: Box::new(value),
                    });
                } else {
                    seq.push(self.analyze(form));
                }
            }
            let body_ast = if seq.len() == 1 {
                seq.pop().expect("non-empty body")
            } else {
                Ast::Seq(seq)
            };
            *lam.body.borrow_mut() = body_ast;
            self.scopes.pop();
            Ast::Lambda(lam)
        }

        fn define_form(&mut self, items: &[Sx]) -> Ast {
            let Some((name, value_sx)) = as_define(&Sx::List(items.to_vec())) else {
                panic!("malformed define");
            };
            assert!(
                self.scopes.is_empty(),
                "internal defines are handled by the enclosing lambda"
            );
            let var = self.resolve(&name);
            let value = self.analyze(&value_sx);
            Ast::Set {
                var,
                value: Box::new(value),
            }
        }

        fn let_form(&mut self, items: &[Sx]) -> Ast {
            if let Sx::Sym(loop_name) = &items[1] {
                // Named let: (let f ((x v) ...) body ...) becomes a letrec
                // over a lambda applied to the initial values.
                let (names, inits) = bindings_of(&items[2]);
                let lambda = {
                    let mut form = vec![
                        Sx::Sym("lambda".into()),
                        Sx::List(names.iter().map(|n| Sx::Sym(n.clone())).collect()),
                    ];
                    form.extend(items[3..].iter().cloned());
                    Sx::List(form)
                };
                let mut call = vec![Sx::Sym(loop_name.clone())];
                call.extend(inits);
                let letrec = Sx::List(vec![
                    Sx::Sym("letrec".into()),
                    Sx::List(vec![Sx::List(vec![Sx::Sym(loop_name.clone()), lambda])]),
                    Sx::List(call),
                ]);
                return self.analyze(&letrec);
            }
            // (let ((x v) ...) body ...) is a direct lambda application.
            let (names, inits) = bindings_of(&items[1]);
            let mut lambda = vec![
                Sx::Sym("lambda".into()),
                Sx::List(names.iter().map(|n| Sx::Sym(n.clone())).collect()),
            ];
            lambda.extend(items[2..].iter().cloned());
            let mut app = vec![Sx::List(lambda)];
            app.extend(inits);
            self.analyze(&Sx::List(app))
        }

        fn letrec_form(&mut self, items: &[Sx]) -> Ast {
            // ((lambda () (define x v) ... body ...))
            let (names, inits) = bindings_of(&items[1]);
            let mut lambda = vec![Sx::Sym("lambda".into()), Sx::List(Vec::new())];
            for (name, init) in names.iter().zip(inits) {
                lambda.push(Sx::List(vec![
                    Sx::Sym("define".into()),
                    Sx::Sym(name.clone()),
                    init,
                ]));
            }
            lambda.extend(items[2..].iter().cloned());
            self.analyze(&Sx::List(vec![Sx::List(lambda)]))
        }
    }

    fn param_name(sx: &Sx) -> Symbol {
        match sx {
            Sx::Sym(s) => Symbol::new(s),
            other => panic!("parameter is not a symbol: {other:?}"),
        }
    }

    fn bindings_of(sx: &Sx) -> (Vec<String>, Vec<Sx>) {
        let Sx::List(bindings) = sx else {
            panic!("malformed binding list");
        };
        let mut names = Vec::new();
        let mut inits = Vec::new();
        for b in bindings {
            let Sx::List(pair) = b else {
                panic!("malformed binding");
            };
            let [Sx::Sym(name), init] = pair.as_slice() else {
                panic!("malformed binding");
            };
            names.push(name.clone());
            inits.push(init.clone());
        }
        (names, inits)
    }

    /// `(define name value)` or `(define (name . params) body ...)`,
    /// normalized to `(name, value)`.
    fn as_define(sx: &Sx) -> Option<(String, Sx)> {
        let Sx::List(items) = sx else { return None };
        match items.as_slice() {
            [Sx::Sym(kw), Sx::Sym(name), value] if kw == "define" => {
                Some((name.clone(), value.clone()))
            }
            [Sx::Sym(kw), Sx::List(sig), body @ ..] if kw == "define" && !sig.is_empty() => {
                let Sx::Sym(name) = &sig[0] else { return None };
                let mut lambda = vec![Sx::Sym("lambda".into()), Sx::List(sig[1..].to_vec())];
                lambda.extend(body.iter().cloned());
                Some((name.clone(), Sx::List(lambda)))
            }
            [Sx::Sym(kw), Sx::Improper(sig, tail), body @ ..] if kw == "define" => {
                let Sx::Sym(name) = &sig[0] else { return None };
                let params = Sx::Improper(sig[1..].to_vec(), tail.clone());
                let mut lambda = vec![Sx::Sym("lambda".into()), params];
                lambda.extend(body.iter().cloned());
                Some((name.clone(), Sx::List(lambda)))
            }
            _ => None,
        }
    }

    /// A byte sink shared with a test, for capturing port output.
    #[derive(Clone)]
    pub struct SharedSink(pub Rc<RefCell<Vec<u8>>>);

    impl SharedSink {
        /// A fresh, empty sink.
        pub fn new() -> Self {
            SharedSink(Rc::new(RefCell::new(Vec::new())))
        }

        /// Everything written so far, as UTF-8.
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
    }

    impl Default for SharedSink {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// A machine plus the source-level entry points the tests use.
    pub struct TestMachine {
        /// The underlying runtime.
        pub machine: Machine,
    }

    impl Default for TestMachine {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TestMachine {
        /// A machine with default parameters.
        pub fn new() -> Self {
            TestMachine {
                machine: Machine::new(MachineParams::default()),
            }
        }

        /// A machine whose default output port writes into the returned
        /// sink.
        pub fn with_captured_output() -> (Self, SharedSink) {
            let tm = Self::new();
            let sink = SharedSink::new();
            tm.machine
                .set_default_port(false, Port::output(Box::new(sink.clone())));
            (tm, sink)
        }

        /// Parse, analyze, compile and run every form; the last result
        /// wins. Runtime exceptions come back as exception values.
        pub fn eval(&mut self, src: &str) -> Value {
            let mut result = Value::Void;
            for sx in parse_all(src) {
                let ast = Analyzer::new(self.machine.globals()).analyze(&sx);
                result = match self.machine.eval(&ast) {
                    Ok(v) => v,
                    Err(e) => e.into(),
                };
            }
            result
        }

        /// Evaluate and unwrap a fixnum result.
        pub fn eval_fixnum(&mut self, src: &str) -> i64 {
            match self.eval(src) {
                Value::Fixnum(n) => n,
                other => panic!("expected fixnum, got {other}"),
            }
        }

        /// Evaluate, expecting an exception value.
        pub fn eval_exception(&mut self, src: &str) -> Rc<crate::value::Exception> {
            match self.eval(src) {
                Value::Exception(e) => e,
                other => panic!("expected exception, got {other}"),
            }
        }
    }
}
