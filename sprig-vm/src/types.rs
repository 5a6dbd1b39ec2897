//! Type descriptors and the class-precedence subtype test.
//!
//! Every value maps to an index in the [`TypeRegistry`]. Builtin types occupy
//! the low indices; record types defined by the object-system layer are
//! appended. Each descriptor carries its class-precedence list as a vector of
//! type indices, root first, so `a isa b` is the depth-indexed test
//! `cpl(type(a))[depth(b)] == b`.

use std::rc::Rc;

use crate::value::Value;

/// Index of the root `object` type.
pub const TYPE_OBJECT: usize = 0;
/// Index of the fixnum type.
pub const TYPE_FIXNUM: usize = 1;
/// Index of the flonum type.
pub const TYPE_FLONUM: usize = 2;
/// Index of the bignum type.
pub const TYPE_BIGNUM: usize = 3;
/// Index of the character type.
pub const TYPE_CHAR: usize = 4;
/// Index of the boolean type.
pub const TYPE_BOOLEAN: usize = 5;
/// Index of the empty-list type.
pub const TYPE_NULL: usize = 6;
/// Index of the eof-object type.
pub const TYPE_EOF: usize = 7;
/// Index of the unspecified-value type.
pub const TYPE_VOID: usize = 8;
/// Index of the symbol type.
pub const TYPE_SYMBOL: usize = 9;
/// Index of the string type.
pub const TYPE_STRING: usize = 10;
/// Index of the byte-vector type.
pub const TYPE_BYTES: usize = 11;
/// Index of the pair type.
pub const TYPE_PAIR: usize = 12;
/// Index of the vector type.
pub const TYPE_VECTOR: usize = 13;
/// Index of the port type.
pub const TYPE_PORT: usize = 14;
/// Index of the exception type.
pub const TYPE_EXCEPTION: usize = 15;
/// Index of the procedure type.
pub const TYPE_PROCEDURE: usize = 16;
/// Index of the bytecode type.
pub const TYPE_BYTECODE: usize = 17;
/// Index of the primitive-descriptor type.
pub const TYPE_OPCODE: usize = 18;
/// Index of the type-descriptor type.
pub const TYPE_TYPE: usize = 19;

const BUILTIN_NAMES: &[&str] = &[
    "object",
    "fixnum",
    "flonum",
    "bignum",
    "char",
    "boolean",
    "null",
    "eof-object",
    "void",
    "symbol",
    "string",
    "byte-vector",
    "pair",
    "vector",
    "port",
    "exception",
    "procedure",
    "bytecode",
    "opcode",
    "type",
];

/// A first-class type descriptor.
#[derive(Debug)]
pub struct TypeDescriptor {
    /// Position in the registry.
    pub index: usize,
    /// Printed name.
    pub name: String,
    /// Class-precedence list as type indices, root first, self last.
    pub cpl: Vec<usize>,
}

impl TypeDescriptor {
    /// Depth of this type in its precedence list.
    pub fn depth(&self) -> usize {
        self.cpl.len() - 1
    }
}

/// Process-wide table of type descriptors.
#[derive(Debug)]
pub struct TypeRegistry {
    types: Vec<Rc<TypeDescriptor>>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// A registry seeded with the builtin types.
    pub fn new() -> Self {
        let types = BUILTIN_NAMES
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let cpl = if index == TYPE_OBJECT {
                    vec![TYPE_OBJECT]
                } else {
                    vec![TYPE_OBJECT, index]
                };
                Rc::new(TypeDescriptor {
                    index,
                    name: (*name).to_string(),
                    cpl,
                })
            })
            .collect();
        TypeRegistry { types }
    }

    /// Descriptor at `index`, if registered.
    pub fn get(&self, index: usize) -> Option<&Rc<TypeDescriptor>> {
        self.types.get(index)
    }

    /// Printed name of the type at `index`.
    pub fn name_of(&self, index: usize) -> &str {
        self.get(index).map(|t| t.name.as_str()).unwrap_or("unknown")
    }

    /// Register a record type, deriving the precedence list from `parent`
    /// (the root `object` type when absent).
    pub fn define_record_type(
        &mut self,
        name: &str,
        parent: Option<usize>,
    ) -> Rc<TypeDescriptor> {
        let index = self.types.len();
        let mut cpl = match parent.and_then(|p| self.get(p)) {
            Some(p) => p.cpl.clone(),
            None => vec![TYPE_OBJECT],
        };
        cpl.push(index);
        let t = Rc::new(TypeDescriptor {
            index,
            name: name.to_string(),
            cpl,
        });
        self.types.push(t.clone());
        t
    }

    /// Type index of an arbitrary value.
    pub fn type_index_of(&self, v: &Value) -> usize {
        match v {
            Value::Fixnum(_) => TYPE_FIXNUM,
            Value::Flonum(_) => TYPE_FLONUM,
            Value::Bignum(_) => TYPE_BIGNUM,
            Value::Char(_) => TYPE_CHAR,
            Value::Boolean(_) => TYPE_BOOLEAN,
            Value::Nil => TYPE_NULL,
            Value::Eof => TYPE_EOF,
            Value::Void | Value::Undef => TYPE_VOID,
            Value::Symbol(_) => TYPE_SYMBOL,
            Value::String(_) => TYPE_STRING,
            Value::Bytes(_) => TYPE_BYTES,
            Value::Pair(_) => TYPE_PAIR,
            Value::Vector(_) => TYPE_VECTOR,
            Value::Record(r) => r.borrow().type_index,
            Value::Port(_) => TYPE_PORT,
            Value::Exception(_) => TYPE_EXCEPTION,
            Value::Procedure(_) => TYPE_PROCEDURE,
            Value::Bytecode(_) => TYPE_BYTECODE,
            Value::PrimOp(_) => TYPE_OPCODE,
            Value::Type(_) => TYPE_TYPE,
        }
    }

    /// The class-precedence subtype test used by `ISA`, `TYPEP` and the slot
    /// accessors.
    pub fn check_type(&self, v: &Value, expected: &TypeDescriptor) -> bool {
        let actual = self.type_index_of(v);
        if actual == expected.index {
            return true;
        }
        match self.get(actual) {
            Some(t) => t.cpl.get(expected.depth()) == Some(&expected.index),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_their_own_types() {
        let reg = TypeRegistry::new();
        let pair_type = reg.get(TYPE_PAIR).unwrap().clone();
        let p = Value::cons(Value::Fixnum(1), Value::Nil);
        assert!(reg.check_type(&p, &pair_type));
        assert!(!reg.check_type(&Value::Fixnum(1), &pair_type));
    }

    #[test]
    fn everything_is_an_object() {
        let reg = TypeRegistry::new();
        let obj = reg.get(TYPE_OBJECT).unwrap().clone();
        assert!(reg.check_type(&Value::Fixnum(1), &obj));
        assert!(reg.check_type(&Value::string("s"), &obj));
    }

    #[test]
    fn record_subtypes_satisfy_parent_checks() {
        let mut reg = TypeRegistry::new();
        let point = reg.define_record_type("point", None);
        let point3 = reg.define_record_type("point3", Some(point.index));
        let v = Value::Record(std::rc::Rc::new(std::cell::RefCell::new(
            crate::value::Record {
                type_index: point3.index,
                slots: vec![Value::Void; 3],
                immutable: false,
            },
        )));
        assert!(reg.check_type(&v, &point3));
        assert!(reg.check_type(&v, &point));
        let other = reg.define_record_type("other", None);
        assert!(!reg.check_type(&v, &other));
    }
}
