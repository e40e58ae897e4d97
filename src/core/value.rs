// This module defines the value model shared by the codewriter and the metainterp. Kind
// enumerates the four value kinds the JIT distinguishes (int, ref, float, void); the first
// three own a register bank and a constant pool in every jitcode, void only appears as a
// result kind. GcRef is an opaque handle to a garbage-collected object as seen by the
// backend. Value is the closed tagged union used to move runtime values between compiled
// code, the warm entry state and the blackhole interpreter, with kind-specific accessors
// instead of dynamic dispatch. Const is a compile-time-known value: it keys constant pools
// and green keys, so floats compare and hash by their bit pattern.

//! Values, constants and value kinds.

use std::fmt;
use std::hash::{Hash, Hasher};

/// The kind of a value. Registers and constant pools exist per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Int,
    Ref,
    Float,
    Void,
}

/// Kinds that own a register bank.
pub const REGISTER_KINDS: [Kind; 3] = [Kind::Int, Kind::Ref, Kind::Float];

impl Kind {
    /// Single-letter tag used in register names and argument codes.
    pub const fn letter(self) -> char {
        match self {
            Kind::Int => 'i',
            Kind::Ref => 'r',
            Kind::Float => 'f',
            Kind::Void => 'v',
        }
    }

    /// Index of the register bank, `None` for void.
    pub const fn bank(self) -> Option<usize> {
        match self {
            Kind::Int => Some(0),
            Kind::Ref => Some(1),
            Kind::Float => Some(2),
            Kind::Void => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Kind::Int => "int",
            Kind::Ref => "ref",
            Kind::Float => "float",
            Kind::Void => "void",
        }
    }

    pub fn from_letter(c: char) -> Option<Kind> {
        match c {
            'i' => Some(Kind::Int),
            'r' => Some(Kind::Ref),
            'f' => Some(Kind::Float),
            'v' => Some(Kind::Void),
            _ => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque reference to a garbage-collected object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GcRef(pub usize);

impl GcRef {
    pub const NULL: GcRef = GcRef(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A runtime value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Ref(GcRef),
    Float(f64),
    Void,
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Int(_) => Kind::Int,
            Value::Ref(_) => Kind::Ref,
            Value::Float(_) => Kind::Float,
            Value::Void => Kind::Void,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match *self {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_gcref(&self) -> Option<GcRef> {
        match *self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match *self {
            Value::Float(v) => Some(v),
            _ => None,
        }
    }
}

/// A compile-time constant.
///
/// Floats are compared bitwise so that constants can be used as hash keys;
/// `0.0` and `-0.0` are different constants, and a NaN equals itself.
#[derive(Debug, Clone, Copy)]
pub enum Const {
    Int(i64),
    Ref(GcRef),
    Float(f64),
}

impl Const {
    pub fn kind(&self) -> Kind {
        match self {
            Const::Int(_) => Kind::Int,
            Const::Ref(_) => Kind::Ref,
            Const::Float(_) => Kind::Float,
        }
    }

    /// The value if this is an integer fitting in a signed byte.
    pub fn short_int(&self) -> Option<i8> {
        match *self {
            Const::Int(v) => i8::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn to_value(self) -> Value {
        match self {
            Const::Int(v) => Value::Int(v),
            Const::Ref(r) => Value::Ref(r),
            Const::Float(v) => Value::Float(v),
        }
    }
}

impl PartialEq for Const {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Const::Int(a), Const::Int(b)) => a == b,
            (Const::Ref(a), Const::Ref(b)) => a == b,
            (Const::Float(a), Const::Float(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl Eq for Const {}

impl Hash for Const {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Const::Int(v) => v.hash(state),
            Const::Ref(r) => r.hash(state),
            Const::Float(v) => v.to_bits().hash(state),
        }
    }
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::Int(v) => write!(f, "${}", v),
            Const::Ref(r) => write!(f, "$ref:{:#x}", r.0),
            Const::Float(v) => write!(f, "${:?}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashSet;

    #[test]
    fn test_short_int_range() {
        assert_eq!(Const::Int(-128).short_int(), Some(-128));
        assert_eq!(Const::Int(127).short_int(), Some(127));
        assert_eq!(Const::Int(128).short_int(), None);
        assert_eq!(Const::Int(-129).short_int(), None);
        assert_eq!(Const::Float(1.0).short_int(), None);
    }

    #[test]
    fn test_float_constants_hash_by_bits() {
        let mut set = HashSet::new();
        set.insert(Const::Float(0.0));
        set.insert(Const::Float(-0.0));
        set.insert(Const::Float(f64::NAN));
        set.insert(Const::Float(f64::NAN));
        assert_eq!(set.len(), 3);
        assert_ne!(Const::Int(1), Const::Float(1.0));
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::Int(7).as_int(), Some(7));
        assert_eq!(Value::Int(7).as_gcref(), None);
        assert_eq!(Value::Ref(GcRef(16)).as_gcref(), Some(GcRef(16)));
        assert_eq!(Value::Float(2.5).as_float(), Some(2.5));
        assert_eq!(Value::Void.kind(), Kind::Void);
    }

    #[test]
    fn test_kind_letters() {
        for kind in REGISTER_KINDS {
            assert_eq!(Kind::from_letter(kind.letter()), Some(kind));
        }
        assert_eq!(Kind::Void.bank(), None);
    }
}
