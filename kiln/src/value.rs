use std::{fmt, sync::Arc};

use crate::{Kind, ObjectRef, VmError, VmResult};

/// A typed value crossing the engine boundary: constant-pool entries, field
/// contents, native arguments and host entry/return values.
#[derive(Clone)]
pub enum Value {
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Reference(Option<ObjectRef>),
}

impl Value {
    pub const NULL: Value = Value::Reference(None);

    /// Zero value of a field or array element of `kind`.
    pub fn default_for(kind: Kind) -> Value {
        match kind {
            Kind::Float => Value::Float(0.0),
            Kind::Long => Value::Long(0),
            Kind::Double => Value::Double(0.0),
            Kind::Reference => Value::NULL,
            _ => Value::Int(0),
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Value::Int(_) => Kind::Int,
            Value::Float(_) => Kind::Float,
            Value::Long(_) => Kind::Long,
            Value::Double(_) => Kind::Double,
            Value::Reference(_) => Kind::Reference,
        }
    }

    pub fn as_int(&self) -> VmResult<i32> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(other.mismatch("int")),
        }
    }

    pub fn as_float(&self) -> VmResult<f32> {
        match self {
            Value::Float(v) => Ok(*v),
            other => Err(other.mismatch("float")),
        }
    }

    pub fn as_long(&self) -> VmResult<i64> {
        match self {
            Value::Long(v) => Ok(*v),
            other => Err(other.mismatch("long")),
        }
    }

    pub fn as_double(&self) -> VmResult<f64> {
        match self {
            Value::Double(v) => Ok(*v),
            other => Err(other.mismatch("double")),
        }
    }

    pub fn as_reference(&self) -> VmResult<Option<&ObjectRef>> {
        match self {
            Value::Reference(v) => Ok(v.as_ref()),
            other => Err(other.mismatch("reference")),
        }
    }

    /// Narrow an int to the representation of a sub-int kind.
    pub fn narrow(self, kind: Kind) -> Value {
        match (self, kind) {
            (Value::Int(v), Kind::Boolean) => Value::Int(v & 1),
            (Value::Int(v), Kind::Byte) => Value::Int(v as i8 as i32),
            (Value::Int(v), Kind::Char) => Value::Int(v as u16 as i32),
            (Value::Int(v), Kind::Short) => Value::Int(v as i16 as i32),
            (value, _) => value,
        }
    }

    fn mismatch(&self, expected: &'static str) -> VmError {
        VmError::TypeMismatch {
            expected,
            got: format!("{self:?}"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Reference(a), Value::Reference(b)) => match (a, b) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            },
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "Int({v})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::Long(v) => write!(f, "Long({v})"),
            Value::Double(v) => write!(f, "Double({v})"),
            Value::Reference(None) => write!(f, "null"),
            Value::Reference(Some(obj)) => write!(f, "Reference({obj})"),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<ObjectRef> for Value {
    fn from(v: ObjectRef) -> Self {
        Value::Reference(Some(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrowing_matches_java_conversions() {
        assert_eq!(Value::Int(0x1ff).narrow(Kind::Byte), Value::Int(-1));
        assert_eq!(Value::Int(-1).narrow(Kind::Char), Value::Int(0xffff));
        assert_eq!(Value::Int(0x18000).narrow(Kind::Short), Value::Int(-32768));
        assert_eq!(Value::Int(3).narrow(Kind::Boolean), Value::Int(1));
        assert_eq!(Value::Long(5).narrow(Kind::Byte), Value::Long(5));
    }

    #[test]
    fn accessors_reject_wrong_kind() {
        assert_eq!(Value::Int(4).as_int().unwrap(), 4);
        assert!(Value::Float(1.0).as_int().is_err());
        assert!(Value::NULL.as_reference().unwrap().is_none());
    }

    #[test]
    fn float_equality_is_bitwise() {
        assert_eq!(Value::Float(f32::NAN), Value::Float(f32::NAN));
        assert_ne!(Value::Double(0.0), Value::Double(-0.0));
    }
}
