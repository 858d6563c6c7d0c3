//! Dynamic value type for heterogeneous snapshots.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A dynamically typed value, used by whole-store snapshots and batch
/// puts.
///
/// Every primitive and binary type of the record format has a variant.
/// Decoded custom objects appear as [`Value::Object`]; they can be read
/// back through a typed downcast but cannot be written through the batch
/// path, which has no way to recover their encoder.
#[derive(Clone)]
pub enum Value {
    /// Boolean value.
    Bool(bool),
    /// 32-bit signed integer.
    Int(i32),
    /// 64-bit signed integer.
    Long(i64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string.
    Text(String),
    /// Byte array.
    Bytes(Vec<u8>),
    /// Decoded object from a registered encoder.
    Object(Arc<dyn Any + Send + Sync>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => f.debug_tuple("Bool").field(v).finish(),
            Self::Int(v) => f.debug_tuple("Int").field(v).finish(),
            Self::Long(v) => f.debug_tuple("Long").field(v).finish(),
            Self::Float(v) => f.debug_tuple("Float").field(v).finish(),
            Self::Double(v) => f.debug_tuple("Double").field(v).finish(),
            Self::Text(v) => f.debug_tuple("Text").field(v).finish(),
            Self::Bytes(v) => f.debug_tuple("Bytes").field(&v.len()).finish(),
            Self::Object(_) => f.write_str("Object(..)"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Long(a), Self::Long(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            // Objects are opaque; equal only when they are the same allocation.
            (Self::Object(a), Self::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_equality() {
        assert_eq!(Value::Int(7), Value::from(7));
        assert_eq!(Value::Text("a".into()), Value::from("a"));
        assert_ne!(Value::Int(7), Value::Long(7));
    }

    #[test]
    fn object_equality_is_identity() {
        let a: Arc<dyn Any + Send + Sync> = Arc::new(42i32);
        assert_eq!(Value::Object(a.clone()), Value::Object(a.clone()));
        let b: Arc<dyn Any + Send + Sync> = Arc::new(42i32);
        assert_ne!(Value::Object(a), Value::Object(b));
    }

    #[test]
    fn debug_hides_object_contents() {
        let v = Value::Object(Arc::new(1u8));
        assert_eq!(format!("{v:?}"), "Object(..)");
    }
}
