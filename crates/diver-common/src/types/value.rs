//! Values crossing the process boundary

use super::handle::RemoteHandle;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Primitive value that is copied by value across the boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Primitive {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(#[serde(with = "float_repr")] f64),
    Char(char),
    String(String),
}

/// JSON has no NaN or infinities; those travel as the strings `"NaN"`,
/// `"Infinity"` and `"-Infinity"`.
mod float_repr {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    const NAN: &str = "NaN";
    const INFINITY: &str = "Infinity";
    const NEG_INFINITY: &str = "-Infinity";

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str(NAN)
        } else if value.is_infinite() {
            serializer.serialize_str(if *value > 0.0 { INFINITY } else { NEG_INFINITY })
        } else {
            serializer.serialize_f64(*value)
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(v),
            Repr::Text(text) => match text.as_str() {
                NAN => Ok(f64::NAN),
                INFINITY => Ok(f64::INFINITY),
                NEG_INFINITY => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("invalid float '{}'", other))),
            },
        }
    }
}

impl Primitive {
    /// Runtime type name of the primitive
    pub fn type_name(&self) -> &'static str {
        match self {
            Primitive::Bool(_) => "bool",
            Primitive::Int(_) => "int",
            Primitive::UInt(_) => "uint",
            Primitive::Float(_) => "float",
            Primitive::Char(_) => "char",
            Primitive::String(_) => "string",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Primitive::Int(v) => Some(*v),
            Primitive::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Primitive::String(s) => Some(s),
            _ => None,
        }
    }

    /// Total-enough ordering used by remote filters and sorts.
    ///
    /// Numbers compare across int/uint/float; strings and chars compare
    /// lexically; anything else is unordered.
    pub fn compare(&self, other: &Primitive) -> Option<Ordering> {
        use Primitive::*;
        match (self, other) {
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (UInt(a), UInt(b)) => Some(a.cmp(b)),
            (Int(a), UInt(b)) => Some(i128::from(*a).cmp(&i128::from(*b))),
            (UInt(a), Int(b)) => Some(i128::from(*a).cmp(&i128::from(*b))),
            (Char(a), Char(b)) => Some(a.cmp(b)),
            (String(a), String(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Primitive::Int(v) => Some(*v as f64),
            Primitive::UInt(v) => Some(*v as f64),
            Primitive::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl std::fmt::Display for Primitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Primitive::Bool(v) => write!(f, "{}", v),
            Primitive::Int(v) => write!(f, "{}", v),
            Primitive::UInt(v) => write!(f, "{}", v),
            Primitive::Float(v) => write!(f, "{}", v),
            Primitive::Char(v) => write!(f, "{}", v),
            Primitive::String(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for Primitive {
    fn from(v: bool) -> Self {
        Primitive::Bool(v)
    }
}

impl From<i64> for Primitive {
    fn from(v: i64) -> Self {
        Primitive::Int(v)
    }
}

impl From<i32> for Primitive {
    fn from(v: i32) -> Self {
        Primitive::Int(i64::from(v))
    }
}

impl From<u64> for Primitive {
    fn from(v: u64) -> Self {
        Primitive::UInt(v)
    }
}

impl From<f64> for Primitive {
    fn from(v: f64) -> Self {
        Primitive::Float(v)
    }
}

impl From<char> for Primitive {
    fn from(v: char) -> Self {
        Primitive::Char(v)
    }
}

impl From<&str> for Primitive {
    fn from(v: &str) -> Self {
        Primitive::String(v.to_string())
    }
}

impl From<String> for Primitive {
    fn from(v: String) -> Self {
        Primitive::String(v)
    }
}

/// Argument or result on the wire: a primitive, a remote object, or null
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ObjectOrPrimitive {
    Null,
    Primitive(Primitive),
    Remote(RemoteHandle),
}

impl ObjectOrPrimitive {
    pub fn is_null(&self) -> bool {
        matches!(self, ObjectOrPrimitive::Null)
    }

    pub fn as_primitive(&self) -> Option<&Primitive> {
        match self {
            ObjectOrPrimitive::Primitive(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteHandle> {
        match self {
            ObjectOrPrimitive::Remote(h) => Some(h),
            _ => None,
        }
    }
}

macro_rules! primitive_into_value {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for ObjectOrPrimitive {
                fn from(v: $ty) -> Self {
                    ObjectOrPrimitive::Primitive(v.into())
                }
            }
        )*
    };
}

primitive_into_value!(bool, i32, i64, u64, f64, char, &str, String);

impl From<Primitive> for ObjectOrPrimitive {
    fn from(p: Primitive) -> Self {
        ObjectOrPrimitive::Primitive(p)
    }
}

impl From<RemoteHandle> for ObjectOrPrimitive {
    fn from(h: RemoteHandle) -> Self {
        ObjectOrPrimitive::Remote(h)
    }
}
