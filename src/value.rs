//! Runtime values carried on ports and bound as parameters.
//!
//! [`Value`] is the single dynamic payload that flows along connections,
//! is bound into [`ModuleParam`](crate::module::ModuleParam)s and travels
//! across the worker boundary. It is serde-serializable so that pipeline
//! clones and worker results can be shipped as text.
//!
//! [`Value::infer_signature`] is the runtime half of map type checking: it
//! names the registry type a literal would have when bound to a port with the
//! given declared signature.

use crate::port::Signature;
use crate::registry::basic;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::path::PathBuf;

/// A dynamically typed port value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    /// Non-finite floats are written as the strings `"NaN"`, `"inf"` and
    /// `"-inf"`, which plain JSON numbers cannot hold.
    Float(#[serde(with = "float_repr")] f64),
    String(String),
    File(PathBuf),
    List(Vec<Value>),
    /// Positional tuple; used for multi-port map elements.
    Tuple(Vec<Value>),
    Table(Table),
    /// Instance of a module type that must round-trip through its descriptor.
    Object(ObjectValue),
}

mod float_repr {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(x: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if x.is_nan() {
            serializer.serialize_str("NaN")
        } else if x.is_infinite() {
            serializer.serialize_str(if *x > 0.0 { "inf" } else { "-inf" })
        } else {
            serializer.serialize_f64(*x)
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
            Repr::Number(x) => Ok(x),
            Repr::Text(t) => match t.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("'{other}' is not a float"))),
            },
        }
    }
}

/// A value whose declared type is itself a registered module type.
///
/// These do not cross the worker boundary as-is: they are serialized to text
/// and tagged with their descriptor's sigstring so the caller can rebuild them
/// through the registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectValue {
    /// Descriptor identifier, e.g. `"itk:Image"`.
    pub descriptor: String,
    /// Opaque state owned by the module type.
    pub state: serde_json::Value,
}

/// An in-memory column table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: Option<String>,
    pub names: Option<Vec<String>>,
    pub columns: Vec<Vec<Value>>,
    pub rows: usize,
}

impl Table {
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn get_column(&self, index: usize) -> Option<&[Value]> {
        self.columns.get(index).map(Vec::as_slice)
    }
}

impl Value {
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(v) | Self::Tuple(v) => Some(v),
            _ => None,
        }
    }

    /// Registry type of this value when it is bound to a port declared as
    /// `declared`.
    ///
    /// An integer bound to a `Float` port is a `Float`. Tuples are inferred
    /// component-wise. Returns `None` when no type can be named, in which case
    /// the caller skips type checking for this value.
    #[must_use]
    pub fn infer_signature(&self, declared: &Signature) -> Option<Signature> {
        if let Self::Tuple(items) = self {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let component = declared
                    .components()
                    .get(i)
                    .map(|c| Signature::single(c.clone()))
                    .unwrap_or_default();
                out.extend(item.infer_signature(&component)?.components().iter().cloned());
            }
            return Some(Signature::new(out));
        }
        let first_declared = declared.components().first().map(String::as_str);
        let ty = match self {
            Self::Boolean(_) => basic::BOOLEAN.to_string(),
            Self::String(_) => basic::STRING.to_string(),
            Self::Integer(_) if first_declared == Some(basic::FLOAT) => basic::FLOAT.to_string(),
            Self::Integer(_) => basic::INTEGER.to_string(),
            Self::Float(_) => basic::FLOAT.to_string(),
            Self::List(_) => basic::LIST.to_string(),
            Self::File(_) => basic::FILE.to_string(),
            Self::Table(_) => basic::TABLE.to_string(),
            Self::Object(obj) if !obj.descriptor.is_empty() => obj.descriptor.clone(),
            Self::Object(_) | Self::Tuple(_) => return None,
        };
        Some(Signature::single(ty))
    }

    /// Convert plain JSON data. `null` has no counterpart; objects become
    /// untyped [`ObjectValue`]s.
    #[must_use]
    pub fn from_json(v: &serde_json::Value) -> Option<Self> {
        use serde_json::Value as Json;
        Some(match v {
            Json::Null => return None,
            Json::Bool(b) => Self::Boolean(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Float(n.as_f64()?),
            },
            Json::String(s) => Self::String(s.clone()),
            Json::Array(items) => Self::List(items.iter().filter_map(Self::from_json).collect()),
            Json::Object(_) => Self::Object(ObjectValue {
                descriptor: String::new(),
                state: v.clone(),
            }),
        })
    }

    /// Render as the literal text stored in a [`ModuleParam`](crate::module::ModuleParam).
    #[must_use]
    pub fn to_literal(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::File(p) => p.display().to_string(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self {
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => write!(f, "{s}"),
            Self::File(p) => write!(f, "{}", p.display()),
            Self::List(items) | Self::Tuple(items) => {
                let open = if matches!(self, Self::List(_)) { '[' } else { '(' };
                let close = if open == '[' { ']' } else { ')' };
                write!(f, "{open}")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "{close}")
            }
            Self::Table(t) => write!(f, "<table {} cols x {} rows>", t.column_count(), t.rows),
            Self::Object(o) => write!(f, "<{}>", o.descriptor),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_widens_to_declared_float() {
        let declared = Signature::single(basic::FLOAT);
        let sig = Value::Integer(3).infer_signature(&declared).unwrap();
        assert_eq!(sig.components(), &[basic::FLOAT.to_string()]);

        let declared = Signature::single(basic::INTEGER);
        let sig = Value::Integer(3).infer_signature(&declared).unwrap();
        assert_eq!(sig.components(), &[basic::INTEGER.to_string()]);
    }

    #[test]
    fn non_finite_floats_survive_json() {
        let v = Value::List(vec![
            Value::Float(f64::INFINITY),
            Value::Float(f64::NEG_INFINITY),
            Value::Float(1.5),
        ]);
        let text = serde_json::to_string(&v).unwrap();
        assert!(text.contains("\"-inf\""), "{text}");
        assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), v);

        let text = serde_json::to_string(&Value::Float(f64::NAN)).unwrap();
        match serde_json::from_str::<Value>(&text).unwrap() {
            Value::Float(x) => assert!(x.is_nan()),
            other => panic!("expected a float, got {other:?}"),
        }
        assert!(serde_json::from_str::<Value>(r#"{"type":"Float","value":"nope"}"#).is_err());
    }

    #[test]
    fn tuple_is_inferred_componentwise() {
        let declared = Signature::new(vec![basic::FLOAT.into(), basic::STRING.into()]);
        let v = Value::Tuple(vec![Value::Integer(1), Value::from("a")]);
        let sig = v.infer_signature(&declared).unwrap();
        assert_eq!(sig.to_string(), "(basic:Float,basic:String)");
    }
}
