//! Dynamic values flowing through the pipeline

use crate::core::error::ExecutionError;
use crate::core::resource::Closeable;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// Ordered field map backing records and pipelines
pub type Record = IndexMap<String, Value>;

/// A pipeline value
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Decimal(f64),
    String(String),
    List(Vec<Value>),
    Record(Record),
    Error(Arc<ExecutionError>),
    Resource(Arc<dyn Closeable>),
}

impl Value {
    /// Build a record value from name/value pairs
    pub fn record<K, I>(fields: I) -> Value
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Record(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Decimal(_) => "decimal",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Record(_) => "record",
            Value::Error(_) => "error",
            Value::Resource(_) => "resource",
        }
    }

    /// Boolean view of the value, `None` when it has none
    pub fn to_boolean(&self) -> Option<bool> {
        match self {
            Value::Null => Some(false),
            Value::Bool(b) => Some(*b),
            Value::Integer(i) => Some(*i != 0),
            Value::Decimal(d) => Some(*d != 0.0),
            Value::String(s) => match s.trim() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            Value::List(items) => Some(items.iter().any(|item| !item.is_null())),
            Value::Record(_) | Value::Error(_) | Value::Resource(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Decimal(d) if d.fract() == 0.0 => Some(*d as i64),
            Value::String(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Decimal(d) => Some(*d),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(record) => Some(record),
            _ => None,
        }
    }

    /// Text form used when a scalar is converted to a string
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Decimal(d) => Some(d.to_string()),
            Value::Error(e) => Some(e.to_string()),
            _ => None,
        }
    }

    /// Convert this value to the kind of `like`
    pub fn convert_like(&self, like: &Value) -> Option<Value> {
        if self.is_null() {
            return Some(Value::Null);
        }
        match like {
            Value::Null => Some(self.clone()),
            Value::Bool(_) => self.to_boolean().map(Value::Bool),
            Value::Integer(_) => self.as_i64().map(Value::Integer),
            Value::Decimal(_) => self.as_f64().map(Value::Decimal),
            Value::String(_) => self.to_text().map(Value::String),
            Value::List(_) if matches!(self, Value::List(_)) => Some(self.clone()),
            Value::Record(_) if matches!(self, Value::Record(_)) => Some(self.clone()),
            Value::Error(_) if matches!(self, Value::Error(_)) => Some(self.clone()),
            Value::Resource(_) if matches!(self, Value::Resource(_)) => Some(self.clone()),
            _ => None,
        }
    }

    /// Equality that compares integers and decimals numerically
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Integer(a), Value::Decimal(b)) | (Value::Decimal(b), Value::Integer(a)) => {
                (*a as f64) == *b
            }
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loosely_equals(y))
            }
            _ => self == other,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Decimal(d) => serde_json::Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Record(record) => serde_json::Value::Object(
                record.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Error(error) => serde_json::json!({
                "code": error.code,
                "message": error.message,
                "description": error.description,
            }),
            Value::Resource(resource) => serde_json::Value::String(format!("{:?}", resource)),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => Arc::ptr_eq(a, b),
            (Value::Resource(a), Value::Resource(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Error(e) => write!(f, "{}", e),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Decimal(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => {
                Value::Record(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Decimal(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<ExecutionError> for Value {
    fn from(error: ExecutionError) -> Self {
        Value::Error(Arc::new(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_boolean() {
        assert_eq!(Value::Null.to_boolean(), Some(false));
        assert_eq!(Value::from("true").to_boolean(), Some(true));
        assert_eq!(Value::from("maybe").to_boolean(), None);
        assert_eq!(Value::from(0).to_boolean(), Some(false));
        assert_eq!(Value::List(vec![Value::Null]).to_boolean(), Some(false));
        assert_eq!(Value::List(vec![Value::Null, 1.into()]).to_boolean(), Some(true));
        assert_eq!(Value::record([("a", Value::Null)]).to_boolean(), None);
    }

    #[test]
    fn test_convert_like() {
        assert_eq!(Value::from("42").convert_like(&Value::Integer(0)), Some(Value::Integer(42)));
        assert_eq!(Value::from(7).convert_like(&Value::from("")), Some(Value::from("7")));
        assert_eq!(Value::from("x").convert_like(&Value::Integer(0)), None);
        assert_eq!(Value::Null.convert_like(&Value::Integer(0)), Some(Value::Null));
    }

    #[test]
    fn test_json_interop() {
        let json = serde_json::json!({"name": "ada", "tags": [1, 2.5, null], "ok": true});
        let value = Value::from(json.clone());
        assert_eq!(value.to_json(), json);
        let record = value.as_record().unwrap();
        assert_eq!(record.len(), 3);
        assert_eq!(record.get("name"), Some(&Value::from("ada")));
    }

    #[test]
    fn test_loose_equality() {
        assert!(Value::from(2).loosely_equals(&Value::from(2.0)));
        assert!(!Value::from(2).loosely_equals(&Value::from("2")));
        assert_ne!(Value::from(2), Value::from(2.0));
    }
}
