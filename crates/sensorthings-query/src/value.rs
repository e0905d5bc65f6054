use serde::{Serialize, Serializer};
use serde_json::Value;

/// Storage representation class of a selected column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Text,
    Json,
    Geometry,
}

/// One decoded cell of a result row.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Integer(i64),
    Text(String),
    Json(Value),
    /// GeoJSON text as produced by `ST_AsGeoJSON`
    Geometry(String),
    Null,
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ColumnValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) | ColumnValue::Geometry(s) => Some(s),
            _ => None,
        }
    }

    /// JSON form used in responses. Geometry text is parsed so it nests as an object.
    pub fn to_json(&self) -> Value {
        match self {
            ColumnValue::Integer(i) => Value::from(*i),
            ColumnValue::Text(s) => Value::String(s.clone()),
            ColumnValue::Json(v) => v.clone(),
            ColumnValue::Geometry(s) => {
                serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))
            }
            ColumnValue::Null => Value::Null,
        }
    }

    /// Plain text form used by `$value`.
    pub fn to_raw_string(&self) -> String {
        match self {
            ColumnValue::Text(s) | ColumnValue::Geometry(s) => s.clone(),
            ColumnValue::Null => String::new(),
            other => other.to_json().to_string(),
        }
    }
}

impl Serialize for ColumnValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ColumnValue::Integer(i) => serializer.serialize_i64(*i),
            ColumnValue::Text(s) => serializer.serialize_str(s),
            ColumnValue::Json(v) => v.serialize(serializer),
            ColumnValue::Geometry(_) => self.to_json().serialize(serializer),
            ColumnValue::Null => serializer.serialize_none(),
        }
    }
}
