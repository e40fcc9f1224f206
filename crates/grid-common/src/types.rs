//! Cell values and columnar containers.
//!
//! A cell is null, boolean, integer, float, text, or a typed structured
//! value encoded as `[code, ...payload]`. Bulk values map column ids to
//! equal-length sequences of cells; table values additionally carry the
//! mandatory `id` column.

use std::collections::BTreeMap;

use serde::de::Error as DeError;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// A single cell value.
///
/// Structured values round-trip through the store as JSON bytes in BLOB
/// columns; booleans are stored with SQLite's integer affinity and read
/// back as `Int(0|1)`.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// Text value.
    Text(String),
    /// Typed structured value: a type code plus opaque payload items.
    Structured(String, Vec<Value>),
}

impl CellValue {
    /// Returns true if the value is null.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Tries to get as integer.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            CellValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Tries to get as float, widening integers.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            CellValue::Float(f) => Some(*f),
            CellValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Tries to get as text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Converts a JSON value to a cell value.
    ///
    /// Arrays must start with a string type code; objects have no cell
    /// encoding.
    pub fn from_json(value: &Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(CellValue::Null),
            Value::Bool(b) => Ok(CellValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(CellValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(CellValue::Float(f))
                } else {
                    Err(format!("unrepresentable number: {n}"))
                }
            }
            Value::String(s) => Ok(CellValue::Text(s.clone())),
            Value::Array(items) => match items.first() {
                Some(Value::String(code)) => {
                    Ok(CellValue::Structured(code.clone(), items[1..].to_vec()))
                }
                _ => Err("structured cell must start with a type code".to_string()),
            },
            Value::Object(_) => Err("objects have no cell encoding".to_string()),
        }
    }

    /// Converts the cell value to its JSON form.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Bool(b) => Value::Bool(*b),
            CellValue::Int(i) => Value::from(*i),
            CellValue::Float(f) => Value::from(*f),
            CellValue::Text(s) => Value::String(s.clone()),
            CellValue::Structured(code, payload) => {
                let mut items = Vec::with_capacity(payload.len() + 1);
                items.push(Value::String(code.clone()));
                items.extend(payload.iter().cloned());
                Value::Array(items)
            }
        }
    }
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        CellValue::Int(v)
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        CellValue::Float(v)
    }
}

impl From<bool> for CellValue {
    fn from(v: bool) -> Self {
        CellValue::Bool(v)
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        CellValue::Text(v.to_string())
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CellValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        CellValue::from_json(&value).map_err(D::Error::custom)
    }
}

/// Bulk column values: column id to an ordered sequence of cells.
///
/// All sequences in one bulk value share the same length (the row count).
pub type BulkColValues = BTreeMap<String, Vec<CellValue>>;

/// Bulk column values with the mandatory integer `id` column.
///
/// Serializes as a JSON map with `id` first, then the remaining columns
/// in their stored order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableColValues {
    /// Row ids, one per row.
    pub id: Vec<i64>,
    /// Remaining columns in projection order, excluding `id`.
    pub columns: Vec<(String, Vec<CellValue>)>,
}

impl TableColValues {
    /// Returns the number of rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.id.len()
    }

    /// Looks up a non-id column by name.
    #[must_use]
    pub fn col(&self, col_id: &str) -> Option<&Vec<CellValue>> {
        self.columns
            .iter()
            .find(|(name, _)| name == col_id)
            .map(|(_, values)| values)
    }
}

impl Serialize for TableColValues {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len() + 1))?;
        map.serialize_entry("id", &self.id)?;
        for (name, values) in &self.columns {
            map.serialize_entry(name, values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for TableColValues {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Map::deserialize(deserializer)?;
        let mut id = Vec::new();
        let mut columns = Vec::new();
        let mut saw_id = false;
        for (name, value) in raw {
            if name == "id" {
                saw_id = true;
                let items = value
                    .as_array()
                    .ok_or_else(|| D::Error::custom("id column must be an array"))?;
                id = items
                    .iter()
                    .map(|v| {
                        v.as_i64()
                            .ok_or_else(|| D::Error::custom("row id must be an integer"))
                    })
                    .collect::<Result<_, _>>()?;
            } else {
                let items = value
                    .as_array()
                    .ok_or_else(|| D::Error::custom("column values must be an array"))?;
                let cells = items
                    .iter()
                    .map(|v| CellValue::from_json(v).map_err(D::Error::custom))
                    .collect::<Result<_, _>>()?;
                columns.push((name, cells));
            }
        }
        if !saw_id {
            return Err(D::Error::custom("missing id column"));
        }
        Ok(TableColValues { id, columns })
    }
}
