//! Cell value binding and extraction for SQLite.
//!
//! Structured cells are stored as JSON bytes in BLOB columns; blobs read
//! back are parsed as `[code, ...]` arrays, falling back to lossy text.

use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::ToSql;
use serde_json::Value;

use grid_common::CellValue;

/// Borrowed cell value, bindable as a SQL parameter.
pub(crate) struct SqlCell<'a>(pub &'a CellValue);

impl ToSql for SqlCell<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            CellValue::Null => ToSqlOutput::Owned(SqlValue::Null),
            CellValue::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            CellValue::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            CellValue::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            CellValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            structured @ CellValue::Structured(..) => ToSqlOutput::Owned(SqlValue::Blob(
                serde_json::to_vec(&structured.to_json()).unwrap_or_default(),
            )),
        })
    }
}

/// Converts a raw SQLite value back into a cell value.
pub(crate) fn cell_from_sql(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(i) => CellValue::Int(i),
        ValueRef::Real(f) => CellValue::Float(f),
        ValueRef::Text(text) => CellValue::Text(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => match serde_json::from_slice::<Value>(blob) {
            Ok(parsed) => CellValue::from_json(&parsed)
                .unwrap_or_else(|_| CellValue::Text(String::from_utf8_lossy(blob).into_owned())),
            Err(_) => CellValue::Text(String::from_utf8_lossy(blob).into_owned()),
        },
    }
}
