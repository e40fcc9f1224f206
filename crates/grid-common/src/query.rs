//! Structured query descriptions and result containers.
//!
//! Queries are structured, not text: a table id plus optional filters,
//! sort, limit, cursor, projection, row-id restriction, and the
//! previous-row flag. The filter tree stays raw JSON here; it is parsed
//! by the SQL builder so that unknown tags and arity violations surface
//! as builder errors rather than deserialization failures.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::TableColValues;

/// A cursor restricting a query to rows strictly after (or, reserved,
/// before) a position in the current order. Wire form: `[kind, values]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCursor(
    /// Cursor kind: `after`, or the reserved `before`.
    pub String,
    /// Position values, aligned with the query's sort columns.
    pub Vec<Value>,
);

impl QueryCursor {
    /// Builds an `after` cursor from the given sort-column values.
    #[must_use]
    pub fn after(values: Vec<Value>) -> Self {
        QueryCursor("after".to_string(), values)
    }
}

/// A structured read query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// Table to read.
    pub table_id: String,
    /// Filter expression tree (tagged arrays), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    /// Sort columns, each optionally prefixed `-` for descending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<String>>,
    /// Maximum number of rows to return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Pagination cursor; value count must equal the sort length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<QueryCursor>,
    /// Columns to project; `id` is always included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    /// Restrict to these row ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_ids: Option<Vec<i64>>,
    /// Project, per returned row, the id of the row immediately before
    /// it in the current order/filter (null if first), under the
    /// synthetic column name `_grist_Previous`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub include_previous: bool,
}

impl Query {
    /// Creates a query over a whole table.
    #[must_use]
    pub fn table(table_id: impl Into<String>) -> Self {
        Query {
            table_id: table_id.into(),
            ..Query::default()
        }
    }
}

/// Options for a streaming read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingOptions {
    /// Read timeout in milliseconds; elapsing it is equivalent to
    /// cancellation. Zero cancels immediately.
    pub timeout_ms: u64,
    /// Maximum rows per emitted chunk; must be positive.
    pub chunk_rows: usize,
}

impl StreamingOptions {
    /// Validates the options.
    pub fn validate(&self) -> Result<(), crate::error::EngineError> {
        if self.chunk_rows == 0 {
            return Err(crate::error::EngineError::InvalidConfig(
                "chunkRows must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// The result of a plain (eager) query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Table that was read.
    pub table_id: String,
    /// Store version at which the read executed.
    pub action_num: u64,
    /// Columnar row data, including the `id` column.
    pub table_data: TableColValues,
}

/// The initial value of a streaming query result; rows follow as chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingHeader {
    /// Table that is being read.
    pub table_id: String,
    /// Store version at which the read executed.
    pub action_num: u64,
    /// Column ids, aligned with the positional row arrays in each chunk.
    pub col_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_wire_names() {
        let query = Query {
            table_id: "Table1".into(),
            sort: Some(vec!["-Age".into()]),
            row_ids: Some(vec![1, 2]),
            include_previous: true,
            ..Query::default()
        };
        let encoded = serde_json::to_value(&query).unwrap();
        assert_eq!(encoded["tableId"], json!("Table1"));
        assert_eq!(encoded["rowIds"], json!([1, 2]));
        assert_eq!(encoded["includePrevious"], json!(true));
        assert!(encoded.get("filters").is_none());

        let decoded: Query = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, query);
    }

    #[test]
    fn test_query_minimal() {
        let decoded: Query = serde_json::from_value(json!({"tableId": "T"})).unwrap();
        assert_eq!(decoded, Query::table("T"));
        assert!(!decoded.include_previous);
    }

    #[test]
    fn test_cursor_wire_form() {
        let cursor = QueryCursor::after(vec![json!(1000)]);
        let encoded = serde_json::to_value(&cursor).unwrap();
        assert_eq!(encoded, json!(["after", [1000]]));
    }

    #[test]
    fn test_streaming_options() {
        let options = StreamingOptions {
            timeout_ms: 60_000,
            chunk_rows: 500,
        };
        assert!(options.validate().is_ok());
        let encoded = serde_json::to_value(options).unwrap();
        assert_eq!(encoded, json!({"timeoutMs": 60000, "chunkRows": 500}));

        let bad = StreamingOptions {
            timeout_ms: 0,
            chunk_rows: 0,
        };
        assert!(bad.validate().is_err());
    }
}
