//! Document actions: tagged records describing one mutation each.
//!
//! The wire form is a tagged array, e.g.
//! `["BulkAddRecord", "Table1", [1, 2], {"Name": ["A", "B"]}]`. Parsing
//! goes through a JSON intermediate so malformed actions surface as
//! conversion errors with a useful message.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::constants::MAX_SMALL_ACTION_ROW_IDS;
use crate::error::EngineError;
use crate::types::{BulkColValues, CellValue};

/// Column description used by `AddTable`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColInfo {
    /// Column identifier.
    pub id: String,
    /// Logical column type (may carry a qualifier, e.g. `Ref:Table1`).
    #[serde(rename = "type")]
    pub col_type: String,
}

/// Partial column description used by `AddColumn` and `ModifyColumn`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ColPatch {
    /// Logical column type, when supplied.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub col_type: Option<String>,
}

/// One document mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum DocAction {
    /// Insert one row per position with explicit row ids.
    BulkAddRecord {
        /// Target table.
        table_id: String,
        /// Row ids to insert.
        row_ids: Vec<i64>,
        /// Column values, each sequence aligned with `row_ids`.
        columns: BulkColValues,
    },
    /// Delete rows by id.
    BulkRemoveRecord {
        /// Target table.
        table_id: String,
        /// Row ids to delete.
        row_ids: Vec<i64>,
    },
    /// Update the listed columns for each row id.
    BulkUpdateRecord {
        /// Target table.
        table_id: String,
        /// Row ids to update.
        row_ids: Vec<i64>,
        /// Column values, each sequence aligned with `row_ids`.
        columns: BulkColValues,
    },
    /// Clear the table and insert the given rows.
    ReplaceTableData {
        /// Target table.
        table_id: String,
        /// Row ids to insert after clearing.
        row_ids: Vec<i64>,
        /// Column values, each sequence aligned with `row_ids`.
        columns: BulkColValues,
    },
    /// Create a table with the given columns plus an implicit integer
    /// primary-key `id` column.
    AddTable {
        /// New table id.
        table_id: String,
        /// Columns in creation order.
        columns: Vec<ColInfo>,
    },
    /// Drop a table.
    RemoveTable {
        /// Table to drop.
        table_id: String,
    },
    /// Rename a table.
    RenameTable {
        /// Current table id.
        old_table_id: String,
        /// New table id.
        new_table_id: String,
    },
    /// Add a column to a table.
    AddColumn {
        /// Target table.
        table_id: String,
        /// New column id.
        col_id: String,
        /// Column description.
        info: ColPatch,
    },
    /// Drop a column.
    RemoveColumn {
        /// Target table.
        table_id: String,
        /// Column to drop.
        col_id: String,
    },
    /// Rename a column.
    RenameColumn {
        /// Target table.
        table_id: String,
        /// Current column id.
        old_col_id: String,
        /// New column id.
        new_col_id: String,
    },
    /// Modify a column in place. Declared but not implemented by the
    /// applier (the store cannot retype a column).
    ModifyColumn {
        /// Target table.
        table_id: String,
        /// Column to modify.
        col_id: String,
        /// Partial column description.
        info: ColPatch,
    },
}

impl DocAction {
    /// Returns the action's tag name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::BulkAddRecord { .. } => "BulkAddRecord",
            Self::BulkRemoveRecord { .. } => "BulkRemoveRecord",
            Self::BulkUpdateRecord { .. } => "BulkUpdateRecord",
            Self::ReplaceTableData { .. } => "ReplaceTableData",
            Self::AddTable { .. } => "AddTable",
            Self::RemoveTable { .. } => "RemoveTable",
            Self::RenameTable { .. } => "RenameTable",
            Self::AddColumn { .. } => "AddColumn",
            Self::RemoveColumn { .. } => "RemoveColumn",
            Self::RenameColumn { .. } => "RenameColumn",
            Self::ModifyColumn { .. } => "ModifyColumn",
        }
    }

    /// Returns the table the action targets (the old id for renames).
    #[must_use]
    pub fn table_id(&self) -> &str {
        match self {
            Self::BulkAddRecord { table_id, .. }
            | Self::BulkRemoveRecord { table_id, .. }
            | Self::BulkUpdateRecord { table_id, .. }
            | Self::ReplaceTableData { table_id, .. }
            | Self::AddTable { table_id, .. }
            | Self::RemoveTable { table_id }
            | Self::AddColumn { table_id, .. }
            | Self::RemoveColumn { table_id, .. }
            | Self::RenameColumn { table_id, .. }
            | Self::ModifyColumn { table_id, .. } => table_id,
            Self::RenameTable { old_table_id, .. } => old_table_id,
        }
    }

    /// Returns the number of rows the action touches (0 for schema
    /// actions).
    #[must_use]
    pub fn row_count(&self) -> usize {
        match self {
            Self::BulkAddRecord { row_ids, .. }
            | Self::BulkRemoveRecord { row_ids, .. }
            | Self::BulkUpdateRecord { row_ids, .. }
            | Self::ReplaceTableData { row_ids, .. } => row_ids.len(),
            _ => 0,
        }
    }

    /// Checks the data-action invariant: every value sequence has the
    /// same length as the row-id list.
    pub fn validate(&self) -> Result<(), EngineError> {
        let (row_ids, columns) = match self {
            Self::BulkAddRecord {
                row_ids, columns, ..
            }
            | Self::BulkUpdateRecord {
                row_ids, columns, ..
            }
            | Self::ReplaceTableData {
                row_ids, columns, ..
            } => (row_ids, columns),
            _ => return Ok(()),
        };
        for (col_id, values) in columns {
            if values.len() != row_ids.len() {
                return Err(EngineError::InvalidAction(format!(
                    "{}: column {col_id} has {} values for {} row ids",
                    self.name(),
                    values.len(),
                    row_ids.len()
                )));
            }
        }
        Ok(())
    }

    /// Returns the stripped form used for large broadcasts: row ids and
    /// value sequences emptied, column keys preserved.
    #[must_use]
    pub fn stripped(&self) -> Self {
        fn empty_cols(columns: &BulkColValues) -> BulkColValues {
            columns.keys().map(|k| (k.clone(), Vec::new())).collect()
        }
        match self {
            Self::BulkAddRecord {
                table_id, columns, ..
            } => Self::BulkAddRecord {
                table_id: table_id.clone(),
                row_ids: Vec::new(),
                columns: empty_cols(columns),
            },
            Self::BulkRemoveRecord { table_id, .. } => Self::BulkRemoveRecord {
                table_id: table_id.clone(),
                row_ids: Vec::new(),
            },
            Self::BulkUpdateRecord {
                table_id, columns, ..
            } => Self::BulkUpdateRecord {
                table_id: table_id.clone(),
                row_ids: Vec::new(),
                columns: empty_cols(columns),
            },
            Self::ReplaceTableData {
                table_id, columns, ..
            } => Self::ReplaceTableData {
                table_id: table_id.clone(),
                row_ids: Vec::new(),
                columns: empty_cols(columns),
            },
            other => other.clone(),
        }
    }

    /// Converts the action to its tagged-array JSON form.
    #[must_use]
    pub fn to_json(&self) -> Value {
        fn cols_json(columns: &BulkColValues) -> Value {
            let map: Map<String, Value> = columns
                .iter()
                .map(|(k, v)| (k.clone(), Value::Array(v.iter().map(CellValue::to_json).collect())))
                .collect();
            Value::Object(map)
        }
        match self {
            Self::BulkAddRecord {
                table_id,
                row_ids,
                columns,
            } => json!(["BulkAddRecord", table_id, row_ids, cols_json(columns)]),
            Self::BulkRemoveRecord { table_id, row_ids } => {
                json!(["BulkRemoveRecord", table_id, row_ids])
            }
            Self::BulkUpdateRecord {
                table_id,
                row_ids,
                columns,
            } => json!(["BulkUpdateRecord", table_id, row_ids, cols_json(columns)]),
            Self::ReplaceTableData {
                table_id,
                row_ids,
                columns,
            } => json!(["ReplaceTableData", table_id, row_ids, cols_json(columns)]),
            Self::AddTable { table_id, columns } => json!(["AddTable", table_id, columns]),
            Self::RemoveTable { table_id } => json!(["RemoveTable", table_id]),
            Self::RenameTable {
                old_table_id,
                new_table_id,
            } => json!(["RenameTable", old_table_id, new_table_id]),
            Self::AddColumn {
                table_id,
                col_id,
                info,
            } => json!(["AddColumn", table_id, col_id, info]),
            Self::RemoveColumn { table_id, col_id } => {
                json!(["RemoveColumn", table_id, col_id])
            }
            Self::RenameColumn {
                table_id,
                old_col_id,
                new_col_id,
            } => json!(["RenameColumn", table_id, old_col_id, new_col_id]),
            Self::ModifyColumn {
                table_id,
                col_id,
                info,
            } => json!(["ModifyColumn", table_id, col_id, info]),
        }
    }

    /// Parses an action from its tagged-array JSON form.
    pub fn from_json(value: &Value) -> Result<Self, String> {
        let items = value.as_array().ok_or("action must be an array")?;
        let tag = items
            .first()
            .and_then(Value::as_str)
            .ok_or("action must start with a string tag")?;

        let arg_str = |idx: usize| -> Result<String, String> {
            items
                .get(idx)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| format!("{tag}: argument {idx} must be a string"))
        };
        let arg_row_ids = |idx: usize| -> Result<Vec<i64>, String> {
            let array = items
                .get(idx)
                .and_then(Value::as_array)
                .ok_or_else(|| format!("{tag}: argument {idx} must be a row-id array"))?;
            array
                .iter()
                .map(|v| v.as_i64().ok_or_else(|| format!("{tag}: row id must be an integer")))
                .collect()
        };
        let arg_cols = |idx: usize| -> Result<BulkColValues, String> {
            let object = items
                .get(idx)
                .and_then(Value::as_object)
                .ok_or_else(|| format!("{tag}: argument {idx} must be a column map"))?;
            object
                .iter()
                .map(|(name, values)| {
                    let array = values
                        .as_array()
                        .ok_or_else(|| format!("{tag}: column {name} must be an array"))?;
                    let cells = array
                        .iter()
                        .map(CellValue::from_json)
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok((name.clone(), cells))
                })
                .collect()
        };
        let arg_patch = |idx: usize| -> Result<ColPatch, String> {
            let raw = items
                .get(idx)
                .cloned()
                .ok_or_else(|| format!("{tag}: missing column info"))?;
            serde_json::from_value(raw).map_err(|e| format!("{tag}: bad column info: {e}"))
        };

        match tag {
            "BulkAddRecord" => Ok(Self::BulkAddRecord {
                table_id: arg_str(1)?,
                row_ids: arg_row_ids(2)?,
                columns: arg_cols(3)?,
            }),
            "BulkRemoveRecord" => Ok(Self::BulkRemoveRecord {
                table_id: arg_str(1)?,
                row_ids: arg_row_ids(2)?,
            }),
            "BulkUpdateRecord" => Ok(Self::BulkUpdateRecord {
                table_id: arg_str(1)?,
                row_ids: arg_row_ids(2)?,
                columns: arg_cols(3)?,
            }),
            "ReplaceTableData" => Ok(Self::ReplaceTableData {
                table_id: arg_str(1)?,
                row_ids: arg_row_ids(2)?,
                columns: arg_cols(3)?,
            }),
            "AddTable" => {
                let raw = items
                    .get(2)
                    .cloned()
                    .ok_or_else(|| format!("{tag}: missing column list"))?;
                let columns: Vec<ColInfo> = serde_json::from_value(raw)
                    .map_err(|e| format!("{tag}: bad column list: {e}"))?;
                Ok(Self::AddTable {
                    table_id: arg_str(1)?,
                    columns,
                })
            }
            "RemoveTable" => Ok(Self::RemoveTable {
                table_id: arg_str(1)?,
            }),
            "RenameTable" => Ok(Self::RenameTable {
                old_table_id: arg_str(1)?,
                new_table_id: arg_str(2)?,
            }),
            "AddColumn" => Ok(Self::AddColumn {
                table_id: arg_str(1)?,
                col_id: arg_str(2)?,
                info: arg_patch(3)?,
            }),
            "RemoveColumn" => Ok(Self::RemoveColumn {
                table_id: arg_str(1)?,
                col_id: arg_str(2)?,
            }),
            "RenameColumn" => Ok(Self::RenameColumn {
                table_id: arg_str(1)?,
                old_col_id: arg_str(2)?,
                new_col_id: arg_str(3)?,
            }),
            "ModifyColumn" => Ok(Self::ModifyColumn {
                table_id: arg_str(1)?,
                col_id: arg_str(2)?,
                info: arg_patch(3)?,
            }),
            other => Err(format!("unknown action tag: {other}")),
        }
    }
}

impl Serialize for DocAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DocAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        DocAction::from_json(&value).map_err(D::Error::custom)
    }
}

/// A set of applied actions broadcast to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSet {
    /// Store version after the set was applied.
    pub action_num: u64,
    /// The applied actions, possibly stripped.
    pub actions: Vec<DocAction>,
}

impl ActionSet {
    /// Returns the broadcast form: actions touching more than
    /// `MAX_SMALL_ACTION_ROW_IDS` rows are stripped.
    #[must_use]
    pub fn for_broadcast(&self) -> Self {
        ActionSet {
            action_num: self.action_num,
            actions: self
                .actions
                .iter()
                .map(|action| {
                    if action.row_count() > MAX_SMALL_ACTION_ROW_IDS {
                        action.stripped()
                    } else {
                        action.clone()
                    }
                })
                .collect(),
        }
    }
}

/// The result of applying a set of actions: one entry per input action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyResultSet {
    /// Per-action results; null for actions with no return value.
    pub results: Vec<Value>,
}
