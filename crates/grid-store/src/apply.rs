//! Applies doc actions to the store.
//!
//! The caller wraps [`apply_all`] in one immediate transaction so that
//! concurrent readers never observe a half-applied set. Data actions with
//! empty row-id lists (and updates with no columns) are valid no-ops.

use rusqlite::Connection;
use serde_json::Value;

use grid_common::{BulkColValues, CellValue, ColInfo, ColPatch, DocAction, EngineError, EngineResult};

use crate::cell::SqlCell;
use crate::sql::check_ident;
use crate::store_err;

/// Maps a logical column type to its store type and default literal.
///
/// Only the head before `:` is used for lookup (e.g. `Ref:Table1` maps
/// as `Ref`); unknown heads fall back to the `Any` entry.
fn store_type(logical: &str) -> (&'static str, &'static str) {
    let head = logical.split(':').next().unwrap_or("");
    match head {
        "Attachments" => ("TEXT", "NULL"),
        "Blob" => ("BLOB", "NULL"),
        "Bool" => ("BOOLEAN", "0"),
        "Choice" => ("TEXT", "''"),
        "ChoiceList" => ("TEXT", "NULL"),
        "Date" => ("DATE", "NULL"),
        "DateTime" => ("DATETIME", "NULL"),
        "Id" => ("INTEGER", "0"),
        "Int" => ("INTEGER", "0"),
        "ManualSortPos" => ("NUMERIC", "1e999"),
        "Numeric" => ("NUMERIC", "0"),
        "PositionNumber" => ("NUMERIC", "1e999"),
        "Ref" => ("INTEGER", "0"),
        "RefList" => ("TEXT", "NULL"),
        "Text" => ("TEXT", "''"),
        // "Any" and every unknown head.
        _ => ("BLOB", "NULL"),
    }
}

/// Applies every action in order, returning one result value per action.
///
/// Any failure leaves the transaction to be rolled back by the caller;
/// nothing is committed piecemeal.
pub fn apply_all(conn: &Connection, actions: &[DocAction]) -> EngineResult<Vec<Value>> {
    actions
        .iter()
        .map(|action| apply_action(conn, action))
        .collect()
}

/// Applies a single action.
pub fn apply_action(conn: &Connection, action: &DocAction) -> EngineResult<Value> {
    action.validate()?;
    match action {
        DocAction::AddTable { table_id, columns } => add_table(conn, table_id, columns)?,
        DocAction::BulkAddRecord {
            table_id,
            row_ids,
            columns,
        } => bulk_add(conn, table_id, row_ids, columns)?,
        DocAction::BulkUpdateRecord {
            table_id,
            row_ids,
            columns,
        } => bulk_update(conn, table_id, row_ids, columns)?,
        DocAction::BulkRemoveRecord { table_id, row_ids } => {
            bulk_remove(conn, table_id, row_ids)?;
        }
        DocAction::ReplaceTableData {
            table_id,
            row_ids,
            columns,
        } => {
            check_ident(table_id)?;
            conn.execute(&format!("DELETE FROM \"{table_id}\""), [])
                .map_err(store_err)?;
            bulk_add(conn, table_id, row_ids, columns)?;
        }
        DocAction::RemoveTable { table_id } => {
            check_ident(table_id)?;
            conn.execute(&format!("DROP TABLE \"{table_id}\""), [])
                .map_err(store_err)?;
        }
        DocAction::RenameTable {
            old_table_id,
            new_table_id,
        } => {
            check_ident(old_table_id)?;
            check_ident(new_table_id)?;
            conn.execute(
                &format!("ALTER TABLE \"{old_table_id}\" RENAME TO \"{new_table_id}\""),
                [],
            )
            .map_err(store_err)?;
        }
        DocAction::AddColumn {
            table_id,
            col_id,
            info,
        } => add_column(conn, table_id, col_id, info)?,
        DocAction::RemoveColumn { table_id, col_id } => {
            check_ident(table_id)?;
            check_ident(col_id)?;
            conn.execute(
                &format!("ALTER TABLE \"{table_id}\" DROP COLUMN \"{col_id}\""),
                [],
            )
            .map_err(store_err)?;
        }
        DocAction::RenameColumn {
            table_id,
            old_col_id,
            new_col_id,
        } => {
            check_ident(table_id)?;
            check_ident(old_col_id)?;
            check_ident(new_col_id)?;
            conn.execute(
                &format!(
                    "ALTER TABLE \"{table_id}\" RENAME COLUMN \"{old_col_id}\" TO \"{new_col_id}\""
                ),
                [],
            )
            .map_err(store_err)?;
        }
        DocAction::ModifyColumn { .. } => {
            return Err(EngineError::NotImplemented(
                "ModifyColumn: the store cannot retype a column in place".to_string(),
            ));
        }
    }
    Ok(Value::Null)
}

fn add_table(conn: &Connection, table_id: &str, columns: &[ColInfo]) -> EngineResult<()> {
    check_ident(table_id)?;
    let mut defs = vec!["\"id\" INTEGER PRIMARY KEY".to_string()];
    for col in columns {
        check_ident(&col.id)?;
        let (sql_type, default) = store_type(&col.col_type);
        defs.push(format!("\"{}\" {sql_type} DEFAULT {default}", col.id));
    }
    conn.execute(
        &format!("CREATE TABLE \"{table_id}\" ({})", defs.join(", ")),
        [],
    )
    .map_err(store_err)?;
    Ok(())
}

fn add_column(
    conn: &Connection,
    table_id: &str,
    col_id: &str,
    info: &ColPatch,
) -> EngineResult<()> {
    check_ident(table_id)?;
    check_ident(col_id)?;
    let (sql_type, default) = store_type(info.col_type.as_deref().unwrap_or("Any"));
    conn.execute(
        &format!("ALTER TABLE \"{table_id}\" ADD COLUMN \"{col_id}\" {sql_type} DEFAULT {default}"),
        [],
    )
    .map_err(store_err)?;
    Ok(())
}

fn bulk_add(
    conn: &Connection,
    table_id: &str,
    row_ids: &[i64],
    columns: &BulkColValues,
) -> EngineResult<()> {
    check_ident(table_id)?;
    if row_ids.is_empty() {
        return Ok(());
    }
    let col_ids: Vec<&str> = columns.keys().map(String::as_str).collect();
    for col_id in &col_ids {
        check_ident(col_id)?;
    }
    let mut names = String::from("\"id\"");
    let mut placeholders = String::from("?");
    for col_id in &col_ids {
        names.push_str(&format!(", \"{col_id}\""));
        placeholders.push_str(", ?");
    }
    let mut stmt = conn
        .prepare(&format!(
            "INSERT INTO \"{table_id}\" ({names}) VALUES ({placeholders})"
        ))
        .map_err(store_err)?;

    let id_cells: Vec<CellValue> = row_ids.iter().map(|id| CellValue::Int(*id)).collect();
    for (index, id_cell) in id_cells.iter().enumerate() {
        let mut row: Vec<SqlCell<'_>> = Vec::with_capacity(col_ids.len() + 1);
        row.push(SqlCell(id_cell));
        for col_id in &col_ids {
            row.push(SqlCell(&columns[*col_id][index]));
        }
        stmt.execute(rusqlite::params_from_iter(row)).map_err(store_err)?;
    }
    Ok(())
}

fn bulk_update(
    conn: &Connection,
    table_id: &str,
    row_ids: &[i64],
    columns: &BulkColValues,
) -> EngineResult<()> {
    check_ident(table_id)?;
    if row_ids.is_empty() || columns.is_empty() {
        return Ok(());
    }
    let col_ids: Vec<&str> = columns.keys().map(String::as_str).collect();
    let mut assignments = Vec::with_capacity(col_ids.len());
    for col_id in &col_ids {
        check_ident(col_id)?;
        assignments.push(format!("\"{col_id}\" = ?"));
    }
    let mut stmt = conn
        .prepare(&format!(
            "UPDATE \"{table_id}\" SET {} WHERE \"id\" = ?",
            assignments.join(", ")
        ))
        .map_err(store_err)?;

    let id_cells: Vec<CellValue> = row_ids.iter().map(|id| CellValue::Int(*id)).collect();
    for (index, id_cell) in id_cells.iter().enumerate() {
        let mut row: Vec<SqlCell<'_>> = Vec::with_capacity(col_ids.len() + 1);
        for col_id in &col_ids {
            row.push(SqlCell(&columns[*col_id][index]));
        }
        row.push(SqlCell(id_cell));
        stmt.execute(rusqlite::params_from_iter(row)).map_err(store_err)?;
    }
    Ok(())
}

fn bulk_remove(conn: &Connection, table_id: &str, row_ids: &[i64]) -> EngineResult<()> {
    check_ident(table_id)?;
    if row_ids.is_empty() {
        return Ok(());
    }
    let mut stmt = conn
        .prepare(&format!("DELETE FROM \"{table_id}\" WHERE \"id\" = ?"))
        .map_err(store_err)?;
    for row_id in row_ids {
        stmt.execute([row_id]).map_err(store_err)?;
    }
    Ok(())
}
