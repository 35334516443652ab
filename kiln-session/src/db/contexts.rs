use rusqlite::{params, Connection, OptionalExtension};

use super::{parse_column, time_column, StoreError, StoreResult};
use crate::state::schema::{ContextRecord, ContextType};
use crate::state::timing::now_millis;

#[derive(Debug, Clone)]
pub struct NewContext {
    pub feature_id: String,
    pub context_type: ContextType,
    pub content: String,
    pub author: Option<String>,
}

/// Append a context row. Context is never mutated after creation.
pub fn create(conn: &Connection, new: &NewContext) -> StoreResult<ContextRecord> {
    conn.execute(
        "INSERT INTO contexts (feature_id, context_type, content, author, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            new.feature_id,
            new.context_type.as_str(),
            new.content,
            new.author,
            now_millis(),
        ],
    )?;
    let id = conn.last_insert_rowid();
    find_by_id(conn, id)?.ok_or_else(|| StoreError::not_found("context", id))
}

pub fn find_by_id(conn: &Connection, id: i64) -> StoreResult<Option<ContextRecord>> {
    Ok(conn
        .query_row(
            "SELECT id, feature_id, context_type, content, author, created_at
             FROM contexts WHERE id = ?1",
            params![id],
            row_to_context,
        )
        .optional()?)
}

/// All context for a feature in the order it was written.
pub fn list_by_feature(conn: &Connection, feature_id: &str) -> StoreResult<Vec<ContextRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, feature_id, context_type, content, author, created_at
         FROM contexts WHERE feature_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![feature_id], row_to_context)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn row_to_context(row: &rusqlite::Row) -> rusqlite::Result<ContextRecord> {
    Ok(ContextRecord {
        id: row.get(0)?,
        feature_id: row.get(1)?,
        context_type: parse_column(row, 2)?,
        content: row.get(3)?,
        author: row.get(4)?,
        created_at: time_column(row, 5)?,
    })
}
