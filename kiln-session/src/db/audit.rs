use rusqlite::{params, Connection};
use serde_json::Value;

use super::{json_column, parse_optional_column, time_column, StoreResult};
use crate::state::schema::{Actor, AuditEntry, EntityType};
use crate::state::timing::now_millis;

#[derive(Debug, Clone, Default)]
pub struct NewAuditEntry {
    pub action: String,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub actor: Option<Actor>,
    pub details: Option<Value>,
}

impl NewAuditEntry {
    pub fn action(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Default::default()
        }
    }
}

pub fn record(conn: &Connection, entry: &NewAuditEntry) -> StoreResult<i64> {
    let details = entry.details.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO audit_log (action, entity_type, entity_id, actor, details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.action,
            entry.entity_type.map(|e| e.as_str()),
            entry.entity_id,
            entry.actor.map(|a| a.as_str()),
            details,
            now_millis(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent entries, newest first.
pub fn list_recent(conn: &Connection, limit: u32) -> StoreResult<Vec<AuditEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, action, entity_type, entity_id, actor, details, created_at
         FROM audit_log ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok(AuditEntry {
            id: row.get(0)?,
            action: row.get(1)?,
            entity_type: parse_optional_column(row, 2)?,
            entity_id: row.get(3)?,
            actor: parse_optional_column(row, 4)?,
            details: json_column(row, 5)?,
            created_at: time_column(row, 6)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
