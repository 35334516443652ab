use rusqlite::{params, Connection};
use serde_json::Value;

use super::{json_column, parse_column, time_column, StoreResult};
use crate::state::schema::{Actor, EntityType, Status, Transition};
use crate::state::timing::now_millis;

#[derive(Debug, Clone)]
pub struct NewTransition {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub from_state: Option<Status>,
    pub to_state: Status,
    pub reason: Option<String>,
    pub actor: Actor,
    pub metadata: Option<Value>,
}

impl NewTransition {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl ToString,
        from_state: Option<Status>,
        to_state: Status,
        actor: Actor,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.to_string(),
            from_state,
            to_state,
            reason: None,
            actor,
            metadata: None,
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Append a transition row and return its id.
pub fn record(conn: &Connection, t: &NewTransition) -> StoreResult<i64> {
    let metadata = t.metadata.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO transitions (entity_type, entity_id, from_state, to_state, reason, actor, created_at, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            t.entity_type.as_str(),
            t.entity_id,
            t.from_state.map(|s| s.as_str()),
            t.to_state.as_str(),
            t.reason,
            t.actor.as_str(),
            now_millis(),
            metadata,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// History for one entity, oldest first.
pub fn list_for_entity(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
) -> StoreResult<Vec<Transition>> {
    let mut stmt = conn.prepare(
        "SELECT id, entity_type, entity_id, from_state, to_state, reason, actor, created_at, metadata
         FROM transitions WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![entity_type.as_str(), entity_id], row_to_transition)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Most recent transitions across all entities, newest first.
pub fn list_recent(conn: &Connection, limit: u32) -> StoreResult<Vec<Transition>> {
    let mut stmt = conn.prepare(
        "SELECT id, entity_type, entity_id, from_state, to_state, reason, actor, created_at, metadata
         FROM transitions ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], row_to_transition)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn row_to_transition(row: &rusqlite::Row) -> rusqlite::Result<Transition> {
    Ok(Transition {
        id: row.get(0)?,
        entity_type: parse_column(row, 1)?,
        entity_id: row.get(2)?,
        from_state: row.get(3)?,
        to_state: row.get(4)?,
        reason: row.get(5)?,
        actor: parse_column(row, 6)?,
        created_at: time_column(row, 7)?,
        metadata: json_column(row, 8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[test]
    fn test_record_and_list() {
        let conn = test_db();
        record(
            &conn,
            &NewTransition::new(EntityType::Task, 7, None, Status::Pending, Actor::System),
        )
        .unwrap();
        record(
            &conn,
            &NewTransition::new(
                EntityType::Task,
                7,
                Some(Status::Pending),
                Status::InProgress,
                Actor::System,
            )
            .reason("dispatched"),
        )
        .unwrap();
        record(
            &conn,
            &NewTransition::new(EntityType::Feature, "f-1", None, Status::Pending, Actor::User),
        )
        .unwrap();

        let history = list_for_entity(&conn, EntityType::Task, "7").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from_state, None);
        assert_eq!(history[1].from_state.as_deref(), Some("pending"));
        assert_eq!(history[1].to_state, "in_progress");
        assert_eq!(history[1].reason.as_deref(), Some("dispatched"));

        let recent = list_recent(&conn, 1).unwrap();
        assert_eq!(recent[0].entity_type, EntityType::Feature);
        assert_eq!(recent[0].actor, Actor::User);
    }
}
