//! Derived records produced when an architect task fans out its output.

use rusqlite::{params, Connection, OptionalExtension};

use super::{time_column, StoreError, StoreResult};
use crate::state::schema::{Decision, Discovery, TaskId, UserStory};
use crate::state::timing::now_millis;

pub fn insert_discovery(
    conn: &Connection,
    feature_id: &str,
    task_id: TaskId,
    title: &str,
    detail: &str,
) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO discoveries (feature_id, task_id, title, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![feature_id, task_id, title, detail, now_millis()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_decision(
    conn: &Connection,
    feature_id: &str,
    task_id: TaskId,
    title: &str,
    rationale: &str,
) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO decisions (feature_id, task_id, title, rationale, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![feature_id, task_id, title, rationale, now_millis()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_user_story(
    conn: &Connection,
    feature_id: &str,
    task_id: TaskId,
    title: &str,
    description: &str,
    acceptance_criteria: &[String],
) -> StoreResult<UserStory> {
    conn.execute(
        "INSERT INTO user_stories (feature_id, task_id, title, description, acceptance_criteria, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            feature_id,
            task_id,
            title,
            description,
            serde_json::to_string(acceptance_criteria)?,
            now_millis(),
        ],
    )?;
    let id = conn.last_insert_rowid();
    find_user_story(conn, id)?.ok_or_else(|| StoreError::not_found("user story", id))
}

pub fn list_discoveries(conn: &Connection, feature_id: &str) -> StoreResult<Vec<Discovery>> {
    let mut stmt = conn.prepare(
        "SELECT id, feature_id, task_id, title, detail, created_at
         FROM discoveries WHERE feature_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![feature_id], |row| {
        Ok(Discovery {
            id: row.get(0)?,
            feature_id: row.get(1)?,
            task_id: row.get(2)?,
            title: row.get(3)?,
            detail: row.get(4)?,
            created_at: time_column(row, 5)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn list_decisions(conn: &Connection, feature_id: &str) -> StoreResult<Vec<Decision>> {
    let mut stmt = conn.prepare(
        "SELECT id, feature_id, task_id, title, rationale, created_at
         FROM decisions WHERE feature_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![feature_id], |row| {
        Ok(Decision {
            id: row.get(0)?,
            feature_id: row.get(1)?,
            task_id: row.get(2)?,
            title: row.get(3)?,
            rationale: row.get(4)?,
            created_at: time_column(row, 5)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_user_story(conn: &Connection, id: i64) -> StoreResult<Option<UserStory>> {
    Ok(conn
        .query_row(
            "SELECT id, feature_id, task_id, title, description, acceptance_criteria, created_at
             FROM user_stories WHERE id = ?1",
            params![id],
            row_to_story,
        )
        .optional()?)
}

pub fn list_user_stories(conn: &Connection, feature_id: &str) -> StoreResult<Vec<UserStory>> {
    let mut stmt = conn.prepare(
        "SELECT id, feature_id, task_id, title, description, acceptance_criteria, created_at
         FROM user_stories WHERE feature_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![feature_id], row_to_story)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn row_to_story(row: &rusqlite::Row) -> rusqlite::Result<UserStory> {
    let criteria: String = row.get(5)?;
    let acceptance_criteria = serde_json::from_str(&criteria).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(UserStory {
        id: row.get(0)?,
        feature_id: row.get(1)?,
        task_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        acceptance_criteria,
        created_at: time_column(row, 6)?,
    })
}
