use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;

use super::features::push_paging;
use super::{
    json_column, optional_time_column, parse_column, time_column, StoreError, StoreResult,
};
use crate::state::schema::{Role, Status, Task, TaskId};
use crate::state::timing::{now_millis, to_millis};

const COLUMNS: &str = "id, feature_id, role, description, status, attempts, user_story_id, \
                       created_at, started_at, completed_at, output, error";

#[derive(Debug, Clone)]
pub struct NewTask {
    pub feature_id: String,
    pub role: Role,
    pub description: String,
    pub user_story_id: Option<i64>,
}

impl NewTask {
    pub fn new(feature_id: impl Into<String>, role: Role, description: impl Into<String>) -> Self {
        Self {
            feature_id: feature_id.into(),
            role,
            description: description.into(),
            user_story_id: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub feature_id: Option<String>,
    pub status: Option<Status>,
    pub role: Option<Role>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Partial update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<Status>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<String>,
}

pub fn create(conn: &Connection, new: &NewTask) -> StoreResult<Task> {
    conn.execute(
        "INSERT INTO tasks (feature_id, role, description, status, attempts, user_story_id, created_at)
         VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5)",
        params![
            new.feature_id,
            new.role.as_str(),
            new.description,
            new.user_story_id,
            now_millis(),
        ],
    )?;
    let id = conn.last_insert_rowid();
    find_by_id(conn, id)?.ok_or_else(|| StoreError::not_found("task", id))
}

pub fn find_by_id(conn: &Connection, id: TaskId) -> StoreResult<Option<Task>> {
    let sql = format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], row_to_task).optional()?)
}

/// List tasks matching the filter, oldest first.
pub fn find_all(conn: &Connection, filter: &TaskFilter) -> StoreResult<Vec<Task>> {
    let mut sql = format!("SELECT {COLUMNS} FROM tasks WHERE 1 = 1");
    let mut args: Vec<SqlValue> = Vec::new();
    if let Some(feature_id) = &filter.feature_id {
        sql.push_str(" AND feature_id = ?");
        args.push(SqlValue::Text(feature_id.clone()));
    }
    if let Some(status) = filter.status {
        sql.push_str(" AND status = ?");
        args.push(SqlValue::Text(status.as_str().to_string()));
    }
    if let Some(role) = filter.role {
        sql.push_str(" AND role = ?");
        args.push(SqlValue::Text(role.as_str().to_string()));
    }
    sql.push_str(" ORDER BY created_at ASC, id ASC");
    push_paging(&mut sql, &mut args, filter.limit, filter.offset);

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args), row_to_task)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Pending tasks, oldest created first, up to `limit`.
pub fn find_pending_oldest(conn: &Connection, limit: u32) -> StoreResult<Vec<Task>> {
    find_all(
        conn,
        &TaskFilter {
            status: Some(Status::Pending),
            limit: Some(limit),
            ..Default::default()
        },
    )
}

pub fn list_by_feature(conn: &Connection, feature_id: &str) -> StoreResult<Vec<Task>> {
    find_all(
        conn,
        &TaskFilter {
            feature_id: Some(feature_id.to_string()),
            ..Default::default()
        },
    )
}

/// Whether the feature already has a pending or in-progress task for `role`.
pub fn exists_active(conn: &Connection, feature_id: &str, role: Role) -> StoreResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tasks
         WHERE feature_id = ?1 AND role = ?2 AND status IN ('pending', 'in_progress')",
        params![feature_id, role.as_str()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Apply a partial update. Fails with `NotFound` for unknown ids.
pub fn update(conn: &Connection, id: TaskId, patch: &TaskPatch) -> StoreResult<Task> {
    let mut sets: Vec<&str> = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();
    if let Some(status) = patch.status {
        sets.push("status = ?");
        args.push(SqlValue::Text(status.as_str().to_string()));
    }
    if let Some(started_at) = patch.started_at {
        sets.push("started_at = ?");
        args.push(SqlValue::Integer(to_millis(started_at)));
    }
    if let Some(completed_at) = patch.completed_at {
        sets.push("completed_at = ?");
        args.push(SqlValue::Integer(to_millis(completed_at)));
    }
    if let Some(output) = &patch.output {
        sets.push("output = ?");
        args.push(SqlValue::Text(serde_json::to_string(output)?));
    }
    if let Some(error) = &patch.error {
        sets.push("error = ?");
        args.push(SqlValue::Text(error.clone()));
    }

    if sets.is_empty() {
        return find_by_id(conn, id)?.ok_or_else(|| StoreError::not_found("task", id));
    }

    args.push(SqlValue::Integer(id));
    let sql = format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", "));
    let changed = conn.execute(&sql, params_from_iter(args))?;
    if changed == 0 {
        return Err(StoreError::not_found("task", id));
    }
    find_by_id(conn, id)?.ok_or_else(|| StoreError::not_found("task", id))
}

/// Bump the attempt counter and return the new value.
pub fn increment_attempts(conn: &Connection, id: TaskId) -> StoreResult<u32> {
    let changed = conn.execute(
        "UPDATE tasks SET attempts = attempts + 1 WHERE id = ?1",
        params![id],
    )?;
    if changed == 0 {
        return Err(StoreError::not_found("task", id));
    }
    let attempts: u32 =
        conn.query_row("SELECT attempts FROM tasks WHERE id = ?1", params![id], |row| {
            row.get(0)
        })?;
    Ok(attempts)
}

/// Move a task to `in_progress`, stamp `started_at` and count the attempt.
pub fn mark_started(conn: &Connection, id: TaskId) -> StoreResult<Task> {
    let changed = conn.execute(
        "UPDATE tasks SET status = 'in_progress', started_at = ?1, attempts = attempts + 1
         WHERE id = ?2",
        params![now_millis(), id],
    )?;
    if changed == 0 {
        return Err(StoreError::not_found("task", id));
    }
    find_by_id(conn, id)?.ok_or_else(|| StoreError::not_found("task", id))
}

/// Put a task back in the queue, clearing what the previous attempt left
/// behind. `attempts` and `started_at` are kept.
pub fn reset_for_retry(conn: &Connection, id: TaskId) -> StoreResult<Task> {
    let changed = conn.execute(
        "UPDATE tasks SET status = 'pending', completed_at = NULL, output = NULL, error = NULL
         WHERE id = ?1",
        params![id],
    )?;
    if changed == 0 {
        return Err(StoreError::not_found("task", id));
    }
    find_by_id(conn, id)?.ok_or_else(|| StoreError::not_found("task", id))
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        feature_id: row.get(1)?,
        role: parse_column(row, 2)?,
        description: row.get(3)?,
        status: parse_column(row, 4)?,
        attempts: row.get(5)?,
        user_story_id: row.get(6)?,
        created_at: time_column(row, 7)?,
        started_at: optional_time_column(row, 8)?,
        completed_at: optional_time_column(row, 9)?,
        output: json_column(row, 10)?,
        error: row.get(11)?,
    })
}
