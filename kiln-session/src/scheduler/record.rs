//! Status changes that always leave a transition row behind.

use chrono::Utc;
use rusqlite::Connection;

use crate::db::tasks::{self, TaskPatch};
use crate::db::transitions::{self, NewTransition};
use crate::db::{features, StoreError, StoreResult};
use crate::state::schema::{Actor, EntityType, Feature, Status, Task, TaskId};
use crate::state::transitions::{validate_feature_transition, validate_task_transition};

fn load_task(conn: &Connection, id: TaskId) -> StoreResult<Task> {
    tasks::find_by_id(conn, id)?.ok_or_else(|| StoreError::not_found("task", id))
}

pub(crate) fn load_feature(conn: &Connection, id: &str) -> StoreResult<Feature> {
    features::find_by_id(conn, id)?.ok_or_else(|| StoreError::not_found("feature", id))
}

/// Validate and apply a task status change. `patch.status` is ignored.
pub(crate) fn move_task(
    conn: &Connection,
    id: TaskId,
    to: Status,
    patch: TaskPatch,
    actor: Actor,
    reason: &str,
) -> StoreResult<Task> {
    let current = load_task(conn, id)?;
    validate_task_transition(current.status, to)?;
    let completed_at = match to {
        Status::Complete | Status::Failed => patch.completed_at.or_else(|| Some(Utc::now())),
        _ => patch.completed_at,
    };
    let task = tasks::update(
        conn,
        id,
        &TaskPatch {
            status: Some(to),
            completed_at,
            ..patch
        },
    )?;
    transitions::record(
        conn,
        &NewTransition::new(EntityType::Task, id, Some(current.status), to, actor).reason(reason),
    )?;
    Ok(task)
}

/// pending -> in_progress, counting the attempt.
pub(crate) fn start_task(conn: &Connection, id: TaskId) -> StoreResult<Task> {
    let current = load_task(conn, id)?;
    validate_task_transition(current.status, Status::InProgress)?;
    let task = tasks::mark_started(conn, id)?;
    transitions::record(
        conn,
        &NewTransition::new(
            EntityType::Task,
            id,
            Some(current.status),
            Status::InProgress,
            Actor::System,
        )
        .reason(format!("dispatched, attempt {}", task.attempts)),
    )?;
    Ok(task)
}

/// failed -> pending, clearing the failed attempt's error and timestamps.
pub(crate) fn requeue_task(conn: &Connection, id: TaskId, actor: Actor, reason: &str) -> StoreResult<Task> {
    let current = load_task(conn, id)?;
    validate_task_transition(current.status, Status::Pending)?;
    let task = tasks::reset_for_retry(conn, id)?;
    transitions::record(
        conn,
        &NewTransition::new(EntityType::Task, id, Some(current.status), Status::Pending, actor)
            .reason(reason),
    )?;
    Ok(task)
}

/// Returns `None` when the feature is already in `to`.
pub(crate) fn move_feature(
    conn: &Connection,
    id: &str,
    to: Status,
    actor: Actor,
    reason: &str,
) -> StoreResult<Option<Feature>> {
    let current = load_feature(conn, id)?;
    if current.status == to {
        return Ok(None);
    }
    validate_feature_transition(current.status, to)?;
    let feature = features::update_status(conn, id, to)?;
    transitions::record(
        conn,
        &NewTransition::new(EntityType::Feature, id, Some(current.status), to, actor)
            .reason(reason),
    )?;
    Ok(Some(feature))
}

pub(crate) fn task_created(conn: &Connection, task: &Task, actor: Actor, reason: &str) -> StoreResult<()> {
    transitions::record(
        conn,
        &NewTransition::new(EntityType::Task, task.id, None, task.status, actor).reason(reason),
    )?;
    Ok(())
}

pub(crate) fn feature_created(
    conn: &Connection,
    feature: &Feature,
    actor: Actor,
    reason: &str,
) -> StoreResult<()> {
    transitions::record(
        conn,
        &NewTransition::new(EntityType::Feature, &feature.id, None, feature.status, actor)
            .reason(reason),
    )?;
    Ok(())
}
