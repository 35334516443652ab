use std::fmt::Write;

use rusqlite::Connection;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use super::{record, Inner, SchedulerEvent};
use crate::db::audit::{self, NewAuditEntry};
use crate::db::contexts::{self, NewContext};
use crate::db::features::{self, NewFeature};
use crate::db::tasks::{self, NewTask, TaskPatch};
use crate::db::{artifacts, StoreResult};
use crate::exec::{ExecutionResult, FailureKind};
use crate::pipeline::Step;
use crate::protocol::ArchitectOutput;
use crate::reasoning::{FailureAdvice, FailureContext};
use crate::state::schema::{
    Actor, ContextType, EntityType, Feature, Priority, Role, Status, Task, KIND_KEY,
    SELF_HEALING_KIND,
};

/// A feature completes only once it has run the full pipeline.
const MIN_TASKS_FOR_COMPLETION: usize = 3;

const SELF_HEALING_AUTHOR: &str = "self-healing";

/// Description of the task that starts `role`'s stage for a feature.
pub(super) fn task_description(role: Role, feature: &Feature) -> String {
    match role {
        Role::Architect => format!("Design the architecture for: {}", feature.description),
        Role::Developer => format!("Implement: {}", feature.description),
        Role::Reviewer => format!("Review the implementation of: {}", feature.description),
    }
}

fn story_description(title: &str, description: &str, criteria: &[String]) -> String {
    let mut out = title.to_string();
    if !description.is_empty() {
        let _ = write!(out, "\n\n{}", description);
    }
    if !criteria.is_empty() {
        out.push_str("\n\nAcceptance criteria:");
        for criterion in criteria {
            let _ = write!(out, "\n- {}", criterion);
        }
    }
    out
}

fn rework_description(feature: &Feature, review: &Value) -> String {
    let mut out = format!("Address review feedback for: {}", feature.description);
    let issues: Vec<&str> = review
        .get("issues")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if !issues.is_empty() {
        out.push_str("\n\nIssues:");
        for issue in issues {
            let _ = write!(out, "\n- {}", issue);
        }
    }
    out
}

/// Persist an architect's discoveries, decisions and user stories, and
/// create one developer task per story (or a single one when there are none).
fn fan_out_architect(
    conn: &Connection,
    task: &Task,
    feature: &Feature,
    output: &Value,
) -> StoreResult<Vec<Task>> {
    let design: ArchitectOutput = match serde_json::from_value(output.clone()) {
        Ok(design) => design,
        Err(e) => {
            warn!(task_id = task.id, error = %e, "architect output did not match the schema, using a single developer task");
            ArchitectOutput::default()
        }
    };

    for d in &design.discoveries {
        artifacts::insert_discovery(conn, &feature.id, task.id, &d.title, &d.detail)?;
    }
    for d in &design.decisions {
        artifacts::insert_decision(conn, &feature.id, task.id, &d.title, &d.rationale)?;
    }

    let mut created = Vec::new();
    if design.user_stories.is_empty() {
        let dev = tasks::create(
            conn,
            &NewTask::new(&feature.id, Role::Developer, task_description(Role::Developer, feature)),
        )?;
        record::task_created(conn, &dev, Actor::System, "architect finished")?;
        created.push(dev);
        return Ok(created);
    }

    for story in &design.user_stories {
        let stored = artifacts::insert_user_story(
            conn,
            &feature.id,
            task.id,
            &story.title,
            &story.description,
            &story.acceptance_criteria,
        )?;
        let mut new = NewTask::new(
            &feature.id,
            Role::Developer,
            story_description(&story.title, &story.description, &story.acceptance_criteria),
        );
        new.user_story_id = Some(stored.id);
        let dev = tasks::create(conn, &new)?;
        record::task_created(conn, &dev, Actor::System, "user story")?;
        created.push(dev);
    }
    Ok(created)
}

/// The shared feature that collects self-healing tasks, created on first use.
fn self_healing_feature(conn: &Connection) -> StoreResult<Feature> {
    if let Some(existing) = features::find_by_kind(conn, SELF_HEALING_KIND)? {
        return Ok(existing);
    }
    let mut metadata = Map::new();
    metadata.insert(KIND_KEY.to_string(), Value::from(SELF_HEALING_KIND));
    let feature = features::create(
        conn,
        &NewFeature {
            description: "Self-healing: unblock failed features".to_string(),
            priority: Priority::High,
            status: None,
            metadata,
        },
    )?;
    record::feature_created(conn, &feature, Actor::System, "first self-healing task")?;
    Ok(feature)
}

impl Inner {
    pub(super) async fn record_outcome(&self, task: &Task, result: ExecutionResult) -> StoreResult<()> {
        if result.success {
            self.on_success(task, result)
        } else {
            self.on_failure(task, result).await
        }
    }

    fn on_success(&self, task: &Task, result: ExecutionResult) -> StoreResult<()> {
        let output = result.output.unwrap_or(Value::Null);
        let (feature, created) = self.store.call(|conn| {
            record::move_task(
                conn,
                task.id,
                Status::Complete,
                TaskPatch {
                    output: Some(output.clone()),
                    ..Default::default()
                },
                Actor::Ai,
                "execution succeeded",
            )?;
            let feature = record::load_feature(conn, &task.feature_id)?;
            let created = if task.role == Role::Architect {
                fan_out_architect(conn, task, &feature, &output)?
            } else {
                Vec::new()
            };
            contexts::create(
                conn,
                &NewContext {
                    feature_id: feature.id.clone(),
                    context_type: task.role.context_type(),
                    content: serde_json::to_string_pretty(&output)?,
                    author: Some(task.role.to_string()),
                },
            )?;
            Ok((feature, created))
        })?;

        info!(
            task_id = task.id,
            role = %task.role,
            duration_ms = result.duration.as_millis() as u64,
            "task complete"
        );
        self.emit(SchedulerEvent::TaskCompleted {
            task_id: task.id,
            feature_id: task.feature_id.clone(),
            role: task.role,
            duration_ms: result.duration.as_millis() as u64,
        });
        if !created.is_empty() {
            info!(
                feature_id = %feature.id,
                tasks = created.len(),
                "created developer tasks from architect output"
            );
        }
        self.advance(task, &feature, &output)
    }

    /// Complete the feature, or create the next stage's task.
    fn advance(&self, task: &Task, feature: &Feature, output: &Value) -> StoreResult<()> {
        if feature.is_self_healing() || feature.status.is_terminal() {
            return Ok(());
        }
        let all = self.store.call(|conn| tasks::list_by_feature(conn, &feature.id))?;
        let rework_rounds = all
            .iter()
            .filter(|t| t.role == Role::Reviewer && t.status == Status::Complete)
            .count()
            .saturating_sub(1) as u32;
        let step = self.pipeline.next(task.role, output, rework_rounds);

        if let Some(Step { role, rework: true }) = step {
            let rework = self.store.call(|conn| {
                let t = tasks::create(
                    conn,
                    &NewTask::new(&feature.id, role, rework_description(feature, output)),
                )?;
                record::task_created(conn, &t, Actor::System, "review requested changes")?;
                Ok(t)
            })?;
            info!(task_id = rework.id, feature_id = %feature.id, round = rework_rounds + 1, "review rejected, created rework task");
            return Ok(());
        }

        let Some(Step { role: next, .. }) = step else {
            // End of the pipeline.
            if all.len() >= MIN_TASKS_FOR_COMPLETION
                && all.iter().all(|t| t.status == Status::Complete)
            {
                let changed = self.store.call(|conn| {
                    record::move_feature(conn, &feature.id, Status::Complete, Actor::System, "all tasks complete")
                })?;
                if changed.is_some() {
                    info!(feature_id = %feature.id, tasks = all.len(), "feature complete");
                    self.emit(SchedulerEvent::FeatureCompleted {
                        feature_id: feature.id.clone(),
                    });
                }
            }
            return Ok(());
        };
        // Developer tasks fanned out from one design all feed a single review.
        if all
            .iter()
            .any(|t| t.role == task.role && t.id != task.id && t.status.is_active())
        {
            debug!(task_id = task.id, role = %task.role, "waiting for sibling tasks before advancing");
            return Ok(());
        }
        let created = self.store.call(|conn| {
            if tasks::exists_active(conn, &feature.id, next)? {
                return Ok(None);
            }
            let t = tasks::create(
                conn,
                &NewTask::new(&feature.id, next, task_description(next, feature)),
            )?;
            record::task_created(conn, &t, Actor::System, "pipeline advance")?;
            Ok(Some(t))
        })?;
        if let Some(t) = created {
            info!(task_id = t.id, feature_id = %feature.id, role = %next, "created next pipeline task");
        }
        Ok(())
    }

    async fn on_failure(&self, task: &Task, result: ExecutionResult) -> StoreResult<()> {
        let error = result.error_message().to_string();
        let failed = self.store.call(|conn| {
            record::move_task(
                conn,
                task.id,
                Status::Failed,
                TaskPatch {
                    error: Some(error.clone()),
                    ..Default::default()
                },
                Actor::System,
                &error,
            )
        })?;
        warn!(
            task_id = task.id,
            role = %task.role,
            attempts = failed.attempts,
            error = %error,
            "task failed"
        );
        self.emit(SchedulerEvent::TaskFailed {
            task_id: task.id,
            feature_id: task.feature_id.clone(),
            role: task.role,
            error: error.clone(),
        });
        self.recover(failed, error, result.failure).await
    }

    /// Retry on the reasoner's advice while attempts remain, otherwise fail
    /// the feature and queue a self-healing task.
    pub(super) async fn recover(
        &self,
        task: Task,
        error: String,
        failure: Option<FailureKind>,
    ) -> StoreResult<()> {
        let feature = self.store.call(|conn| record::load_feature(conn, &task.feature_id))?;
        if feature.status.is_terminal() {
            debug!(task_id = task.id, feature_status = %feature.status, "feature already finished, not recovering");
            return Ok(());
        }

        let max_attempts = self.config.max_task_attempts;
        if self.config.self_healing_enabled && task.attempts < max_attempts {
            let failure_ctx = FailureContext {
                task: task.clone(),
                feature_description: feature.description.clone(),
                error: error.clone(),
                failure,
                max_attempts,
            };
            match self.reasoner.analyze_failure(&failure_ctx).await {
                Ok(advice) if advice.retry => return self.retry(&task, &advice),
                Ok(_) => info!(task_id = task.id, "failure analysis advised against retrying"),
                Err(e) => {
                    error!(task_id = task.id, error = %e, "self-healing analysis failed");
                    self.store.call(|conn| {
                        audit::record(
                            conn,
                            &NewAuditEntry {
                                entity_type: Some(EntityType::Task),
                                entity_id: Some(task.id.to_string()),
                                actor: Some(Actor::System),
                                details: Some(json!({ "error": e.to_string() })),
                                ..NewAuditEntry::action("self_healing_failed")
                            },
                        )
                    })?;
                    return self.fail_feature(&feature, &format!("task {} failed: {}", task.id, error));
                }
            }
        }
        self.fail_and_heal(&task, &feature, &error)
    }

    fn retry(&self, task: &Task, advice: &FailureAdvice) -> StoreResult<()> {
        self.store.call(|conn| {
            record::requeue_task(conn, task.id, Actor::Ai, "retry advised by failure analysis")?;
            let guidance = advice
                .additional_context
                .iter()
                .cloned()
                .chain(
                    advice
                        .modified_prompt
                        .iter()
                        .map(|p| format!("Revised instructions:\n{}", p)),
                );
            for content in guidance {
                contexts::create(
                    conn,
                    &NewContext {
                        feature_id: task.feature_id.clone(),
                        context_type: ContextType::Guidance,
                        content,
                        author: Some(SELF_HEALING_AUTHOR.to_string()),
                    },
                )?;
            }
            audit::record(
                conn,
                &NewAuditEntry {
                    entity_type: Some(EntityType::Task),
                    entity_id: Some(task.id.to_string()),
                    actor: Some(Actor::Ai),
                    details: Some(json!({ "attempts": task.attempts })),
                    ..NewAuditEntry::action("self_healing_retry")
                },
            )?;
            Ok(())
        })?;
        info!(task_id = task.id, next_attempt = task.attempts + 1, "task queued for retry");
        self.emit(SchedulerEvent::TaskRetrying {
            task_id: task.id,
            feature_id: task.feature_id.clone(),
            attempt: task.attempts + 1,
        });
        Ok(())
    }

    fn fail_feature(&self, feature: &Feature, reason: &str) -> StoreResult<()> {
        let changed = self.store.call(|conn| {
            record::move_feature(conn, &feature.id, Status::Failed, Actor::System, reason)
        })?;
        if changed.is_some() {
            warn!(feature_id = %feature.id, reason, "feature failed");
            self.emit(SchedulerEvent::FeatureFailed {
                feature_id: feature.id.clone(),
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    /// Fail the feature and queue a developer task in the self-healing
    /// feature. Failures inside the self-healing feature stop here.
    pub(super) fn fail_and_heal(&self, task: &Task, feature: &Feature, error: &str) -> StoreResult<()> {
        if feature.is_self_healing() {
            warn!(task_id = task.id, "self-healing task failed, not escalating");
            return Ok(());
        }
        self.fail_feature(feature, &format!("task {} ({}) failed: {}", task.id, task.role, error))?;

        let healing = self.store.call(|conn| {
            let bucket = self_healing_feature(conn)?;
            let description = format!(
                "Unblock feature \"{}\" ({}): {} task {} failed after {} attempt(s): {}",
                feature.description, feature.id, task.role, task.id, task.attempts, error
            );
            let t = tasks::create(conn, &NewTask::new(&bucket.id, Role::Developer, description))?;
            record::task_created(conn, &t, Actor::System, "self-healing")?;
            audit::record(
                conn,
                &NewAuditEntry {
                    entity_type: Some(EntityType::Feature),
                    entity_id: Some(feature.id.clone()),
                    actor: Some(Actor::System),
                    details: Some(json!({ "failedTaskId": task.id, "healingTaskId": t.id })),
                    ..NewAuditEntry::action("self_healing_task_created")
                },
            )?;
            Ok(t)
        })?;
        info!(task_id = healing.id, feature_id = %feature.id, "queued self-healing task");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feature(description: &str) -> Feature {
        let now = chrono::Utc::now();
        Feature {
            id: "f1".to_string(),
            description: description.to_string(),
            status: Status::Pending,
            priority: Priority::Normal,
            created_at: now,
            updated_at: now,
            completed_at: None,
            metadata: Map::new(),
        }
    }

    #[test]
    fn test_task_descriptions() {
        let f = feature("Add login");
        assert_eq!(task_description(Role::Architect, &f), "Design the architecture for: Add login");
        assert_eq!(task_description(Role::Developer, &f), "Implement: Add login");
        assert_eq!(task_description(Role::Reviewer, &f), "Review the implementation of: Add login");
    }

    #[test]
    fn test_rework_description_lists_issues() {
        let f = feature("Add login");
        let desc = rework_description(&f, &json!({"approved": false, "issues": ["no tests", 3]}));
        assert_eq!(desc, "Address review feedback for: Add login\n\nIssues:\n- no tests");
    }

    #[test]
    fn test_story_description() {
        let desc = story_description("Login form", "Email and password", &["validates email".to_string()]);
        assert_eq!(desc, "Login form\n\nEmail and password\n\nAcceptance criteria:\n- validates email");
        assert_eq!(story_description("Bare", "", &[]), "Bare");
    }
}
