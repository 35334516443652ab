use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{context, record, Inner, RunningTask, SchedulerEvent, TickReport};
use crate::db::tasks::{self, TaskFilter, TaskPatch};
use crate::db::StoreResult;
use crate::exec::{ExecutionRequest, ExecutionStrategy, FailureKind};
use crate::protocol::ContextEntry;
use crate::state::schema::{Actor, Feature, FeatureId, Role, Status, Task, TaskId};

/// How many pending tasks one tick looks at.
const CANDIDATE_WINDOW: u32 = 100;

/// How long a cancelled strategy gets to wind down before its future is dropped.
const CANCEL_GRACE: Duration = Duration::from_secs(30);

const INTERRUPTED_ERROR: &str = "Task interrupted before it finished (scheduler restarted)";

impl Inner {
    pub(super) async fn tick(self: &Arc<Self>) -> StoreResult<TickReport> {
        let _guard = self.tick_lock.lock().await;
        let mut report = TickReport {
            timed_out: self.sweep_stuck(),
            ..Default::default()
        };
        if !self.reconciled.swap(true, Ordering::SeqCst) {
            match self.reclaim_interrupted() {
                Ok(ids) => report.interrupted = ids,
                Err(e) => {
                    self.reconciled.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
        if self.paused.load(Ordering::SeqCst) || self.shutdown.is_cancelled() {
            return Ok(report);
        }
        self.dispatch_pending(&mut report)?;
        if !report.dispatched.is_empty() || !report.timed_out.is_empty() || !report.interrupted.is_empty() {
            debug!(?report, "tick");
        }
        Ok(report)
    }

    /// Settle tasks a previous process left in progress. Their sessions are
    /// gone, so each one fails and goes back to pending while attempts remain.
    fn reclaim_interrupted(&self) -> StoreResult<Vec<TaskId>> {
        let stale: Vec<Task> = {
            let found = self.store.call(|conn| {
                tasks::find_all(
                    conn,
                    &TaskFilter {
                        status: Some(Status::InProgress),
                        ..Default::default()
                    },
                )
            })?;
            let running = self.running();
            found
                .into_iter()
                .filter(|t| !running.contains_key(&t.id))
                .collect()
        };

        let mut reclaimed = Vec::with_capacity(stale.len());
        for task in stale {
            match self.reclaim(&task) {
                Ok(()) => reclaimed.push(task.id),
                Err(e) => self.report_error(Some(task.id), &e),
            }
        }
        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "reclaimed interrupted tasks");
            self.audit(
                "interrupted_tasks_reclaimed",
                Some(json!({ "taskIds": reclaimed })),
            );
        }
        Ok(reclaimed)
    }

    fn reclaim(&self, task: &Task) -> StoreResult<()> {
        let failed = self.store.call(|conn| {
            record::move_task(
                conn,
                task.id,
                Status::Failed,
                TaskPatch {
                    error: Some(INTERRUPTED_ERROR.to_string()),
                    ..Default::default()
                },
                Actor::System,
                INTERRUPTED_ERROR,
            )
        })?;
        warn!(task_id = task.id, attempts = failed.attempts, "task was still in progress at startup");
        self.emit(SchedulerEvent::TaskFailed {
            task_id: task.id,
            feature_id: task.feature_id.clone(),
            role: task.role,
            error: INTERRUPTED_ERROR.to_string(),
        });

        if failed.attempts < self.config.max_task_attempts {
            self.store
                .call(|conn| record::requeue_task(conn, task.id, Actor::System, "requeued after restart"))?;
            self.emit(SchedulerEvent::TaskRetrying {
                task_id: task.id,
                feature_id: task.feature_id.clone(),
                attempt: failed.attempts + 1,
            });
            return Ok(());
        }

        let feature = self
            .store
            .call(|conn| record::load_feature(conn, &task.feature_id))?;
        if feature.status.is_terminal() {
            return Ok(());
        }
        self.fail_and_heal(&failed, &feature, INTERRUPTED_ERROR)
    }

    /// Fail every running task older than the task timeout and free its slot.
    /// Recovery runs off the tick so a slow reasoner cannot stall dispatch.
    fn sweep_stuck(self: &Arc<Self>) -> Vec<TaskId> {
        let timeout = self.config.task_timeout();
        let stuck: Vec<(TaskId, RunningTask)> = {
            let mut running = self.running();
            let ids: Vec<TaskId> = running
                .iter()
                .filter(|(_, r)| !r.finishing && r.started.elapsed() > timeout)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| running.remove(&id).map(|r| (id, r)))
                .collect()
        };

        let mut swept = Vec::with_capacity(stuck.len());
        for (task_id, entry) in stuck {
            entry.cancel.cancel();
            warn!(
                task_id,
                role = %entry.role,
                timeout_secs = timeout.as_secs(),
                "task ran past its timeout"
            );
            let error = format!("Task timed out after {}s", timeout.as_secs());
            let failed = self.store.call(|conn| {
                record::move_task(
                    conn,
                    task_id,
                    Status::Failed,
                    TaskPatch {
                        error: Some(error.clone()),
                        ..Default::default()
                    },
                    Actor::System,
                    &error,
                )
            });
            match failed {
                Ok(task) => {
                    self.emit(SchedulerEvent::TaskTimedOut {
                        task_id,
                        feature_id: task.feature_id.clone(),
                        role: task.role,
                    });
                    self.spawn_recovery(task, error, Some(FailureKind::Timeout));
                }
                Err(e) => self.report_error(Some(task_id), &e),
            }
            swept.push(task_id);
        }
        if !swept.is_empty() {
            self.idle.notify_waiters();
        }
        swept
    }

    fn spawn_recovery(self: &Arc<Self>, task: Task, error: String, failure: Option<FailureKind>) {
        self.recovering.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let task_id = task.id;
            if let Err(e) = inner.recover(task, error, failure).await {
                inner.report_error(Some(task_id), &e);
            }
            inner.recovering.fetch_sub(1, Ordering::SeqCst);
            inner.idle.notify_waiters();
            inner.wake.notify_one();
        });
    }

    /// Free global slots and free slots per role.
    fn free_capacity(&self) -> (usize, HashMap<Role, usize>) {
        let running = self.running();
        let global = self.config.max_concurrent_tasks.saturating_sub(running.len());
        let per_role = Role::ALL
            .iter()
            .map(|&role| {
                let busy = running.values().filter(|r| r.role == role).count();
                let cap = self
                    .config
                    .max_concurrent_by_role
                    .get(role)
                    .min(self.config.max_concurrent_tasks);
                (role, cap.saturating_sub(busy))
            })
            .collect();
        (global, per_role)
    }

    fn dispatch_pending(self: &Arc<Self>, report: &mut TickReport) -> StoreResult<()> {
        let (mut global_free, mut role_free) = self.free_capacity();
        if global_free == 0 {
            return Ok(());
        }

        let candidates = self
            .store
            .call(|conn| tasks::find_pending_oldest(conn, CANDIDATE_WINDOW))?;
        let mut features: HashMap<FeatureId, Option<Feature>> = HashMap::new();

        for task in candidates {
            let task_id = task.id;
            if !features.contains_key(&task.feature_id) {
                let loaded = self
                    .store
                    .call(|conn| crate::db::features::find_by_id(conn, &task.feature_id))?;
                features.insert(task.feature_id.clone(), loaded);
            }
            let Some(feature) = features.get(&task.feature_id).cloned().flatten() else {
                warn!(task_id, feature_id = %task.feature_id, "pending task has no feature");
                continue;
            };
            if feature.status.is_terminal() {
                debug!(task_id, feature_status = %feature.status, "skipping task of finished feature");
                continue;
            }

            if task.attempts >= self.config.max_task_attempts {
                match self.fail_exhausted(&task, &feature) {
                    Ok(()) => report.force_failed.push(task_id),
                    Err(e) => self.report_error(Some(task_id), &e),
                }
                // Feature status changed; reload on next use.
                features.remove(&task.feature_id);
                continue;
            }

            if global_free == 0 {
                break;
            }
            let free = role_free.entry(task.role).or_insert(0);
            if *free == 0 {
                continue;
            }

            let feature_id = task.feature_id.clone();
            match self.dispatch(task, &feature) {
                Ok(()) => {
                    global_free -= 1;
                    *free -= 1;
                    report.dispatched.push(task_id);
                    if feature.status == Status::Pending {
                        features.remove(&feature_id);
                    }
                }
                Err(e) => self.report_error(Some(task_id), &e),
            }
        }
        Ok(())
    }

    fn fail_exhausted(&self, task: &Task, feature: &Feature) -> StoreResult<()> {
        let error = format!(
            "Exceeded maximum attempts ({})",
            self.config.max_task_attempts
        );
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
        warn!(task_id = task.id, attempts = task.attempts, "task out of attempts, failing without dispatch");
        self.emit(SchedulerEvent::TaskFailed {
            task_id: task.id,
            feature_id: task.feature_id.clone(),
            role: task.role,
            error: error.clone(),
        });
        self.fail_and_heal(&failed, feature, &error)
    }

    /// Mark the task started, then hand it to its strategy on a new tokio task.
    fn dispatch(self: &Arc<Self>, task: Task, feature: &Feature) -> StoreResult<()> {
        let task = self.store.call(|conn| {
            let started = record::start_task(conn, task.id)?;
            if feature.status == Status::Pending {
                record::move_feature(
                    conn,
                    &feature.id,
                    Status::InProgress,
                    Actor::System,
                    "first task dispatched",
                )?;
            }
            Ok(started)
        })?;

        let context = match self
            .store
            .call(|conn| context::build_task_context(conn, &task, feature))
        {
            Ok(context) => context,
            Err(e) => {
                warn!(task_id = task.id, error = %e, "failed to load task context, dispatching with feature only");
                vec![ContextEntry::new("Feature", &feature.description)]
            }
        };

        let strategy = Arc::clone(self.strategies.for_role(task.role));
        let cancel = CancellationToken::new();
        let mut request = ExecutionRequest::new(task.id, task.role, &task.description);
        request.context = context;
        request.cancel = cancel.clone();

        info!(
            task_id = task.id,
            feature_id = %task.feature_id,
            role = %task.role,
            attempt = task.attempts,
            strategy = strategy.name(),
            "dispatching task"
        );
        self.emit(SchedulerEvent::TaskStarted {
            task_id: task.id,
            feature_id: task.feature_id.clone(),
            role: task.role,
            attempt: task.attempts,
        });

        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
        let task_id = task.id;
        let role = task.role;
        let inner = Arc::clone(self);
        // Insert under the lock so a fast finish cannot race the insert.
        let mut running = self.running();
        tokio::spawn(async move {
            inner.execute(task, strategy, request, slot).await;
        });
        running.insert(
            task_id,
            RunningTask {
                role,
                started: tokio::time::Instant::now(),
                cancel,
                slot,
                finishing: false,
            },
        );
        Ok(())
    }

    async fn execute(
        self: Arc<Self>,
        task: Task,
        strategy: Arc<dyn ExecutionStrategy>,
        request: ExecutionRequest,
        slot: u64,
    ) {
        let cancel = request.cancel.clone();
        let result = tokio::select! {
            result = strategy.execute(request) => result,
            _ = async {
                cancel.cancelled().await;
                tokio::time::sleep(CANCEL_GRACE).await;
            } => {
                warn!(task_id = task.id, "strategy ignored cancellation, dropping it");
                return;
            }
        };
        if !self.claim(task.id, slot) {
            debug!(task_id = task.id, "dropping result of a task the sweep already failed");
            return;
        }
        if let Err(e) = self.record_outcome(&task, result).await {
            self.report_error(Some(task.id), &e);
        }
        self.release(task.id, slot);
        self.idle.notify_waiters();
        self.wake.notify_one();
    }

    fn claim(&self, task_id: TaskId, slot: u64) -> bool {
        match self.running().get_mut(&task_id) {
            Some(entry) if entry.slot == slot && !entry.finishing => {
                entry.finishing = true;
                true
            }
            _ => false,
        }
    }

    fn release(&self, task_id: TaskId, slot: u64) {
        let mut running = self.running();
        if running.get(&task_id).is_some_and(|r| r.slot == slot) {
            running.remove(&task_id);
        }
    }
}
