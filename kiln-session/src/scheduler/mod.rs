//! Concurrency-bounded scheduler that drives features through the role
//! pipeline.
//!
//! Each tick sweeps tasks that ran past the timeout, then dispatches the
//! oldest pending tasks that fit under the global and per-role limits.
//! Dispatched tasks run on their own tokio task and report back through
//! `record_outcome`, which advances the feature or hands the failure to the
//! reasoner.

mod context;
mod dispatch;
mod outcome;
mod record;
#[cfg(test)]
mod tests;

pub use context::build_task_context;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{KilnConfig, ReasonerKind, SchedulerConfig};
use crate::db::audit::{self, NewAuditEntry};
use crate::db::features::NewFeature;
use crate::db::tasks::{self, NewTask};
use crate::db::{features, Store, StoreError, StoreResult};
use crate::exec::{
    CompletionRegistry, ExecutionStrategy, HeadlessStrategy, InteractiveStrategy, ProcessLauncher,
};
use crate::pipeline::Pipeline;
use crate::reasoning::{ModelReasoner, ReasoningPort, RuleBasedReasoner};
use crate::state::schema::{Actor, EntityType, Feature, FeatureId, Role, Status, Task, TaskId};

const EVENT_CAPACITY: usize = 256;

/// Progress notifications. Slow subscribers miss events rather than block
/// the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    TaskStarted {
        task_id: TaskId,
        feature_id: FeatureId,
        role: Role,
        attempt: u32,
    },
    TaskCompleted {
        task_id: TaskId,
        feature_id: FeatureId,
        role: Role,
        duration_ms: u64,
    },
    TaskFailed {
        task_id: TaskId,
        feature_id: FeatureId,
        role: Role,
        error: String,
    },
    TaskTimedOut {
        task_id: TaskId,
        feature_id: FeatureId,
        role: Role,
    },
    TaskRetrying {
        task_id: TaskId,
        feature_id: FeatureId,
        attempt: u32,
    },
    FeatureCompleted {
        feature_id: FeatureId,
    },
    FeatureFailed {
        feature_id: FeatureId,
        reason: String,
    },
    Error {
        task_id: Option<TaskId>,
        message: String,
    },
}

/// Which strategy runs which role.
#[derive(Clone)]
pub struct Strategies {
    pub headless: Arc<dyn ExecutionStrategy>,
    /// Developer tasks run as long-lived interactive sessions.
    pub interactive: Arc<dyn ExecutionStrategy>,
}

impl Strategies {
    pub fn for_role(&self, role: Role) -> &Arc<dyn ExecutionStrategy> {
        match role {
            Role::Developer => &self.interactive,
            Role::Architect | Role::Reviewer => &self.headless,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub timed_out: Vec<TaskId>,
    /// Tasks found in progress at startup with no live session behind them.
    pub interrupted: Vec<TaskId>,
    pub force_failed: Vec<TaskId>,
    pub dispatched: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub feature: Feature,
    /// The first pipeline task; `None` when the feature was created in a
    /// status other than pending.
    pub task: Option<Task>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    /// All in-flight tasks finished before the wait ran out.
    pub drained: bool,
    pub in_flight: usize,
}

struct RunningTask {
    role: Role,
    started: Instant,
    /// Fired by the sweep; the strategy terminates its process with grace.
    cancel: CancellationToken,
    /// Distinguishes dispatches of the same task id across retries.
    slot: u64,
    /// Set once the outcome is being recorded; the sweep leaves it alone.
    finishing: bool,
}

struct Inner {
    store: Store,
    config: SchedulerConfig,
    strategies: Strategies,
    reasoner: Arc<dyn ReasoningPort>,
    pipeline: Pipeline,
    running: Mutex<HashMap<TaskId, RunningTask>>,
    next_slot: AtomicU64,
    /// Sweep recoveries still running off the tick.
    recovering: AtomicUsize,
    /// Interrupted tasks from an earlier process have been settled.
    reconciled: AtomicBool,
    events: broadcast::Sender<SchedulerEvent>,
    paused: AtomicBool,
    wake: Notify,
    idle: Notify,
    tick_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

/// Cheap to clone; clones share the same running set.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.running_count())
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl Scheduler {
    pub fn new(
        store: Store,
        config: SchedulerConfig,
        strategies: Strategies,
        reasoner: Arc<dyn ReasoningPort>,
        pipeline: Pipeline,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                strategies,
                reasoner,
                pipeline,
                running: Mutex::new(HashMap::new()),
                next_slot: AtomicU64::new(1),
                recovering: AtomicUsize::new(0),
                reconciled: AtomicBool::new(false),
                events,
                paused: AtomicBool::new(false),
                wake: Notify::new(),
                idle: Notify::new(),
                tick_lock: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Wire the process-backed strategies and the configured reasoner.
    pub fn from_config(
        store: Store,
        config: &KilnConfig,
        launcher: Arc<dyn ProcessLauncher>,
        completions: CompletionRegistry,
    ) -> Self {
        let headless = Arc::new(HeadlessStrategy::new(config.headless.clone(), launcher.clone()));
        let interactive = Arc::new(InteractiveStrategy::new(
            config.interactive.clone(),
            launcher,
            completions,
        ));
        let reasoner: Arc<dyn ReasoningPort> = match config.scheduler.reasoner {
            ReasonerKind::Rules => Arc::new(RuleBasedReasoner),
            ReasonerKind::Model => Arc::new(ModelReasoner::new(headless.clone())),
        };
        Self::new(
            store,
            config.scheduler.clone(),
            Strategies {
                headless,
                interactive,
            },
            reasoner,
            Pipeline::from_config(&config.pipeline),
        )
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// Create a feature and, when it starts pending, its first pipeline task.
    pub fn submit_feature(&self, new: NewFeature) -> StoreResult<Submission> {
        let first = self.inner.pipeline.first();
        let submission = self.inner.store.call(|conn| {
            let feature = features::create(conn, &new)?;
            record::feature_created(conn, &feature, Actor::User, "submitted")?;
            let task = if feature.status == Status::Pending {
                let task = tasks::create(
                    conn,
                    &NewTask::new(&feature.id, first, outcome::task_description(first, &feature)),
                )?;
                record::task_created(conn, &task, Actor::System, "pipeline start")?;
                Some(task)
            } else {
                None
            };
            audit::record(
                conn,
                &NewAuditEntry {
                    entity_type: Some(EntityType::Feature),
                    entity_id: Some(feature.id.clone()),
                    actor: Some(Actor::User),
                    details: Some(json!({ "priority": feature.priority })),
                    ..NewAuditEntry::action("feature_submitted")
                },
            )?;
            Ok(Submission { feature, task })
        })?;
        info!(
            feature_id = %submission.feature.id,
            first_task = ?submission.task.as_ref().map(|t| t.id),
            "feature submitted"
        );
        self.trigger();
        Ok(submission)
    }

    /// Run one scheduling pass. Concurrent calls are serialized.
    pub async fn tick(&self) -> StoreResult<TickReport> {
        self.inner.tick().await
    }

    /// Tick on the check interval and whenever `trigger` is called, until
    /// `cancel` fires or `stop` is called.
    pub async fn run(&self, cancel: CancellationToken) {
        let interval_dur = self.inner.config.check_interval();
        self.inner.audit("scheduler_started", Some(json!({
            "checkIntervalMs": interval_dur.as_millis() as u64,
            "maxConcurrentTasks": self.inner.config.max_concurrent_tasks,
        })));
        info!(interval_ms = interval_dur.as_millis() as u64, "scheduler started");

        let mut interval = tokio::time::interval(interval_dur);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.inner.shutdown.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.inner.wake.notified() => {
                    debug!("scheduler woken early");
                }
            }
            if let Err(e) = self.tick().await {
                self.inner.report_error(None, &e);
            }
        }
        info!("scheduler loop exited");
    }

    /// Ask the run loop for an immediate tick.
    pub fn trigger(&self) {
        self.inner.wake.notify_one();
    }

    /// Stop dispatching. Running tasks continue and the sweep still runs.
    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            info!("scheduler paused");
            self.inner.audit("scheduler_paused", None);
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            info!("scheduler resumed");
            self.inner.audit("scheduler_resumed", None);
            self.trigger();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// End the run loop and wait up to `max_wait` for in-flight tasks.
    pub async fn stop(&self, max_wait: Duration) -> StopReport {
        self.inner.shutdown.cancel();
        let in_flight = self.running_count();
        info!(in_flight, "stopping scheduler");

        let drained = tokio::time::timeout(max_wait, self.wait_idle()).await.is_ok();
        let remaining = self.running_count();
        if !drained {
            warn!(
                in_flight = remaining,
                waited_ms = max_wait.as_millis() as u64,
                "forced stop with tasks still running"
            );
        }
        self.inner.audit(
            "scheduler_stopped",
            Some(json!({ "drained": drained, "inFlight": remaining })),
        );
        StopReport {
            drained,
            in_flight: remaining,
        }
    }

    pub fn running_count(&self) -> usize {
        self.inner.running().len()
    }

    pub fn running_tasks(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.inner.running().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Nothing is running and no timed-out task is still being recovered.
    pub fn is_idle(&self) -> bool {
        self.inner.running().is_empty() && self.inner.recovering.load(Ordering::SeqCst) == 0
    }

    /// Resolve once `is_idle` holds.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl Inner {
    fn running(&self) -> MutexGuard<'_, HashMap<TaskId, RunningTask>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn report_error(&self, task_id: Option<TaskId>, e: &StoreError) {
        error!(task_id = ?task_id, error = %e, "scheduler error");
        self.emit(SchedulerEvent::Error {
            task_id,
            message: e.to_string(),
        });
    }

    fn audit(&self, action: &str, details: Option<Value>) {
        let entry = NewAuditEntry {
            actor: Some(Actor::System),
            details,
            ..NewAuditEntry::action(action)
        };
        if let Err(e) = self.store.call(|conn| audit::record(conn, &entry)) {
            warn!(action, error = %e, "failed to write audit entry");
        }
    }
}
