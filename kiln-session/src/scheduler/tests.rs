use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::config::{PipelineConfig, RoleLimits};
use crate::db::features::NewFeature;
use crate::db::{artifacts, audit, contexts, features, tasks};
use crate::deadlock::{Deadlock, DeadlockDecision, WorkItem};
use crate::exec::{ExecutionRequest, ExecutionResult, FailureKind};
use crate::reasoning::{FailureAdvice, FailureContext, ReasoningError, RuleBasedReasoner};
use crate::state::schema::{ContextType, SELF_HEALING_KIND};

enum Reply {
    Done(ExecutionResult),
    After(Duration, ExecutionResult),
    Hang,
}

type Handler = dyn Fn(&ExecutionRequest, u32) -> Reply + Send + Sync;

/// Strategy that answers from a closure. The closure gets the request and
/// the 1-based call count for that task.
struct FakeStrategy {
    handler: Box<Handler>,
    calls: Mutex<Vec<ExecutionRequest>>,
    /// Hanging calls that ended through their cancel token.
    cancelled: AtomicUsize,
}

impl FakeStrategy {
    fn new(handler: impl Fn(&ExecutionRequest, u32) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            cancelled: AtomicUsize::new(0),
        })
    }

    /// Every role succeeds with a well-formed output.
    fn succeeding() -> Arc<Self> {
        Self::new(|req, _| ok(role_output(req.role)))
    }

    fn calls(&self) -> Vec<ExecutionRequest> {
        self.calls.lock().unwrap().clone()
    }

    fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionStrategy for FakeStrategy {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.clone());
            calls.iter().filter(|r| r.task_id == request.task_id).count() as u32
        };
        match (self.handler)(&request, n) {
            Reply::Done(result) => result,
            Reply::After(delay, result) => {
                tokio::time::sleep(delay).await;
                result
            }
            Reply::Hang => {
                request.cancel.cancelled().await;
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                ExecutionResult::failed(FailureKind::Cancelled, "session cancelled", Duration::ZERO, 1)
            }
        }
    }
}

struct BrokenReasoner;

/// Takes a minute to answer, then advises a retry.
struct SlowReasoner;

#[async_trait]
impl ReasoningPort for SlowReasoner {
    async fn analyze_failure(&self, ctx: &FailureContext) -> Result<FailureAdvice, ReasoningError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        RuleBasedReasoner.analyze_failure(ctx).await
    }

    async fn resolve_deadlock(&self, d: &Deadlock, items: &[WorkItem]) -> Result<DeadlockDecision, ReasoningError> {
        RuleBasedReasoner.resolve_deadlock(d, items).await
    }
}

#[async_trait]
impl ReasoningPort for BrokenReasoner {
    async fn analyze_failure(&self, _: &FailureContext) -> Result<FailureAdvice, ReasoningError> {
        Err(ReasoningError::Execution("model unavailable".to_string()))
    }

    async fn resolve_deadlock(&self, _: &Deadlock, _: &[WorkItem]) -> Result<DeadlockDecision, ReasoningError> {
        Err(ReasoningError::Execution("model unavailable".to_string()))
    }
}

fn ok(output: Value) -> Reply {
    Reply::Done(ExecutionResult::succeeded(output, Duration::from_millis(10), 1))
}

fn fail(message: &str) -> Reply {
    Reply::Done(ExecutionResult::failed(
        FailureKind::Exit,
        message,
        Duration::from_millis(10),
        1,
    ))
}

fn role_output(role: Role) -> Value {
    match role {
        Role::Architect => json!({
            "design": "Session cookie login",
            "discoveries": [{"title": "Existing users table", "detail": "has email column"}],
            "decisions": [{"title": "bcrypt", "rationale": "already vendored"}],
            "userStories": [{
                "title": "Login form",
                "description": "Email and password form",
                "acceptanceCriteria": ["rejects bad password"]
            }]
        }),
        Role::Developer => json!({
            "filesCreated": ["src/login.rs"],
            "filesModified": [],
            "testsAdded": ["login_rejects_bad_password"],
            "implementation": "added login handler"
        }),
        Role::Reviewer => json!({"approved": true, "issues": [], "suggestions": [], "summary": "ok"}),
    }
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_tasks: 3,
        max_concurrent_by_role: RoleLimits {
            architect: 1,
            developer: 1,
            reviewer: 1,
        },
        task_timeout_ms: 60_000,
        max_task_attempts: 3,
        self_healing_enabled: true,
        ..Default::default()
    }
}

fn scheduler_with(
    config: SchedulerConfig,
    strategy: Arc<FakeStrategy>,
    reasoner: Arc<dyn ReasoningPort>,
    pipeline: Pipeline,
) -> Scheduler {
    Scheduler::new(
        Store::in_memory(),
        config,
        Strategies {
            headless: strategy.clone(),
            interactive: strategy,
        },
        reasoner,
        pipeline,
    )
}

fn scheduler(config: SchedulerConfig, strategy: Arc<FakeStrategy>) -> Scheduler {
    scheduler_with(config, strategy, Arc::new(RuleBasedReasoner), Pipeline::forward())
}

fn submit(s: &Scheduler, description: &str) -> Submission {
    s.submit_feature(NewFeature {
        description: description.to_string(),
        ..Default::default()
    })
    .unwrap()
}

/// Tick and let every dispatched task finish, until nothing is left to do.
async fn drive(s: &Scheduler) {
    for _ in 0..20 {
        let report = s.tick().await.unwrap();
        s.wait_idle().await;
        if report.dispatched.is_empty() && report.force_failed.is_empty() {
            return;
        }
    }
    panic!("scheduler did not settle");
}

fn feature_tasks(s: &Scheduler, feature_id: &str) -> Vec<Task> {
    s.store()
        .call(|conn| tasks::list_by_feature(conn, feature_id))
        .unwrap()
}

fn load_feature(s: &Scheduler, feature_id: &str) -> Feature {
    s.store()
        .call(|conn| features::find_by_id(conn, feature_id))
        .unwrap()
        .unwrap()
}

fn drain(rx: &mut broadcast::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_submit_creates_single_architect_task() {
    let s = scheduler(config(), FakeStrategy::succeeding());

    let submission = submit(&s, "Add login");

    let task = submission.task.expect("first task");
    assert_eq!(task.role, Role::Architect);
    assert_eq!(task.status, Status::Pending);
    assert_eq!(feature_tasks(&s, &submission.feature.id).len(), 1);
    assert_eq!(submission.feature.status, Status::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_submit_non_pending_feature_creates_no_task() {
    let s = scheduler(config(), FakeStrategy::succeeding());

    let submission = s
        .submit_feature(NewFeature {
            description: "Imported".to_string(),
            status: Some(Status::InProgress),
            ..Default::default()
        })
        .unwrap();

    assert!(submission.task.is_none());
    assert!(feature_tasks(&s, &submission.feature.id).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_architect_output_fans_out_to_story_tasks() {
    let s = scheduler(config(), FakeStrategy::succeeding());
    let submission = submit(&s, "Add login");

    let report = s.tick().await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    s.wait_idle().await;

    let all = feature_tasks(&s, &submission.feature.id);
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].status, Status::Complete);
    let developer = &all[1];
    assert_eq!(developer.role, Role::Developer);
    assert_eq!(developer.status, Status::Pending);
    assert!(developer.user_story_id.is_some());
    assert!(developer.description.starts_with("Login form"));

    let fid = submission.feature.id.clone();
    let (stories, discoveries, decisions, ctx) = s
        .store()
        .call(|conn| {
            Ok((
                artifacts::list_user_stories(conn, &fid)?,
                artifacts::list_discoveries(conn, &fid)?,
                artifacts::list_decisions(conn, &fid)?,
                contexts::list_by_feature(conn, &fid)?,
            ))
        })
        .unwrap();
    assert_eq!(stories.len(), 1);
    assert_eq!(discoveries.len(), 1);
    assert_eq!(decisions.len(), 1);
    assert_eq!(ctx.len(), 1);
    assert_eq!(ctx[0].context_type, ContextType::Architecture);
    assert_eq!(load_feature(&s, &fid).status, Status::InProgress);
}

#[tokio::test(start_paused = true)]
async fn test_architect_without_stories_creates_one_developer_task() {
    let strategy = FakeStrategy::new(|req, _| match req.role {
        Role::Architect => ok(json!({"design": "small change"})),
        role => ok(role_output(role)),
    });
    let s = scheduler(config(), strategy);
    let submission = submit(&s, "Fix typo");

    s.tick().await.unwrap();
    s.wait_idle().await;

    let all = feature_tasks(&s, &submission.feature.id);
    assert_eq!(all.len(), 2);
    assert_eq!(all[1].role, Role::Developer);
    assert_eq!(all[1].description, "Implement: Fix typo");
    assert!(all[1].user_story_id.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_full_pipeline_completes_feature() {
    let strategy = FakeStrategy::succeeding();
    let s = scheduler(config(), strategy.clone());
    let mut events = s.subscribe();
    let submission = submit(&s, "Add login");

    drive(&s).await;

    let fid = submission.feature.id.clone();
    let all = feature_tasks(&s, &fid);
    let roles: Vec<Role> = all.iter().map(|t| t.role).collect();
    assert_eq!(roles, vec![Role::Architect, Role::Developer, Role::Reviewer]);
    assert!(all.iter().all(|t| t.status == Status::Complete));

    let feature = load_feature(&s, &fid);
    assert_eq!(feature.status, Status::Complete);
    assert!(feature.completed_at.is_some());

    let ctx = s.store().call(|conn| contexts::list_by_feature(conn, &fid)).unwrap();
    assert_eq!(ctx.len(), 3);

    // The reviewer sees the developer's report and the architect's decisions.
    let review_request = strategy
        .calls()
        .into_iter()
        .find(|r| r.role == Role::Reviewer)
        .unwrap();
    let labels: Vec<String> = review_request.context.iter().map(|c| c.label.clone()).collect();
    assert!(labels.contains(&"implementation (developer)".to_string()));
    assert!(labels.contains(&"Architecture Decisions".to_string()));

    let events = drain(&mut events);
    assert!(events.contains(&SchedulerEvent::FeatureCompleted { feature_id: fid }));
    let started = events
        .iter()
        .filter(|e| matches!(e, SchedulerEvent::TaskStarted { .. }))
        .count();
    assert_eq!(started, 3);
}

#[tokio::test(start_paused = true)]
async fn test_feature_with_fewer_than_three_tasks_stays_open() {
    let s = scheduler(config(), FakeStrategy::succeeding());
    let feature = s
        .store()
        .call(|conn| {
            let f = features::create(conn, &NewFeature {
                description: "Tiny".to_string(),
                ..Default::default()
            })?;
            tasks::create(conn, &NewTask::new(&f.id, Role::Reviewer, "review only"))?;
            Ok(f)
        })
        .unwrap();

    drive(&s).await;

    let all = feature_tasks(&s, &feature.id);
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, Status::Complete);
    assert_eq!(load_feature(&s, &feature.id).status, Status::InProgress);
}

#[tokio::test(start_paused = true)]
async fn test_developer_capacity_is_respected() {
    let s = scheduler(config(), FakeStrategy::new(|_, _| Reply::Hang));
    let feature = s
        .store()
        .call(|conn| {
            let f = features::create(conn, &NewFeature::default())?;
            for i in 0..3 {
                tasks::create(conn, &NewTask::new(&f.id, Role::Developer, format!("story {}", i)))?;
            }
            Ok(f)
        })
        .unwrap();

    let first = s.tick().await.unwrap();
    let second = s.tick().await.unwrap();
    tokio::task::yield_now().await;

    assert_eq!(first.dispatched.len(), 1);
    assert!(second.dispatched.is_empty());
    assert_eq!(s.running_count(), 1);
    let in_progress = feature_tasks(&s, &feature.id)
        .into_iter()
        .filter(|t| t.status == Status::InProgress)
        .count();
    assert_eq!(in_progress, 1);
}

#[tokio::test(start_paused = true)]
async fn test_global_capacity_caps_dispatch() {
    let mut cfg = config();
    cfg.max_concurrent_tasks = 1;
    cfg.max_concurrent_by_role.developer = 2;
    let s = scheduler(cfg, FakeStrategy::new(|_, _| Reply::Hang));
    s.store()
        .call(|conn| {
            let f = features::create(conn, &NewFeature::default())?;
            tasks::create(conn, &NewTask::new(&f.id, Role::Developer, "a"))?;
            tasks::create(conn, &NewTask::new(&f.id, Role::Developer, "b"))?;
            Ok(())
        })
        .unwrap();

    let report = s.tick().await.unwrap();

    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(s.running_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_oldest_pending_task_dispatched_first() {
    let s = scheduler(config(), FakeStrategy::new(|_, _| Reply::Hang));
    let first = submit(&s, "first");
    let _second = submit(&s, "second");

    let report = s.tick().await.unwrap();

    // Architect capacity is one.
    assert_eq!(report.dispatched, vec![first.task.unwrap().id]);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_task_is_swept() {
    let mut cfg = config();
    cfg.task_timeout_ms = 1_000;
    cfg.self_healing_enabled = false;
    let s = scheduler(cfg, FakeStrategy::new(|_, _| Reply::Hang));
    let mut events = s.subscribe();
    let submission = submit(&s, "Slow feature");
    let task_id = submission.task.unwrap().id;

    s.tick().await.unwrap();
    assert_eq!(s.running_tasks(), vec![task_id]);

    tokio::time::advance(Duration::from_secs(2)).await;
    let report = s.tick().await.unwrap();

    assert_eq!(report.timed_out, vec![task_id]);
    assert!(!s.running_tasks().contains(&task_id));
    s.wait_idle().await;
    let task = s
        .store()
        .call(|conn| tasks::find_by_id(conn, task_id))
        .unwrap()
        .unwrap();
    assert_eq!(task.status, Status::Failed);
    assert_eq!(task.error.as_deref(), Some("Task timed out after 1s"));
    assert_eq!(load_feature(&s, &submission.feature.id).status, Status::Failed);

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        SchedulerEvent::TaskTimedOut { task_id: id, .. } if *id == task_id
    )));
}

#[tokio::test(start_paused = true)]
async fn test_sweep_cancels_strategy_instead_of_aborting() {
    let mut cfg = config();
    cfg.task_timeout_ms = 1_000;
    let strategy = FakeStrategy::new(|_, _| Reply::Hang);
    let s = scheduler(cfg, strategy.clone());
    submit(&s, "Slow feature");

    s.tick().await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;
    s.tick().await.unwrap();
    s.wait_idle().await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert_eq!(strategy.cancelled(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_recovery_does_not_block_next_tick() {
    let mut cfg = config();
    cfg.task_timeout_ms = 1_000;
    let strategy = FakeStrategy::new(|req, _| {
        if req.description.contains("Slow") {
            Reply::Hang
        } else {
            ok(role_output(req.role))
        }
    });
    let s = scheduler_with(cfg, strategy, Arc::new(SlowReasoner), Pipeline::forward());
    let slow = submit(&s, "Slow feature");
    let slow_id = slow.task.unwrap().id;

    s.tick().await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;
    let swept = s.tick().await.unwrap();
    assert_eq!(swept.timed_out, vec![slow_id]);
    assert!(!s.is_idle());

    // Architect capacity is free again while the reasoner is still thinking.
    let quick = submit(&s, "Quick feature");
    let report = tokio::time::timeout(Duration::from_secs(1), s.tick())
        .await
        .expect("tick waited on recovery")
        .unwrap();
    assert_eq!(report.dispatched, vec![quick.task.unwrap().id]);

    s.wait_idle().await;
    let task = s.store().call(|conn| tasks::find_by_id(conn, slow_id)).unwrap().unwrap();
    assert_eq!(task.status, Status::Pending);
    assert_eq!(task.attempts, 1);
}

/// Two schedulers over the same database, as across a restart.
fn restarted(store: &Store, cfg: SchedulerConfig, strategy: Arc<FakeStrategy>) -> Scheduler {
    Scheduler::new(
        store.clone(),
        cfg,
        Strategies {
            headless: strategy.clone(),
            interactive: strategy,
        },
        Arc::new(RuleBasedReasoner),
        Pipeline::forward(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_restart_requeues_interrupted_task() {
    let store = Store::in_memory();
    let before = restarted(&store, config(), FakeStrategy::new(|_, _| Reply::Hang));
    let submission = submit(&before, "Add login");
    let task_id = submission.task.unwrap().id;
    before.tick().await.unwrap();
    assert_eq!(before.running_tasks(), vec![task_id]);

    let strategy = FakeStrategy::succeeding();
    let after = restarted(&store, config(), strategy.clone());
    let mut events = after.subscribe();
    let report = after.tick().await.unwrap();

    assert_eq!(report.interrupted, vec![task_id]);
    assert_eq!(report.dispatched, vec![task_id]);
    after.wait_idle().await;
    let task = store.call(|conn| tasks::find_by_id(conn, task_id)).unwrap().unwrap();
    assert_eq!(task.status, Status::Complete);
    assert_eq!(task.attempts, 2);
    assert_eq!(strategy.calls().len(), 1);

    let events = drain(&mut events);
    assert!(events.contains(&SchedulerEvent::TaskRetrying {
        task_id,
        feature_id: submission.feature.id.clone(),
        attempt: 2,
    }));

    // Reconciliation runs once per scheduler.
    let again = after.tick().await.unwrap();
    assert!(again.interrupted.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_restart_fails_interrupted_task_out_of_attempts() {
    let mut cfg = config();
    cfg.max_task_attempts = 1;
    let store = Store::in_memory();
    let before = restarted(&store, cfg.clone(), FakeStrategy::new(|_, _| Reply::Hang));
    let submission = submit(&before, "Add login");
    let task_id = submission.task.unwrap().id;
    before.tick().await.unwrap();

    let after = restarted(&store, cfg, FakeStrategy::succeeding());
    let report = after.tick().await.unwrap();

    assert_eq!(report.interrupted, vec![task_id]);
    assert!(!report.dispatched.contains(&task_id));
    let task = store.call(|conn| tasks::find_by_id(conn, task_id)).unwrap().unwrap();
    assert_eq!(task.status, Status::Failed);
    assert!(task.error.unwrap().contains("interrupted"));
    let feature = store
        .call(|conn| features::find_by_id(conn, &submission.feature.id))
        .unwrap()
        .unwrap();
    assert_eq!(feature.status, Status::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_failed_task_retried_with_guidance() {
    let strategy = FakeStrategy::new(|req, n| match (req.role, n) {
        (Role::Architect, 1) => fail("process exited with code 1: boom"),
        (role, _) => ok(role_output(role)),
    });
    let s = scheduler(config(), strategy.clone());
    let mut events = s.subscribe();
    let submission = submit(&s, "Add login");
    let task_id = submission.task.unwrap().id;

    s.tick().await.unwrap();
    s.wait_idle().await;

    let task = s.store().call(|conn| tasks::find_by_id(conn, task_id)).unwrap().unwrap();
    assert_eq!(task.status, Status::Pending);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.error, None);
    assert_eq!(task.completed_at, None);
    let fid = submission.feature.id.clone();
    let ctx = s.store().call(|conn| contexts::list_by_feature(conn, &fid)).unwrap();
    assert_eq!(ctx.len(), 1);
    assert_eq!(ctx[0].context_type, ContextType::Guidance);

    s.tick().await.unwrap();
    s.wait_idle().await;

    let task = s.store().call(|conn| tasks::find_by_id(conn, task_id)).unwrap().unwrap();
    assert_eq!(task.status, Status::Complete);
    assert_eq!(task.attempts, 2);

    // The retry carried the guidance.
    let retry = strategy.calls().into_iter().filter(|r| r.task_id == task_id).nth(1).unwrap();
    assert!(retry.context.iter().any(|c| c.label.starts_with("guidance")));

    let events = drain(&mut events);
    assert!(events.contains(&SchedulerEvent::TaskRetrying {
        task_id,
        feature_id: fid,
        attempt: 2,
    }));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_task_fails_feature_and_queues_self_healing() {
    let mut cfg = config();
    cfg.max_task_attempts = 2;
    let strategy = FakeStrategy::new(|req, _| match req.role {
        Role::Architect => fail("process exited with code 2: bad"),
        _ => Reply::Hang,
    });
    let s = scheduler(cfg, strategy);
    let mut events = s.subscribe();
    let submission = submit(&s, "Doomed");
    let task_id = submission.task.unwrap().id;

    for _ in 0..2 {
        s.tick().await.unwrap();
        s.wait_idle().await;
    }

    let task = s.store().call(|conn| tasks::find_by_id(conn, task_id)).unwrap().unwrap();
    assert_eq!(task.status, Status::Failed);
    assert_eq!(task.attempts, 2);
    let fid = submission.feature.id.clone();
    assert_eq!(load_feature(&s, &fid).status, Status::Failed);

    let bucket = s
        .store()
        .call(|conn| features::find_by_kind(conn, SELF_HEALING_KIND))
        .unwrap()
        .expect("self-healing feature");
    assert!(bucket.is_self_healing());
    let healing = feature_tasks(&s, &bucket.id);
    assert_eq!(healing.len(), 1);
    assert_eq!(healing[0].role, Role::Developer);
    assert!(healing[0].description.contains(&fid));

    let events = drain(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, SchedulerEvent::FeatureFailed { feature_id, .. } if *feature_id == fid)));
}

#[tokio::test(start_paused = true)]
async fn test_self_healing_failures_do_not_escalate() {
    let mut cfg = config();
    cfg.max_task_attempts = 1;
    let s = scheduler(cfg, FakeStrategy::new(|_, _| fail("always broken")));
    submit(&s, "Doomed");

    drive(&s).await;

    let bucket = s
        .store()
        .call(|conn| features::find_by_kind(conn, SELF_HEALING_KIND))
        .unwrap()
        .unwrap();
    let healing = feature_tasks(&s, &bucket.id);
    assert_eq!(healing.len(), 1);
    assert_eq!(healing[0].status, Status::Failed);
    assert_eq!(load_feature(&s, &bucket.id).status, Status::InProgress);
}

#[tokio::test(start_paused = true)]
async fn test_reasoner_error_fails_feature_without_healing_task() {
    let s = scheduler_with(
        config(),
        FakeStrategy::new(|_, _| fail("boom")),
        Arc::new(BrokenReasoner),
        Pipeline::forward(),
    );
    let submission = submit(&s, "Add login");

    s.tick().await.unwrap();
    s.wait_idle().await;

    assert_eq!(load_feature(&s, &submission.feature.id).status, Status::Failed);
    let bucket = s
        .store()
        .call(|conn| features::find_by_kind(conn, SELF_HEALING_KIND))
        .unwrap();
    assert!(bucket.is_none());
    let actions: Vec<String> = s
        .store()
        .call(|conn| audit::list_recent(conn, 20))
        .unwrap()
        .into_iter()
        .map(|a| a.action)
        .collect();
    assert!(actions.contains(&"self_healing_failed".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_tasks_of_failed_feature_are_skipped() {
    let s = scheduler(config(), FakeStrategy::succeeding());
    let feature = s
        .store()
        .call(|conn| {
            let f = features::create(conn, &NewFeature {
                status: Some(Status::Failed),
                ..Default::default()
            })?;
            tasks::create(conn, &NewTask::new(&f.id, Role::Developer, "orphan"))?;
            Ok(f)
        })
        .unwrap();

    let report = s.tick().await.unwrap();

    assert!(report.dispatched.is_empty());
    assert_eq!(feature_tasks(&s, &feature.id)[0].status, Status::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_pending_task_over_attempt_limit_is_force_failed() {
    let s = scheduler(config(), FakeStrategy::succeeding());
    let task = s
        .store()
        .call(|conn| {
            let f = features::create(conn, &NewFeature::default())?;
            let t = tasks::create(conn, &NewTask::new(&f.id, Role::Architect, "design"))?;
            for _ in 0..3 {
                tasks::increment_attempts(conn, t.id)?;
            }
            Ok(t)
        })
        .unwrap();

    let report = s.tick().await.unwrap();

    assert_eq!(report.force_failed, vec![task.id]);
    assert!(!report.dispatched.contains(&task.id));
    let stored = s.store().call(|conn| tasks::find_by_id(conn, task.id)).unwrap().unwrap();
    assert_eq!(stored.status, Status::Failed);
    assert_eq!(stored.attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn test_review_rework_loop() {
    let strategy = FakeStrategy::new(|req, _| match req.role {
        Role::Reviewer if req.description.starts_with("Review") && !req.context.iter().any(|c| c.content.contains("add tests")) => {
            ok(json!({"approved": false, "issues": ["add tests"]}))
        }
        role => ok(role_output(role)),
    });
    let pipeline = Pipeline::from_config(&PipelineConfig {
        review_rework: true,
        max_rework_cycles: 1,
    });
    let s = scheduler_with(config(), strategy, Arc::new(RuleBasedReasoner), pipeline);
    let submission = submit(&s, "Add login");

    drive(&s).await;

    let all = feature_tasks(&s, &submission.feature.id);
    let roles: Vec<Role> = all.iter().map(|t| t.role).collect();
    assert_eq!(
        roles,
        vec![Role::Architect, Role::Developer, Role::Reviewer, Role::Developer, Role::Reviewer]
    );
    assert!(all[3].description.contains("- add tests"));
    assert_eq!(load_feature(&s, &submission.feature.id).status, Status::Complete);
}

#[tokio::test(start_paused = true)]
async fn test_pause_and_resume() {
    let s = scheduler(config(), FakeStrategy::succeeding());
    submit(&s, "Add login");

    s.pause();
    assert!(s.is_paused());
    assert!(s.tick().await.unwrap().dispatched.is_empty());

    s.resume();
    assert_eq!(s.tick().await.unwrap().dispatched.len(), 1);

    let actions: Vec<String> = s
        .store()
        .call(|conn| audit::list_recent(conn, 20))
        .unwrap()
        .into_iter()
        .map(|a| a.action)
        .collect();
    assert!(actions.contains(&"scheduler_paused".to_string()));
    assert!(actions.contains(&"scheduler_resumed".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_stop_drains_in_flight_tasks() {
    let strategy = FakeStrategy::new(|req, _| {
        Reply::After(Duration::from_secs(5), ExecutionResult::succeeded(role_output(req.role), Duration::from_secs(5), 1))
    });
    let s = scheduler(config(), strategy);
    submit(&s, "Add login");
    s.tick().await.unwrap();

    let report = s.stop(Duration::from_secs(10)).await;

    assert_eq!(report, StopReport { drained: true, in_flight: 0 });
    // Stopped schedulers no longer dispatch.
    assert!(s.tick().await.unwrap().dispatched.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_gives_up_after_max_wait() {
    let s = scheduler(config(), FakeStrategy::new(|_, _| Reply::Hang));
    submit(&s, "Add login");
    s.tick().await.unwrap();

    let report = s.stop(Duration::from_secs(1)).await;

    assert_eq!(report, StopReport { drained: false, in_flight: 1 });
}

#[tokio::test(start_paused = true)]
async fn test_run_loop_processes_until_cancelled() {
    let mut cfg = config();
    cfg.check_interval_ms = 100;
    let s = scheduler(cfg, FakeStrategy::succeeding());
    let mut events = s.subscribe();
    let cancel = CancellationToken::new();
    let loop_handle = {
        let s = s.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { s.run(cancel).await })
    };

    let submission = submit(&s, "Add login");
    let fid = submission.feature.id.clone();
    let completed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let SchedulerEvent::FeatureCompleted { feature_id } = events.recv().await.unwrap() {
                return feature_id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(completed, fid);

    cancel.cancel();
    loop_handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_every_status_change_is_recorded() {
    let s = scheduler(config(), FakeStrategy::succeeding());
    let submission = submit(&s, "Add login");
    drive(&s).await;

    let task_id = submission.task.unwrap().id.to_string();
    let history = s
        .store()
        .call(|conn| crate::db::transitions::list_for_entity(conn, EntityType::Task, &task_id))
        .unwrap();
    let path: Vec<(Option<String>, String)> = history
        .into_iter()
        .map(|t| (t.from_state, t.to_state))
        .collect();
    assert_eq!(
        path,
        vec![
            (None, "pending".to_string()),
            (Some("pending".to_string()), "in_progress".to_string()),
            (Some("in_progress".to_string()), "complete".to_string()),
        ]
    );
}

#[test]
fn test_events_serialize_with_type_tag() {
    let event = SchedulerEvent::TaskRetrying {
        task_id: 4,
        feature_id: "f".to_string(),
        attempt: 2,
    };
    assert_eq!(
        serde_json::to_value(&event).unwrap(),
        json!({"type": "task_retrying", "task_id": 4, "feature_id": "f", "attempt": 2})
    );
}
