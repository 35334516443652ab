use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use kiln_session::exec::{CompletionRegistry, TokioLauncher};
use kiln_session::scheduler::{Scheduler, SchedulerEvent};

const PRINTER_DRAIN: Duration = Duration::from_secs(2);

/// Tick until no work is runnable, printing progress events.
///
/// Developer sessions started here can only finish through the stdout
/// marker, so `interactive.accept_stdout_marker` should be enabled. The
/// daemon also accepts completions over HTTP.
pub fn run(config_path: Option<&Path>, max_ticks: Option<u32>, json: bool) -> anyhow::Result<u8> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let (config, store) = super::open(config_path)?;
    if !config.interactive.accept_stdout_marker {
        warn!("interactive.accept_stdout_marker is off; developer sessions can only complete through the daemon");
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let scheduler = Scheduler::from_config(
            store,
            &config,
            Arc::new(TokioLauncher),
            CompletionRegistry::new(),
        );
        let printer = tokio::spawn(print_events(scheduler.subscribe(), json));
        let interval = config.scheduler.check_interval();
        let mut ticks = 0u32;

        loop {
            let report = scheduler.tick().await?;
            ticks += 1;
            let quiet = report.dispatched.is_empty()
                && report.force_failed.is_empty()
                && report.interrupted.is_empty();
            if quiet && scheduler.is_idle() {
                break;
            }
            if max_ticks.is_some_and(|max| ticks >= max) {
                break;
            }
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
                _ = scheduler.wait_idle() => {}
            }
        }

        let stop = scheduler.stop(config.scheduler.stop_wait()).await;
        // Dropping the last handle closes the channel once in-flight tasks are gone.
        drop(scheduler);
        if tokio::time::timeout(PRINTER_DRAIN, printer).await.is_err() {
            warn!("event printer did not finish");
        }
        if !json {
            println!(
                "Stopped after {} tick(s){}",
                ticks,
                if stop.drained {
                    String::new()
                } else {
                    format!(", {} task(s) still running", stop.in_flight)
                }
            );
        }
        Ok::<u8, anyhow::Error>(0)
    })
}

async fn print_events(mut events: broadcast::Receiver<SchedulerEvent>, json: bool) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if json {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{}", line);
                    }
                } else {
                    println!("{}", describe(&event));
                }
            }
            Err(RecvError::Lagged(missed)) => warn!(missed, "event printer fell behind"),
            Err(RecvError::Closed) => return,
        }
    }
}

pub fn describe(event: &SchedulerEvent) -> String {
    match event {
        SchedulerEvent::TaskStarted { task_id, role, attempt, .. } => {
            format!("task {} ({}) started, attempt {}", task_id, role, attempt)
        }
        SchedulerEvent::TaskCompleted { task_id, role, duration_ms, .. } => {
            format!("task {} ({}) complete in {}ms", task_id, role, duration_ms)
        }
        SchedulerEvent::TaskFailed { task_id, role, error, .. } => {
            format!("task {} ({}) failed: {}", task_id, role, error)
        }
        SchedulerEvent::TaskTimedOut { task_id, role, .. } => {
            format!("task {} ({}) timed out", task_id, role)
        }
        SchedulerEvent::TaskRetrying { task_id, attempt, .. } => {
            format!("task {} queued for attempt {}", task_id, attempt)
        }
        SchedulerEvent::FeatureCompleted { feature_id } => format!("feature {} complete", feature_id),
        SchedulerEvent::FeatureFailed { feature_id, reason } => {
            format!("feature {} failed: {}", feature_id, reason)
        }
        SchedulerEvent::Error { task_id, message } => match task_id {
            Some(id) => format!("error on task {}: {}", id, message),
            None => format!("error: {}", message),
        },
    }
}
