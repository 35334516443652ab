use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use kiln_daemon::config::DaemonConfig;
use kiln_daemon::http::{self, AppState};
use kiln_daemon::shutdown::drain_then_close;
use kiln_session::db::Store;
use kiln_session::exec::{CompletionRegistry, TokioLauncher};
use kiln_session::scheduler::{Scheduler, SchedulerEvent};

#[derive(Parser)]
#[command(name = "kiln-daemon", about = "Runs the kiln scheduler and its control API")]
struct Cli {
    /// Path to config file (default: ~/.config/kiln/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = DaemonConfig::load(cli.config.as_ref())?;
    let db_path = config.kiln.db_path();
    info!(db = %db_path.display(), port = config.http_port, "loaded config");

    let store = Store::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    let completions = CompletionRegistry::new();
    let scheduler = Scheduler::from_config(
        store,
        &config.kiln,
        Arc::new(TokioLauncher),
        completions.clone(),
    );

    let cancel = CancellationToken::new();
    // Closed only after the scheduler drains.
    let http_cancel = CancellationToken::new();

    let http_handle = http::spawn_http_server(
        config.http_port,
        AppState {
            scheduler: scheduler.clone(),
            completions,
        },
        http_cancel.clone(),
    )
    .await?;

    let log_handle = tokio::spawn(log_events(scheduler.subscribe()));

    let loop_handle = {
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    info!("daemon started");

    tokio::select! {
        _ = cancel.cancelled() => {
            info!("shutdown signal received");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }

    drain_then_close(&scheduler, config.kiln.scheduler.stop_wait(), &http_cancel).await;
    cancel.cancel();

    let _ = loop_handle.await;
    let _ = http_handle.await;
    log_handle.abort();

    info!("daemon stopped");
    Ok(())
}

/// Mirror scheduler events into the log.
async fn log_events(mut events: tokio::sync::broadcast::Receiver<SchedulerEvent>) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match events.recv().await {
            Ok(SchedulerEvent::TaskFailed {
                task_id, error: e, ..
            }) => {
                warn!(task_id, error = %e, "task failed");
            }
            Ok(SchedulerEvent::FeatureFailed { feature_id, reason }) => {
                warn!(feature = %feature_id, reason = %reason, "feature failed");
            }
            Ok(SchedulerEvent::Error { task_id, message }) => {
                error!(task_id = ?task_id, error = %message, "scheduler error");
            }
            Ok(event) => {
                info!(event = ?event, "scheduler event");
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event log lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
