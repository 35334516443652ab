use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kiln_session::scheduler::{Scheduler, StopReport};

/// Drain the scheduler, then close the control API.
///
/// Interactive sessions finish through `POST /tasks/{id}/complete`, so the
/// API has to stay up until the drain is over or in-flight sessions could
/// never report back.
pub async fn drain_then_close(
    scheduler: &Scheduler,
    stop_wait: Duration,
    http: &CancellationToken,
) -> StopReport {
    let report = scheduler.stop(stop_wait).await;
    if report.drained {
        info!("scheduler drained");
    } else {
        warn!(in_flight = report.in_flight, "abandoning running tasks");
    }
    http.cancel();
    report
}
