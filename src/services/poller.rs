use crate::models::{Stage, StageEvent};
use crate::services::clock::{ClockHandle, ProgressClock};
use crate::services::registry::{EventOutcome, FileRegistry};
use crate::services::remote::{ProgressReport, RemoteStageClient};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Registry-side handle to one running poller. Dropping it does not stop
/// the poller; cancellation is explicit so delete/deleteAll stay in charge.
pub(crate) struct PollerHandle {
    clock: ClockHandle,
}

impl PollerHandle {
    pub(crate) fn cancel(&self) {
        self.clock.cancel();
    }
}

/// Spawns the polling loop for one stage task.
///
/// One query per tick, never overlapping: the loop awaits each
/// `query_progress` before asking the clock again, and the clock skips any
/// tick that passed meanwhile. The loop ends when a terminal report is
/// delivered, when the registry drops an event (record deleted or task
/// stale), or when the clock is cancelled.
pub(crate) fn spawn(
    registry: Arc<FileRegistry>,
    client: Arc<dyn RemoteStageClient>,
    id: Uuid,
    stage: Stage,
    task_id: String,
    interval: Duration,
    max_transport_failures: u32,
) -> PollerHandle {
    let (mut clock, handle) = ProgressClock::new(interval);

    tokio::spawn(async move {
        let started = Instant::now();
        let mut misses = 0u32;

        while clock.tick().await {
            match client.query_progress(stage, &task_id).await {
                Ok(report) => {
                    misses = 0;
                    let (event, terminal) = match report {
                        ProgressReport::Running(percent) => (
                            StageEvent::ProgressUpdate {
                                percent,
                                eta_seconds: estimate_eta(started.elapsed(), percent),
                            },
                            false,
                        ),
                        ProgressReport::Complete => (StageEvent::StageCompleted, true),
                        ProgressReport::Failed => (
                            StageEvent::StageFailed {
                                reason: format!("{stage} stage failed on the server"),
                            },
                            true,
                        ),
                    };
                    let outcome = registry.apply_stage_event(id, &task_id, event).await;
                    if terminal || outcome == EventOutcome::Dropped {
                        break;
                    }
                }
                Err(err) if err.is_retryable() => {
                    // Transient: retry on the next tick, up to the limit.
                    misses += 1;
                    tracing::warn!(%id, %stage, misses, error = %err, "progress poll failed");
                    if misses >= max_transport_failures {
                        let reason = format!(
                            "lost contact with the masking service after {misses} attempts: {err}"
                        );
                        registry
                            .apply_stage_event(id, &task_id, StageEvent::StageFailed { reason })
                            .await;
                        break;
                    }
                }
                Err(err) => {
                    // Decode failures and 4xx rejections do not heal on retry.
                    registry
                        .apply_stage_event(
                            id,
                            &task_id,
                            StageEvent::StageFailed {
                                reason: err.to_string(),
                            },
                        )
                        .await;
                    break;
                }
            }
        }
        tracing::debug!(%id, %stage, "poller finished");
    });

    PollerHandle { clock: handle }
}

/// The remote only reports percent, so the ETA comes from the observed rate.
fn estimate_eta(elapsed: Duration, percent: u8) -> Option<u64> {
    if percent == 0 {
        return None;
    }
    let per_unit = elapsed.as_secs_f64() / f64::from(percent);
    Some((per_unit * f64::from(100 - percent)).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_eta() {
        // 25% in 10s leaves 30s for the remaining 75%.
        assert_eq!(estimate_eta(Duration::from_secs(10), 25), Some(30));
        assert_eq!(estimate_eta(Duration::from_secs(10), 50), Some(10));
        assert_eq!(estimate_eta(Duration::from_secs(10), 0), None);
        assert_eq!(estimate_eta(Duration::from_secs(10), 99), Some(0));
    }
}
