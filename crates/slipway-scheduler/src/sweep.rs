//! Stuck-attempt sweep.
//!
//! Attempts left `running` past the configured timeout are finished
//! `errored` through the same mutation API workers use; losing a race
//! against a real finish is expected and ignored.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use slipway_core::AttemptResult;
use slipway_db::BuildStore;

use crate::error::SchedulerError;
use crate::lifecycle::BuildLifecycle;

pub struct TimeoutSweeper {
    store: Arc<dyn BuildStore>,
    lifecycle: Arc<BuildLifecycle>,
}

impl TimeoutSweeper {
    pub fn new(store: Arc<dyn BuildStore>, lifecycle: Arc<BuildLifecycle>) -> Self {
        Self { store, lifecycle }
    }

    /// One pass: error out every timed-out attempt. Returns how many were
    /// swept.
    pub async fn sweep_once(&self) -> Result<u32, SchedulerError> {
        let cutoff = self.lifecycle.stale_cutoff();
        let mut swept = 0;
        for attempt in self.store.stale_running_attempts(cutoff).await? {
            match self.lifecycle.finish(attempt.id, AttemptResult::Errored).await {
                Ok(outcome) => {
                    swept += 1;
                    warn!(
                        attempt_id = %attempt.id,
                        build_state = %outcome.build_state,
                        "attempt timed out"
                    );
                }
                Err(e) if e.is_attempt_conflict() => {
                    // The worker finished first; its result stands.
                }
                Err(e) => return Err(e),
            }
        }
        Ok(swept)
    }

    /// Run the sweep on an interval.
    pub async fn run(&self, interval: Duration) {
        info!(interval_secs = interval.as_secs(), "starting timeout sweep");
        loop {
            match self.sweep_once().await {
                Ok(0) => {}
                Ok(swept) => info!(swept, "sweep finished"),
                Err(e) => warn!(error = %e, "sweep failed"),
            }
            sleep(interval).await;
        }
    }
}
