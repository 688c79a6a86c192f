//! Orphan reaper.
//!
//! The last line of defense against a crashed worker that never wrote
//! a terminal status: any phase still `processing` past its
//! `expected_completion_at` is failed with a timeout, and its job
//! with it. Reaped jobs are not revived automatically.

use chrono::Utc;
use graphloom_db::{DbError, PipelineStore};
use graphloom_protocol::defaults::REAPER_INTERVAL_SECS;
use serde_json::{json, Map};
use std::time::Duration;
use tracing::{error, info, warn};

pub struct OrphanReaper {
    store: PipelineStore,
}

impl OrphanReaper {
    pub fn new(store: PipelineStore) -> Self {
        Self { store }
    }

    /// One sweep. Returns how many phases were reaped.
    pub async fn sweep_once(&self) -> Result<usize, DbError> {
        let now = Utc::now();
        let orphans = self.store.orphaned_phases(now).await?;
        if orphans.is_empty() {
            return Ok(0);
        }

        warn!(count = orphans.len(), "found orphaned phases");
        for phase in &orphans {
            let deadline = phase
                .expected_completion_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string());
            self.store
                .fail_phase(
                    &phase.id,
                    "TimeoutError",
                    &format!(
                        "Phase timeout - still processing past expected completion at {deadline}. \
                         Marked as orphaned by automated cleanup."
                    ),
                    None,
                )
                .await?;

            self.store.fail_job(&phase.pipeline_job_id).await?;
            let mut patch = Map::new();
            patch.insert("orphaned".to_string(), json!(true));
            self.store
                .merge_job_metadata(&phase.pipeline_job_id, patch)
                .await?;

            info!(
                phase_id = %phase.id,
                pipeline_job_id = %phase.pipeline_job_id,
                phase = %phase.phase,
                "reaped orphaned phase"
            );
        }
        Ok(orphans.len())
    }

    /// Periodic sweep loop (every 5 minutes).
    pub async fn run(&self) {
        info!(interval_secs = REAPER_INTERVAL_SECS, "orphan reaper running");
        loop {
            if let Err(err) = self.sweep_once().await {
                error!(%err, "orphan sweep failed");
            }
            tokio::time::sleep(Duration::from_secs(REAPER_INTERVAL_SECS)).await;
        }
    }
}
