//! Idle Reaper
//!
//! Background sweep that stops containers nobody has used for a while.

use crate::pool::PoolManager;
use crate::registry::ModelId;
use crate::shutdown::{BackgroundTask, signalled};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub sweep_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub released: Vec<ModelId>,
    pub failed: Vec<ModelId>,
}

pub struct IdleReaper {
    pool: Arc<PoolManager>,
    config: ReaperConfig,
}

impl IdleReaper {
    pub fn new(pool: Arc<PoolManager>, config: ReaperConfig) -> Self {
        Self { pool, config }
    }

    /// Release every container idle longer than `idle_timeout`. A failed stop
    /// is logged and the sweep moves on.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let Some(cutoff) = Instant::now().checked_sub(self.config.idle_timeout) else {
            return report;
        };

        let candidates: Vec<ModelId> = self
            .pool
            .snapshot()
            .entries
            .iter()
            .filter(|e| e.last_used < cutoff)
            .map(|e| e.model_id)
            .collect();

        for model_id in candidates {
            match self.pool.release_if_idle(model_id, cutoff).await {
                Ok(true) => {
                    tracing::info!(
                        model_id = %model_id,
                        idle_timeout_secs = self.config.idle_timeout.as_secs(),
                        "released idle container"
                    );
                    report.released.push(model_id);
                }
                // Used again since the snapshot.
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(model_id = %model_id, error = %err, "failed to release idle container");
                    report.failed.push(model_id);
                }
            }
        }

        report
    }

    /// Run the sweep loop on its own task until the handle is shut down.
    pub fn spawn(self) -> BackgroundTask {
        BackgroundTask::spawn("idle-reaper", move |mut shutdown| async move {
            tracing::info!(
                interval_secs = self.config.sweep_interval.as_secs(),
                idle_timeout_secs = self.config.idle_timeout.as_secs(),
                "idle reaper started"
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.sweep_interval) => {
                        let report = self.sweep_once().await;
                        if !report.released.is_empty() || !report.failed.is_empty() {
                            tracing::debug!(
                                released = report.released.len(),
                                failed = report.failed.len(),
                                "idle sweep finished"
                            );
                        }
                    }
                    _ = signalled(&mut shutdown) => break,
                }
            }
            tracing::info!("idle reaper stopped");
        })
    }
}
