//! Defrag Scheduler
//!
//! Periodically asks the array to defragment the storage group. Runs are
//! best-effort: a failed run is logged and counted, and the loop goes on.

use crate::domain::ports::SanBackendRef;
use crate::metrics::ProvisionerMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default time between two defragmentation runs
pub const DEFAULT_DEFRAG_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Result of one defragmentation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum DefragOutcome {
    /// The array accepted the request; defragmentation runs on its own
    Started,
    Failed(String),
}

/// What happened in one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefragReport {
    pub started_at: DateTime<Utc>,
    pub outcome: DefragOutcome,
}

impl DefragReport {
    pub fn is_started(&self) -> bool {
        self.outcome == DefragOutcome::Started
    }
}

/// Background defragmentation loop
pub struct DefragScheduler {
    backend: SanBackendRef,
    interval: Duration,
    cancel: CancellationToken,
    metrics: Option<Arc<ProvisionerMetrics>>,
}

impl DefragScheduler {
    pub fn new(backend: SanBackendRef, interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            backend,
            interval,
            cancel,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ProvisionerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run a single defragmentation and report how it went
    pub async fn run_once(&self) -> DefragReport {
        let started_at = Utc::now();

        let outcome = match self.backend.defrag().await {
            Ok(()) => {
                info!("Disk group defragmentation started");
                DefragOutcome::Started
            }
            Err(e) => {
                warn!("Disk group defragmentation failed: {}", e);
                DefragOutcome::Failed(e.to_string())
            }
        };

        if let Some(metrics) = &self.metrics {
            let result = match outcome {
                DefragOutcome::Started => "started",
                DefragOutcome::Failed(_) => "failed",
            };
            metrics.record_defrag(result);
        }

        DefragReport {
            started_at,
            outcome,
        }
    }

    /// Defragment, sleep the interval, repeat until cancelled.
    /// Returns the number of runs.
    pub async fn run(&self) -> u64 {
        info!(interval_secs = self.interval.as_secs(), "Defrag scheduler started");
        let mut runs = 0;

        while !self.cancel.is_cancelled() {
            self.run_once().await;
            runs += 1;

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!(runs, "Defrag scheduler stopped");
        runs
    }
}
