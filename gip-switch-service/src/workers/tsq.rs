use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::TsqWorkerConfig;
use crate::service::lifecycle::LifecycleService;

/// Resolves indeterminate legs against the gateway's authoritative status:
/// times out silent legs, escalates them to TSQ, and polls until the leg
/// resolves or attempts are exhausted.
pub struct TsqWorker {
    lifecycle: Arc<LifecycleService>,
    config: TsqWorkerConfig,
}

impl TsqWorker {
    pub fn new(lifecycle: Arc<LifecycleService>, config: TsqWorkerConfig) -> Self {
        Self { lifecycle, config }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            poll_interval = ?self.config.poll_interval,
            max_attempts = self.config.max_attempts,
            "TSQ worker started"
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("TSQ worker stopped");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "TSQ worker tick failed");
                    }
                }
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let batch_size = self.config.batch_size as i64;

        let timed_out = self.lifecycle.sweep_timeouts(batch_size).await?;
        if timed_out > 0 {
            debug!(timed_out, "Legs timed out waiting for callbacks");
        }

        let queried = self.lifecycle.run_tsq_batch(batch_size).await?;
        if queried > 0 {
            debug!(queried, "Status queries issued");
        }

        self.lifecycle.sweep_stale_initiated(batch_size).await?;

        Ok(())
    }
}
