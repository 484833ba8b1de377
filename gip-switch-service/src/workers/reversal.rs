use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ReversalWorkerConfig;
use crate::service::lifecycle::LifecycleService;

/// Initiates compensating reversals for failed credit legs and keeps
/// retrying until a callback resolves them or attempts are exhausted.
pub struct ReversalWorker {
    lifecycle: Arc<LifecycleService>,
    config: ReversalWorkerConfig,
}

impl ReversalWorker {
    pub fn new(lifecycle: Arc<LifecycleService>, config: ReversalWorkerConfig) -> Self {
        Self { lifecycle, config }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            poll_interval = ?self.config.poll_interval,
            max_attempts = self.config.max_attempts,
            "Reversal worker started"
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reversal worker stopped");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Reversal worker tick failed");
                    }
                }
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let dispatched = self
            .lifecycle
            .run_reversal_batch(self.config.batch_size as i64)
            .await?;
        if dispatched > 0 {
            debug!(dispatched, "Reversals dispatched");
        }
        Ok(())
    }
}
