use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::CallbackWorkerConfig;
use crate::service::lifecycle::LifecycleService;

/// Consumes the inbound gateway callback queue and advances the state
/// machine. Also sweeps rows waiting for a credit dispatch or a terminal
/// fold, so a crash between commits never strands a transaction.
pub struct CallbackProcessor {
    lifecycle: Arc<LifecycleService>,
    config: CallbackWorkerConfig,
}

impl CallbackProcessor {
    pub fn new(lifecycle: Arc<LifecycleService>, config: CallbackWorkerConfig) -> Self {
        Self { lifecycle, config }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            poll_interval = ?self.config.poll_interval,
            batch_size = self.config.batch_size,
            "Callback processor started"
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Callback processor stopped");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Callback processor tick failed");
                    }
                }
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let batch_size = self.config.batch_size as i64;

        let processed = self.lifecycle.process_callbacks(batch_size).await?;
        if processed > 0 {
            debug!(processed, "Processed gateway callbacks");
        }

        self.lifecycle.dispatch_pending_credits(batch_size).await?;
        self.lifecycle.fold_terminal_states(batch_size).await?;

        Ok(())
    }
}
