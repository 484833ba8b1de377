use std::sync::Arc;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::WebhookWorkerConfig;
use crate::model::webhook_backoff;
use crate::repo::client_callback::{ClientCallbackRecord, ClientCallbackRepo};
use crate::webhook::WebhookSender;

/// Delivers terminal-state notifications to institution webhooks with
/// bounded exponential retry.
pub struct ClientCallbackDeliverer {
    repo: Arc<dyn ClientCallbackRepo + Sync + Send>,
    sender: Arc<dyn WebhookSender + Sync + Send>,
    config: WebhookWorkerConfig,
}

impl ClientCallbackDeliverer {
    pub fn new(
        repo: Arc<dyn ClientCallbackRepo + Sync + Send>,
        sender: Arc<dyn WebhookSender + Sync + Send>,
        config: WebhookWorkerConfig,
    ) -> Self {
        Self {
            repo,
            sender,
            config,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            poll_interval = ?self.config.poll_interval,
            max_attempts = self.config.max_attempts,
            "Client callback deliverer started"
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Client callback deliverer stopped");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Client callback deliverer tick failed");
                    }
                }
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let due = self
            .repo
            .claim_due(&now, self.config.batch_size as i64)
            .await?;
        for callback in due {
            self.deliver_one(&callback).await?;
        }
        Ok(())
    }

    pub async fn deliver_one(&self, callback: &ClientCallbackRecord) -> anyhow::Result<()> {
        let attempts = callback.attempts + 1;

        let (http_status, error) = match self
            .sender
            .deliver(&callback.url, &callback.payload)
            .await
        {
            Ok(delivery) if delivery.is_success() => {
                info!(
                    callback_id = %callback.id,
                    transaction_id = %callback.transaction_id,
                    attempts,
                    "Client callback delivered"
                );
                self.repo
                    .mark_delivered(&callback.id, attempts, delivery.http_status as i32)
                    .await?;
                return Ok(());
            }
            Ok(delivery) => (
                Some(delivery.http_status as i32),
                Some(delivery.body_snippet),
            ),
            Err(network_error) => (None, Some(network_error)),
        };

        if attempts >= callback.max_attempts {
            warn!(
                callback_id = %callback.id,
                transaction_id = %callback.transaction_id,
                attempts,
                "Client callback delivery failed permanently"
            );
            self.repo
                .mark_failed(&callback.id, attempts, http_status, error)
                .await?;
        } else {
            let delay = webhook_backoff(
                self.config.initial_delay,
                self.config.backoff_multiplier,
                attempts as u32,
                self.config.max_delay,
            );
            let next_attempt_at = Utc::now() + delay;
            warn!(
                callback_id = %callback.id,
                transaction_id = %callback.transaction_id,
                attempts,
                retry_in = ?delay,
                "Client callback delivery failed; retrying"
            );
            self.repo
                .mark_retry(&callback.id, attempts, &next_attempt_at, http_status, error)
                .await?;
        }

        Ok(())
    }
}
