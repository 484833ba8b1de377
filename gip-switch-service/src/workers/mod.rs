use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WorkersConfig;
use crate::service::Services;

pub mod callbacks;
pub mod reversal;
pub mod tsq;
pub mod webhook;

pub use callbacks::CallbackProcessor;
pub use reversal::ReversalWorker;
pub use tsq::TsqWorker;
pub use webhook::ClientCallbackDeliverer;

/// Starts every background worker. Each loop finishes its in-flight batch
/// when the token is cancelled.
pub fn spawn_all(
    services: &Services,
    config: &WorkersConfig,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let callback_processor = CallbackProcessor::new(
        services.lifecycle_service.clone(),
        config.callback.clone(),
    );
    let tsq_worker = TsqWorker::new(services.lifecycle_service.clone(), config.tsq.clone());
    let reversal_worker =
        ReversalWorker::new(services.lifecycle_service.clone(), config.reversal.clone());
    let deliverer = ClientCallbackDeliverer::new(
        services.client_callback_repo.clone(),
        services.webhook_sender.clone(),
        config.webhook.clone(),
    );

    vec![
        tokio::spawn(callback_processor.run(shutdown.clone())),
        tokio::spawn(tsq_worker.run(shutdown.clone())),
        tokio::spawn(reversal_worker.run(shutdown.clone())),
        tokio::spawn(deliverer.run(shutdown.clone())),
    ]
}
