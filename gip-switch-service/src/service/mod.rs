use std::sync::Arc;

use gip_switch_common::config::DbConfig;
use gip_switch_common::SafeDisplay;

use crate::config::SwitchServiceConfig;
use crate::db;
use crate::gateway::{GatewayError, GipGateway, HttpGipGateway};
use crate::repo::audit::{AuditRepo, DbAuditRepo};
use crate::repo::client_callback::{ClientCallbackRepo, DbClientCallbackRepo};
use crate::repo::gip_callback::{DbGipCallbackRepo, GipCallbackRepo};
use crate::repo::transaction::{DbTransactionRepo, TransactionRepo};
use crate::repo::RepoError;
use crate::service::auth::{AuthError, AuthService};
use crate::service::lifecycle::LifecycleService;
use crate::service::transfer::TransferService;
use crate::webhook::{HttpWebhookSender, WebhookSender};

pub mod auth;
pub mod lifecycle;
pub mod transfer;

#[derive(Clone)]
pub struct Services {
    pub auth_service: Arc<AuthService>,
    pub transfer_service: Arc<TransferService>,
    pub lifecycle_service: Arc<LifecycleService>,
    pub gip_callback_repo: Arc<dyn GipCallbackRepo + Sync + Send>,
    pub client_callback_repo: Arc<dyn ClientCallbackRepo + Sync + Send>,
    pub audit_repo: Arc<dyn AuditRepo + Sync + Send>,
    pub webhook_sender: Arc<dyn WebhookSender + Sync + Send>,
}

impl Services {
    pub async fn new(config: &SwitchServiceConfig) -> Result<Services, String> {
        let (transaction_repo, gip_callback_repo, client_callback_repo, audit_repo) =
            match config.db.clone() {
                DbConfig::Postgres(db_config) => {
                    let db_pool = Arc::new(
                        db::create_postgres_pool(&db_config)
                            .await
                            .map_err(|e| e.to_string())?,
                    );

                    let transaction_repo: Arc<dyn TransactionRepo + Sync + Send> =
                        Arc::new(DbTransactionRepo::new(db_pool.clone()));
                    let gip_callback_repo: Arc<dyn GipCallbackRepo + Sync + Send> =
                        Arc::new(DbGipCallbackRepo::new(db_pool.clone()));
                    let client_callback_repo: Arc<dyn ClientCallbackRepo + Sync + Send> =
                        Arc::new(DbClientCallbackRepo::new(db_pool.clone()));
                    let audit_repo: Arc<dyn AuditRepo + Sync + Send> =
                        Arc::new(DbAuditRepo::new(db_pool.clone()));
                    (
                        transaction_repo,
                        gip_callback_repo,
                        client_callback_repo,
                        audit_repo,
                    )
                }
                DbConfig::Sqlite(db_config) => {
                    let db_pool = Arc::new(
                        db::create_sqlite_pool(&db_config)
                            .await
                            .map_err(|e| e.to_string())?,
                    );

                    let transaction_repo: Arc<dyn TransactionRepo + Sync + Send> =
                        Arc::new(DbTransactionRepo::new(db_pool.clone()));
                    let gip_callback_repo: Arc<dyn GipCallbackRepo + Sync + Send> =
                        Arc::new(DbGipCallbackRepo::new(db_pool.clone()));
                    let client_callback_repo: Arc<dyn ClientCallbackRepo + Sync + Send> =
                        Arc::new(DbClientCallbackRepo::new(db_pool.clone()));
                    let audit_repo: Arc<dyn AuditRepo + Sync + Send> =
                        Arc::new(DbAuditRepo::new(db_pool.clone()));
                    (
                        transaction_repo,
                        gip_callback_repo,
                        client_callback_repo,
                        audit_repo,
                    )
                }
            };

        let gateway: Arc<dyn GipGateway + Sync + Send> = Arc::new(
            HttpGipGateway::new(config.gateway.clone()).map_err(|e| e.to_string())?,
        );

        let webhook_sender: Arc<dyn WebhookSender + Sync + Send> =
            Arc::new(HttpWebhookSender::new(config.workers.webhook.request_timeout)?);

        let auth_service = Arc::new(AuthService::new(&config.institutions));

        let transfer_service = Arc::new(TransferService::new(
            transaction_repo.clone(),
            audit_repo.clone(),
            gateway.clone(),
            config.gateway.dispatch_retries.clone(),
            config.leg_timeouts.clone(),
        ));

        let lifecycle_service = Arc::new(LifecycleService::new(
            transaction_repo.clone(),
            gip_callback_repo.clone(),
            gateway.clone(),
            config.inconclusive_action_codes.iter().cloned().collect(),
            config.workers.tsq.clone(),
            config.workers.reversal.clone(),
            config.workers.webhook.clone(),
            config.leg_timeouts.clone(),
        ));

        Ok(Services {
            auth_service,
            transfer_service,
            lifecycle_service,
            gip_callback_repo,
            client_callback_repo,
            audit_repo,
            webhook_sender,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Duplicate reference: {0}")]
    DuplicateReference(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Gateway unreachable: {0}")]
    GatewayUnreachable(String),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SafeDisplay for TransferError {
    fn to_safe_string(&self) -> String {
        match self {
            TransferError::Unauthorized(_) => self.to_string(),
            TransferError::Validation(_) => self.to_string(),
            TransferError::DuplicateReference(_) => self.to_string(),
            TransferError::NotFound(_) => self.to_string(),
            TransferError::GatewayUnreachable(_) => "Gateway unreachable".to_string(),
            TransferError::InternalRepoError(inner) => inner.to_safe_string(),
            TransferError::Internal(_) => "Internal error".to_string(),
        }
    }
}

impl From<AuthError> for TransferError {
    fn from(error: AuthError) -> Self {
        TransferError::Unauthorized(error.to_string())
    }
}

impl From<GatewayError> for TransferError {
    fn from(error: GatewayError) -> Self {
        TransferError::GatewayUnreachable(error.to_safe_string())
    }
}
