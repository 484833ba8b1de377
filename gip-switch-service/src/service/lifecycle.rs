use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use gip_switch_common::model::{ActionCode, ActionOutcome, FunctionCode};
use tracing::{error, info, warn};

use crate::config::{
    LegTimeoutsConfig, ReversalWorkerConfig, TsqWorkerConfig, WebhookWorkerConfig,
};
use crate::gateway::{GatewayError, GipGateway, LegDispatch, TsqStatus};
use crate::model::{
    format_amount, tsq_backoff, webhook_backoff, AuditLevel, CallbackStatus,
    ClientCallbackPayload, GipEventKind, Transaction, TransactionStatus, WebhookReason,
    WebhookStatus,
};
use crate::repo::audit::NewAuditEntry;
use crate::repo::client_callback::NewClientCallback;
use crate::repo::gip_callback::{GipCallbackRecord, GipCallbackRepo};
use crate::repo::transaction::{
    CallbackResolution, NewGipEvent, StateTransition, TransactionRepo,
};
use crate::repo::RepoError;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("{0}")]
    Internal(String),
}

/// The transaction lifecycle engine shared by the background workers:
/// routes inbound callbacks, resolves indeterminate legs via TSQ, dispatches
/// credit legs and compensating reversals, escalates what cannot be
/// resolved automatically.
pub struct LifecycleService {
    transaction_repo: Arc<dyn TransactionRepo + Sync + Send>,
    gip_callback_repo: Arc<dyn GipCallbackRepo + Sync + Send>,
    gateway: Arc<dyn GipGateway + Sync + Send>,
    inconclusive_codes: HashSet<String>,
    tsq: TsqWorkerConfig,
    reversal: ReversalWorkerConfig,
    webhook: WebhookWorkerConfig,
    leg_timeouts: LegTimeoutsConfig,
}

impl LifecycleService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transaction_repo: Arc<dyn TransactionRepo + Sync + Send>,
        gip_callback_repo: Arc<dyn GipCallbackRepo + Sync + Send>,
        gateway: Arc<dyn GipGateway + Sync + Send>,
        inconclusive_codes: HashSet<String>,
        tsq: TsqWorkerConfig,
        reversal: ReversalWorkerConfig,
        webhook: WebhookWorkerConfig,
        leg_timeouts: LegTimeoutsConfig,
    ) -> Self {
        Self {
            transaction_repo,
            gip_callback_repo,
            gateway,
            inconclusive_codes,
            tsq,
            reversal,
            webhook,
            leg_timeouts,
        }
    }

    // --- Callback processing -------------------------------------------------

    /// One processor tick: routes a batch of pending callbacks. A failing
    /// callback is marked ERROR and does not stop the batch.
    pub async fn process_callbacks(&self, batch_size: i64) -> Result<usize, LifecycleError> {
        let batch = self.gip_callback_repo.fetch_batch(batch_size).await?;
        let mut processed = 0;
        for callback in batch {
            let callback_id = callback.id;
            match self.process_callback(&callback).await {
                Ok(()) => processed += 1,
                Err(error) => {
                    error!(
                        callback_id = %callback_id,
                        session_id = %callback.session_id,
                        error = %error,
                        "Callback processing failed"
                    );
                    self.gip_callback_repo
                        .resolve(
                            &callback_id,
                            &CallbackStatus::Error.to_string(),
                            Some(error.to_string()),
                        )
                        .await?;
                }
            }
        }
        Ok(processed)
    }

    async fn process_callback(&self, callback: &GipCallbackRecord) -> Result<(), LifecycleError> {
        let function_code = match FunctionCode::from_str(&callback.function_code) {
            Ok(code) => code,
            Err(_) => {
                return self
                    .ignore_callback(callback, "Unknown function code")
                    .await;
            }
        };

        let record = self
            .transaction_repo
            .get_by_session(&callback.session_id)
            .await?;
        let transaction = match record {
            Some(record) => Transaction::try_from(record).map_err(LifecycleError::Internal)?,
            None => {
                return self
                    .ignore_callback(callback, "No transaction for session")
                    .await;
            }
        };

        match function_code {
            FunctionCode::FundsTransferDebit => self.handle_ftd_callback(&transaction, callback).await,
            FunctionCode::FundsTransferCredit => self.handle_ftc_callback(&transaction, callback).await,
            FunctionCode::Reversal => self.handle_reversal_callback(&transaction, callback).await,
            _ => self.ignore_callback(callback, "Unexpected function code").await,
        }
    }

    async fn ignore_callback(
        &self,
        callback: &GipCallbackRecord,
        reason: &str,
    ) -> Result<(), LifecycleError> {
        info!(
            callback_id = %callback.id,
            session_id = %callback.session_id,
            reason = reason,
            "Ignoring callback"
        );
        self.gip_callback_repo
            .resolve(
                &callback.id,
                &CallbackStatus::Ignored.to_string(),
                Some(reason.to_string()),
            )
            .await?;
        Ok(())
    }

    /// A duplicate or late callback: kept in the event log, no state change.
    async fn ignore_duplicate(
        &self,
        transaction: &Transaction,
        callback: &GipCallbackRecord,
        kind: GipEventKind,
    ) -> Result<(), LifecycleError> {
        self.transaction_repo
            .record_event(
                &transaction.id,
                &NewGipEvent {
                    kind,
                    session_id: callback.session_id.clone(),
                    tracking_number: callback.tracking_number.clone(),
                    action_code: Some(callback.action_code.clone()),
                    payload: callback.payload.clone(),
                    outcome: Some("IGNORED".to_string()),
                },
            )
            .await?;
        self.ignore_callback(callback, "Leg already resolved").await
    }

    fn callback_event(&self, kind: GipEventKind, callback: &GipCallbackRecord, outcome: &str) -> NewGipEvent {
        NewGipEvent {
            kind,
            session_id: callback.session_id.clone(),
            tracking_number: callback.tracking_number.clone(),
            action_code: Some(callback.action_code.clone()),
            payload: callback.payload.clone(),
            outcome: Some(outcome.to_string()),
        }
    }

    fn processed(&self, callback: &GipCallbackRecord) -> CallbackResolution {
        CallbackResolution {
            callback_id: callback.id,
            status: CallbackStatus::Processed.to_string(),
            error: None,
        }
    }

    async fn handle_ftd_callback(
        &self,
        transaction: &Transaction,
        callback: &GipCallbackRecord,
    ) -> Result<(), LifecycleError> {
        if transaction.status != TransactionStatus::FtdPending {
            return self
                .ignore_duplicate(transaction, callback, GipEventKind::FtdCallback)
                .await;
        }

        let action_code = ActionCode(callback.action_code.clone());
        match action_code.classify(&self.inconclusive_codes) {
            ActionOutcome::Success => {
                let mut transition = StateTransition::new(
                    transaction.id,
                    TransactionStatus::FtdPending,
                    TransactionStatus::FtdSuccess,
                );
                transition.ftd_action_code = Some(action_code.0.clone());
                transition.clear_leg_deadline = true;
                transition.status_message = Some("Debit confirmed".to_string());
                transition
                    .events
                    .push(self.callback_event(GipEventKind::FtdCallback, callback, "SUCCESS"));
                transition.resolve_callback = Some(self.processed(callback));

                if self.transaction_repo.apply(&transition).await? {
                    info!(
                        transaction_id = %transaction.id,
                        session_id = %transaction.session_id,
                        "Debit leg confirmed; dispatching credit leg"
                    );
                    self.dispatch_credit(transaction).await;
                }
                Ok(())
            }
            ActionOutcome::Inconclusive => {
                self.schedule_tsq(
                    transaction,
                    callback,
                    TransactionStatus::FtdTsq,
                    GipEventKind::FtdCallback,
                    action_code,
                )
                .await
            }
            ActionOutcome::Failure => {
                let mut transition = StateTransition::new(
                    transaction.id,
                    TransactionStatus::FtdPending,
                    TransactionStatus::FtdFailed,
                );
                transition.ftd_action_code = Some(action_code.0.clone());
                transition.clear_leg_deadline = true;
                transition.status_message =
                    Some(format!("Debit failed with action code {}", action_code));
                transition
                    .events
                    .push(self.callback_event(GipEventKind::FtdCallback, callback, "FAILED"));
                transition.resolve_callback = Some(self.processed(callback));
                transition.enqueue_webhook = self.webhook_request(
                    transaction,
                    WebhookStatus::Failed,
                    Some(WebhookReason::FtdFailed),
                    Some(action_code.0.clone()),
                    "Debit leg failed",
                );

                if self.transaction_repo.apply(&transition).await? {
                    warn!(
                        transaction_id = %transaction.id,
                        session_id = %transaction.session_id,
                        action_code = %action_code,
                        "Debit leg failed"
                    );
                }
                Ok(())
            }
        }
    }

    async fn handle_ftc_callback(
        &self,
        transaction: &Transaction,
        callback: &GipCallbackRecord,
    ) -> Result<(), LifecycleError> {
        if transaction.status != TransactionStatus::FtcPending {
            return self
                .ignore_duplicate(transaction, callback, GipEventKind::FtcCallback)
                .await;
        }

        let action_code = ActionCode(callback.action_code.clone());
        match action_code.classify(&self.inconclusive_codes) {
            ActionOutcome::Success => {
                let mut transition = StateTransition::new(
                    transaction.id,
                    TransactionStatus::FtcPending,
                    TransactionStatus::FtcSuccess,
                );
                transition.ftc_action_code = Some(action_code.0.clone());
                transition.clear_leg_deadline = true;
                transition.status_message = Some("Credit confirmed".to_string());
                transition
                    .events
                    .push(self.callback_event(GipEventKind::FtcCallback, callback, "SUCCESS"));
                transition.resolve_callback = Some(self.processed(callback));

                if self.transaction_repo.apply(&transition).await? {
                    self.complete_transfer(transaction, Some(action_code.0.clone()))
                        .await?;
                }
                Ok(())
            }
            ActionOutcome::Inconclusive => {
                self.schedule_tsq(
                    transaction,
                    callback,
                    TransactionStatus::FtcTsq,
                    GipEventKind::FtcCallback,
                    action_code,
                )
                .await
            }
            ActionOutcome::Failure => {
                let mut transition = StateTransition::new(
                    transaction.id,
                    TransactionStatus::FtcPending,
                    TransactionStatus::FtcFailed,
                );
                transition.ftc_action_code = Some(action_code.0.clone());
                transition.clear_leg_deadline = true;
                transition.status_message = Some(format!(
                    "Credit failed with action code {}; reversal required",
                    action_code
                ));
                transition
                    .events
                    .push(self.callback_event(GipEventKind::FtcCallback, callback, "FAILED"));
                transition.resolve_callback = Some(self.processed(callback));

                if self.transaction_repo.apply(&transition).await? {
                    warn!(
                        transaction_id = %transaction.id,
                        session_id = %transaction.session_id,
                        action_code = %action_code,
                        "Credit leg failed; reversal required"
                    );
                }
                Ok(())
            }
        }
    }

    async fn handle_reversal_callback(
        &self,
        transaction: &Transaction,
        callback: &GipCallbackRecord,
    ) -> Result<(), LifecycleError> {
        if transaction.status != TransactionStatus::ReversalPending {
            return self
                .ignore_duplicate(transaction, callback, GipEventKind::ReversalCallback)
                .await;
        }

        let action_code = ActionCode(callback.action_code.clone());
        if action_code.is_success() {
            let mut transition = StateTransition::new(
                transaction.id,
                TransactionStatus::ReversalPending,
                TransactionStatus::ReversalSuccess,
            );
            transition.reversal_action_code = Some(action_code.0.clone());
            transition.clear_leg_deadline = true;
            transition.status_message = Some("Reversal confirmed".to_string());
            transition
                .events
                .push(self.callback_event(GipEventKind::ReversalCallback, callback, "SUCCESS"));
            transition.resolve_callback = Some(self.processed(callback));

            if self.transaction_repo.apply(&transition).await? {
                self.fail_reversed(transaction, Some(action_code.0.clone()))
                    .await?;
            }
            Ok(())
        } else {
            let mut transition = StateTransition::new(
                transaction.id,
                TransactionStatus::ReversalPending,
                TransactionStatus::ReversalFailed,
            );
            transition.reversal_action_code = Some(action_code.0.clone());
            transition.clear_leg_deadline = true;
            transition.status_message =
                Some(format!("Reversal failed with action code {}", action_code));
            transition
                .events
                .push(self.callback_event(GipEventKind::ReversalCallback, callback, "FAILED"));
            transition.resolve_callback = Some(self.processed(callback));
            transition.audit = Some(NewAuditEntry {
                level: AuditLevel::Critical.to_string(),
                kind: "REVERSAL_FAILED".to_string(),
                transaction_id: Some(transaction.id),
                message: format!(
                    "Reversal failed for session {} with action code {}; manual intervention required",
                    transaction.session_id, action_code
                ),
                details: callback.payload.clone(),
            });

            if self.transaction_repo.apply(&transition).await? {
                error!(
                    transaction_id = %transaction.id,
                    session_id = %transaction.session_id,
                    action_code = %action_code,
                    "Reversal failed; manual intervention required"
                );
            }
            Ok(())
        }
    }

    async fn schedule_tsq(
        &self,
        transaction: &Transaction,
        callback: &GipCallbackRecord,
        tsq_status: TransactionStatus,
        event_kind: GipEventKind,
        action_code: ActionCode,
    ) -> Result<(), LifecycleError> {
        let mut transition =
            StateTransition::new(transaction.id, transaction.status, tsq_status);
        match tsq_status {
            TransactionStatus::FtdTsq => transition.ftd_action_code = Some(action_code.0.clone()),
            _ => transition.ftc_action_code = Some(action_code.0.clone()),
        }
        transition.clear_leg_deadline = true;
        transition.tsq_next_attempt_at = Some(Utc::now() + self.tsq.base_interval);
        transition.status_message = Some(format!(
            "Inconclusive action code {:?}; status query scheduled",
            action_code.0
        ));
        transition
            .events
            .push(self.callback_event(event_kind, callback, "INCONCLUSIVE"));
        transition.resolve_callback = Some(self.processed(callback));

        if self.transaction_repo.apply(&transition).await? {
            info!(
                transaction_id = %transaction.id,
                session_id = %transaction.session_id,
                status = %tsq_status,
                "Leg inconclusive; TSQ scheduled"
            );
        }
        Ok(())
    }

    // --- Terminal folds ------------------------------------------------------

    /// FTC_SUCCESS is an audit waypoint; the externally observable terminal
    /// state is COMPLETED, reached here together with the webhook enqueue.
    async fn complete_transfer(
        &self,
        transaction: &Transaction,
        action_code: Option<String>,
    ) -> Result<bool, LifecycleError> {
        let mut transition = StateTransition::new(
            transaction.id,
            TransactionStatus::FtcSuccess,
            TransactionStatus::Completed,
        );
        transition.status_message = Some("Transfer completed".to_string());
        transition.enqueue_webhook = self.webhook_request(
            transaction,
            WebhookStatus::Success,
            None,
            action_code,
            "Transfer completed",
        );

        let applied = self.transaction_repo.apply(&transition).await?;
        if applied {
            info!(
                transaction_id = %transaction.id,
                session_id = %transaction.session_id,
                "Transfer completed"
            );
        }
        Ok(applied)
    }

    /// REVERSAL_SUCCESS folds into the terminal FAILED, carrying the
    /// REVERSED notification.
    async fn fail_reversed(
        &self,
        transaction: &Transaction,
        action_code: Option<String>,
    ) -> Result<bool, LifecycleError> {
        let mut transition = StateTransition::new(
            transaction.id,
            TransactionStatus::ReversalSuccess,
            TransactionStatus::Failed,
        );
        transition.status_message = Some("Credit failed; debit reversed".to_string());
        transition.enqueue_webhook = self.webhook_request(
            transaction,
            WebhookStatus::Failed,
            Some(WebhookReason::Reversed),
            action_code,
            "Credit leg failed; the debit was reversed",
        );

        let applied = self.transaction_repo.apply(&transition).await?;
        if applied {
            info!(
                transaction_id = %transaction.id,
                session_id = %transaction.session_id,
                "Transaction failed after successful reversal"
            );
        }
        Ok(applied)
    }

    /// Completes folds that a crash may have left behind: FTC_SUCCESS and
    /// REVERSAL_SUCCESS rows whose terminal transition never committed.
    pub async fn fold_terminal_states(&self, limit: i64) -> Result<(), LifecycleError> {
        for record in self
            .transaction_repo
            .list_by_status(&TransactionStatus::FtcSuccess.to_string(), limit)
            .await?
        {
            let transaction = Transaction::try_from(record).map_err(LifecycleError::Internal)?;
            let action_code = transaction.ftc_action_code.as_ref().map(|c| c.0.clone());
            self.complete_transfer(&transaction, action_code).await?;
        }

        for record in self
            .transaction_repo
            .list_by_status(&TransactionStatus::ReversalSuccess.to_string(), limit)
            .await?
        {
            let transaction = Transaction::try_from(record).map_err(LifecycleError::Internal)?;
            let action_code = transaction.reversal_action_code.as_ref().map(|c| c.0.clone());
            self.fail_reversed(&transaction, action_code).await?;
        }

        Ok(())
    }

    // --- Credit dispatch -----------------------------------------------------

    /// Dispatches the credit leg for rows sitting in FTD_SUCCESS. Called
    /// directly after a debit confirmation and from the processor's sweep,
    /// so a dispatch failure is retried on the next tick.
    pub async fn dispatch_pending_credits(&self, limit: i64) -> Result<usize, LifecycleError> {
        let records = self
            .transaction_repo
            .list_by_status(&TransactionStatus::FtdSuccess.to_string(), limit)
            .await?;
        let mut dispatched = 0;
        for record in records {
            let transaction = Transaction::try_from(record).map_err(LifecycleError::Internal)?;
            if self.dispatch_credit(&transaction).await {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    async fn dispatch_credit(&self, transaction: &Transaction) -> bool {
        let dispatch = self.leg_dispatch(transaction);
        let ack = match self.gateway.funds_transfer_credit(&dispatch).await {
            Ok(ack) => Some(ack),
            Err(GatewayError::InvalidResponse(message)) => {
                warn!(
                    transaction_id = %transaction.id,
                    message = %message,
                    "Credit dispatch acknowledged with undecodable response"
                );
                None
            }
            Err(error) => {
                warn!(
                    transaction_id = %transaction.id,
                    session_id = %transaction.session_id,
                    error = %error,
                    "Credit dispatch failed; will retry"
                );
                return false;
            }
        };

        let mut transition = StateTransition::new(
            transaction.id,
            TransactionStatus::FtdSuccess,
            TransactionStatus::FtcPending,
        );
        transition.leg_deadline_at = Some(Utc::now() + self.leg_timeouts.ftc_callback);
        transition.events.push(NewGipEvent {
            kind: GipEventKind::FtcRequest,
            session_id: transaction.session_id.0.clone(),
            tracking_number: ack.as_ref().and_then(|a| a.tracking_number.clone()),
            action_code: ack
                .as_ref()
                .and_then(|a| a.action_code.clone())
                .map(|c| c.0),
            payload: ack.as_ref().map(|a| a.raw.to_string()),
            outcome: Some("DISPATCHED".to_string()),
        });

        match self.transaction_repo.apply(&transition).await {
            Ok(applied) => {
                if applied {
                    info!(
                        transaction_id = %transaction.id,
                        session_id = %transaction.session_id,
                        "Credit leg dispatched"
                    );
                }
                applied
            }
            Err(error) => {
                error!(
                    transaction_id = %transaction.id,
                    error = %error,
                    "Failed to record credit dispatch"
                );
                false
            }
        }
    }

    // --- Timeouts and TSQ ----------------------------------------------------

    /// Marks pending legs whose callback deadline has passed; a TSQ is
    /// scheduled immediately to resolve them.
    pub async fn sweep_timeouts(&self, limit: i64) -> Result<usize, LifecycleError> {
        let now = Utc::now();
        let records = self.transaction_repo.pending_past_deadline(&now, limit).await?;
        let mut timed_out = 0;
        for record in records {
            let transaction = Transaction::try_from(record).map_err(LifecycleError::Internal)?;
            let mut transition = StateTransition::new(
                transaction.id,
                transaction.status,
                TransactionStatus::Timeout,
            );
            transition.clear_leg_deadline = true;
            transition.tsq_next_attempt_at = Some(now);
            transition.status_message = Some(format!(
                "No callback received while {}; escalating to status query",
                transaction.status
            ));

            if self.transaction_repo.apply(&transition).await? {
                warn!(
                    transaction_id = %transaction.id,
                    session_id = %transaction.session_id,
                    previous_status = %transaction.status,
                    "Leg timed out waiting for callback"
                );
                timed_out += 1;
            }
        }
        Ok(timed_out)
    }

    /// One TSQ worker tick over the due rows.
    pub async fn run_tsq_batch(&self, limit: i64) -> Result<usize, LifecycleError> {
        let now = Utc::now();
        let records = self.transaction_repo.due_for_tsq(&now, limit).await?;
        let mut queried = 0;
        for record in records {
            let transaction = Transaction::try_from(record).map_err(LifecycleError::Internal)?;
            match self.process_tsq(transaction).await {
                Ok(true) => queried += 1,
                Ok(false) => {}
                Err(error) => {
                    error!(error = %error, "TSQ processing failed");
                }
            }
        }
        Ok(queried)
    }

    async fn process_tsq(&self, mut transaction: Transaction) -> Result<bool, LifecycleError> {
        // A TIMEOUT row first becomes the TSQ state of its unresolved leg.
        if transaction.status == TransactionStatus::Timeout {
            let tsq_status = if transaction.debit_leg_resolved() {
                TransactionStatus::FtcTsq
            } else {
                TransactionStatus::FtdTsq
            };
            let transition =
                StateTransition::new(transaction.id, TransactionStatus::Timeout, tsq_status);
            if !self.transaction_repo.apply(&transition).await? {
                return Ok(false);
            }
            transaction.status = tsq_status;
        }

        self.transaction_repo
            .record_event(
                &transaction.id,
                &NewGipEvent {
                    kind: GipEventKind::TsqRequest,
                    session_id: transaction.session_id.0.clone(),
                    tracking_number: None,
                    action_code: None,
                    payload: None,
                    outcome: Some("DISPATCHED".to_string()),
                },
            )
            .await?;

        let status = match self.gateway.status_query(&transaction.session_id).await {
            Ok(status) => status,
            Err(error) => {
                warn!(
                    transaction_id = %transaction.id,
                    session_id = %transaction.session_id,
                    error = %error,
                    "Status query failed; will retry"
                );
                return Ok(false);
            }
        };

        self.apply_tsq_response(&transaction, &status).await?;
        Ok(true)
    }

    async fn apply_tsq_response(
        &self,
        transaction: &Transaction,
        status: &TsqStatus,
    ) -> Result<(), LifecycleError> {
        let attempts = transaction.tsq_attempts + 1;
        let response_event = NewGipEvent {
            kind: GipEventKind::TsqResponse,
            session_id: transaction.session_id.0.clone(),
            tracking_number: None,
            action_code: Some(status.action_code.clone()),
            payload: Some(status.raw.to_string()),
            outcome: Some(status.code_pair()),
        };
        let debit_leg = transaction.status == TransactionStatus::FtdTsq;

        match (status.response_code.as_str(), status.action_code.as_str()) {
            ("000", "000") => {
                if debit_leg {
                    let mut transition = StateTransition::new(
                        transaction.id,
                        TransactionStatus::FtdTsq,
                        TransactionStatus::FtdSuccess,
                    );
                    transition.ftd_action_code = Some("000".to_string());
                    transition.tsq_attempts = Some(attempts as i32);
                    transition.clear_tsq_schedule = true;
                    transition.status_message =
                        Some("Debit confirmed by status query".to_string());
                    transition.events.push(response_event);

                    if self.transaction_repo.apply(&transition).await? {
                        info!(
                            transaction_id = %transaction.id,
                            "Status query confirmed debit; dispatching credit leg"
                        );
                        self.dispatch_credit(transaction).await;
                    }
                } else {
                    let mut transition = StateTransition::new(
                        transaction.id,
                        TransactionStatus::FtcTsq,
                        TransactionStatus::FtcSuccess,
                    );
                    transition.ftc_action_code = Some("000".to_string());
                    transition.tsq_attempts = Some(attempts as i32);
                    transition.clear_tsq_schedule = true;
                    transition.status_message =
                        Some("Credit confirmed by status query".to_string());
                    transition.events.push(response_event);

                    if self.transaction_repo.apply(&transition).await? {
                        self.complete_transfer(transaction, Some("000".to_string()))
                            .await?;
                    }
                }
            }
            ("000", "381") => {
                if debit_leg {
                    let mut transition = StateTransition::new(
                        transaction.id,
                        TransactionStatus::FtdTsq,
                        TransactionStatus::FtdFailed,
                    );
                    transition.ftd_action_code = Some(status.action_code.clone());
                    transition.tsq_attempts = Some(attempts as i32);
                    transition.clear_tsq_schedule = true;
                    transition.status_message =
                        Some("Debit not found at receiver; leg failed".to_string());
                    transition.events.push(response_event);
                    transition.enqueue_webhook = self.webhook_request(
                        transaction,
                        WebhookStatus::Failed,
                        Some(WebhookReason::FtdFailed),
                        Some(status.action_code.clone()),
                        "Debit leg failed",
                    );
                    self.transaction_repo.apply(&transition).await?;
                } else {
                    let mut transition = StateTransition::new(
                        transaction.id,
                        TransactionStatus::FtcTsq,
                        TransactionStatus::FtcFailed,
                    );
                    transition.ftc_action_code = Some(status.action_code.clone());
                    transition.tsq_attempts = Some(attempts as i32);
                    transition.clear_tsq_schedule = true;
                    transition.status_message =
                        Some("Credit not found at receiver; reversal required".to_string());
                    transition.events.push(response_event);
                    self.transaction_repo.apply(&transition).await?;
                }
            }
            _ => {
                // Still indeterminate ("000/990" and anything unexpected).
                if attempts >= self.tsq.max_attempts {
                    let mut transition = StateTransition::new(
                        transaction.id,
                        transaction.status,
                        transaction.status,
                    );
                    transition.tsq_attempts = Some(attempts as i32);
                    transition.clear_tsq_schedule = true;
                    transition.escalated_at = Some(Utc::now());
                    transition.status_message = Some(format!(
                        "Status query attempts exhausted; last response {}",
                        status.code_pair()
                    ));
                    transition.events.push(response_event);
                    transition.audit = Some(NewAuditEntry {
                        level: AuditLevel::Critical.to_string(),
                        kind: "TSQ_EXHAUSTED".to_string(),
                        transaction_id: Some(transaction.id),
                        message: format!(
                            "Status query attempts exhausted for session {}; last response {}",
                            transaction.session_id,
                            status.code_pair()
                        ),
                        details: Some(status.raw.to_string()),
                    });
                    self.transaction_repo.apply(&transition).await?;
                    error!(
                        transaction_id = %transaction.id,
                        session_id = %transaction.session_id,
                        last_response = %status.code_pair(),
                        "Status query attempts exhausted; manual intervention required"
                    );
                } else {
                    let delay =
                        tsq_backoff(self.tsq.base_interval, attempts, self.tsq.max_interval);
                    let mut transition = StateTransition::new(
                        transaction.id,
                        transaction.status,
                        transaction.status,
                    );
                    transition.tsq_attempts = Some(attempts as i32);
                    transition.tsq_next_attempt_at = Some(Utc::now() + delay);
                    transition.status_message = Some(format!(
                        "Status query still indeterminate ({}); retrying",
                        status.code_pair()
                    ));
                    transition.events.push(response_event);
                    self.transaction_repo.apply(&transition).await?;
                }
            }
        }

        Ok(())
    }

    // --- Reversals -----------------------------------------------------------

    /// One reversal worker tick: dispatches reversals for failed credit
    /// legs and re-dispatches or escalates reversals whose callback never
    /// arrived.
    pub async fn run_reversal_batch(&self, limit: i64) -> Result<usize, LifecycleError> {
        // Staleness is judged against the tick start, so a reversal
        // dispatched within this tick is never re-selected by it.
        let now = Utc::now();
        let mut dispatched = 0;

        for record in self
            .transaction_repo
            .list_by_status(&TransactionStatus::FtcFailed.to_string(), limit)
            .await?
        {
            let transaction = Transaction::try_from(record).map_err(LifecycleError::Internal)?;
            if self
                .dispatch_reversal(&transaction, TransactionStatus::FtcFailed)
                .await?
            {
                dispatched += 1;
            }
        }

        for record in self.transaction_repo.stale_reversals(&now, limit).await? {
            let transaction = Transaction::try_from(record).map_err(LifecycleError::Internal)?;
            if transaction.reversal_attempts < self.reversal.max_attempts {
                if self
                    .dispatch_reversal(&transaction, TransactionStatus::ReversalPending)
                    .await?
                {
                    dispatched += 1;
                }
            } else {
                self.escalate_reversal(&transaction).await?;
            }
        }

        Ok(dispatched)
    }

    async fn dispatch_reversal(
        &self,
        transaction: &Transaction,
        from: TransactionStatus,
    ) -> Result<bool, LifecycleError> {
        let dispatch = self.leg_dispatch(transaction);
        let ack = match self.gateway.reversal(&dispatch).await {
            Ok(ack) => Some(ack),
            Err(GatewayError::InvalidResponse(message)) => {
                warn!(
                    transaction_id = %transaction.id,
                    message = %message,
                    "Reversal dispatch acknowledged with undecodable response"
                );
                None
            }
            Err(error) => {
                warn!(
                    transaction_id = %transaction.id,
                    session_id = %transaction.session_id,
                    error = %error,
                    "Reversal dispatch failed; will retry"
                );
                return Ok(false);
            }
        };

        let attempts = transaction.reversal_attempts + 1;
        let mut transition =
            StateTransition::new(transaction.id, from, TransactionStatus::ReversalPending);
        transition.reversal_attempts = Some(attempts as i32);
        transition.leg_deadline_at = Some(Utc::now() + self.reversal.callback_timeout);
        transition.status_message = Some(format!("Reversal dispatched (attempt {attempts})"));
        transition.events.push(NewGipEvent {
            kind: GipEventKind::ReversalRequest,
            session_id: transaction.session_id.0.clone(),
            tracking_number: ack.as_ref().and_then(|a| a.tracking_number.clone()),
            action_code: ack
                .as_ref()
                .and_then(|a| a.action_code.clone())
                .map(|c| c.0),
            payload: ack.as_ref().map(|a| a.raw.to_string()),
            outcome: Some("DISPATCHED".to_string()),
        });

        let applied = self.transaction_repo.apply(&transition).await?;
        if applied {
            info!(
                transaction_id = %transaction.id,
                session_id = %transaction.session_id,
                attempt = attempts,
                "Reversal dispatched"
            );
        }
        Ok(applied)
    }

    /// All reversal attempts exhausted with no callback: hold the row and
    /// raise one critical alert for the operator queue.
    async fn escalate_reversal(&self, transaction: &Transaction) -> Result<(), LifecycleError> {
        let mut transition = StateTransition::new(
            transaction.id,
            TransactionStatus::ReversalPending,
            TransactionStatus::ReversalPending,
        );
        transition.escalated_at = Some(Utc::now());
        transition.status_message = Some(format!(
            "Reversal attempts exhausted after {} tries",
            transaction.reversal_attempts
        ));
        transition.audit = Some(NewAuditEntry {
            level: AuditLevel::Critical.to_string(),
            kind: "REVERSAL_EXHAUSTED".to_string(),
            transaction_id: Some(transaction.id),
            message: format!(
                "Reversal attempts exhausted for session {}; manual intervention required",
                transaction.session_id
            ),
            details: None,
        });

        if self.transaction_repo.apply(&transition).await? {
            error!(
                transaction_id = %transaction.id,
                session_id = %transaction.session_id,
                attempts = transaction.reversal_attempts,
                "Reversal attempts exhausted; manual intervention required"
            );
        }
        Ok(())
    }

    // --- Janitor -------------------------------------------------------------

    /// INITIATED rows whose debit dispatch never succeeded and that are
    /// older than the transaction timeout are surfaced once in the audit
    /// log.
    pub async fn sweep_stale_initiated(&self, limit: i64) -> Result<(), LifecycleError> {
        let cutoff = Utc::now() - self.leg_timeouts.transaction;
        for record in self
            .transaction_repo
            .stale_initiated(&cutoff, limit)
            .await?
        {
            let transaction = Transaction::try_from(record).map_err(LifecycleError::Internal)?;
            let mut transition = StateTransition::new(
                transaction.id,
                TransactionStatus::Initiated,
                TransactionStatus::Initiated,
            );
            transition.escalated_at = Some(Utc::now());
            transition.audit = Some(NewAuditEntry {
                level: AuditLevel::Info.to_string(),
                kind: "STALE_INITIATED".to_string(),
                transaction_id: Some(transaction.id),
                message: format!(
                    "Transaction {} never left INITIATED; debit dispatch was not accepted",
                    transaction.reference_number
                ),
                details: None,
            });
            self.transaction_repo.apply(&transition).await?;
        }
        Ok(())
    }

    // --- Helpers -------------------------------------------------------------

    fn leg_dispatch(&self, transaction: &Transaction) -> LegDispatch {
        LegDispatch {
            session_id: transaction.session_id.clone(),
            source_bank_code: transaction.source_bank_code.clone(),
            source_account_number: transaction.source_account_number.clone(),
            source_account_name: transaction.source_account_name.clone(),
            destination_bank_code: transaction.destination_bank_code.clone(),
            destination_account_number: transaction.destination_account_number.clone(),
            destination_account_name: transaction.destination_account_name.clone(),
            amount: format_amount(&transaction.amount),
            narration: transaction.narration.clone(),
        }
    }

    /// None when the institution did not register a webhook URL.
    fn webhook_request(
        &self,
        transaction: &Transaction,
        status: WebhookStatus,
        reason: Option<WebhookReason>,
        action_code: Option<String>,
        message: &str,
    ) -> Option<NewClientCallback> {
        let url = transaction
            .client_callback_url
            .clone()
            .filter(|url| !url.is_empty())?;

        let payload = ClientCallbackPayload {
            status,
            transaction_id: transaction.id,
            reference_number: transaction.reference_number.0.clone(),
            session_id: transaction.session_id.0.clone(),
            action_code,
            amount: format_amount(&transaction.amount),
            message: message.to_string(),
            reason,
        };
        let payload = match serde_json::to_string(&payload) {
            Ok(payload) => payload,
            Err(error) => {
                error!(
                    transaction_id = %transaction.id,
                    error = %error,
                    "Failed to serialize webhook payload"
                );
                return None;
            }
        };

        let delay = webhook_backoff(
            self.webhook.initial_delay,
            self.webhook.backoff_multiplier,
            0,
            self.webhook.max_delay,
        );
        Some(NewClientCallback {
            url,
            payload,
            max_attempts: self.webhook.max_attempts as i32,
            next_attempt_at: Utc::now() + delay,
        })
    }
}
