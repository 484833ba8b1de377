use std::sync::Arc;

use chrono::Utc;
use gip_switch_common::config::RetryConfig;
use gip_switch_common::model::{ActionCode, ReferenceNumber, SessionId};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::LegTimeoutsConfig;
use crate::gateway::{GatewayAck, GatewayError, GipGateway, LegDispatch, NameEnquiryDispatch};
use crate::model::{
    format_amount, AuditLevel, GipEventKind, NewTransfer, Transaction, TransactionStatus,
};
use crate::repo::audit::{AuditRepo, NewAuditEntry};
use crate::repo::transaction::{
    NewGipEvent, StateTransition, TransactionRecord, TransactionRepo,
};
use crate::repo::RepoError;
use crate::service::auth::InstitutionContext;
use crate::service::TransferError;

#[derive(Debug, Clone)]
pub struct NameEnquiry {
    pub destination_bank_code: String,
    pub account_number: String,
}

#[derive(Debug, Clone)]
pub struct NameEnquiryResult {
    pub session_id: SessionId,
    pub account_name: Option<String>,
    pub action_code: Option<ActionCode>,
}

#[derive(Debug, Clone)]
pub struct TransferAccepted {
    pub transaction_id: Uuid,
    pub session_id: SessionId,
    pub status: TransactionStatus,
}

#[derive(Debug, Clone)]
pub struct TransactionDetails {
    pub transaction: Transaction,
    pub events: Vec<crate::repo::transaction::GipEventRecord>,
}

/// Intake operations exposed to the HTTP layer: name enquiry, funds
/// transfer, status query.
pub struct TransferService {
    transaction_repo: Arc<dyn TransactionRepo + Sync + Send>,
    audit_repo: Arc<dyn AuditRepo + Sync + Send>,
    gateway: Arc<dyn GipGateway + Sync + Send>,
    dispatch_retries: RetryConfig,
    leg_timeouts: LegTimeoutsConfig,
}

impl TransferService {
    pub fn new(
        transaction_repo: Arc<dyn TransactionRepo + Sync + Send>,
        audit_repo: Arc<dyn AuditRepo + Sync + Send>,
        gateway: Arc<dyn GipGateway + Sync + Send>,
        dispatch_retries: RetryConfig,
        leg_timeouts: LegTimeoutsConfig,
    ) -> Self {
        Self {
            transaction_repo,
            audit_repo,
            gateway,
            dispatch_retries,
            leg_timeouts,
        }
    }

    /// Synchronous account-name lookup. Leaves an audit-log entry but no
    /// transaction row.
    pub async fn name_enquiry(
        &self,
        context: &InstitutionContext,
        enquiry: &NameEnquiry,
    ) -> Result<NameEnquiryResult, TransferError> {
        let session_id = SessionId::generate(&context.participant_code);
        let dispatch = NameEnquiryDispatch {
            session_id: session_id.clone(),
            destination_bank_code: enquiry.destination_bank_code.clone(),
            account_number: enquiry.account_number.clone(),
        };

        let result = tokio::time::timeout(
            self.leg_timeouts.name_enquiry,
            self.gateway.name_enquiry(&dispatch),
        )
        .await
        .unwrap_or(Err(GatewayError::Timeout));

        match result {
            Ok(ack) => {
                self.audit_repo
                    .record(&NewAuditEntry {
                        level: AuditLevel::Info.to_string(),
                        kind: "NAME_ENQUIRY".to_string(),
                        transaction_id: None,
                        message: format!(
                            "Name enquiry by {} for {}@{}: action code {}",
                            context.name,
                            enquiry.account_number,
                            enquiry.destination_bank_code,
                            ack.action_code
                                .as_ref()
                                .map(|code| code.0.as_str())
                                .unwrap_or("-"),
                        ),
                        details: Some(ack.raw.to_string()),
                    })
                    .await?;

                Ok(NameEnquiryResult {
                    session_id,
                    account_name: ack.account_name,
                    action_code: ack.action_code,
                })
            }
            Err(error) => {
                warn!(
                    session_id = %session_id,
                    error = %error,
                    "Name enquiry dispatch failed"
                );
                self.audit_repo
                    .record(&NewAuditEntry {
                        level: AuditLevel::Info.to_string(),
                        kind: "NAME_ENQUIRY".to_string(),
                        transaction_id: None,
                        message: format!(
                            "Name enquiry by {} for {}@{} failed: {}",
                            context.name,
                            enquiry.account_number,
                            enquiry.destination_bank_code,
                            error
                        ),
                        details: None,
                    })
                    .await?;
                Err(error.into())
            }
        }
    }

    /// Persists the transaction and dispatches the debit leg. The row only
    /// advances to FTD_PENDING once the gateway accepted the dispatch;
    /// otherwise it stays INITIATED and the caller sees the failure.
    pub async fn funds_transfer(
        &self,
        context: &InstitutionContext,
        transfer: NewTransfer,
    ) -> Result<TransferAccepted, TransferError> {
        let now = Utc::now();
        let transaction = Transaction {
            id: Uuid::new_v4(),
            institution_id: context.institution_id.clone(),
            credential_id: context.credential_id.clone(),
            reference_number: transfer.reference_number.clone(),
            session_id: SessionId::generate(&context.participant_code),
            source_bank_code: transfer.source_bank_code,
            source_account_number: transfer.source_account_number,
            source_account_name: transfer.source_account_name,
            destination_bank_code: transfer.destination_bank_code,
            destination_account_number: transfer.destination_account_number,
            destination_account_name: transfer.destination_account_name,
            amount: transfer.amount,
            narration: transfer.narration,
            client_callback_url: transfer.client_callback_url,
            status: TransactionStatus::Initiated,
            ftd_action_code: None,
            ftc_action_code: None,
            reversal_action_code: None,
            status_message: None,
            tsq_attempts: 0,
            tsq_next_attempt_at: None,
            reversal_attempts: 0,
            leg_deadline_at: None,
            escalated_at: None,
            created_at: now,
            updated_at: now,
        };

        let record = TransactionRecord::from(transaction.clone());
        self.transaction_repo
            .create(&record)
            .await
            .map_err(|error| match error {
                RepoError::UniqueViolation(_) => TransferError::DuplicateReference(
                    transfer.reference_number.0.clone(),
                ),
                other => TransferError::from(other),
            })?;

        let dispatch = LegDispatch {
            session_id: transaction.session_id.clone(),
            source_bank_code: transaction.source_bank_code.clone(),
            source_account_number: transaction.source_account_number.clone(),
            source_account_name: transaction.source_account_name.clone(),
            destination_bank_code: transaction.destination_bank_code.clone(),
            destination_account_number: transaction.destination_account_number.clone(),
            destination_account_name: transaction.destination_account_name.clone(),
            amount: format_amount(&transaction.amount),
            narration: transaction.narration.clone(),
        };

        let ack = self.dispatch_debit_with_retry(&dispatch).await?;

        let mut transition = StateTransition::new(
            transaction.id,
            TransactionStatus::Initiated,
            TransactionStatus::FtdPending,
        );
        transition.leg_deadline_at = Some(Utc::now() + self.leg_timeouts.ftd_callback);
        transition.events.push(NewGipEvent {
            kind: GipEventKind::FtdRequest,
            session_id: transaction.session_id.0.clone(),
            tracking_number: ack.as_ref().and_then(|a| a.tracking_number.clone()),
            action_code: ack.as_ref().and_then(|a| a.action_code.clone()).map(|c| c.0),
            payload: ack.as_ref().map(|a| a.raw.to_string()),
            outcome: Some("DISPATCHED".to_string()),
        });

        if !self.transaction_repo.apply(&transition).await? {
            return Err(TransferError::Internal(format!(
                "Transaction {} left INITIATED unexpectedly",
                transaction.id
            )));
        }

        info!(
            transaction_id = %transaction.id,
            session_id = %transaction.session_id,
            reference_number = %transaction.reference_number,
            "Debit leg dispatched"
        );

        Ok(TransferAccepted {
            transaction_id: transaction.id,
            session_id: transaction.session_id,
            status: TransactionStatus::FtdPending,
        })
    }

    /// One retry on a transient dispatch failure, then the error surfaces
    /// and the row stays INITIATED. A response we cannot decode still counts
    /// as dispatched: the gateway has the request and will call back.
    async fn dispatch_debit_with_retry(
        &self,
        dispatch: &LegDispatch,
    ) -> Result<Option<GatewayAck>, TransferError> {
        let mut attempt = 0;
        loop {
            match self.gateway.funds_transfer_debit(dispatch).await {
                Ok(ack) => return Ok(Some(ack)),
                Err(GatewayError::InvalidResponse(message)) => {
                    warn!(
                        session_id = %dispatch.session_id,
                        message = %message,
                        "Debit dispatch acknowledged with undecodable response"
                    );
                    return Ok(None);
                }
                Err(error) if error.is_transient() && attempt + 1 < self.dispatch_retries.max_attempts => {
                    warn!(
                        session_id = %dispatch.session_id,
                        attempt = attempt,
                        error = %error,
                        "Debit dispatch failed; retrying"
                    );
                    tokio::time::sleep(self.dispatch_retries.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    pub async fn status_query(
        &self,
        context: &InstitutionContext,
        reference_number: &ReferenceNumber,
    ) -> Result<Transaction, TransferError> {
        let record = self
            .transaction_repo
            .get_by_reference(&context.institution_id.0, &reference_number.0)
            .await?
            .ok_or_else(|| TransferError::NotFound(reference_number.0.clone()))?;
        Transaction::try_from(record).map_err(TransferError::Internal)
    }

    pub async fn get_transaction(
        &self,
        context: &InstitutionContext,
        id: &Uuid,
    ) -> Result<TransactionDetails, TransferError> {
        let record = self
            .transaction_repo
            .get(id)
            .await?
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;

        if record.institution_id != context.institution_id.0 {
            return Err(TransferError::NotFound(id.to_string()));
        }

        let events = self.transaction_repo.events(id).await?;
        let transaction = Transaction::try_from(record).map_err(TransferError::Internal)?;
        Ok(TransactionDetails {
            transaction,
            events,
        })
    }
}
