use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use gip_switch_common::model::{
    ActionCode, CredentialId, InstitutionId, ReferenceNumber, SessionId,
};
use sqlx::{Database, Pool};
use uuid::Uuid;

use crate::model::{
    format_amount, GipEventKind, Transaction, TransactionStatus,
};
use crate::repo::audit::NewAuditEntry;
use crate::repo::client_callback::NewClientCallback;
use crate::repo::RepoError;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub institution_id: Uuid,
    pub credential_id: Uuid,
    pub reference_number: String,
    pub session_id: String,
    pub source_bank_code: String,
    pub source_account_number: String,
    pub source_account_name: String,
    pub destination_bank_code: String,
    pub destination_account_number: String,
    pub destination_account_name: String,
    pub amount: String,
    pub narration: String,
    pub client_callback_url: Option<String>,
    pub status: String,
    pub ftd_action_code: Option<String>,
    pub ftc_action_code: Option<String>,
    pub reversal_action_code: Option<String>,
    pub status_message: Option<String>,
    pub tsq_attempts: i32,
    pub tsq_next_attempt_at: Option<DateTime<Utc>>,
    pub reversal_attempts: i32,
    pub leg_deadline_at: Option<DateTime<Utc>>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRecord> for Transaction {
    type Error = String;

    fn try_from(value: TransactionRecord) -> Result<Self, Self::Error> {
        let status = TransactionStatus::from_str(&value.status)
            .map_err(|_| format!("Invalid transaction status: {}", value.status))?;
        let amount = BigDecimal::from_str(&value.amount)
            .map_err(|_| format!("Invalid transaction amount: {}", value.amount))?;
        Ok(Transaction {
            id: value.id,
            institution_id: InstitutionId(value.institution_id),
            credential_id: CredentialId(value.credential_id),
            reference_number: ReferenceNumber(value.reference_number),
            session_id: SessionId(value.session_id),
            source_bank_code: value.source_bank_code,
            source_account_number: value.source_account_number,
            source_account_name: value.source_account_name,
            destination_bank_code: value.destination_bank_code,
            destination_account_number: value.destination_account_number,
            destination_account_name: value.destination_account_name,
            amount,
            narration: value.narration,
            client_callback_url: value.client_callback_url,
            status,
            ftd_action_code: value.ftd_action_code.map(ActionCode),
            ftc_action_code: value.ftc_action_code.map(ActionCode),
            reversal_action_code: value.reversal_action_code.map(ActionCode),
            status_message: value.status_message,
            tsq_attempts: value.tsq_attempts as u32,
            tsq_next_attempt_at: value.tsq_next_attempt_at,
            reversal_attempts: value.reversal_attempts as u32,
            leg_deadline_at: value.leg_deadline_at,
            escalated_at: value.escalated_at,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

impl From<Transaction> for TransactionRecord {
    fn from(value: Transaction) -> Self {
        Self {
            id: value.id,
            institution_id: value.institution_id.0,
            credential_id: value.credential_id.0,
            reference_number: value.reference_number.0,
            session_id: value.session_id.0,
            source_bank_code: value.source_bank_code,
            source_account_number: value.source_account_number,
            source_account_name: value.source_account_name,
            destination_bank_code: value.destination_bank_code,
            destination_account_number: value.destination_account_number,
            destination_account_name: value.destination_account_name,
            amount: format_amount(&value.amount),
            narration: value.narration,
            client_callback_url: value.client_callback_url,
            status: value.status.to_string(),
            ftd_action_code: value.ftd_action_code.map(|code| code.0),
            ftc_action_code: value.ftc_action_code.map(|code| code.0),
            reversal_action_code: value.reversal_action_code.map(|code| code.0),
            status_message: value.status_message,
            tsq_attempts: value.tsq_attempts as i32,
            tsq_next_attempt_at: value.tsq_next_attempt_at,
            reversal_attempts: value.reversal_attempts as i32,
            leg_deadline_at: value.leg_deadline_at,
            escalated_at: value.escalated_at,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct GipEventRecord {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub event_seq: i64,
    pub kind: String,
    pub session_id: String,
    pub tracking_number: Option<String>,
    pub action_code: Option<String>,
    pub payload: Option<String>,
    pub outcome: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An audit-log entry for one gateway exchange, appended in the same
/// database transaction as the state change it witnesses.
#[derive(Debug, Clone)]
pub struct NewGipEvent {
    pub kind: GipEventKind,
    pub session_id: String,
    pub tracking_number: Option<String>,
    pub action_code: Option<String>,
    pub payload: Option<String>,
    pub outcome: Option<String>,
}

/// Terminalisation of an inbound callback row, applied with a
/// compare-and-swap so a callback leaves PENDING exactly once.
#[derive(Debug, Clone)]
pub struct CallbackResolution {
    pub callback_id: Uuid,
    pub status: String,
    pub error: Option<String>,
}

/// One atomic step of the lifecycle: a compare-and-swap on the transaction
/// status plus everything that must become durable with it. Applied in a
/// single database transaction; returns false (and changes nothing) when
/// another worker advanced the row first.
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub transaction_id: Uuid,
    pub from: TransactionStatus,
    pub to: TransactionStatus,
    pub ftd_action_code: Option<String>,
    pub ftc_action_code: Option<String>,
    pub reversal_action_code: Option<String>,
    pub status_message: Option<String>,
    pub tsq_attempts: Option<i32>,
    pub clear_tsq_schedule: bool,
    pub tsq_next_attempt_at: Option<DateTime<Utc>>,
    pub reversal_attempts: Option<i32>,
    pub clear_leg_deadline: bool,
    pub leg_deadline_at: Option<DateTime<Utc>>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub events: Vec<NewGipEvent>,
    pub resolve_callback: Option<CallbackResolution>,
    pub enqueue_webhook: Option<NewClientCallback>,
    pub audit: Option<NewAuditEntry>,
}

impl StateTransition {
    pub fn new(
        transaction_id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> Self {
        debug_assert!(
            from == to || from.can_transition_to(to),
            "illegal transition {from} -> {to}"
        );
        Self {
            transaction_id,
            from,
            to,
            ftd_action_code: None,
            ftc_action_code: None,
            reversal_action_code: None,
            status_message: None,
            tsq_attempts: None,
            clear_tsq_schedule: false,
            tsq_next_attempt_at: None,
            reversal_attempts: None,
            clear_leg_deadline: false,
            leg_deadline_at: None,
            escalated_at: None,
            events: Vec::new(),
            resolve_callback: None,
            enqueue_webhook: None,
            audit: None,
        }
    }
}

#[async_trait]
pub trait TransactionRepo {
    async fn create(&self, record: &TransactionRecord) -> Result<(), RepoError>;

    async fn get(&self, id: &Uuid) -> Result<Option<TransactionRecord>, RepoError>;

    async fn get_by_reference(
        &self,
        institution_id: &Uuid,
        reference_number: &str,
    ) -> Result<Option<TransactionRecord>, RepoError>;

    async fn get_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<TransactionRecord>, RepoError>;

    /// Applies the transition if the row is still in `transition.from`.
    async fn apply(&self, transition: &StateTransition) -> Result<bool, RepoError>;

    /// Appends an event without touching the transaction status (request
    /// dispatches, ignored duplicates).
    async fn record_event(
        &self,
        transaction_id: &Uuid,
        event: &NewGipEvent,
    ) -> Result<(), RepoError>;

    async fn events(&self, transaction_id: &Uuid) -> Result<Vec<GipEventRecord>, RepoError>;

    async fn list_by_status(
        &self,
        status: &str,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, RepoError>;

    async fn due_for_tsq(
        &self,
        now: &DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, RepoError>;

    async fn pending_past_deadline(
        &self,
        now: &DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, RepoError>;

    async fn stale_reversals(
        &self,
        now: &DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, RepoError>;

    async fn stale_initiated(
        &self,
        cutoff: &DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, RepoError>;
}

pub struct DbTransactionRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbTransactionRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

const COLUMNS_PG: &str = "id, institution_id, credential_id, reference_number, session_id, \
     source_bank_code, source_account_number, source_account_name, \
     destination_bank_code, destination_account_number, destination_account_name, \
     amount::text AS amount, narration, client_callback_url, status, \
     ftd_action_code, ftc_action_code, reversal_action_code, status_message, \
     tsq_attempts, tsq_next_attempt_at, reversal_attempts, leg_deadline_at, \
     escalated_at, created_at, updated_at";

const COLUMNS_SQLITE: &str = "id, institution_id, credential_id, reference_number, session_id, \
     source_bank_code, source_account_number, source_account_name, \
     destination_bank_code, destination_account_number, destination_account_name, \
     amount, narration, client_callback_url, status, \
     ftd_action_code, ftc_action_code, reversal_action_code, status_message, \
     tsq_attempts, tsq_next_attempt_at, reversal_attempts, leg_deadline_at, \
     escalated_at, created_at, updated_at";

const UPDATE_TRANSITION: &str = r#"
      UPDATE transactions
      SET status = $3,
          ftd_action_code = COALESCE($4, ftd_action_code),
          ftc_action_code = COALESCE($5, ftc_action_code),
          reversal_action_code = COALESCE($6, reversal_action_code),
          status_message = COALESCE($7, status_message),
          tsq_attempts = COALESCE($8, tsq_attempts),
          tsq_next_attempt_at = CASE WHEN $9 THEN NULL ELSE COALESCE($10, tsq_next_attempt_at) END,
          reversal_attempts = COALESCE($11, reversal_attempts),
          leg_deadline_at = CASE WHEN $12 THEN NULL ELSE COALESCE($13, leg_deadline_at) END,
          escalated_at = COALESCE($14, escalated_at),
          updated_at = $15
      WHERE id = $1 AND status = $2
    "#;

const INSERT_EVENT: &str = r#"
      INSERT INTO gip_events
        (id, transaction_id, event_seq, kind, session_id, tracking_number, action_code, payload, outcome, created_at)
      VALUES
        ($1, $2,
         (SELECT COALESCE(MAX(event_seq), 0) + 1 FROM gip_events WHERE transaction_id = $2),
         $3, $4, $5, $6, $7, $8, $9)
    "#;

const RESOLVE_CALLBACK: &str = r#"
      UPDATE gip_callbacks
      SET status = $2, processing_error = $3
      WHERE id = $1 AND status = 'PENDING'
    "#;

const ENQUEUE_WEBHOOK: &str = r#"
      INSERT INTO client_callbacks
        (id, transaction_id, url, payload, attempts, max_attempts, next_attempt_at, status, created_at, updated_at)
      VALUES
        ($1, $2, $3, $4, 0, $5, $6, 'PENDING', $7, $7)
    "#;

const INSERT_AUDIT: &str = r#"
      INSERT INTO audit_log (id, level, kind, transaction_id, message, details, created_at)
      VALUES ($1, $2, $3, $4, $5, $6, $7)
    "#;

#[async_trait]
impl TransactionRepo for DbTransactionRepo<sqlx::Postgres> {
    async fn create(&self, record: &TransactionRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO transactions
                (id, institution_id, credential_id, reference_number, session_id,
                 source_bank_code, source_account_number, source_account_name,
                 destination_bank_code, destination_account_number, destination_account_name,
                 amount, narration, client_callback_url, status,
                 tsq_attempts, reversal_attempts, created_at, updated_at)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12::numeric, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(record.id)
        .bind(record.institution_id)
        .bind(record.credential_id)
        .bind(record.reference_number.clone())
        .bind(record.session_id.clone())
        .bind(record.source_bank_code.clone())
        .bind(record.source_account_number.clone())
        .bind(record.source_account_name.clone())
        .bind(record.destination_bank_code.clone())
        .bind(record.destination_account_number.clone())
        .bind(record.destination_account_name.clone())
        .bind(record.amount.clone())
        .bind(record.narration.clone())
        .bind(record.client_callback_url.clone())
        .bind(record.status.clone())
        .bind(record.tsq_attempts)
        .bind(record.reversal_attempts)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(self.db_pool.deref())
        .await?;

        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<TransactionRecord>, RepoError> {
        let query = format!("SELECT {COLUMNS_PG} FROM transactions WHERE id = $1");
        sqlx::query_as::<_, TransactionRecord>(&query)
            .bind(id)
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn get_by_reference(
        &self,
        institution_id: &Uuid,
        reference_number: &str,
    ) -> Result<Option<TransactionRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS_PG} FROM transactions WHERE institution_id = $1 AND reference_number = $2"
        );
        sqlx::query_as::<_, TransactionRecord>(&query)
            .bind(institution_id)
            .bind(reference_number)
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn get_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<TransactionRecord>, RepoError> {
        let query = format!("SELECT {COLUMNS_PG} FROM transactions WHERE session_id = $1");
        sqlx::query_as::<_, TransactionRecord>(&query)
            .bind(session_id)
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn apply(&self, transition: &StateTransition) -> Result<bool, RepoError> {
        let mut tx = self.db_pool.begin().await?;
        let now = Utc::now();

        let updated = sqlx::query(UPDATE_TRANSITION)
            .bind(transition.transaction_id)
            .bind(transition.from.to_string())
            .bind(transition.to.to_string())
            .bind(transition.ftd_action_code.clone())
            .bind(transition.ftc_action_code.clone())
            .bind(transition.reversal_action_code.clone())
            .bind(transition.status_message.clone())
            .bind(transition.tsq_attempts)
            .bind(transition.clear_tsq_schedule)
            .bind(transition.tsq_next_attempt_at)
            .bind(transition.reversal_attempts)
            .bind(transition.clear_leg_deadline)
            .bind(transition.leg_deadline_at)
            .bind(transition.escalated_at)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for event in &transition.events {
            sqlx::query(INSERT_EVENT)
                .bind(Uuid::new_v4())
                .bind(transition.transaction_id)
                .bind(event.kind.to_string())
                .bind(event.session_id.clone())
                .bind(event.tracking_number.clone())
                .bind(event.action_code.clone())
                .bind(event.payload.clone())
                .bind(event.outcome.clone())
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(resolution) = &transition.resolve_callback {
            sqlx::query(RESOLVE_CALLBACK)
                .bind(resolution.callback_id)
                .bind(resolution.status.clone())
                .bind(resolution.error.clone())
                .execute(&mut *tx)
                .await?;
        }

        if let Some(webhook) = &transition.enqueue_webhook {
            sqlx::query(ENQUEUE_WEBHOOK)
                .bind(Uuid::new_v4())
                .bind(transition.transaction_id)
                .bind(webhook.url.clone())
                .bind(webhook.payload.clone())
                .bind(webhook.max_attempts)
                .bind(webhook.next_attempt_at)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(audit) = &transition.audit {
            sqlx::query(INSERT_AUDIT)
                .bind(Uuid::new_v4())
                .bind(audit.level.clone())
                .bind(audit.kind.clone())
                .bind(audit.transaction_id)
                .bind(audit.message.clone())
                .bind(audit.details.clone())
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn record_event(
        &self,
        transaction_id: &Uuid,
        event: &NewGipEvent,
    ) -> Result<(), RepoError> {
        sqlx::query(INSERT_EVENT)
            .bind(Uuid::new_v4())
            .bind(transaction_id)
            .bind(event.kind.to_string())
            .bind(event.session_id.clone())
            .bind(event.tracking_number.clone())
            .bind(event.action_code.clone())
            .bind(event.payload.clone())
            .bind(event.outcome.clone())
            .bind(Utc::now())
            .execute(self.db_pool.deref())
            .await?;
        Ok(())
    }

    async fn events(&self, transaction_id: &Uuid) -> Result<Vec<GipEventRecord>, RepoError> {
        sqlx::query_as::<_, GipEventRecord>(
            "SELECT id, transaction_id, event_seq, kind, session_id, tracking_number, action_code, payload, outcome, created_at FROM gip_events WHERE transaction_id = $1 ORDER BY event_seq ASC",
        )
        .bind(transaction_id)
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn list_by_status(
        &self,
        status: &str,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS_PG} FROM transactions WHERE status = $1 ORDER BY updated_at ASC LIMIT $2 FOR UPDATE SKIP LOCKED"
        );
        sqlx::query_as::<_, TransactionRecord>(&query)
            .bind(status)
            .bind(limit)
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn due_for_tsq(
        &self,
        now: &DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS_PG} FROM transactions \
             WHERE status IN ('FTD_TSQ', 'FTC_TSQ', 'TIMEOUT') \
               AND tsq_next_attempt_at IS NOT NULL AND tsq_next_attempt_at <= $1 \
               AND escalated_at IS NULL \
             ORDER BY tsq_next_attempt_at ASC LIMIT $2 FOR UPDATE SKIP LOCKED"
        );
        sqlx::query_as::<_, TransactionRecord>(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn pending_past_deadline(
        &self,
        now: &DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS_PG} FROM transactions \
             WHERE status IN ('FTD_PENDING', 'FTC_PENDING') \
               AND leg_deadline_at IS NOT NULL AND leg_deadline_at <= $1 \
             ORDER BY leg_deadline_at ASC LIMIT $2 FOR UPDATE SKIP LOCKED"
        );
        sqlx::query_as::<_, TransactionRecord>(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn stale_reversals(
        &self,
        now: &DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS_PG} FROM transactions \
             WHERE status = 'REVERSAL_PENDING' \
               AND leg_deadline_at IS NOT NULL AND leg_deadline_at <= $1 \
               AND escalated_at IS NULL \
             ORDER BY leg_deadline_at ASC LIMIT $2 FOR UPDATE SKIP LOCKED"
        );
        sqlx::query_as::<_, TransactionRecord>(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn stale_initiated(
        &self,
        cutoff: &DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS_PG} FROM transactions \
             WHERE status = 'INITIATED' AND created_at <= $1 AND escalated_at IS NULL \
             ORDER BY created_at ASC LIMIT $2 FOR UPDATE SKIP LOCKED"
        );
        sqlx::query_as::<_, TransactionRecord>(&query)
            .bind(cutoff)
            .bind(limit)
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }
}

#[async_trait]
impl TransactionRepo for DbTransactionRepo<sqlx::Sqlite> {
    async fn create(&self, record: &TransactionRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO transactions
                (id, institution_id, credential_id, reference_number, session_id,
                 source_bank_code, source_account_number, source_account_name,
                 destination_bank_code, destination_account_number, destination_account_name,
                 amount, narration, client_callback_url, status,
                 tsq_attempts, reversal_attempts, created_at, updated_at)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(record.id)
        .bind(record.institution_id)
        .bind(record.credential_id)
        .bind(record.reference_number.clone())
        .bind(record.session_id.clone())
        .bind(record.source_bank_code.clone())
        .bind(record.source_account_number.clone())
        .bind(record.source_account_name.clone())
        .bind(record.destination_bank_code.clone())
        .bind(record.destination_account_number.clone())
        .bind(record.destination_account_name.clone())
        .bind(record.amount.clone())
        .bind(record.narration.clone())
        .bind(record.client_callback_url.clone())
        .bind(record.status.clone())
        .bind(record.tsq_attempts)
        .bind(record.reversal_attempts)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(self.db_pool.deref())
        .await?;

        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<TransactionRecord>, RepoError> {
        let query = format!("SELECT {COLUMNS_SQLITE} FROM transactions WHERE id = $1");
        sqlx::query_as::<_, TransactionRecord>(&query)
            .bind(id)
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn get_by_reference(
        &self,
        institution_id: &Uuid,
        reference_number: &str,
    ) -> Result<Option<TransactionRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS_SQLITE} FROM transactions WHERE institution_id = $1 AND reference_number = $2"
        );
        sqlx::query_as::<_, TransactionRecord>(&query)
            .bind(institution_id)
            .bind(reference_number)
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn get_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<TransactionRecord>, RepoError> {
        let query = format!("SELECT {COLUMNS_SQLITE} FROM transactions WHERE session_id = $1");
        sqlx::query_as::<_, TransactionRecord>(&query)
            .bind(session_id)
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn apply(&self, transition: &StateTransition) -> Result<bool, RepoError> {
        let mut tx = self.db_pool.begin().await?;
        let now = Utc::now();

        let updated = sqlx::query(UPDATE_TRANSITION)
            .bind(transition.transaction_id)
            .bind(transition.from.to_string())
            .bind(transition.to.to_string())
            .bind(transition.ftd_action_code.clone())
            .bind(transition.ftc_action_code.clone())
            .bind(transition.reversal_action_code.clone())
            .bind(transition.status_message.clone())
            .bind(transition.tsq_attempts)
            .bind(transition.clear_tsq_schedule)
            .bind(transition.tsq_next_attempt_at)
            .bind(transition.reversal_attempts)
            .bind(transition.clear_leg_deadline)
            .bind(transition.leg_deadline_at)
            .bind(transition.escalated_at)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for event in &transition.events {
            sqlx::query(INSERT_EVENT)
                .bind(Uuid::new_v4())
                .bind(transition.transaction_id)
                .bind(event.kind.to_string())
                .bind(event.session_id.clone())
                .bind(event.tracking_number.clone())
                .bind(event.action_code.clone())
                .bind(event.payload.clone())
                .bind(event.outcome.clone())
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(resolution) = &transition.resolve_callback {
            sqlx::query(RESOLVE_CALLBACK)
                .bind(resolution.callback_id)
                .bind(resolution.status.clone())
                .bind(resolution.error.clone())
                .execute(&mut *tx)
                .await?;
        }

        if let Some(webhook) = &transition.enqueue_webhook {
            sqlx::query(ENQUEUE_WEBHOOK)
                .bind(Uuid::new_v4())
                .bind(transition.transaction_id)
                .bind(webhook.url.clone())
                .bind(webhook.payload.clone())
                .bind(webhook.max_attempts)
                .bind(webhook.next_attempt_at)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(audit) = &transition.audit {
            sqlx::query(INSERT_AUDIT)
                .bind(Uuid::new_v4())
                .bind(audit.level.clone())
                .bind(audit.kind.clone())
                .bind(audit.transaction_id)
                .bind(audit.message.clone())
                .bind(audit.details.clone())
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn record_event(
        &self,
        transaction_id: &Uuid,
        event: &NewGipEvent,
    ) -> Result<(), RepoError> {
        sqlx::query(INSERT_EVENT)
            .bind(Uuid::new_v4())
            .bind(transaction_id)
            .bind(event.kind.to_string())
            .bind(event.session_id.clone())
            .bind(event.tracking_number.clone())
            .bind(event.action_code.clone())
            .bind(event.payload.clone())
            .bind(event.outcome.clone())
            .bind(Utc::now())
            .execute(self.db_pool.deref())
            .await?;
        Ok(())
    }

    async fn events(&self, transaction_id: &Uuid) -> Result<Vec<GipEventRecord>, RepoError> {
        sqlx::query_as::<_, GipEventRecord>(
            "SELECT id, transaction_id, event_seq, kind, session_id, tracking_number, action_code, payload, outcome, created_at FROM gip_events WHERE transaction_id = $1 ORDER BY event_seq ASC",
        )
        .bind(transaction_id)
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn list_by_status(
        &self,
        status: &str,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS_SQLITE} FROM transactions WHERE status = $1 ORDER BY updated_at ASC LIMIT $2"
        );
        sqlx::query_as::<_, TransactionRecord>(&query)
            .bind(status)
            .bind(limit)
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn due_for_tsq(
        &self,
        now: &DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS_SQLITE} FROM transactions \
             WHERE status IN ('FTD_TSQ', 'FTC_TSQ', 'TIMEOUT') \
               AND tsq_next_attempt_at IS NOT NULL AND tsq_next_attempt_at <= $1 \
               AND escalated_at IS NULL \
             ORDER BY tsq_next_attempt_at ASC LIMIT $2"
        );
        sqlx::query_as::<_, TransactionRecord>(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn pending_past_deadline(
        &self,
        now: &DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS_SQLITE} FROM transactions \
             WHERE status IN ('FTD_PENDING', 'FTC_PENDING') \
               AND leg_deadline_at IS NOT NULL AND leg_deadline_at <= $1 \
             ORDER BY leg_deadline_at ASC LIMIT $2"
        );
        sqlx::query_as::<_, TransactionRecord>(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn stale_reversals(
        &self,
        now: &DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS_SQLITE} FROM transactions \
             WHERE status = 'REVERSAL_PENDING' \
               AND leg_deadline_at IS NOT NULL AND leg_deadline_at <= $1 \
               AND escalated_at IS NULL \
             ORDER BY leg_deadline_at ASC LIMIT $2"
        );
        sqlx::query_as::<_, TransactionRecord>(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn stale_initiated(
        &self,
        cutoff: &DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, RepoError> {
        let query = format!(
            "SELECT {COLUMNS_SQLITE} FROM transactions \
             WHERE status = 'INITIATED' AND created_at <= $1 AND escalated_at IS NULL \
             ORDER BY created_at ASC LIMIT $2"
        );
        sqlx::query_as::<_, TransactionRecord>(&query)
            .bind(cutoff)
            .bind(limit)
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }
}
