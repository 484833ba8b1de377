use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use gip_switch_common::model::{
    ActionCode, CredentialId, InstitutionId, ReferenceNumber, SessionId,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// Position of a transaction in the debit-then-credit pipeline.
///
/// The permitted transitions form a DAG; every persisted transition is a
/// compare-and-swap against the expected source status, so an illegal or
/// duplicate transition affects zero rows.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Initiated,
    FtdPending,
    FtdSuccess,
    FtdTsq,
    FtdFailed,
    FtcPending,
    FtcSuccess,
    FtcTsq,
    FtcFailed,
    ReversalPending,
    ReversalSuccess,
    ReversalFailed,
    Completed,
    Failed,
    Timeout,
}

impl TransactionStatus {
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Initiated, FtdPending)
                | (FtdPending, FtdSuccess | FtdTsq | FtdFailed | Timeout)
                | (FtdTsq, FtdSuccess | FtdFailed)
                | (FtdSuccess, FtcPending)
                | (FtcPending, FtcSuccess | FtcTsq | FtcFailed | Timeout)
                | (FtcTsq, FtcSuccess | FtcFailed)
                | (FtcSuccess, Completed)
                | (FtcFailed, ReversalPending)
                | (ReversalPending, ReversalSuccess | ReversalFailed)
                | (ReversalSuccess, Failed)
                | (Timeout, FtdTsq | FtcTsq)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::FtdFailed
                | TransactionStatus::ReversalFailed
                | TransactionStatus::Completed
                | TransactionStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum GipEventKind {
    FtdRequest,
    FtdCallback,
    FtcRequest,
    FtcCallback,
    TsqRequest,
    TsqResponse,
    ReversalRequest,
    ReversalCallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CallbackStatus {
    Pending,
    Processed,
    Ignored,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditLevel {
    Info,
    Critical,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: Uuid,
    pub institution_id: InstitutionId,
    pub credential_id: CredentialId,
    pub reference_number: ReferenceNumber,
    pub session_id: SessionId,
    pub source_bank_code: String,
    pub source_account_number: String,
    pub source_account_name: String,
    pub destination_bank_code: String,
    pub destination_account_number: String,
    pub destination_account_name: String,
    pub amount: BigDecimal,
    pub narration: String,
    pub client_callback_url: Option<String>,
    pub status: TransactionStatus,
    pub ftd_action_code: Option<ActionCode>,
    pub ftc_action_code: Option<ActionCode>,
    pub reversal_action_code: Option<ActionCode>,
    pub status_message: Option<String>,
    pub tsq_attempts: u32,
    pub tsq_next_attempt_at: Option<DateTime<Utc>>,
    pub reversal_attempts: u32,
    pub leg_deadline_at: Option<DateTime<Utc>>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// The leg a TIMEOUT or TSQ enquiry is about: once the debit leg has
    /// confirmed, any open question concerns the credit leg.
    pub fn debit_leg_resolved(&self) -> bool {
        self.ftd_action_code
            .as_ref()
            .map(|code| code.is_success())
            .unwrap_or(false)
    }
}

/// Parameters accepted from an institution to start a transfer.
#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub reference_number: ReferenceNumber,
    pub source_bank_code: String,
    pub source_account_number: String,
    pub source_account_name: String,
    pub destination_bank_code: String,
    pub destination_account_number: String,
    pub destination_account_name: String,
    pub amount: BigDecimal,
    pub narration: String,
    pub client_callback_url: Option<String>,
}

/// Terminal-state notification posted to the originating institution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCallbackPayload {
    pub status: WebhookStatus,
    pub transaction_id: Uuid,
    pub reference_number: String,
    pub session_id: String,
    pub action_code: Option<String>,
    pub amount: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<WebhookReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookReason {
    FtdFailed,
    Reversed,
}

/// Parses and validates a transfer amount: positive, at most two decimal
/// places.
pub fn parse_amount(raw: &str) -> Result<BigDecimal, String> {
    let amount =
        BigDecimal::from_str(raw.trim()).map_err(|_| format!("Invalid amount: {raw}"))?;
    if amount <= BigDecimal::from(0) {
        return Err("Amount must be positive".to_string());
    }
    if amount.fractional_digit_count() > 2 {
        return Err("Amount must have at most two decimal places".to_string());
    }
    Ok(amount)
}

/// Canonical two-decimal rendering used on the wire and in storage.
pub fn format_amount(amount: &BigDecimal) -> String {
    amount.with_scale(2).to_string()
}

/// Webhook retry delay before attempt `attempts + 1`:
/// `initial * multiplier^attempts`, capped.
pub fn webhook_backoff(
    initial_delay: Duration,
    multiplier: f64,
    attempts: u32,
    max_delay: Duration,
) -> Duration {
    let delay = initial_delay.as_secs_f64() * multiplier.powi(attempts as i32);
    max_delay.min(Duration::from_secs_f64(delay))
}

/// TSQ retry delay: `base * 2^attempts`, capped.
pub fn tsq_backoff(base_interval: Duration, attempts: u32, max_interval: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempts.min(16));
    max_interval.min(base_interval.saturating_mul(factor))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use std::str::FromStr;

    const ALL_STATUSES: [TransactionStatus; 15] = [
        TransactionStatus::Initiated,
        TransactionStatus::FtdPending,
        TransactionStatus::FtdSuccess,
        TransactionStatus::FtdTsq,
        TransactionStatus::FtdFailed,
        TransactionStatus::FtcPending,
        TransactionStatus::FtcSuccess,
        TransactionStatus::FtcTsq,
        TransactionStatus::FtcFailed,
        TransactionStatus::ReversalPending,
        TransactionStatus::ReversalSuccess,
        TransactionStatus::ReversalFailed,
        TransactionStatus::Completed,
        TransactionStatus::Failed,
        TransactionStatus::Timeout,
    ];

    #[test]
    fn status_strings_round_trip() {
        for status in ALL_STATUSES {
            let rendered = status.to_string();
            assert_eq!(TransactionStatus::from_str(&rendered).unwrap(), status);
        }
        assert_eq!(TransactionStatus::FtdTsq.to_string(), "FTD_TSQ");
        assert_eq!(
            TransactionStatus::ReversalPending.to_string(),
            "REVERSAL_PENDING"
        );
    }

    #[test]
    fn terminal_statuses_have_no_successors() {
        for status in ALL_STATUSES {
            if status.is_terminal() {
                for next in ALL_STATUSES {
                    assert!(
                        !status.can_transition_to(next),
                        "{status} must not transition to {next}"
                    );
                }
            }
        }
    }

    #[test]
    fn happy_path_is_a_valid_walk() {
        let path = [
            TransactionStatus::Initiated,
            TransactionStatus::FtdPending,
            TransactionStatus::FtdSuccess,
            TransactionStatus::FtcPending,
            TransactionStatus::FtcSuccess,
            TransactionStatus::Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]));
        }
    }

    #[test]
    fn reversal_path_is_a_valid_walk() {
        let path = [
            TransactionStatus::FtcPending,
            TransactionStatus::FtcFailed,
            TransactionStatus::ReversalPending,
            TransactionStatus::ReversalSuccess,
            TransactionStatus::Failed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]));
        }
    }

    #[test]
    fn backward_transitions_are_rejected() {
        assert!(!TransactionStatus::FtdSuccess.can_transition_to(TransactionStatus::FtdPending));
        assert!(!TransactionStatus::FtcPending.can_transition_to(TransactionStatus::FtdSuccess));
        assert!(!TransactionStatus::Completed.can_transition_to(TransactionStatus::FtcPending));
        assert!(!TransactionStatus::FtdPending.can_transition_to(TransactionStatus::FtcPending));
    }

    #[test]
    fn timeout_escalates_only_to_tsq() {
        for next in ALL_STATUSES {
            let allowed = matches!(
                next,
                TransactionStatus::FtdTsq | TransactionStatus::FtcTsq
            );
            assert_eq!(TransactionStatus::Timeout.can_transition_to(next), allowed);
        }
    }

    #[test]
    fn amount_parsing() {
        assert_eq!(format_amount(&parse_amount("100").unwrap()), "100.00");
        assert_eq!(format_amount(&parse_amount("0.10").unwrap()), "0.10");
        assert_eq!(format_amount(&parse_amount(" 25.5 ").unwrap()), "25.50");
        assert!(parse_amount("0").is_err());
        assert!(parse_amount("-3").is_err());
        assert!(parse_amount("1.999").is_err());
        assert!(parse_amount("abc").is_err());
    }

    #[test]
    fn webhook_backoff_schedule() {
        let initial = Duration::from_secs(5);
        let max = Duration::from_secs(3600);
        let delays: Vec<u64> = (0..5)
            .map(|attempts| webhook_backoff(initial, 2.0, attempts, max).as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80]);
    }

    #[test]
    fn webhook_backoff_is_capped() {
        let initial = Duration::from_secs(5);
        let max = Duration::from_secs(60);
        assert_eq!(webhook_backoff(initial, 2.0, 10, max), max);
    }

    #[test]
    fn tsq_backoff_schedule() {
        let base = Duration::from_secs(300);
        let max = Duration::from_secs(3600);
        assert_eq!(tsq_backoff(base, 0, max), Duration::from_secs(300));
        assert_eq!(tsq_backoff(base, 1, max), Duration::from_secs(600));
        assert_eq!(tsq_backoff(base, 2, max), Duration::from_secs(1200));
        assert_eq!(tsq_backoff(base, 5, max), max);
    }
}
