use async_trait::async_trait;
use gip_switch_common::model::{ActionCode, SessionId};
use gip_switch_common::SafeDisplay;

pub mod http;

pub use http::HttpGipGateway;

/// Outbound client for the clearing gateway. One method per gateway
/// function; the switch never interprets transport-level detail beyond
/// transient-or-not.
#[async_trait]
pub trait GipGateway {
    /// Synchronous account-name lookup (function 230).
    async fn name_enquiry(
        &self,
        dispatch: &NameEnquiryDispatch,
    ) -> Result<GatewayAck, GatewayError>;

    /// Debit leg dispatch (function 241); the result arrives as a callback.
    async fn funds_transfer_debit(&self, dispatch: &LegDispatch)
        -> Result<GatewayAck, GatewayError>;

    /// Credit leg dispatch (function 240); the result arrives as a callback.
    async fn funds_transfer_credit(
        &self,
        dispatch: &LegDispatch,
    ) -> Result<GatewayAck, GatewayError>;

    /// Compensating reversal (function 242), keyed on the original session.
    async fn reversal(&self, dispatch: &LegDispatch) -> Result<GatewayAck, GatewayError>;

    /// Authoritative status lookup (function 111).
    async fn status_query(&self, session_id: &SessionId) -> Result<TsqStatus, GatewayError>;
}

#[derive(Debug, Clone)]
pub struct NameEnquiryDispatch {
    pub session_id: SessionId,
    pub destination_bank_code: String,
    pub account_number: String,
}

#[derive(Debug, Clone)]
pub struct LegDispatch {
    pub session_id: SessionId,
    pub source_bank_code: String,
    pub source_account_number: String,
    pub source_account_name: String,
    pub destination_bank_code: String,
    pub destination_account_number: String,
    pub destination_account_name: String,
    pub amount: String,
    pub narration: String,
}

/// Synchronous acknowledgement of a gateway call.
#[derive(Debug, Clone)]
pub struct GatewayAck {
    pub action_code: Option<ActionCode>,
    pub account_name: Option<String>,
    pub tracking_number: Option<String>,
    pub raw: serde_json::Value,
}

/// The two-code TSQ verdict: `response_code` qualifies the enquiry itself,
/// `action_code` the enquired leg.
#[derive(Debug, Clone)]
pub struct TsqStatus {
    pub response_code: String,
    pub action_code: String,
    pub raw: serde_json::Value,
}

impl TsqStatus {
    pub fn code_pair(&self) -> String {
        format!("{}/{}", self.response_code, self.action_code)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway request failed: {0}")]
    Transport(String),
    #[error("Gateway request timed out")]
    Timeout,
    #[error("Gateway returned HTTP {0}")]
    UnexpectedStatus(u16),
    #[error("Failed to decode gateway response: {0}")]
    InvalidResponse(String),
    #[error("Failed to initialize gateway client: {0}")]
    Initialization(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Transport(_) | GatewayError::Timeout => true,
            GatewayError::UnexpectedStatus(status) => *status >= 500,
            GatewayError::InvalidResponse(_) | GatewayError::Initialization(_) => false,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            GatewayError::Timeout
        } else {
            GatewayError::Transport(error.to_string())
        }
    }
}

impl SafeDisplay for GatewayError {
    fn to_safe_string(&self) -> String {
        match self {
            GatewayError::Timeout => "Gateway request timed out".to_string(),
            GatewayError::Transport(_)
            | GatewayError::UnexpectedStatus(_)
            | GatewayError::Initialization(_) => "Gateway unreachable".to_string(),
            GatewayError::InvalidResponse(_) => "Unexpected gateway response".to_string(),
        }
    }
}
