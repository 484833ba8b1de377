use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstitutionId(pub Uuid);

impl InstitutionId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for InstitutionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialId(pub Uuid);

impl Display for CredentialId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-supplied transaction reference, unique per institution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceNumber(pub String);

impl Display for ReferenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique identifier assigned by the switch on intake and used to
/// correlate every gateway exchange of a transaction.
///
/// 30 numeric characters: a 6-digit participant prefix, a 12-digit UTC
/// timestamp and a 12-digit random tail.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate(participant_prefix: &str) -> Self {
        let mut rng = rand::rng();
        let timestamp = Utc::now().format("%y%m%d%H%M%S");
        let tail: String = (0..12).map(|_| rng.random_range(0..=9).to_string()).collect();
        let prefix: String = participant_prefix
            .chars()
            .filter(|c| c.is_ascii_digit())
            .chain(std::iter::repeat('0'))
            .take(6)
            .collect();
        Self(format!("{prefix}{timestamp}{tail}"))
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackingNumber(pub String);

impl Display for TrackingNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Three-character status string returned by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionCode(pub String);

pub const ACTION_CODE_SUCCESS: &str = "000";

/// Interpretation of an action code against the configured inconclusive set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Success,
    Inconclusive,
    Failure,
}

impl ActionCode {
    pub fn is_success(&self) -> bool {
        self.0 == ACTION_CODE_SUCCESS
    }

    pub fn classify(&self, inconclusive_codes: &HashSet<String>) -> ActionOutcome {
        if self.is_success() {
            ActionOutcome::Success
        } else if self.0.is_empty() || inconclusive_codes.contains(&self.0) {
            ActionOutcome::Inconclusive
        } else {
            ActionOutcome::Failure
        }
    }
}

impl Display for ActionCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Gateway function codes, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    NameEnquiry,
    FundsTransferCredit,
    FundsTransferDebit,
    Reversal,
    StatusQuery,
}

impl FunctionCode {
    pub fn code(&self) -> &'static str {
        match self {
            FunctionCode::NameEnquiry => "230",
            FunctionCode::FundsTransferCredit => "240",
            FunctionCode::FundsTransferDebit => "241",
            FunctionCode::Reversal => "242",
            FunctionCode::StatusQuery => "111",
        }
    }
}

impl Display for FunctionCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for FunctionCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "230" => Ok(FunctionCode::NameEnquiry),
            "240" => Ok(FunctionCode::FundsTransferCredit),
            "241" => Ok(FunctionCode::FundsTransferDebit),
            "242" => Ok(FunctionCode::Reversal),
            "111" => Ok(FunctionCode::StatusQuery),
            other => Err(format!("Unknown function code: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn inconclusive() -> HashSet<String> {
        ["909", "912", "990"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn action_code_classification() {
        let codes = inconclusive();
        assert_eq!(
            ActionCode("000".to_string()).classify(&codes),
            ActionOutcome::Success
        );
        assert_eq!(
            ActionCode("990".to_string()).classify(&codes),
            ActionOutcome::Inconclusive
        );
        assert_eq!(
            ActionCode("909".to_string()).classify(&codes),
            ActionOutcome::Inconclusive
        );
        assert_eq!(
            ActionCode(String::new()).classify(&codes),
            ActionOutcome::Inconclusive
        );
        assert_eq!(
            ActionCode("910".to_string()).classify(&codes),
            ActionOutcome::Failure
        );
    }

    #[test]
    fn session_id_is_30_numeric_chars() {
        let session_id = SessionId::generate("090123");
        assert_eq!(session_id.0.len(), 30);
        assert!(session_id.0.chars().all(|c| c.is_ascii_digit()));
        assert!(session_id.0.starts_with("090123"));
    }

    #[test]
    fn session_id_pads_short_prefix() {
        let session_id = SessionId::generate("42");
        assert_eq!(session_id.0.len(), 30);
        assert!(session_id.0.starts_with("420000"));
    }

    #[test]
    fn function_code_round_trip() {
        for code in ["230", "240", "241", "242", "111"] {
            assert_eq!(FunctionCode::from_str(code).unwrap().code(), code);
        }
        assert!(FunctionCode::from_str("999").is_err());
    }
}
