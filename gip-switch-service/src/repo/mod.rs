use gip_switch_common::SafeDisplay;

pub mod audit;
pub mod client_callback;
pub mod gip_callback;
pub mod transaction;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("Unique constraint violation: {0}")]
    UniqueViolation(String),
    #[error("Database error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for RepoError {
    fn from(error: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_error) = &error {
            if db_error.is_unique_violation() {
                return RepoError::UniqueViolation(db_error.message().to_string());
            }
        }
        RepoError::Internal(error.to_string())
    }
}

impl SafeDisplay for RepoError {
    fn to_safe_string(&self) -> String {
        match self {
            RepoError::UniqueViolation(_) => "Duplicate record".to_string(),
            RepoError::Internal(_) => "Internal repository error".to_string(),
        }
    }
}
