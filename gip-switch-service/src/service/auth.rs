use std::collections::HashMap;

use gip_switch_common::model::{CredentialId, InstitutionId};
use gip_switch_common::SafeDisplay;

use crate::config::InstitutionCredentialConfig;

/// The tenant resolved from a request's API credentials.
#[derive(Debug, Clone)]
pub struct InstitutionContext {
    pub institution_id: InstitutionId,
    pub credential_id: CredentialId,
    pub name: String,
    pub participant_code: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid API credentials")]
    InvalidCredentials,
}

impl SafeDisplay for AuthError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

struct CredentialEntry {
    api_secret: String,
    context: InstitutionContext,
}

/// Credential check against the configured institutions; keys are resolved
/// in memory, the configuration is immutable after startup.
pub struct AuthService {
    credentials: HashMap<String, CredentialEntry>,
}

impl AuthService {
    pub fn new(institutions: &[InstitutionCredentialConfig]) -> Self {
        let credentials = institutions
            .iter()
            .map(|institution| {
                (
                    institution.api_key.clone(),
                    CredentialEntry {
                        api_secret: institution.api_secret.clone(),
                        context: InstitutionContext {
                            institution_id: InstitutionId(institution.institution_id),
                            credential_id: CredentialId(institution.credential_id),
                            name: institution.name.clone(),
                            participant_code: institution.participant_code.clone(),
                        },
                    },
                )
            })
            .collect();
        Self { credentials }
    }

    pub fn authenticate(
        &self,
        api_key: &str,
        api_secret: &str,
    ) -> Result<InstitutionContext, AuthError> {
        match self.credentials.get(api_key) {
            Some(entry) if entry.api_secret == api_secret => Ok(entry.context.clone()),
            _ => Err(AuthError::InvalidCredentials),
        }
    }
}
