use gip_switch_common::config::{
    ConfigExample, ConfigLoader, DbConfig, HasConfigExamples, RetryConfig,
};
use gip_switch_common::tracing::TracingConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SwitchServiceConfig {
    pub tracing: TracingConfig,
    pub environment: String,
    pub http_port: u16,
    pub db: DbConfig,
    pub gateway: GipGatewayConfig,
    pub workers: WorkersConfig,
    pub leg_timeouts: LegTimeoutsConfig,
    /// Action codes that neither confirm nor deny a leg; they always lead to
    /// a TSQ schedule. The empty action code is treated the same way.
    pub inconclusive_action_codes: Vec<String>,
    pub institutions: Vec<InstitutionCredentialConfig>,
}

impl Default for SwitchServiceConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("gip-switch-service"),
            environment: "dev".to_string(),
            http_port: 8085,
            db: DbConfig::default(),
            gateway: GipGatewayConfig::default(),
            workers: WorkersConfig::default(),
            leg_timeouts: LegTimeoutsConfig::default(),
            inconclusive_action_codes: vec![
                "909".to_string(),
                "912".to_string(),
                "990".to_string(),
            ],
            institutions: vec![],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GipGatewayConfig {
    pub nec_url: Url,
    pub ftd_url: Url,
    pub ftc_url: Url,
    pub tsq_url: Url,
    /// Reversals go to the FTC endpoint with function code 242 unless a
    /// dedicated URL is configured.
    pub reversal_url: Option<Url>,
    /// Where the gateway posts its asynchronous callbacks back to us.
    pub callback_url: Url,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub dispatch_retries: RetryConfig,
}

impl GipGatewayConfig {
    pub fn reversal_url(&self) -> &Url {
        self.reversal_url.as_ref().unwrap_or(&self.ftc_url)
    }
}

impl Default for GipGatewayConfig {
    fn default() -> Self {
        Self {
            nec_url: Url::parse("http://localhost:9085/gip/nec").expect("invalid NEC URL"),
            ftd_url: Url::parse("http://localhost:9085/gip/ftd").expect("invalid FTD URL"),
            ftc_url: Url::parse("http://localhost:9085/gip/ftc").expect("invalid FTC URL"),
            tsq_url: Url::parse("http://localhost:9085/gip/tsq").expect("invalid TSQ URL"),
            reversal_url: None,
            callback_url: Url::parse("http://localhost:8085/v1/callback")
                .expect("invalid callback URL"),
            request_timeout: Duration::from_secs(30),
            dispatch_retries: RetryConfig {
                max_attempts: 2,
                min_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(2),
                multiplier: 2.0,
            },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkersConfig {
    pub callback: CallbackWorkerConfig,
    pub tsq: TsqWorkerConfig,
    pub reversal: ReversalWorkerConfig,
    pub webhook: WebhookWorkerConfig,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            callback: CallbackWorkerConfig::default(),
            tsq: TsqWorkerConfig::default(),
            reversal: ReversalWorkerConfig::default(),
            webhook: WebhookWorkerConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallbackWorkerConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub batch_size: u32,
}

impl Default for CallbackWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            batch_size: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TsqWorkerConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Delay before the first TSQ of a leg; later attempts back off as
    /// `base_interval * 2^attempts`, capped at `max_interval`.
    #[serde(with = "humantime_serde")]
    pub base_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
    pub max_attempts: u32,
    pub batch_size: u32,
}

impl Default for TsqWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            base_interval: Duration::from_secs(300),
            max_interval: Duration::from_secs(3600),
            max_attempts: 3,
            batch_size: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReversalWorkerConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub max_attempts: u32,
    /// How long to wait for a reversal callback before the attempt is
    /// considered lost and the row becomes eligible again.
    #[serde(with = "humantime_serde")]
    pub callback_timeout: Duration,
    pub batch_size: u32,
}

impl Default for ReversalWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_attempts: 3,
            callback_timeout: Duration::from_secs(300),
            batch_size: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookWorkerConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub batch_size: u32,
}

impl Default for WebhookWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_attempts: 5,
            initial_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(30),
            batch_size: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LegTimeoutsConfig {
    #[serde(with = "humantime_serde")]
    pub name_enquiry: Duration,
    #[serde(with = "humantime_serde")]
    pub ftd_callback: Duration,
    #[serde(with = "humantime_serde")]
    pub ftc_callback: Duration,
    #[serde(with = "humantime_serde")]
    pub transaction: Duration,
}

impl Default for LegTimeoutsConfig {
    fn default() -> Self {
        Self {
            name_enquiry: Duration::from_secs(60),
            ftd_callback: Duration::from_secs(1800),
            ftc_callback: Duration::from_secs(1800),
            transaction: Duration::from_secs(3600),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstitutionCredentialConfig {
    pub institution_id: Uuid,
    pub credential_id: Uuid,
    pub name: String,
    /// Bank code used as the session id prefix for this institution.
    pub participant_code: String,
    pub api_key: String,
    pub api_secret: String,
}

impl HasConfigExamples<SwitchServiceConfig> for SwitchServiceConfig {
    fn examples() -> Vec<ConfigExample<SwitchServiceConfig>> {
        vec![(
            "with-institution",
            SwitchServiceConfig {
                institutions: vec![InstitutionCredentialConfig {
                    institution_id: Uuid::parse_str("1f2a9e54-7c61-4d15-9e0b-0f4f31c5a1d2")
                        .expect("invalid UUID"),
                    credential_id: Uuid::parse_str("7b3c2d10-52ee-4f82-a6a4-3e5d9a6f1b77")
                        .expect("invalid UUID"),
                    name: "First Example Bank".to_string(),
                    participant_code: "090123".to_string(),
                    api_key: "example-key".to_string(),
                    api_secret: "example-secret".to_string(),
                }],
                ..SwitchServiceConfig::default()
            },
        )]
    }
}

pub fn make_config_loader() -> ConfigLoader<SwitchServiceConfig> {
    ConfigLoader::new_with_examples(&PathBuf::from("config/switch-service.toml"))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use crate::config::make_config_loader;

    #[test]
    pub fn config_is_loadable() {
        make_config_loader().load().expect("Failed to load config");
    }
}
