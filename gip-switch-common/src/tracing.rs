use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    pub default_directive: String,
    pub json: bool,
    pub ansi: bool,
}

impl TracingConfig {
    /// Human-readable console output, the setup used when running a service
    /// on a developer machine.
    pub fn local_dev(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            default_directive: "info".to_string(),
            json: false,
            ansi: true,
        }
    }

    /// JSON line output for log shippers.
    pub fn deployed(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            default_directive: "info".to_string(),
            json: true,
            ansi: false,
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::local_dev("service")
    }
}

/// Initializes the global subscriber. `RUST_LOG` wins over the configured
/// default directive.
pub fn init_tracing_with_default_env_filter(config: &TracingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_directive));

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_ansi(config.ansi))
            .init();
    }
}
