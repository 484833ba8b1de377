use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "GIP_SWITCH__";
const ENV_SEPARATOR: &str = "__";

pub trait ConfigLoaderConfig: DeserializeOwned + Serialize + Default {}

impl<T: DeserializeOwned + Serialize + Default> ConfigLoaderConfig for T {}

/// A named example configuration, dumped alongside the default one by
/// `--dump-config`.
pub type ConfigExample<T> = (&'static str, T);

pub trait HasConfigExamples<T> {
    fn examples() -> Vec<ConfigExample<T>>;
}

/// Layered configuration loading: compiled-in defaults, then the TOML config
/// file, then `GIP_SWITCH__`-prefixed environment variables.
pub struct ConfigLoader<T: ConfigLoaderConfig> {
    pub config_file_name: PathBuf,
    make_examples: Option<fn() -> Vec<ConfigExample<T>>>,
}

impl<T: ConfigLoaderConfig> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> ConfigLoader<T> {
        ConfigLoader {
            config_file_name: config_file_name.to_path_buf(),
            make_examples: None,
        }
    }

    pub fn new_with_examples(config_file_name: &Path) -> ConfigLoader<T>
    where
        T: HasConfigExamples<T>,
    {
        ConfigLoader {
            config_file_name: config_file_name.to_path_buf(),
            make_examples: Some(T::examples),
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed(ENV_PREFIX).split(ENV_SEPARATOR))
    }

    pub fn load(&self) -> figment::Result<T> {
        self.figment().extract()
    }

    /// Loads the configuration, unless `--dump-config` was passed, in which
    /// case the default (and example) configurations are printed as TOML and
    /// `None` is returned so the caller can exit.
    pub fn load_or_dump_config(&self) -> Option<T> {
        if std::env::args().any(|arg| arg == "--dump-config") {
            self.dump_config();
            None
        } else {
            match self.load() {
                Ok(config) => Some(config),
                Err(error) => {
                    eprintln!("Failed to load config: {error}");
                    None
                }
            }
        }
    }

    fn dump_config(&self) {
        match toml_string(&T::default()) {
            Ok(dump) => println!("# default\n{dump}"),
            Err(error) => eprintln!("Failed to dump default config: {error}"),
        }
        if let Some(make_examples) = self.make_examples {
            for (name, example) in make_examples() {
                match toml_string(&example) {
                    Ok(dump) => println!("# {name}\n{dump}"),
                    Err(error) => eprintln!("Failed to dump example config {name}: {error}"),
                }
            }
        }
    }
}

fn toml_string<T: Serialize>(value: &T) -> Result<String, figment::Error> {
    let mut json = serde_json::to_value(value).map_err(|e| figment::Error::from(e.to_string()))?;
    strip_nulls(&mut json);
    toml::to_string(&json).map_err(|e| figment::Error::from(e.to_string()))
}

// TOML has no null; unset optional fields are dropped from the dump.
fn strip_nulls(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(strip_nulls);
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DbConfig {
    Postgres(DbPostgresConfig),
    Sqlite(DbSqliteConfig),
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig::Sqlite(DbSqliteConfig::default())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbPostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub schema: Option<String>,
    pub max_connections: u32,
}

impl Default for DbPostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "gip_switch".to_string(),
            username: "postgres".to_string(),
            password: "postgres".to_string(),
            schema: None,
            max_connections: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbSqliteConfig {
    pub database: String,
    pub max_connections: u32,
}

impl Default for DbSqliteConfig {
    fn default() -> Self {
        Self {
            database: "data/gip-switch.db".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryConfig {
    /// Delay before the given zero-based attempt, exponentially increasing
    /// and capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.min_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        self.max_delay.min(Duration::from_secs_f64(delay))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::RetryConfig;
    use std::time::Duration;

    #[test]
    fn retry_delay_is_exponential_and_capped() {
        let retries = RetryConfig {
            max_attempts: 5,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
        };
        assert_eq!(retries.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(retries.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(retries.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(retries.delay_for_attempt(10), Duration::from_millis(350));
    }
}
