use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Global configuration for Magpie.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MagpieConfig {
    /// Baseline requeue interval for the controllers, in seconds.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: u64,

    /// Default per-execution deadline in seconds, applied when a task does
    /// not set its own timeout.
    #[serde(default = "default_task_timeout")]
    pub task_timeout: u64,

    /// Execution log sink settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_reconcile_interval() -> u64 {
    5
}

fn default_task_timeout() -> u64 {
    5
}

impl Default for MagpieConfig {
    fn default() -> Self {
        MagpieConfig {
            reconcile_interval: default_reconcile_interval(),
            task_timeout: default_task_timeout(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Execution log sink configuration. Backend selection and credentials
/// come from the flat `LOGGING_*` process variables or the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub enabled: bool,

    /// One of `postgres`, `mysql`, `elasticsearch`, `kafka`.
    pub backend: Option<String>,

    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Database name for the relational backends.
    pub database: Option<String>,
    /// Index name for the Elasticsearch backend.
    pub index: Option<String>,
}

impl MagpieConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Flat process variables (`RECONCILE_INTERVAL`, `TASK_TIMEOUT`,
    ///    `LOGGING_*`) (highest priority)
    /// 2. Environment variables (`MAGPIE__*`)
    /// 3. Config file (magpie.yaml in the current dir)
    /// 4. Defaults (lowest priority)
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&MagpieConfig::default())?)
            .add_source(
                config::File::with_name("magpie")
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix("MAGPIE")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut loaded: MagpieConfig = builder.build()?.try_deserialize()?;
        loaded.apply_process_env();
        Ok(loaded)
    }

    /// Overlay the flat process-level variables.
    fn apply_process_env(&mut self) {
        if let Some(v) = env_parse::<u64>("RECONCILE_INTERVAL") {
            self.reconcile_interval = v;
        }
        if let Some(v) = env_parse::<u64>("TASK_TIMEOUT") {
            self.task_timeout = v;
        }
        if let Some(v) = env_parse::<bool>("LOGGING_ENABLED") {
            self.logging.enabled = v;
        }
        if let Some(v) = env_string("LOGGING_BACKEND") {
            self.logging.backend = Some(v);
        }
        if let Some(v) = env_string("LOGGING_HOST") {
            self.logging.host = Some(v);
        }
        if let Some(v) = env_parse::<u16>("LOGGING_PORT") {
            self.logging.port = Some(v);
        }
        if let Some(v) = env_string("LOGGING_USER") {
            self.logging.user = Some(v);
        }
        if let Some(v) = env_string("LOGGING_PASSWORD") {
            self.logging.password = Some(v);
        }
        if let Some(v) = env_string("LOGGING_DATABASE") {
            self.logging.database = Some(v);
        }
        if let Some(v) = env_string("LOGGING_INDEX") {
            self.logging.index = Some(v);
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval.max(1))
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout.max(1))
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}
