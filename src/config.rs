use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{ConfigError, CredentialsError};
use crate::schema::RecordShape;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// Top-level structure loaded from `config.json`.
//
// It defines:
// - Global currency list
// - Logger settings
// - API calls, services and extra record shapes
// - Stream reconnection policy
// - Strategy pipeline order
//
// The value is built once in `main` and passed by reference.
//
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Default currencies for services that declare none
    #[serde(default)]
    pub currencies: Vec<String>,

    #[serde(default)]
    pub logger: LoggerConfig,

    pub api: ApiConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    /// Strategy names, in pipeline order
    #[serde(default = "default_strategies")]
    pub strategies: Vec<String>,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_strategies() -> Vec<String> {
    vec!["latest".to_string(), "print".to_string()]
}

// ------------------------------------------------------------
// Logger configuration
// ------------------------------------------------------------
//
// `level` is the default filter, `modules` maps a module path
// (e.g. "nombot::adapters") to its own level.
//
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggerConfig {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub modules: BTreeMap<String, String>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            modules: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Calls issued against every service with a REST endpoint
    #[serde(default)]
    pub calls: BTreeMap<String, CallSpec>,

    pub services: Vec<ServiceConfig>,

    /// Additional or overriding record shapes, keyed by call/response type
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub shapes: BTreeMap<String, RecordShape>,
}

// ------------------------------------------------------------
// Scheduled calls
// ------------------------------------------------------------
//
// - No `delay`: the call fires on every poll iteration
// - With `delay` (seconds): the call is throttled by the scheduler
// - `priority` breaks ties between calls due at the same instant
//   (lower fires first)
//
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
}

impl CallSpec {
    pub fn delay(&self) -> Option<Duration> {
        self.delay.map(Duration::from_secs_f64)
    }
}

// ------------------------------------------------------------
// Service configuration
// ------------------------------------------------------------
//
// One entry per API service (exchange or aggregator).
// `name` selects the facade implementation in the registry.
//
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    /// Overrides the global currency list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currencies: Option<Vec<String>>,

    #[serde(default)]
    pub credentials: Vec<Credential>,

    /// Selects a named entry from `credentials` (first entry otherwise)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,

    /// Channel name → response type (record shape name)
    #[serde(default)]
    pub subscriptions: BTreeMap<String, String>,

    /// Exchange codes monitored through this service
    #[serde(default)]
    pub exchanges: Vec<String>,

    pub endpoints: Endpoints,

    /// Query the server channel catalogue after subscribing
    #[serde(default)]
    pub discover_channels: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(rename = "apiKey", alias = "apikey")]
    pub api_key: String,

    pub secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Endpoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket: Option<String>,
}

// ------------------------------------------------------------
// Stream configuration
// ------------------------------------------------------------
//
// Reconnection is an explicit operator decision. With `enabled`
// false a lost connection leaves the stream adapter closed.
//
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// None retries forever
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_true() -> bool {
    true
}

fn default_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: default_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Whether another attempt is allowed after `attempt` consecutive failures.
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.is_none_or(|max| attempt < max)
    }

    /// Exponential backoff before attempt number `attempt` (1-based), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self.delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

fn default_interval() -> u64 {
    30
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
        }
    }
}

// ------------------------------------------------------------
// Loading and validation
// ------------------------------------------------------------

impl Config {
    /// Reads, parses and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        data.parse()
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.services.is_empty() {
            return Err(ConfigError::Missing("api.services".into()));
        }

        if self.logger.level.parse::<log::LevelFilter>().is_err() {
            return Err(ConfigError::Invalid {
                key: "logger.level".into(),
                reason: format!("unknown level '{}'", self.logger.level),
            });
        }
        for (module, level) in &self.logger.modules {
            if level.parse::<log::LevelFilter>().is_err() {
                return Err(ConfigError::Invalid {
                    key: format!("logger.modules.{module}"),
                    reason: format!("unknown level '{level}'"),
                });
            }
        }

        for (name, call) in &self.api.calls {
            if let Some(delay) = call.delay {
                if !delay.is_finite() || delay < 0.0 {
                    return Err(ConfigError::Invalid {
                        key: format!("api.calls.{name}.delay"),
                        reason: format!("must be a non-negative number of seconds, got {delay}"),
                    });
                }
            }
        }

        let mut seen = Vec::new();
        for (i, svc) in self.api.services.iter().enumerate() {
            if svc.name.trim().is_empty() {
                return Err(ConfigError::Missing(format!("api.services[{i}].name")));
            }
            if seen.contains(&svc.name) {
                return Err(ConfigError::Invalid {
                    key: format!("api.services[{i}].name"),
                    reason: format!("duplicate service '{}'", svc.name),
                });
            }
            seen.push(svc.name.clone());

            if svc.endpoints.rest.is_none() && svc.endpoints.websocket.is_none() {
                return Err(ConfigError::Missing(format!(
                    "api.services[{i}].endpoints.rest or .websocket"
                )));
            }
            if (!svc.subscriptions.is_empty() || svc.discover_channels)
                && svc.endpoints.websocket.is_none()
            {
                return Err(ConfigError::Missing(format!(
                    "api.services[{i}].endpoints.websocket"
                )));
            }
        }

        if self.stream.reconnect.max_delay_ms < self.stream.reconnect.delay_ms {
            return Err(ConfigError::Invalid {
                key: "stream.reconnect.max_delay_ms".into(),
                reason: "must not be smaller than delay_ms".into(),
            });
        }

        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.api.services.iter().find(|s| s.name == name)
    }

    /// Service currencies, falling back to the global list.
    pub fn currencies_for(&self, svc: &ServiceConfig) -> Vec<String> {
        svc.currencies
            .clone()
            .unwrap_or_else(|| self.currencies.clone())
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg: Config = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

impl ServiceConfig {
    /// Resolves the credential used by this service.
    pub fn credentials(&self) -> Result<&Credential, CredentialsError> {
        match &self.credential {
            Some(wanted) => self
                .credentials
                .iter()
                .find(|c| c.name.as_deref() == Some(wanted.as_str()))
                .ok_or_else(|| CredentialsError::UnknownName {
                    service: self.name.clone(),
                    name: wanted.clone(),
                }),
            None => self
                .credentials
                .first()
                .ok_or_else(|| CredentialsError::Missing(self.name.clone())),
        }
    }
}
