//! Configuration Module
//!
//! Provides TOML (or JSON) configuration for the relay with support for:
//! - Broker connections
//! - Bindings (source topic → transform → destination topic)
//! - Sandbox limits, retry backoff and script watching
//! - Metrics endpoint
//! - Environment variable overrides (VIBEMQ_RELAY__* prefix)
//!
//! [`Config::resolve`] normalizes the raw document into a [`Topology`]:
//! names defaulted, broker references resolved, topics validated.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use binding::{BindingConfig, BrokerRef, EndpointConfig, OneOrMany};
pub use broker::{BrokerConfig, BROKER_URL_ENV, BROKER_URL_ENV_LOWER, DEFAULT_RECONNECT_INTERVAL};
pub use metrics::MetricsConfig;

use crate::binding::{BindingSpec, RejectedBinding, ScriptSource, TopicSpec};
use crate::broker::BrokerSpec;
use crate::topic::{validate_destination_pattern, validate_topic_filter};

mod binding;
mod broker;
mod metrics;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// JSON parsing error
    Json(serde_json::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Json(e) => write!(f, "JSON error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Json(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Directory binding script paths are relative to
    #[serde(alias = "bindingsRoot")]
    pub bindings_root: PathBuf,
    /// Transform sandbox limits
    pub sandbox: SandboxConfig,
    /// Backoff for re-subscribing after a failed start
    pub retry: RetryConfig,
    /// Script file change detection
    pub watch: WatchConfig,
    /// Per-binding engine settings
    pub engine: EngineConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
    /// Broker connections
    pub brokers: Vec<BrokerConfig>,
    /// Routing rules
    pub bindings: Vec<BindingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            bindings_root: PathBuf::from("."),
            sandbox: SandboxConfig::default(),
            retry: RetryConfig::default(),
            watch: WatchConfig::default(),
            engine: EngineConfig::default(),
            metrics: MetricsConfig::default(),
            brokers: Vec::new(),
            bindings: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Transform sandbox limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Time budget for compiling and initializing a script
    #[serde(with = "humantime_serde")]
    pub load_timeout: Duration,
    /// Time budget for one handler invocation
    #[serde(with = "humantime_serde")]
    pub run_timeout: Duration,
    /// Maximum guest linear memory in bytes
    pub max_memory: usize,
    /// Maximum `publish` calls per invocation
    pub max_outbound: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(3),
            run_timeout: Duration::from_secs(2),
            max_memory: 16 * 1024 * 1024,
            max_outbound: 1024,
        }
    }
}

/// Retry backoff configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial: Duration,
    /// Ceiling for the delay
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    /// Growth factor between attempts
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Script watch configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Whether script files are watched for changes
    pub enabled: bool,
    /// Poll interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(1),
        }
    }
}

/// Per-binding engine settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of each binding's inbound FIFO
    pub binding_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binding_queue: 1024,
        }
    }
}

/// Normalized view of the configuration
#[derive(Debug, Clone)]
pub struct Topology {
    pub brokers: Vec<BrokerSpec>,
    /// Bindings whose broker references all resolved
    pub bindings: Vec<BindingSpec>,
    /// Bindings rejected because they reference unknown brokers
    pub rejected: Vec<RejectedBinding>,
}

impl Config {
    /// Load configuration from a file with environment variable overrides.
    ///
    /// Files ending in `.json` are read as JSON, everything else as TOML.
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}`
    /// 2. Override via env vars: `VIBEMQ_RELAY__` prefix with double underscores for nesting:
    ///    - `VIBEMQ_RELAY__LOG__LEVEL=debug` overrides `log.level`
    ///    - `VIBEMQ_RELAY__SANDBOX__RUN_TIMEOUT=5s` overrides `sandbox.run_timeout`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let format = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => FileFormat::Json,
            _ => FileFormat::Toml,
        };

        let content = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&content);

        let cfg = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("bindings_root", ".")?
            .add_source(File::from_str(&substituted, format))
            // Double underscore separates nested keys, single underscore preserved in field names
            .add_source(
                Environment::with_prefix("VIBEMQ_RELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = cfg.try_deserialize()?;
        if config.bindings_root.is_relative() {
            if let Some(dir) = path.parent() {
                config.bindings_root = dir.join(&config.bindings_root);
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse JSON configuration from a string (for testing, no env var support)
    pub fn parse_json(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resolve().map(|_| ())
    }

    /// Normalize into a [`Topology`].
    ///
    /// Malformed fields are a [`ConfigError`]. A binding that references a
    /// broker which does not exist is not an error here; it is returned in
    /// [`Topology::rejected`] and never started.
    pub fn resolve(&self) -> Result<Topology, ConfigError> {
        if self.brokers.is_empty() {
            return Err(ConfigError::Validation(
                "at least one broker must be configured".to_string(),
            ));
        }
        if self.sandbox.run_timeout.is_zero() || self.sandbox.load_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "sandbox timeouts must be non-zero".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "retry.multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.engine.binding_queue == 0 {
            return Err(ConfigError::Validation(
                "engine.binding_queue must be non-zero".to_string(),
            ));
        }

        let brokers = self.resolve_brokers()?;
        let broker_names: Vec<&str> = brokers.iter().map(|b| b.name.as_str()).collect();

        let mut bindings = Vec::new();
        let mut rejected = Vec::new();
        let mut seen = HashSet::new();

        for (index, binding) in self.bindings.iter().enumerate() {
            let name = binding.resolved_name(index);
            if !seen.insert(name.clone()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate binding name '{}'",
                    name
                )));
            }

            let script = match (&binding.path, &binding.inline) {
                (Some(_), Some(_)) => {
                    return Err(ConfigError::Validation(format!(
                        "binding '{}' cannot have both 'path' and 'inline'",
                        name
                    )));
                }
                (Some(path), None) => ScriptSource::File(self.bindings_root.join(path)),
                (None, Some(source)) => ScriptSource::Inline(source.clone()),
                (None, None) => ScriptSource::Identity,
            };

            let from = binding.from_or_default();
            let to = binding.to_or_default();
            let from_topic = from.topic_or_default();
            let to_topic = to.topic_or_default();

            validate_topic_filter(from_topic).map_err(|e| {
                ConfigError::Validation(format!("binding '{}': from.topic: {}", name, e))
            })?;
            validate_destination_pattern(to_topic).map_err(|e| {
                ConfigError::Validation(format!("binding '{}': to.topic: {}", name, e))
            })?;
            for qos in [from.qos, to.qos] {
                if qos > 2 {
                    return Err(ConfigError::Validation(format!(
                        "binding '{}': qos must be 0, 1, or 2",
                        name
                    )));
                }
            }

            let resolved = resolve_refs(&from.broker_refs(), &broker_names).and_then(|f| {
                resolve_refs(&to.broker_refs(), &broker_names).map(|t| (f, t))
            });

            match resolved {
                Ok((from_brokers, to_brokers)) => bindings.push(BindingSpec {
                    name,
                    from: TopicSpec::new(from_topic, from_brokers, from.qos),
                    to: TopicSpec::new(to_topic, to_brokers, to.qos),
                    script,
                    active: binding.active,
                }),
                Err(unknown) => rejected.push(RejectedBinding {
                    name,
                    reason: format!("unknown broker '{}'", unknown),
                    active: binding.active,
                }),
            }
        }

        Ok(Topology {
            brokers,
            bindings,
            rejected,
        })
    }

    fn resolve_brokers(&self) -> Result<Vec<BrokerSpec>, ConfigError> {
        let mut seen = HashSet::new();
        let mut brokers = Vec::with_capacity(self.brokers.len());

        for (index, broker) in self.brokers.iter().enumerate() {
            let name = broker.resolved_name(index);
            if !seen.insert(name.clone()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate broker name '{}'",
                    name
                )));
            }

            let url = broker.resolved_url().ok_or_else(|| {
                ConfigError::Validation(format!(
                    "broker '{}' has no 'url' and neither {} nor {} is set",
                    name, BROKER_URL_ENV, BROKER_URL_ENV_LOWER
                ))
            })?;

            let client_id = broker
                .client_id
                .clone()
                .unwrap_or_else(|| format!("vibemq-relay-{}-{}", std::process::id(), name));

            brokers.push(BrokerSpec {
                name,
                url,
                reconnect: broker.reconnect_interval(),
                client_id,
                keepalive: broker.keepalive_duration(),
            });
        }

        Ok(brokers)
    }
}

/// Resolve broker references to names, deduplicated in order.
///
/// Returns the first unresolvable reference as the error.
fn resolve_refs(refs: &[BrokerRef], names: &[&str]) -> Result<Vec<String>, BrokerRef> {
    let mut resolved: Vec<String> = Vec::with_capacity(refs.len());
    for r in refs {
        let name = match r {
            BrokerRef::Index(i) => names.get(*i).copied(),
            BrokerRef::Name(n) => names.iter().copied().find(|candidate| candidate == n),
        }
        .ok_or_else(|| r.clone())?;

        if !resolved.iter().any(|existing| existing == name) {
            resolved.push(name.to_string());
        }
    }
    Ok(resolved)
}
