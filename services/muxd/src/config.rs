//! Daemon configuration.
//!
//! Loaded from built-in defaults, then an optional YAML file, then
//! `MUXD_*` environment variables. Nested keys use `__` in variable names.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Environment, File, FileFormat};
use serde::Deserialize;

use connmux::{ListenerConfig, DEFAULT_MAX_SNIFF_BYTES, DEFAULT_QUEUE_CAPACITY};

/// File read when `MUXD_CONFIG` is unset. Optional.
pub const DEFAULT_CONFIG_FILE: &str = "muxd.yaml";

/// Variable naming an explicit configuration file. Required when set.
pub const CONFIG_FILE_ENV: &str = "MUXD_CONFIG";

const ENV_PREFIX: &str = "MUXD";

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Shared address to listen on, `host:port`.
    pub bind_addr: String,

    /// Connections each route may hold before dispatch waits.
    pub queue_capacity: usize,

    /// Timeout in milliseconds for each read made while matching.
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,

    /// Bytes peeked before a connection is given up as unmatched.
    pub max_sniff_bytes: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Routes in priority order.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// One downstream server: connections it matches are forwarded upstream.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RouteConfig {
    pub name: String,

    #[serde(rename = "match")]
    pub matcher: MatchConfig,

    /// Upstream address, `host:port`.
    pub forward_to: String,
}

/// How a route recognizes its connections.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchConfig {
    /// First bytes equal `value`.
    Prefix { value: String },
    /// A TLS handshake record.
    Tls,
    /// Every connection.
    Any,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self> {
        let file = match std::env::var_os(CONFIG_FILE_ENV) {
            Some(path) => {
                let path = PathBuf::from(path);
                File::from(path.as_path()).format(FileFormat::Yaml).required(true)
            }
            None => File::from(Path::new(DEFAULT_CONFIG_FILE))
                .format(FileFormat::Yaml)
                .required(false),
        };
        Self::build(file, Environment::with_prefix(ENV_PREFIX))
    }

    fn build<S>(file: S, env: Environment) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config: Self = config::Config::builder()
            .set_default("bind_addr", ":7000")?
            .set_default("queue_capacity", DEFAULT_QUEUE_CAPACITY as u64)?
            .set_default("max_sniff_bytes", DEFAULT_MAX_SNIFF_BYTES as u64)?
            .set_default("log_level", "info")?
            .add_source(file)
            .add_source(
                env.prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to load configuration")?
            .try_deserialize()
            .context("invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be at least 1");
        }
        if self.max_sniff_bytes == 0 {
            bail!("max_sniff_bytes must be at least 1");
        }
        for route in &self.routes {
            if route.name.is_empty() {
                bail!("route name must not be empty");
            }
            if route.forward_to.is_empty() {
                bail!("route {} has no forward_to address", route.name);
            }
            if let MatchConfig::Prefix { value } = &route.matcher {
                if value.is_empty() {
                    bail!("route {} has an empty prefix", route.name);
                }
            }
        }
        Ok(())
    }

    /// Timeout for matching reads, if configured.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    /// Settings for the multiplexing listener.
    pub fn listener_config(&self) -> ListenerConfig {
        let mut config = ListenerConfig::new(self.bind_addr.clone());
        config.queue_capacity = self.queue_capacity;
        config.read_timeout = self.read_timeout();
        config.max_sniff_bytes = self.max_sniff_bytes;
        config
    }
}
