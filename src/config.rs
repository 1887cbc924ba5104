//! Configuration management for Turnstile.
//!
//! Settings are layered, lowest priority first:
//! 1. Built-in defaults
//! 2. An optional YAML/TOML/JSON file
//! 3. `TURNSTILE__`-prefixed environment variables, e.g.
//!    `TURNSTILE__STORE__BACKEND=shared`
//! 4. Command-line flags

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::DEFAULT_NAMESPACE;

/// Prefix of the environment variables read by [`TurnstileConfig::load`].
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Which window store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local fixed windows
    #[default]
    Local,
    /// Redis sliding logs shared by every instance
    Shared,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis URL, required for the shared backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for every shared key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Upper bound on a single shared store call
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Time between local janitor sweeps
    #[serde(default = "default_janitor_interval")]
    pub janitor_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            namespace: default_namespace(),
            operation_timeout_ms: default_operation_timeout(),
            janitor_interval_secs: default_janitor_interval(),
        }
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_operation_timeout() -> u64 {
    250
}

fn default_janitor_interval() -> u64 {
    60
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to the route rules file; without one every route is unlimited
    #[serde(default)]
    pub routes_path: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Reject settings the service cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Shared && self.store.redis_url.is_none() {
            return Err(TurnstileError::Config(
                "store.redis_url is required for the shared backend".to_string(),
            ));
        }
        if self.store.namespace.is_empty() {
            return Err(TurnstileError::Config(
                "store.namespace must not be empty".to_string(),
            ));
        }
        if self.store.operation_timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "store.operation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.store.janitor_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "store.janitor_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Command-line flags. Each one overrides the file and environment.
#[derive(Debug, Default, Parser)]
#[command(name = "turnstile", version, about = "Request admission control service")]
pub struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Address for the gRPC server
    #[arg(long, value_name = "ADDR")]
    pub grpc_addr: Option<SocketAddr>,

    /// Counter store backend
    #[arg(long, value_enum, value_name = "BACKEND")]
    pub backend: Option<StoreBackend>,

    /// Redis URL for the shared backend
    #[arg(long, value_name = "URL")]
    pub redis_url: Option<String>,

    /// Route rules file
    #[arg(long, value_name = "PATH")]
    pub routes: Option<PathBuf>,

    /// Log level: error, warn, info, debug, trace
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    pub log_json: bool,
}

impl Cli {
    /// Apply the flags that were given on top of `config`.
    pub fn apply(&self, config: &mut TurnstileConfig) {
        if let Some(addr) = self.grpc_addr {
            config.server.grpc_addr = addr;
        }
        if let Some(backend) = self.backend {
            config.store.backend = backend;
        }
        if let Some(url) = &self.redis_url {
            config.store.redis_url = Some(url.clone());
        }
        if let Some(routes) = &self.routes {
            config.rate_limiting.routes_path = Some(routes.clone());
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.log_json {
            config.logging.json = true;
        }
    }
}
