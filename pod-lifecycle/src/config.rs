//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: POD_LIFECYCLE_)
//! 2. A TOML file (`./pod-lifecycle.toml` or an explicit path)
//! 3. Default values
//!
//! Loading never validates ports or timeouts; [`ProbeConfig::validate`] does,
//! and [`PodManagerBuilder::build`](crate::PodManagerBuilder::build) always calls it.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default configuration file name, looked up in the working directory
pub const CONFIG_FILE: &str = "pod-lifecycle.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "POD_LIFECYCLE_";

/// Wire protocol used to answer probes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckMechanism {
    /// `GET /startup`, `/live`, `/ready`
    #[default]
    Http,
    /// gRPC health protocol with services `startup`, `live`, `ready`
    Grpc,
}

impl fmt::Display for CheckMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Grpc => write!(f, "grpc"),
        }
    }
}

/// Whether the responder owns its listener or registers on the caller's server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Binding {
    /// Opens its own listener on the configured port
    #[default]
    Standalone,
    /// Registers handlers on a caller-owned transport and never stops it
    Attached,
}

/// Probe configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Probe protocol
    #[serde(default)]
    pub mechanism: CheckMechanism,

    /// Standalone or attached
    #[serde(default)]
    pub binding: Binding,

    /// Address the standalone listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Port for HTTP probes
    #[serde(default = "default_http_port")]
    pub http_port: u32,

    /// Port for gRPC health probes
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u32,

    /// Maximum time to drain the probe server on shutdown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Per-checker deadline for readiness evaluation
    #[serde(default = "default_checker_timeout_ms")]
    pub checker_timeout_ms: u64,

    /// Deadline for a single HTTP probe request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How often the gRPC responder re-evaluates readiness (0 disables)
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error) or an EnvFilter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_http_port() -> u32 {
    8080
}

fn default_grpc_port() -> u32 {
    50051
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_checker_timeout_ms() -> u64 {
    2_000
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_refresh_interval_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            mechanism: CheckMechanism::default(),
            binding: Binding::default(),
            bind_address: default_bind_address(),
            http_port: default_http_port(),
            grpc_port: default_grpc_port(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            checker_timeout_ms: default_checker_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            refresh_interval_ms: default_refresh_interval_ms(),
            log_level: default_log_level(),
        }
    }
}

impl ProbeConfig {
    /// Load configuration from `./pod-lifecycle.toml` (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Load configuration from a specific file
    ///
    /// A missing file is not an error; defaults and environment variables still apply.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
        }

        let config = Figment::new()
            .merge(Serialized::defaults(ProbeConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;

        Ok(config)
    }

    /// Reject values that would otherwise fail later at bind time or make every check time out
    pub fn validate(&self) -> Result<()> {
        validate_port("http_port", self.http_port)?;
        validate_port("grpc_port", self.grpc_port)?;
        if self.checker_timeout_ms == 0 {
            return Err(Error::InvalidTimeout("checker_timeout_ms"));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::InvalidTimeout("request_timeout_ms"));
        }
        Ok(())
    }

    /// Port of the selected mechanism
    pub fn port(&self) -> Result<u16> {
        match self.mechanism {
            CheckMechanism::Http => checked_port("http_port", self.http_port),
            CheckMechanism::Grpc => checked_port("grpc_port", self.grpc_port),
        }
    }

    /// Socket address the standalone listener binds to
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.bind_address, self.port()?))
    }

    /// Listener address for HTTP probes
    pub fn http_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(
            self.bind_address,
            checked_port("http_port", self.http_port)?,
        ))
    }

    /// Listener address for the gRPC health service
    pub fn grpc_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(
            self.bind_address,
            checked_port("grpc_port", self.grpc_port)?,
        ))
    }

    /// Drain deadline
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Per-checker deadline
    pub fn checker_timeout(&self) -> Duration {
        Duration::from_millis(self.checker_timeout_ms)
    }

    /// HTTP probe request deadline
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// gRPC refresh interval, `None` when disabled
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_ms > 0).then(|| Duration::from_millis(self.refresh_interval_ms))
    }
}

fn validate_port(name: &'static str, port: u32) -> Result<()> {
    checked_port(name, port).map(|_| ())
}

fn checked_port(name: &'static str, port: u32) -> Result<u16> {
    match u16::try_from(port) {
        Ok(valid) if valid != 0 => Ok(valid),
        _ => Err(Error::InvalidPort { name, port }),
    }
}
