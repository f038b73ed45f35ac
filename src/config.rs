//! Server configuration.
//!
//! Defaults can be overridden by a YAML file named in `TANDEM_CONFIG`, and
//! the listen address by `LISTEN`:
//!
//! ```yaml
//! listen_addr: "0.0.0.0:8080"
//! max_connections: 100
//! authorities: ["www.example.com", "example.com"]
//! protocol: "1.1"
//! timeouts:
//!   idle_secs: 5
//!   connection_secs: 10
//!   app_secs: 10
//! ```

use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::http::message::HttpVersion;

/// Timeouts every connection runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Wait for the first byte of a new request.
    pub idle: Duration,
    /// Any later socket read or write.
    pub connection: Duration,
    /// Wait for the application to make progress.
    pub app: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        TimeoutConfig::default().into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub idle_secs: f64,
    pub connection_secs: f64,
    pub app_secs: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle_secs: 5.0,
            connection_secs: 10.0,
            app_secs: 10.0,
        }
    }
}

fn secs(value: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(value)
        .ok()
        .filter(|d| !d.is_zero())
        .unwrap_or_else(|| Duration::from_secs_f64(fallback))
}

impl From<TimeoutConfig> for Timeouts {
    fn from(cfg: TimeoutConfig) -> Self {
        let defaults = TimeoutConfig::default();
        Self {
            idle: secs(cfg.idle_secs, defaults.idle_secs),
            connection: secs(cfg.connection_secs, defaults.connection_secs),
            app: secs(cfg.app_secs, defaults.app_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    /// Most connections served at once; more are refused with a 503.
    pub max_connections: Option<usize>,
    /// Authorities (virtual hosts) served. The first is the default.
    pub authorities: Vec<String>,
    /// HTTP/1.0 disables chunked transfer and persistent connections.
    pub protocol: HttpVersion,
    pub timeouts: TimeoutConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            max_connections: None,
            authorities: Vec::new(),
            protocol: HttpVersion::HTTP_1_1,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var("TANDEM_CONFIG") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {}", path))?;
                Self::from_yaml(&text).with_context(|| format!("parsing config file {}", path))?
            }
            Err(_) => Self::default(),
        };
        if let Ok(listen_addr) = std::env::var("LISTEN") {
            cfg.listen_addr = listen_addr;
        }
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts.into()
    }

    /// The port part of the listen address.
    pub fn port(&self) -> u16 {
        self.listen_addr
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(80)
    }

    /// The authority used when a request names none.
    pub fn default_authority(&self) -> String {
        match self.authorities.first() {
            Some(authority) => authority.to_ascii_lowercase(),
            None if self.port() == 80 => "localhost".to_string(),
            None => format!("localhost:{}", self.port()),
        }
    }
}
