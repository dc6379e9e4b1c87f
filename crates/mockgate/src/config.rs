//! Gateway configuration loaded from a YAML file.
//!
//! The file names the listen address, the service map (logical service name
//! to upstream origin), the port allowlist for admitted origins, upstream
//! client tuning, and the capture buffer capacity.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    /// Logical service name -> upstream origin URL (`http://host:port`).
    pub services: HashMap<String, String>,
    /// Ports an admitted origin may use. Checked after service resolution.
    pub allowed_ports: Vec<u16>,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    /// Total request deadline. A slow upstream turns into a 504 at this point.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            keepalive_secs: default_keepalive_secs(),
            max_idle_per_host: default_max_idle_per_host(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    /// Bounded buffer between request handlers and the traffic worker.
    /// When full, new events are dropped, never the handler blocked.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4545
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_max_idle_per_host() -> usize {
    100
}

fn default_idle_timeout_secs() -> u64 {
    90
}

fn default_buffer_capacity() -> usize {
    1024
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {}", path.as_ref().display()))?;
        let config: Config = serde_yaml::from_str(&raw).context("failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            bail!("config error: 'services' must name at least one upstream");
        }
        for (name, origin) in &self.services {
            let uri: hyper::Uri = origin
                .parse()
                .with_context(|| format!("config error: service '{}' has an unparseable origin '{}'", name, origin))?;
            match uri.scheme_str() {
                Some("http") | Some("https") => {}
                _ => bail!(
                    "config error: service '{}' origin '{}' must use http or https",
                    name,
                    origin
                ),
            }
            if uri.host().is_none() {
                bail!("config error: service '{}' origin '{}' has no host", name, origin);
            }
        }
        if self.allowed_ports.is_empty() {
            bail!("config error: 'allowedPorts' must not be empty");
        }
        if self.upstream.timeout_secs == 0 {
            bail!("config error: upstream.timeoutSecs must be greater than zero");
        }
        if self.capture.buffer_capacity == 0 {
            bail!("config error: capture.bufferCapacity must be greater than zero");
        }
        Ok(())
    }
}
