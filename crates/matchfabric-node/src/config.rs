//! Configuration types for matchfabric-node.
//! Parsed from matchfabric.toml.
//!
//! The rest of the node only sees configuration through [`ConfigSource`]:
//! endpoints and integer settings looked up by logical name.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Authority (config server) address.
pub const AUTHORITY_ENDPOINT: &str = "config_server";
/// Bind address and base listening port for peer matching servers.
pub const PEER_ENDPOINT: &str = "matching_server";

pub const MAX_MESSAGE_SIZE: &str = "max_message_size";
pub const CONNECT_ATTEMPTS: &str = "connect_attempts";
pub const CONNECT_RETRY_DELAY_MS: &str = "connect_retry_delay_ms";
pub const RECONNECT_BACKOFF_MS: &str = "reconnect_backoff_ms";
pub const REGISTRATION_TIMEOUT_MS: &str = "registration_timeout_ms";
pub const REGISTRATION_ATTEMPTS: &str = "registration_attempts";
pub const VERIFICATION_TIMEOUT_MS: &str = "verification_timeout_ms";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("no endpoint named {0:?}")]
    UnknownEndpoint(String),
    #[error("endpoint {name:?} has unparseable ip {value:?}")]
    InvalidAddress { name: String, value: String },
    #[error("no setting named {0:?}")]
    UnknownSetting(String),
    #[error("setting {name:?} has invalid value {value}")]
    InvalidSetting { name: String, value: i64 },
}

/// Name-based view of configuration consumed by the coordinator.
pub trait ConfigSource: Send + Sync {
    fn resolve(&self, name: &str) -> Result<SocketAddr, ConfigError>;
    fn resolve_int(&self, name: &str) -> Result<i64, ConfigError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_endpoints")]
    pub endpoints: BTreeMap<String, EndpointEntry>,
    #[serde(default)]
    pub tuning: TuningSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointEntry {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningSection {
    #[serde(default = "default_max_message_size")]
    pub max_message_size: i64,
    /// Attempts for the initial authority connect; 0 retries without bound.
    #[serde(default = "default_5")]
    pub connect_attempts: i64,
    #[serde(default = "default_1000")]
    pub connect_retry_delay_ms: i64,
    #[serde(default = "default_5000")]
    pub reconnect_backoff_ms: i64,
    #[serde(default = "default_10000")]
    pub registration_timeout_ms: i64,
    /// Connect-and-register rounds before startup gives up; 0 is unbounded.
    #[serde(default = "default_3")]
    pub registration_attempts: i64,
    /// How long an inbound peer may wait for the authority's verdict.
    #[serde(default = "default_10000")]
    pub verification_timeout_ms: i64,
}

impl Default for TuningSection {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            connect_attempts: 5,
            connect_retry_delay_ms: 1000,
            reconnect_backoff_ms: 5000,
            registration_timeout_ms: 10_000,
            registration_attempts: 3,
            verification_timeout_ms: 10_000,
        }
    }
}

// Default value functions
fn default_endpoints() -> BTreeMap<String, EndpointEntry> {
    BTreeMap::from([
        (
            AUTHORITY_ENDPOINT.to_string(),
            EndpointEntry {
                ip: "127.0.0.1".into(),
                port: 8765,
            },
        ),
        (
            PEER_ENDPOINT.to_string(),
            EndpointEntry {
                ip: "0.0.0.0".into(),
                port: 9000,
            },
        ),
    ])
}
fn default_max_message_size() -> i64 {
    matchfabric_protocol::DEFAULT_MAX_MESSAGE_SIZE as i64
}
fn default_3() -> i64 {
    3
}
fn default_5() -> i64 {
    5
}
fn default_1000() -> i64 {
    1000
}
fn default_5000() -> i64 {
    5000
}
fn default_10000() -> i64 {
    10_000
}

impl NodeConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn set_endpoint(&mut self, name: &str, addr: SocketAddr) {
        self.endpoints.insert(
            name.to_string(),
            EndpointEntry {
                ip: addr.ip().to_string(),
                port: addr.port(),
            },
        );
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            tuning: TuningSection::default(),
        }
    }
}

impl ConfigSource for NodeConfig {
    fn resolve(&self, name: &str) -> Result<SocketAddr, ConfigError> {
        let entry = self
            .endpoints
            .get(name)
            .ok_or_else(|| ConfigError::UnknownEndpoint(name.to_string()))?;
        let ip: IpAddr = entry
            .ip
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidAddress {
                name: name.to_string(),
                value: entry.ip.clone(),
            })?;
        Ok(SocketAddr::new(ip, entry.port))
    }

    fn resolve_int(&self, name: &str) -> Result<i64, ConfigError> {
        let t = &self.tuning;
        match name {
            MAX_MESSAGE_SIZE => Ok(t.max_message_size),
            CONNECT_ATTEMPTS => Ok(t.connect_attempts),
            CONNECT_RETRY_DELAY_MS => Ok(t.connect_retry_delay_ms),
            RECONNECT_BACKOFF_MS => Ok(t.reconnect_backoff_ms),
            REGISTRATION_TIMEOUT_MS => Ok(t.registration_timeout_ms),
            REGISTRATION_ATTEMPTS => Ok(t.registration_attempts),
            VERIFICATION_TIMEOUT_MS => Ok(t.verification_timeout_ms),
            other => Err(ConfigError::UnknownSetting(other.to_string())),
        }
    }
}

/// Integer settings resolved once at startup and converted to their working types.
#[derive(Debug, Clone)]
pub struct Tuning {
    pub max_message_size: usize,
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
    pub reconnect_backoff: Duration,
    pub registration_timeout: Duration,
    pub registration_attempts: u32,
    pub verification_timeout: Duration,
}

impl Tuning {
    pub fn resolve(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let max_message_size = non_negative(source, MAX_MESSAGE_SIZE)?;
        if (max_message_size as usize) < matchfabric_protocol::HEADER_SIZE {
            return Err(ConfigError::InvalidSetting {
                name: MAX_MESSAGE_SIZE.to_string(),
                value: max_message_size,
            });
        }
        Ok(Self {
            max_message_size: max_message_size as usize,
            connect_attempts: count(source, CONNECT_ATTEMPTS)?,
            connect_retry_delay: millis(source, CONNECT_RETRY_DELAY_MS)?,
            reconnect_backoff: millis(source, RECONNECT_BACKOFF_MS)?,
            registration_timeout: millis(source, REGISTRATION_TIMEOUT_MS)?,
            registration_attempts: count(source, REGISTRATION_ATTEMPTS)?,
            verification_timeout: millis(source, VERIFICATION_TIMEOUT_MS)?,
        })
    }
}

fn non_negative(source: &dyn ConfigSource, name: &str) -> Result<i64, ConfigError> {
    let value = source.resolve_int(name)?;
    if value < 0 {
        return Err(ConfigError::InvalidSetting {
            name: name.to_string(),
            value,
        });
    }
    Ok(value)
}

fn count(source: &dyn ConfigSource, name: &str) -> Result<u32, ConfigError> {
    let value = non_negative(source, name)?;
    u32::try_from(value).map_err(|_| ConfigError::InvalidSetting {
        name: name.to_string(),
        value,
    })
}

fn millis(source: &dyn ConfigSource, name: &str) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(non_negative(source, name)? as u64))
}
