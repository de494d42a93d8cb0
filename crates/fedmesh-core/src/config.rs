//! Configuration system for fedmesh.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FEDMESH_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/fedmesh/config.toml
//!   3. ~/.config/fedmesh/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{Parameters, MAX_DATAGRAM, MAX_FRAGMENT_LEN};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FedmeshConfig {
    pub network: NetworkConfig,
    pub transport: TransportConfig,
    pub algebra: AlgebraConfig,
    /// Hyperparameters a coordinator hands to joining participants.
    pub training: Parameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local bind address. Port 0 = OS-assigned.
    pub bind_addr: String,
    /// SO_RCVBUF in bytes. 0 = leave the OS default.
    pub recv_buffer_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum payload bytes per fragment.
    pub max_fragment_len: usize,
    /// Largest payload accepted for one logical message, in either direction.
    pub max_message_len: usize,
    /// How long to wait for a fragment's acknowledgment before resending.
    pub ack_timeout_ms: u64,
    /// Resends of one fragment before the peer is declared unresponsive.
    pub max_retries: u32,
    /// Incomplete reassembly sessions idle longer than this are dropped.
    pub reassembly_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgebraConfig {
    /// Seed of the shared mask. Every node of one federation must agree on it.
    pub mask_seed: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            recv_buffer_bytes: 4 * 1024 * 1024,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_fragment_len: MAX_FRAGMENT_LEN,
            max_message_len: 64 * 1024 * 1024,
            ack_timeout_ms: 500,
            max_retries: 5,
            reassembly_ttl_secs: 30,
        }
    }
}

impl Default for AlgebraConfig {
    fn default() -> Self {
        Self { mask_seed: 0x5eed }
    }
}

impl TransportConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn reassembly_ttl(&self) -> Duration {
        Duration::from_secs(self.reassembly_ttl_secs)
    }

    /// Most fragments a message within `max_message_len` can need.
    pub fn max_fragments(&self) -> u32 {
        let fragments = self.max_message_len.div_ceil(self.max_fragment_len.max(1)).max(1);
        u32::try_from(fragments).unwrap_or(u32::MAX)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("fedmesh")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FedmeshConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            FedmeshConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FEDMESH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&FedmeshConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the transport cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let len = self.transport.max_fragment_len;
        // Leave room for the JSON envelope around the payload.
        let ceiling = MAX_DATAGRAM - 1024;
        if len == 0 || len > ceiling {
            return Err(ConfigError::Invalid {
                key: "transport.max_fragment_len",
                reason: format!("{len} not in 1..={ceiling}"),
            });
        }
        if self.transport.max_message_len < len {
            return Err(ConfigError::Invalid {
                key: "transport.max_message_len",
                reason: format!(
                    "{} is below max_fragment_len {len}",
                    self.transport.max_message_len
                ),
            });
        }
        if self.transport.ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "transport.ack_timeout_ms",
                reason: "must be non-zero".into(),
            });
        }
        self.training.validate().map_err(|e| ConfigError::Invalid {
            key: "training",
            reason: e.to_string(),
        })?;
        Ok(())
    }

    /// Apply FEDMESH_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FEDMESH_NETWORK__BIND_ADDR") {
            self.network.bind_addr = v;
        }
        if let Ok(v) = std::env::var("FEDMESH_NETWORK__RECV_BUFFER_BYTES") {
            if let Ok(n) = v.parse() {
                self.network.recv_buffer_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("FEDMESH_TRANSPORT__MAX_FRAGMENT_LEN") {
            if let Ok(n) = v.parse() {
                self.transport.max_fragment_len = n;
            }
        }
        if let Ok(v) = std::env::var("FEDMESH_TRANSPORT__ACK_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                self.transport.ack_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("FEDMESH_TRANSPORT__MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                self.transport.max_retries = n;
            }
        }
        if let Ok(v) = std::env::var("FEDMESH_TRANSPORT__MAX_MESSAGE_LEN") {
            if let Ok(n) = v.parse() {
                self.transport.max_message_len = n;
            }
        }
        if let Ok(v) = std::env::var("FEDMESH_TRANSPORT__REASSEMBLY_TTL_SECS") {
            if let Ok(n) = v.parse() {
                self.transport.reassembly_ttl_secs = n;
            }
        }
        if let Ok(v) = std::env::var("FEDMESH_ALGEBRA__MASK_SEED") {
            if let Ok(n) = v.parse() {
                self.algebra.mask_seed = n;
            }
        }
    }
}
