//! Configuration system for Kith.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $KITH_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/kith/config.toml
//!   3. ~/.config/kith/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KithConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub dialer: DialerSettings,
    pub friends: Vec<FriendConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Hex-encoded signing seed. Auto-generated on first run.
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the dialer listens on for inbound connections.
    pub listen_addr: String,
    /// Sockets the dialer may hold open at once, inbound and outbound.
    pub fd_limit: usize,
}

/// Tunables for the connection pool and handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialerSettings {
    /// Warm outbound connections kept per friend.
    pub pool_target: usize,
    /// Rounds over the pool before a dial gives up.
    pub max_dial_tries: u32,
    pub replenish_wait_ms: u64,
    pub fd_wait_ms: u64,
    pub handshake_timeout_ms: u64,
    pub backoff_lo_ms: u64,
    pub backoff_hi_ms: u64,
    pub backoff_ratio: f64,
    /// Pause after a failed authentication before the slot is retried.
    pub auth_retry_ms: u64,
    pub rating_halflife_secs: u64,
    pub rating_bound: f64,
    /// Largest cargo payload carried by one frame.
    pub max_frame_len: usize,
    /// Depth of the arrival and status notification queues.
    pub notify_capacity: usize,
}

/// A friend as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendConfig {
    pub name: String,
    /// Hex-encoded Ed25519 public key.
    pub signature_key: String,
    /// Key we present when dialing them (the accept key they gave us).
    pub dial_key: u64,
    /// Key we issued to them.
    pub accept_key: u64,
    /// Where to reach them. None = inbound only.
    #[serde(default)]
    pub addr: Option<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            key_path: config_dir().join("identity.key"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7070".to_string(),
            fd_limit: 200,
        }
    }
}

impl Default for DialerSettings {
    fn default() -> Self {
        Self {
            pool_target: 3,
            max_dial_tries: 7,
            replenish_wait_ms: 1_000,
            fd_wait_ms: 5_000,
            handshake_timeout_ms: 20_000,
            backoff_lo_ms: 2_000,
            backoff_hi_ms: 30 * 60 * 1_000,
            backoff_ratio: 1.5,
            auth_retry_ms: 5_000,
            rating_halflife_secs: 3_600,
            rating_bound: 1e20,
            max_frame_len: 64 * 1024,
            notify_capacity: 64,
        }
    }
}

impl DialerSettings {
    pub fn replenish_wait(&self) -> Duration {
        Duration::from_millis(self.replenish_wait_ms)
    }

    pub fn fd_wait(&self) -> Duration {
        Duration::from_millis(self.fd_wait_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn backoff_lo(&self) -> Duration {
        Duration::from_millis(self.backoff_lo_ms)
    }

    pub fn backoff_hi(&self) -> Duration {
        Duration::from_millis(self.backoff_hi_ms)
    }

    pub fn auth_retry(&self) -> Duration {
        Duration::from_millis(self.auth_retry_ms)
    }

    pub fn rating_halflife(&self) -> Duration {
        Duration::from_secs(self.rating_halflife_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("kith")
}

fn dirs_or_home() -> PathBuf {
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl KithConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            KithConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("KITH_CONFIG")
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
            let text = toml::to_string_pretty(&KithConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply KITH_* overrides. Unparseable values are ignored.
    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("KITH_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(n) = var("KITH_NETWORK__FD_LIMIT").and_then(|v| v.parse().ok()) {
            self.network.fd_limit = n;
        }
        if let Some(n) = var("KITH_DIALER__POOL_TARGET").and_then(|v| v.parse().ok()) {
            self.dialer.pool_target = n;
        }
    }
}
