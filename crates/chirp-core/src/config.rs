use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_XMPP_PORT: u16 = 5222;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Connection parameters for one XMPP account.
///
/// Immutable once handed to `connect`; a connect attempt is only accepted
/// when [`SessionProfile::is_complete`] holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProfile {
    /// Server host name, e.g. "talk.example.com".
    pub host: String,

    /// Server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Full JID including the resource, e.g. "alice@example.com/desktop".
    pub jid: String,

    /// Account password.
    pub password: String,
}

impl SessionProfile {
    pub fn new(host: &str, jid: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port: DEFAULT_XMPP_PORT,
            jid: jid.to_string(),
            password: password.to_string(),
        }
    }

    /// All of host, jid, and password must be non-empty.
    pub fn is_complete(&self) -> bool {
        !self.host.is_empty() && !self.jid.is_empty() && !self.password.is_empty()
    }

    /// The JID without its resource part.
    pub fn bare_jid(&self) -> &str {
        self.jid.split('/').next().unwrap_or(&self.jid)
    }
}

fn default_port() -> u16 {
    DEFAULT_XMPP_PORT
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Echo every inbound chat body back to its sender. Demonstration
    /// behavior inherited from the sample client; disable for real use.
    pub auto_echo: bool,

    /// Transport-level reconnect attempts before giving up; 0 means retry
    /// forever. Authentication failures are never retried.
    pub max_reconnect_attempts: u32,

    /// I/O timeout applied to dial, SASL, and sends.
    pub timeout_seconds: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            auto_echo: true,
            max_reconnect_attempts: 0,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub enabled: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Top-level application configuration, loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub account: Option<SessionProfile>,
    pub session: SessionSettings,
    pub notifications: NotificationSettings,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}
