use crate::ConfigError;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

pub const FCM_HOST: &str = "fcm-xmpp.googleapis.com";
pub const FCM_DEV_PORT: u16 = 5236;
pub const FCM_PROD_PORT: u16 = 5235;
/// Domain FCM expects in the login identity.
pub const FCM_DOMAIN: &str = "gcm.googleapis.com";

fn default_host() -> String {
    FCM_HOST.to_string()
}

fn default_handshake_timeout() -> u64 {
    30
}

/// Credentials and endpoint for FCM's XMPP server.
///
/// Used only while a connection performs its handshake.
#[derive(Clone, Deserialize)]
pub struct XmppConfig {
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub server_key: String,
    #[serde(default = "default_host")]
    pub host: String,
    /// Overrides the port implied by `production`.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub production: bool,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl XmppConfig {
    pub fn new(sender_id: impl Into<String>, server_key: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            server_key: server_key.into(),
            host: default_host(),
            port: None,
            production: false,
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }

    /// SASL identity, `<sender id>@gcm.googleapis.com`.
    pub fn login(&self) -> String {
        format!("{}@{}", self.sender_id, FCM_DOMAIN)
    }

    pub fn port(&self) -> u16 {
        match (self.port, self.production) {
            (Some(port), _) => port,
            (None, true) => FCM_PROD_PORT,
            (None, false) => FCM_DEV_PORT,
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sender_id.trim().is_empty() {
            return Err(ConfigError::Missing("sender_id"));
        }
        if self.server_key.trim().is_empty() {
            return Err(ConfigError::Missing("server_key"));
        }
        Ok(())
    }
}

impl Default for XmppConfig {
    fn default() -> Self {
        Self::new("", "")
    }
}

impl fmt::Debug for XmppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XmppConfig")
            .field("sender_id", &self.sender_id)
            .field("server_key", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port())
            .field("production", &self.production)
            .field("handshake_timeout_secs", &self.handshake_timeout_secs)
            .finish()
    }
}
