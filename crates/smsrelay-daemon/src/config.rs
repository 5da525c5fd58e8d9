//! Daemon configuration: a TOML file with CLI and environment overrides.

use serde::Deserialize;
use smsrelay_client::{SupervisorConfig, XmppConfig};
use std::path::{Path, PathBuf};

fn default_inbound_capacity() -> usize {
    64
}

/// Knobs that belong to the daemon rather than the client library.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Bound of the channel between connections and the inbound consumer.
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: default_inbound_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub xmpp: XmppConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Values from the command line or environment. They win over the file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub sender_id: Option<String>,
    pub server_key: Option<String>,
    pub production: bool,
}

impl DaemonConfig {
    pub fn parse(text: &str, path: &Path) -> Result<Self, LoadError> {
        toml::from_str(text).map_err(|source| LoadError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path` if given; without a file everything comes from overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, LoadError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(sender_id) = overrides.sender_id {
            self.xmpp.sender_id = sender_id;
        }
        if let Some(server_key) = overrides.server_key {
            self.xmpp.server_key = server_key;
        }
        if overrides.production {
            self.xmpp.production = true;
        }
    }
}
