use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{KeystoreError, KeystoreResult};
use crate::types::{Endpoint, DEFAULT_PSK_IDENTITY};

/// Top-level client configuration (loaded from kslink.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KslinkConfig {
    pub client: ClientConfig,
    /// Keystore hosts, keyed by a free-form label
    pub servers: BTreeMap<String, ServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Reconnect once and resend when the keystore closed an idle connection
    pub auto_reconnect: bool,
    /// TCP connect timeout in seconds (default: 10)
    pub connect_timeout_secs: u64,
    /// Socket read/write timeout in seconds, 0 disables (default: 10)
    pub io_timeout_secs: u64,
    /// How long callers wait for a dispatched request, 0 waits forever (default: 30)
    pub request_timeout_secs: u64,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            connect_timeout_secs: 10,
            io_timeout_secs: 10,
            request_timeout_secs: 30,
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        (self.io_timeout_secs > 0).then(|| Duration::from_secs(self.io_timeout_secs))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

/// One host serving one or more keystore identities on a shared port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub keystores: Vec<KeystoreEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystoreEntry {
    /// TLS server name, also the routing name (e.g. "key17.com")
    pub servername: String,
    /// Hex-encoded pre-shared key
    pub psk: String,
    /// PSK identity (default: "Client_identity")
    #[serde(default = "default_psk_identity")]
    pub psk_identity: String,
}

fn default_psk_identity() -> String {
    DEFAULT_PSK_IDENTITY.to_string()
}

impl KslinkConfig {
    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> KeystoreResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KeystoreError::Config(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| KeystoreError::Config(format!("parsing {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> KeystoreResult<Self> {
        toml::from_str(content).map_err(|e| KeystoreError::Config(format!("parsing config: {e}")))
    }

    /// Flatten every configured keystore into an [`Endpoint`].
    ///
    /// Fails on an undecodable PSK or a servername listed twice.
    pub fn endpoints(&self) -> KeystoreResult<Vec<Endpoint>> {
        let mut endpoints: Vec<Endpoint> = Vec::new();
        for (label, server) in &self.servers {
            for entry in &server.keystores {
                if endpoints.iter().any(|e| e.servername == entry.servername) {
                    return Err(KeystoreError::Config(format!(
                        "keystore {} listed more than once",
                        entry.servername
                    )));
                }
                let psk = hex::decode(entry.psk.trim()).map_err(|e| {
                    KeystoreError::Config(format!(
                        "server {label}: psk for {} is not valid hex: {e}",
                        entry.servername
                    ))
                })?;
                if psk.is_empty() {
                    return Err(KeystoreError::Config(format!(
                        "server {label}: empty psk for {}",
                        entry.servername
                    )));
                }
                endpoints.push(
                    Endpoint::new(&server.host, server.port, &entry.servername, psk)
                        .with_psk_identity(&entry.psk_identity),
                );
            }
        }
        Ok(endpoints)
    }
}
