//! Node configuration loaded from TOML with defaults.
//!
//! Every field is optional in the file; missing keys fall back to
//! [`WireConfig::default`].

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Default per-request timeout (five minutes).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 300_000;

/// Length of the random token in node and message ids.
pub const DEFAULT_ID_TOKEN_LEN: usize = 16;

/// Maximum single framed message size (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Errors from loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Configuration for a protocol node and its transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireConfig {
    /// Human-readable node name, used in logs.
    pub node_name: String,
    /// Timeout applied by `Node::request` when the caller gives none.
    pub request_timeout_ms: u64,
    /// Number of random characters in generated ids.
    pub id_token_len: usize,
    /// Upper bound for a single TCP frame body.
    pub max_message_size: u32,
    /// Address the TCP transport binds to.
    pub listen_addr: SocketAddr,
    /// Answer requests for unregistered functions with an error response
    /// instead of leaving the caller to time out.
    pub reply_on_unknown_method: bool,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            node_name: "nekara-node".to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            id_token_len: DEFAULT_ID_TOKEN_LEN,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            reply_on_unknown_method: true,
        }
    }
}

impl WireConfig {
    /// The default request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }
}

/// Load configuration from a TOML file, falling back to defaults.
///
/// A missing, unreadable or invalid file is logged and yields
/// [`WireConfig::default`].
pub fn load_config(path: Option<&Path>) -> WireConfig {
    let Some(path) = path else {
        info!("No config path given, using defaults");
        return WireConfig::default();
    };

    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
        return WireConfig::default();
    }

    match WireConfig::load(path) {
        Ok(config) => {
            info!(path = %path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %path.display(),
                "Failed to load config, using defaults"
            );
            WireConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = WireConfig::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(300));
        assert_eq!(config.id_token_len, 16);
        assert_eq!(config.max_message_size, 16 * 1024 * 1024);
        assert_eq!(config.listen_addr.port(), 0);
        assert!(config.reply_on_unknown_method);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = WireConfig::from_toml_str(
            r#"
            node_name = "tester"
            request_timeout_ms = 5000
            listen_addr = "0.0.0.0:7200"
            "#,
        )
        .unwrap();
        assert_eq!(config.node_name, "tester");
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.listen_addr.port(), 7200);
        assert_eq!(config.id_token_len, DEFAULT_ID_TOKEN_LEN);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let err = WireConfig::from_toml_str("request_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "reply_on_unknown_method = false").unwrap();
        writeln!(file, "id_token_len = 8").unwrap();

        let config = WireConfig::load(file.path()).unwrap();
        assert!(!config.reply_on_unknown_method);
        assert_eq!(config.id_token_len, 8);
    }

    #[test]
    fn test_load_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert_eq!(load_config(Some(&missing)), WireConfig::default());

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "this is = = not toml").unwrap();
        assert_eq!(load_config(Some(&broken)), WireConfig::default());

        assert_eq!(load_config(None), WireConfig::default());
    }
}
