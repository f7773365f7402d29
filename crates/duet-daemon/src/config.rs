//! Resolved client configuration.

use duet_core::SessionConfig;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Relay URL must start with ws:// or wss://: {0}")]
    InvalidRelayUrl(String),

    #[error("Stories directory not found: {0}")]
    StoriesDirMissing(PathBuf),

    #[error("Namespace must be non-empty ASCII letters, digits or '-': {0}")]
    InvalidNamespace(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub relay_url: String,
    pub stories_dir: PathBuf,
    /// Uppercased signaling namespace
    pub namespace: String,
    /// Whether to offer local audio/video
    pub media: bool,
}

impl ClientConfig {
    pub fn new(
        relay_url: &str,
        stories_dir: PathBuf,
        namespace: &str,
        media: bool,
    ) -> Result<Self, ConfigError> {
        let relay_url = relay_url.trim();
        if !(relay_url.starts_with("ws://") || relay_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidRelayUrl(relay_url.to_string()));
        }
        if !stories_dir.is_dir() {
            return Err(ConfigError::StoriesDirMissing(stories_dir));
        }
        let namespace = namespace.trim();
        if namespace.is_empty()
            || !namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(ConfigError::InvalidNamespace(namespace.to_string()));
        }

        Ok(Self {
            relay_url: relay_url.to_string(),
            stories_dir,
            namespace: namespace.to_ascii_uppercase(),
            media,
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            namespace: self.namespace.clone(),
            ..SessionConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_core::ReconnectConfig;
    use tempfile::TempDir;

    #[test]
    fn test_valid_config() {
        let dir = TempDir::new().unwrap();
        let config =
            ClientConfig::new(" ws://127.0.0.1:9300 ", dir.path().to_path_buf(), "aventura", true)
                .unwrap();

        assert_eq!(config.relay_url, "ws://127.0.0.1:9300");
        assert_eq!(config.namespace, "AVENTURA");
        assert_eq!(
            config.session_config(),
            SessionConfig {
                namespace: "AVENTURA".to_string(),
                reconnect: ReconnectConfig::default(),
            }
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        let dir = TempDir::new().unwrap();
        let stories = dir.path().to_path_buf();

        assert!(matches!(
            ClientConfig::new("http://relay", stories.clone(), "AVENTURA", true),
            Err(ConfigError::InvalidRelayUrl(_))
        ));
        assert!(matches!(
            ClientConfig::new("ws://relay", stories.join("missing"), "AVENTURA", true),
            Err(ConfigError::StoriesDirMissing(_))
        ));
        assert!(matches!(
            ClientConfig::new("ws://relay", stories, "two words", true),
            Err(ConfigError::InvalidNamespace(_))
        ));
    }
}
