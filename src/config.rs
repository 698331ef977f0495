//! Server configuration.
//!
//! Usable programmatically via [`ServerConfig::default`] or loaded from a
//! TOML file. Applications own process startup and CLI handling; this module
//! only shapes the engine itself.

use std::path::Path;

use serde::Deserialize;

use crate::poller::Backend;

/// Engine configuration for a [`Server`](crate::server::Server).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to (e.g. `127.0.0.1:23337`).
    pub listen: String,
    /// Maximum simultaneously connected peers.
    pub max_peers: usize,
    /// Readiness multiplexer backend.
    pub backend: Backend,
    /// Event batch capacity per poll call.
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_peers: default_max_peers(),
            backend: Backend::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:23337".to_string()
}

fn default_max_peers() -> usize {
    1024
}

fn default_event_capacity() -> usize {
    256
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::Config(format!("failed to read '{}': {}", path.display(), e))
        })?;
        toml::from_str(&contents).map_err(|e| {
            crate::Error::Config(format!("failed to parse '{}': {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen, "127.0.0.1:23337");
        assert_eq!(config.max_peers, 1024);
        assert_eq!(config.backend, Backend::Edge);
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            listen = "0.0.0.0:9000"
            max_peers = 64
            backend = "scan"
        "#;

        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.max_peers, 64);
        assert_eq!(config.backend, Backend::Scan);
        // unspecified fields fall back to defaults
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let toml_str = r#"backend = "uring""#;
        assert!(toml::from_str::<ServerConfig>(toml_str).is_err());
    }
}
