//! Client configuration
//!
//! JSON configuration file matching the classic SSR client layout.
//! Every field has a serde default so a minimal file only needs the
//! remote endpoint and credentials.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{ProxyError, Result};

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local SOCKS5 listen host
    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    /// Local SOCKS5 listen port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Remote SSR server host (IP literal or hostname)
    #[serde(default)]
    pub remote_host: String,

    /// Remote SSR server port
    #[serde(default)]
    pub remote_port: u16,

    /// Shared password the cipher key is derived from
    #[serde(default)]
    pub password: String,

    /// Stream cipher name (e.g. "aes-256-cfb", "chacha20", "rc4-md5")
    #[serde(default = "default_method")]
    pub method: String,

    /// Protocol plugin name (e.g. "auth_aes128_sha1")
    #[serde(default = "default_origin")]
    pub protocol: String,

    /// Protocol plugin parameter, optionally "uid:key"
    #[serde(default)]
    pub protocol_param: String,

    /// Obfs plugin name (e.g. "http_simple", "tls1.2_ticket_auth")
    #[serde(default = "default_plain")]
    pub obfs: String,

    /// Obfs plugin parameter (plugin-specific)
    #[serde(default)]
    pub obfs_param: String,

    /// Per-socket idle timeout in milliseconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Whether UDP ASSOCIATE requests get a success reply
    #[serde(default)]
    pub udp: bool,
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    1080
}

fn default_method() -> String {
    "aes-256-cfb".to_string()
}

fn default_origin() -> String {
    "origin".to_string()
}

fn default_plain() -> String {
    "plain".to_string()
}

fn default_idle_timeout() -> u64 {
    60_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            remote_host: String::new(),
            remote_port: 0,
            password: String::new(),
            method: default_method(),
            protocol: default_origin(),
            protocol_param: String::new(),
            obfs: default_plain(),
            obfs_param: String::new(),
            idle_timeout: default_idle_timeout(),
            udp: false,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Reject configurations that cannot possibly start a tunnel.
    pub fn validate(&self) -> Result<()> {
        if self.remote_host.is_empty() {
            return Err(ProxyError::Config("remote_host is required".to_string()));
        }
        if self.remote_port == 0 {
            return Err(ProxyError::Config("remote_port is required".to_string()));
        }
        if self.password.is_empty() {
            return Err(ProxyError::Config("password is required".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen_host, "127.0.0.1");
        assert_eq!(config.listen_port, 1080);
        assert_eq!(config.method, "aes-256-cfb");
        assert_eq!(config.protocol, "origin");
        assert_eq!(config.obfs, "plain");
        assert_eq!(config.idle_timeout, 60_000);
        assert!(!config.udp);
    }

    #[test]
    fn test_minimal_json() {
        let json = r#"{
            "remote_host": "203.0.113.9",
            "remote_port": 8388,
            "password": "secret",
            "method": "aes-128-cfb",
            "protocol": "auth_aes128_sha1",
            "obfs": "http_simple"
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.remote_host, "203.0.113.9");
        assert_eq!(config.remote_port, 8388);
        assert_eq!(config.protocol, "auth_aes128_sha1");
        assert_eq!(config.obfs, "http_simple");
        // Unspecified fields take their defaults.
        assert_eq!(config.listen_port, 1080);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_empty_remote() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_roundtrip() {
        let mut config = Config::default();
        config.remote_host = "example.net".to_string();
        config.remote_port = 443;
        config.password = "pw".to_string();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.remote_host, config.remote_host);
        assert_eq!(parsed.idle_timeout, config.idle_timeout);
    }
}
