use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{FrontendError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "sqlfe_config.json";

/// How a query carrying several statements is treated when the client did
/// not negotiate CLIENT_MULTI_STATEMENTS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiStatementMode {
    Off,
    On,
    Warn,
}

impl std::str::FromStr for MultiStatementMode {
    type Err = FrontendError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "0" => Ok(MultiStatementMode::Off),
            "on" | "1" => Ok(MultiStatementMode::On),
            "warn" | "2" => Ok(MultiStatementMode::Warn),
            other => Err(FrontendError::Config(format!(
                "invalid multi_statement_mode '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

impl TlsConfig {
    pub fn is_configured(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }
}

/// A user account served by the in-memory privilege manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    #[serde(default = "default_user_host")]
    pub host: String,
    #[serde(default)]
    pub password: String,
    /// Empty means "not set"; handshakes fall back to mysql_native_password.
    #[serde(default)]
    pub plugin: String,
    #[serde(default)]
    pub connection_admin: bool,
    /// OS account allowed to log in as this user through auth_socket.
    #[serde(default)]
    pub socket_user: Option<String>,
}

fn default_user_host() -> String {
    "%".to_string()
}

/// A table served by the in-memory executor. Every cell is a string; `NULL`
/// is written as JSON null.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub database: String,
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Option<String>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub socket: Option<String>,
    pub server_version: String,
    pub max_connections: usize,
    pub max_allowed_packet: usize,
    pub wait_timeout_secs: u64,
    pub require_secure_transport: bool,
    pub tls: TlsConfig,
    pub default_auth_plugin: String,
    pub init_connect: String,
    pub multi_statement_mode: MultiStatementMode,
    pub collation_server: String,
    pub auth_cache_ttl_secs: u64,
    pub graceful_shutdown_timeout_secs: u64,
    pub users: Vec<UserConfig>,
    pub tables: Vec<TableConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            socket: None,
            server_version: "8.0.11-sqlfe".to_string(),
            max_connections: 0,
            max_allowed_packet: 64 << 20,
            wait_timeout_secs: 28800,
            require_secure_transport: false,
            tls: TlsConfig::default(),
            default_auth_plugin: "mysql_native_password".to_string(),
            init_connect: String::new(),
            multi_statement_mode: MultiStatementMode::Off,
            collation_server: "utf8mb4_bin".to_string(),
            auth_cache_ttl_secs: 30,
            graceful_shutdown_timeout_secs: 30,
            users: vec![UserConfig {
                name: "root".to_string(),
                host: "%".to_string(),
                password: String::new(),
                plugin: "mysql_native_password".to_string(),
                connection_admin: true,
                socket_user: None,
            }],
            tables: Vec::new(),
        }
    }
}

impl Config {
    /// Load from `SQLFE_CONFIG` (or `sqlfe_config.json`), then apply env overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("SQLFE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let mut config = match fs::read_to_string(&path) {
            Ok(content) => Self::from_json(&content)?,
            Err(_) => {
                let config = Config::default();
                // Leave an example next to the expected path for reference.
                if let Ok(example) = serde_json::to_string_pretty(&config) {
                    let _ = fs::write(format!("{}.example", path), example);
                }
                config
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = Self::from_json(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| FrontendError::Config(e.to_string()))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("SQLFE_HOST") {
            debug!("Overriding host from SQLFE_HOST");
            self.host = host;
        }
        if let Ok(port) = std::env::var("SQLFE_PORT") {
            if let Ok(port_num) = port.parse::<u16>() {
                self.port = port_num;
            }
        }
        if let Ok(socket) = std::env::var("SQLFE_SOCKET") {
            self.socket = if socket.is_empty() { None } else { Some(socket) };
        }
        if let Ok(timeout) = std::env::var("SQLFE_WAIT_TIMEOUT") {
            if let Ok(secs) = timeout.parse::<u64>() {
                self.wait_timeout_secs = secs;
            }
        }
        if let Ok(max) = std::env::var("SQLFE_MAX_CONNECTIONS") {
            if let Ok(max) = max.parse::<usize>() {
                self.max_connections = max;
            }
        }
        if let Ok(flag) = std::env::var("SQLFE_REQUIRE_SECURE_TRANSPORT") {
            self.require_secure_transport = matches!(flag.as_str(), "1" | "true" | "ON" | "on");
        }
        if let Ok(cert) = std::env::var("SQLFE_TLS_CERT") {
            self.tls.cert_path = Some(cert);
        }
        if let Ok(key) = std::env::var("SQLFE_TLS_KEY") {
            self.tls.key_path = Some(key);
        }
        if let Ok(mode) = std::env::var("SQLFE_MULTI_STATEMENT") {
            match mode.parse() {
                Ok(mode) => self.multi_statement_mode = mode,
                Err(e) => warn!("ignoring SQLFE_MULTI_STATEMENT: {}", e),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tls.cert_path.is_some() != self.tls.key_path.is_some() {
            return Err(FrontendError::Config(
                "tls.cert_path and tls.key_path must be set together".to_string(),
            ));
        }
        if self.require_secure_transport && !self.tls.is_configured() {
            return Err(FrontendError::Config(
                "require_secure_transport needs a TLS certificate and key".to_string(),
            ));
        }
        if self.max_allowed_packet == 0 {
            return Err(FrontendError::Config(
                "max_allowed_packet must be positive".to_string(),
            ));
        }
        if self.port == 0 && self.socket.is_none() && self.host != "127.0.0.1" {
            return Err(FrontendError::Config(
                "port 0 is only allowed on loopback or alongside a unix socket".to_string(),
            ));
        }
        if crate::expression::charset::collation_by_name(&self.collation_server).is_none() {
            return Err(FrontendError::Config(format!(
                "unknown collation_server '{}'",
                self.collation_server
            )));
        }
        if crate::mysql::auth::AuthPlugin::from_name(&self.default_auth_plugin).is_none() {
            return Err(FrontendError::Config(format!(
                "unknown default_auth_plugin '{}'",
                self.default_auth_plugin
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_allowed_packet, 64 * 1024 * 1024);
        assert_eq!(config.multi_statement_mode, MultiStatementMode::Off);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = Config::from_json(r#"{"port": 3307, "multi_statement_mode": "warn"}"#).unwrap();
        assert_eq!(config.port, 3307);
        assert_eq!(config.multi_statement_mode, MultiStatementMode::Warn);
        assert_eq!(config.wait_timeout_secs, 28800);
    }

    #[test]
    fn test_half_configured_tls_is_rejected() {
        let mut config = Config::default();
        config.tls.cert_path = Some("/tmp/cert.pem".to_string());
        assert!(matches!(config.validate(), Err(FrontendError::Config(_))));
    }

    #[test]
    fn test_secure_transport_without_tls_is_rejected() {
        let config = Config {
            require_secure_transport: true,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"users": [{{"name": "app", "password": "secret", "plugin": "caching_sha2_password"}}]}}"#
        )
        .unwrap();
        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.users.len(), 1);
        assert_eq!(config.users[0].host, "%");
        assert_eq!(config.users[0].plugin, "caching_sha2_password");
    }

    #[test]
    fn test_multi_statement_mode_parse() {
        assert_eq!("ON".parse::<MultiStatementMode>().unwrap(), MultiStatementMode::On);
        assert_eq!("2".parse::<MultiStatementMode>().unwrap(), MultiStatementMode::Warn);
        assert!("sometimes".parse::<MultiStatementMode>().is_err());
    }
}
