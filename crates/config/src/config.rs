//! Configuration structures and parsing for shellgate

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream gateway settings
    #[serde(default)]
    pub proxy: ProxyConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.is_empty() {
            return Err(ConfigError::Validation(
                "Server has no listen addresses".to_string(),
            ));
        }

        if self.server.cert_path.is_some() != self.server.key_path.is_some() {
            return Err(ConfigError::Validation(
                "cert_path and key_path must be configured together".to_string(),
            ));
        }

        if self.proxy.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        if !matches!(self.proxy.upstream_scheme.as_str(), "ws" | "wss") {
            return Err(ConfigError::Validation(format!(
                "Unsupported upstream scheme '{}' (expected 'ws' or 'wss')",
                self.proxy.upstream_scheme
            )));
        }

        for (host, addr) in &self.proxy.resolve {
            if addr.parse::<SocketAddr>().is_err() {
                return Err(ConfigError::Validation(format!(
                    "Resolve override for '{}' is not a socket address: {}",
                    host, addr
                )));
            }
        }

        let ratio = self.global.tracing.sampling_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::Validation(format!(
                "sampling_ratio must be between 0.0 and 1.0, got {}",
                ratio
            )));
        }

        if self.proxy.secret().is_none() {
            // Not fatal at load time: every upgrade is answered with 500 until a secret is set.
            warn!(
                env = %self.proxy.hmac_secret_env,
                "No HMAC secret configured; upgrade requests will be rejected"
            );
        }

        Ok(())
    }
}

/// Global configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Access log file path (optional)
    #[serde(default)]
    pub access_log: Option<String>,

    /// Access log format: "common" or "json"
    #[serde(default = "default_log_format")]
    pub access_log_format: String,

    /// Grace period for graceful shutdown in seconds (default: 30)
    #[serde(default = "default_grace_period")]
    pub grace_period: u64,

    /// OpenTelemetry tracing configuration
    #[serde(default)]
    pub tracing: TracingConfig,
}

fn default_log_format() -> String {
    "common".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_grace_period() -> u64 {
    30
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            access_log: None,
            access_log_format: default_log_format(),
            grace_period: default_grace_period(),
            tracing: TracingConfig::default(),
        }
    }
}

/// OpenTelemetry tracing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Enable OpenTelemetry tracing
    #[serde(default)]
    pub enabled: bool,

    /// OTLP endpoint (e.g., "http://localhost:4317")
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Sampling ratio (0.0 to 1.0, default: 1.0 = sample everything)
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "shellgate".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen addresses (":8080" is shorthand for "0.0.0.0:8080")
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,

    /// Certificate for TLS listeners (PEM)
    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    /// Private key for TLS listeners (PEM)
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

fn default_listen() -> Vec<String> {
    vec!["0.0.0.0:8080".to_string()]
}

impl ServerConfig {
    /// TLS certificate and key paths, when both are configured
    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.cert_path, &self.key_path) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cert_path: None,
            key_path: None,
        }
    }
}

/// Upstream gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Secret used to sign upstream auth tokens (takes priority over the environment)
    #[serde(default)]
    pub hmac_secret: Option<String>,

    /// Environment variable consulted when `hmac_secret` is unset
    #[serde(default = "default_hmac_secret_env")]
    pub hmac_secret_env: String,

    /// Scheme for upstream handshakes: "wss" or "ws"
    #[serde(default = "default_upstream_scheme")]
    pub upstream_scheme: String,

    /// Upstream port (defaults to 443 for wss, 80 for ws)
    #[serde(default)]
    pub upstream_port: Option<u16>,

    /// Maximum number of candidates tried per request
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// TCP connect timeout per candidate in milliseconds (0 = none)
    #[serde(default)]
    pub connect_timeout_ms: u64,

    /// Pass the client's Sec-WebSocket-Extensions header upstream
    #[serde(default = "default_forward_extensions")]
    pub forward_extensions: bool,

    /// Header carrying the identifying client IP
    #[serde(default = "default_client_ip_header")]
    pub client_ip_header: String,

    /// Header carrying the client country code
    #[serde(default = "default_country_header")]
    pub country_header: String,

    /// Name of the backend affinity cookie
    #[serde(default = "default_affinity_cookie")]
    pub affinity_cookie: String,

    /// Host header suffix identifying internal probe clients
    #[serde(default = "default_probe_host_suffix")]
    pub probe_host_suffix: String,

    /// Static host -> "ip:port" overrides used instead of DNS
    #[serde(default)]
    pub resolve: HashMap<String, String>,
}

fn default_hmac_secret_env() -> String {
    "HMAC_SECRET".to_string()
}

fn default_upstream_scheme() -> String {
    "wss".to_string()
}

fn default_max_attempts() -> usize {
    30
}

fn default_forward_extensions() -> bool {
    true
}

fn default_client_ip_header() -> String {
    "cf-connecting-ip".to_string()
}

fn default_country_header() -> String {
    "cf-ipcountry".to_string()
}

fn default_affinity_cookie() -> String {
    "ws_upstream".to_string()
}

fn default_probe_host_suffix() -> String {
    "github.io".to_string()
}

impl ProxyConfig {
    /// Resolve the signing secret from the config file or the environment.
    ///
    /// Empty values count as absent.
    pub fn secret(&self) -> Option<String> {
        self.hmac_secret
            .clone()
            .or_else(|| std::env::var(&self.hmac_secret_env).ok())
            .filter(|s| !s.is_empty())
    }

    /// Port used for upstream connections
    pub fn effective_upstream_port(&self) -> u16 {
        self.upstream_port.unwrap_or(match self.upstream_scheme.as_str() {
            "ws" => 80,
            _ => 443,
        })
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            hmac_secret: None,
            hmac_secret_env: default_hmac_secret_env(),
            upstream_scheme: default_upstream_scheme(),
            upstream_port: None,
            max_attempts: default_max_attempts(),
            connect_timeout_ms: 0,
            forward_extensions: default_forward_extensions(),
            client_ip_header: default_client_ip_header(),
            country_header: default_country_header(),
            affinity_cookie: default_affinity_cookie(),
            probe_host_suffix: default_probe_host_suffix(),
            resolve: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.global.log_level, "info");
        assert_eq!(config.server.listen, vec!["0.0.0.0:8080".to_string()]);
        assert_eq!(config.proxy.max_attempts, 30);
        assert_eq!(config.proxy.upstream_scheme, "wss");
        assert_eq!(config.proxy.affinity_cookie, "ws_upstream");
        assert_eq!(config.proxy.probe_host_suffix, "github.io");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[global]
log_level = "debug"
access_log_format = "json"

[server]
listen = [":9000"]

[proxy]
hmac_secret = "s3cret"
upstream_scheme = "ws"
max_attempts = 5
client_ip_header = "x-real-ip"

[proxy.resolve]
"shellshock.io" = "127.0.0.1:9001"
"#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.global.log_level, "debug");
        assert_eq!(config.server.listen, vec![":9000".to_string()]);
        assert_eq!(config.proxy.secret().as_deref(), Some("s3cret"));
        assert_eq!(config.proxy.max_attempts, 5);
        assert_eq!(config.proxy.client_ip_header, "x-real-ip");
        assert_eq!(config.proxy.effective_upstream_port(), 80);
        assert_eq!(
            config.proxy.resolve.get("shellshock.io").map(String::as_str),
            Some("127.0.0.1:9001")
        );
    }

    #[test]
    fn test_upstream_port_defaults() {
        let mut proxy = ProxyConfig::default();
        assert_eq!(proxy.effective_upstream_port(), 443);

        proxy.upstream_scheme = "ws".to_string();
        assert_eq!(proxy.effective_upstream_port(), 80);

        proxy.upstream_port = Some(8443);
        assert_eq!(proxy.effective_upstream_port(), 8443);
    }

    #[test]
    fn test_empty_secret_is_absent() {
        let proxy = ProxyConfig {
            hmac_secret: Some(String::new()),
            hmac_secret_env: "SHELLGATE_TEST_UNSET_SECRET".to_string(),
            ..ProxyConfig::default()
        };
        assert!(proxy.secret().is_none());
    }

    #[test]
    fn test_validation_no_listen() {
        let toml = r#"
[server]
listen = []
"#;
        let result = Config::from_toml(toml);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validation_bad_scheme() {
        let toml = r#"
[proxy]
upstream_scheme = "https"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_validation_zero_attempts() {
        let toml = r#"
[proxy]
max_attempts = 0
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_validation_cert_without_key() {
        let toml = r#"
[server]
listen = [":443"]
cert_path = "/etc/shellgate/cert.pem"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_validation_bad_resolve_override() {
        let toml = r#"
[proxy.resolve]
"shellshock.io" = "not-an-address"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_validation_sampling_ratio() {
        let toml = r#"
[global.tracing]
enabled = true
sampling_ratio = 1.5
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_tls_paths() {
        let mut server = ServerConfig::default();
        assert!(server.tls_paths().is_none());

        server.cert_path = Some(PathBuf::from("cert.pem"));
        server.key_path = Some(PathBuf::from("key.pem"));
        let (cert, key) = server.tls_paths().unwrap();
        assert_eq!(cert, Path::new("cert.pem"));
        assert_eq!(key, Path::new("key.pem"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
listen = ["127.0.0.1:8081"]

[proxy]
hmac_secret = "from-file"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.listen, vec!["127.0.0.1:8081".to_string()]);
        assert_eq!(config.proxy.secret().as_deref(), Some("from-file"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load("/nonexistent/shellgate.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
