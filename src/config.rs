//! Configuration parsing and management

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Certificate authority and MITM settings
    #[serde(default)]
    pub tls: TlsConfig,

    /// Upstream connection settings
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Transaction log settings
    #[serde(default)]
    pub log: TransactionLogConfig,

    /// Console logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Modifier pipeline installed at startup
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Proxy-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Address to bind the proxy server
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Host name that addresses the configuration API through the proxy
    #[serde(default = "default_api_host")]
    pub api_host: String,

    /// Answer CORS preflights and add CORS headers on API responses
    #[serde(default)]
    pub cors: bool,

    /// Name used in the Via header and as the certificate organization
    #[serde(default = "default_signature")]
    pub signature: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            api_host: default_api_host(),
            cors: false,
            signature: default_signature(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1:50080".to_string()
}

fn default_api_host() -> String {
    "tapline.proxy".to_string()
}

fn default_signature() -> String {
    "tapline".to_string()
}

/// Certificate authority and MITM configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Intercept CONNECT tunnels; when false tunnels are spliced through untouched
    #[serde(default = "default_true")]
    pub mitm: bool,

    /// Path to a PEM CA certificate; a fresh CA is generated when unset
    pub ca_cert: Option<String>,

    /// Path to the PEM private key of `ca_cert`
    pub ca_key: Option<String>,

    /// Half-width of the leaf certificate validity window, in seconds
    #[serde(default = "default_validity_secs")]
    pub validity_secs: u64,

    /// Validity of a generated root certificate, in seconds
    #[serde(default = "default_authority_validity_secs")]
    pub authority_validity_secs: u64,

    /// Skip verification of upstream server certificates. Insecure, testing only.
    #[serde(default)]
    pub skip_tls_verify: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            mitm: true,
            ca_cert: None,
            ca_key: None,
            validity_secs: default_validity_secs(),
            authority_validity_secs: default_authority_validity_secs(),
            skip_tls_verify: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Upper bound for either validity setting, roughly a century
pub const MAX_VALIDITY_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn default_validity_secs() -> u64 {
    60 * 60
}

fn default_authority_validity_secs() -> u64 {
    30 * 24 * 60 * 60
}

impl TlsConfig {
    pub fn validity(&self) -> Duration {
        Duration::from_secs(self.validity_secs)
    }

    pub fn authority_validity(&self) -> Duration {
        Duration::from_secs(self.authority_validity_secs)
    }
}

/// Upstream dialing and keep-alive policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Timeout for establishing the TCP connection, in seconds
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// How long an idle upstream connection is kept for reuse, in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Never reuse upstream connections
    #[serde(default)]
    pub disable_keepalive: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: default_dial_timeout_secs(),
            keepalive_secs: default_keepalive_secs(),
            disable_keepalive: false,
        }
    }
}

fn default_dial_timeout_secs() -> u64 {
    30
}

fn default_keepalive_secs() -> u64 {
    30
}

impl UpstreamConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

/// Transaction log (HAR entries) configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransactionLogConfig {
    /// JSONL file the exporter appends to. When unset nothing is written to
    /// disk, but exchanges are still recorded in memory for the HAR API.
    #[serde(default = "default_log_path")]
    pub path: Option<String>,

    /// Seconds between two exports of the in-memory buffer
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Leave CONNECT entries out of the log file
    #[serde(default = "default_true")]
    pub skip_connect: bool,

    /// Capture request and response bodies
    #[serde(default = "default_true")]
    pub capture_bodies: bool,

    /// Bodies longer than this are truncated in the entry
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for TransactionLogConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            sync_interval_secs: default_sync_interval_secs(),
            skip_connect: true,
            capture_bodies: true,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_log_path() -> Option<String> {
    Some("./tapline.log".to_string())
}

fn default_sync_interval_secs() -> u64 {
    2
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl TransactionLogConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

/// Console logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Include decoded bodies in the console logger's output
    #[serde(default)]
    pub log_bodies: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_bodies: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Pipeline installed before the first connection is accepted
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Path to a JSON modifier message
    pub file: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.proxy.signature.trim().is_empty() {
            return Err(Error::config("`proxy.signature` must not be empty"));
        }
        if self.proxy.api_host.trim().is_empty() {
            return Err(Error::config("`proxy.api_host` must not be empty"));
        }
        if self.tls.validity_secs == 0 {
            return Err(Error::config("`tls.validity_secs` must be greater than zero"));
        }
        if self.tls.authority_validity_secs == 0 {
            return Err(Error::config(
                "`tls.authority_validity_secs` must be greater than zero",
            ));
        }
        if self.tls.validity_secs > MAX_VALIDITY_SECS
            || self.tls.authority_validity_secs > MAX_VALIDITY_SECS
        {
            return Err(Error::config(format!(
                "`tls.validity_secs` and `tls.authority_validity_secs` must not exceed {}",
                MAX_VALIDITY_SECS
            )));
        }
        if self.tls.validity_secs >= self.tls.authority_validity_secs {
            return Err(Error::config(
                "`tls.validity_secs` must be less than `tls.authority_validity_secs`",
            ));
        }
        if self.tls.ca_cert.is_some() != self.tls.ca_key.is_some() {
            return Err(Error::config(
                "`tls.ca_cert` and `tls.ca_key` must be set together",
            ));
        }
        if self.log.sync_interval_secs == 0 {
            return Err(Error::config(
                "`log.sync_interval_secs` must be greater than zero",
            ));
        }
        if self.upstream.dial_timeout_secs == 0 {
            return Err(Error::config(
                "`upstream.dial_timeout_secs` must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Create a minimal configuration: no transaction log file, generated CA
    pub fn minimal(bind_address: String) -> Self {
        let mut config = Self::default();
        config.proxy.bind_address = bind_address;
        config.log.path = None;
        config
    }
}
