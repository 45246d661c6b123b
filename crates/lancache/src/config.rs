//! Configuration loading

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::info;

/// The port that switches the HTTP listener to self-signed TLS
pub const HTTPS_PORT: u16 = 443;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub dns: DnsSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address shared by the HTTP and DNS listeners
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port for the mirror; 443 enables the self-signed TLS shim
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_enabled")]
    pub http_enabled: bool,
    /// UDP port for the DNS interceptor
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,
    #[serde(default = "default_enabled")]
    pub dns_enabled: bool,
}

/// Cache storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: String,
}

/// Upstream registry and resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Intercepted registry hostname; also the cache-key registry
    /// field and, by default, the HTTPS origin for misses
    #[serde(default = "default_registry")]
    pub registry: String,
    /// Explicit upstream base URL, overriding the derived one
    #[serde(default)]
    pub url: Option<String>,
    /// Resolver that answers non-intercepted DNS queries
    #[serde(default = "default_upstream_dns")]
    pub dns: String,
    /// Total timeout for control requests, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// DNS interception configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DnsSettings {
    /// IPv4 handed to intercepted clients; defaults to the host's
    /// first non-loopback address
    #[serde(default)]
    pub redirect_ip: Option<Ipv4Addr>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            http_port: default_http_port(),
            http_enabled: default_enabled(),
            dns_port: default_dns_port(),
            dns_enabled: default_enabled(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            registry: default_registry(),
            url: None,
            dns: default_upstream_dns(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cache: CacheConfig::default(),
            upstream: UpstreamConfig::default(),
            dns: DnsSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_dns_port() -> u16 {
    53
}

fn default_enabled() -> bool {
    true
}

fn default_cache_dir() -> String {
    "./data/cache".to_string()
}

fn default_registry() -> String {
    "registry.ollama.ai".to_string()
}

fn default_upstream_dns() -> String {
    "1.1.1.1:53".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &str) -> Result<Self> {
        let config_path = Path::new(path);

        if !config_path.exists() {
            info!("Config file not found at {}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        info!("Loaded configuration from {}", path);
        Ok(config)
    }

    /// The upstream base URL, derived from the intercepted hostname
    /// unless overridden
    pub fn upstream_url(&self) -> String {
        self.upstream
            .url
            .clone()
            .unwrap_or_else(|| format!("https://{}", self.upstream.registry))
    }
}
