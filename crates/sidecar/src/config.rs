//! Configuration loader — TOML file + environment variable overrides.
//!
//! Grounded on `crates/agent/src/config.rs::AgentConfig::load()`'s
//! file-then-env layering: environment variables always win over the
//! config file for the options operators most often need to override at
//! deploy time.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    pub hostname: String,
    pub bind_address: String,
    pub discovery: DiscoveryConfig,
    pub snapshotter: SnapshotterConfig,
    pub health: HealthConfig,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            bind_address: "0.0.0.0:9901".to_string(),
            discovery: DiscoveryConfig::default(),
            snapshotter: SnapshotterConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

/// Discovery-source configuration (spec §6 "Discovery-source configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Container-runtime URL; empty means read from the environment
    /// (`DOCKER_HOST`, or the platform default socket).
    pub endpoint: String,
    /// `"regex"` or `"label"`.
    pub namer: String,
    /// Regex pattern (namer=regex) or label key (namer=label).
    pub namer_arg: String,
    /// IP used when synthesizing listener-notification URLs.
    pub advertise_ip: String,
    /// Path to the static-JSON target file; empty disables the source.
    pub config_file: String,
    /// Fallback IP for static targets' ports that omit one.
    pub default_ip: String,
    pub kube_host: String,
    pub kube_port: u16,
    pub namespace: String,
    pub timeout_secs: u64,
    pub creds_path: String,
    pub poll_interval_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            namer: "label".to_string(),
            namer_arg: "sidecar.service".to_string(),
            advertise_ip: "127.0.0.1".to_string(),
            config_file: String::new(),
            default_ip: String::new(),
            kube_host: String::new(),
            kube_port: 0,
            namespace: "default".to_string(),
            timeout_secs: 5,
            creds_path: String::new(),
            poll_interval_secs: 5,
        }
    }
}

impl DiscoveryConfig {
    pub fn cluster_api_enabled(&self) -> bool {
        !self.kube_host.is_empty()
    }

    pub fn static_file_enabled(&self) -> bool {
        !self.config_file.is_empty()
    }

    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.kube_host, self.kube_port)
    }
}

/// Proxy snapshotter configuration (spec §6 "Proxy snapshotter configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotterConfig {
    pub bind_ip: String,
    pub use_hostnames: bool,
    pub use_grpc_api: bool,
    pub update_interval_secs: u64,
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".to_string(),
            use_hostnames: false,
            use_grpc_api: true,
            update_interval_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_secs: u64,
    pub default_check_host: String,
    pub default_check_endpoint: String,
    pub reconcile_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 3,
            default_check_host: crate::health::DEFAULT_CHECK_HOST.to_string(),
            default_check_endpoint: crate::health::DEFAULT_CHECK_ENDPOINT.to_string(),
            reconcile_interval_secs: 5,
        }
    }
}

fn default_hostname() -> String {
    hostname_from_env().unwrap_or_else(|| "localhost".to_string())
}

fn hostname_from_env() -> Option<String> {
    std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty())
}

impl SidecarConfig {
    /// Load from `SIDECAR_CONFIG_FILE` (default `/etc/sidecar/sidecar.toml`)
    /// if present, else environment variables, with environment variables
    /// always overriding file-loaded values for the options below.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path =
            std::env::var("SIDECAR_CONFIG_FILE").unwrap_or_else(|_| "/etc/sidecar/sidecar.toml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            tracing::info!("loading configuration from {}", config_path);
            Self::from_file(&config_path)?
        } else {
            tracing::info!("config file not found at {}, using defaults + environment", config_path);
            Self::default()
        };

        if let Ok(hostname) = std::env::var("SIDECAR_HOSTNAME") {
            config.hostname = hostname;
        }
        if let Ok(bind) = std::env::var("SIDECAR_BIND_ADDRESS") {
            config.bind_address = bind;
        }
        if let Ok(endpoint) = std::env::var("SIDECAR_DISCOVERY_ENDPOINT") {
            config.discovery.endpoint = endpoint;
        }
        if let Ok(config_file) = std::env::var("SIDECAR_STATIC_CONFIG_FILE") {
            config.discovery.config_file = config_file;
        }
        if let Ok(kube_host) = std::env::var("SIDECAR_KUBE_HOST") {
            config.discovery.kube_host = kube_host;
        }
        if let Ok(creds_path) = std::env::var("SIDECAR_CREDS_PATH") {
            config.discovery.creds_path = creds_path;
        }
        if let Ok(bind_ip) = std::env::var("SIDECAR_BIND_IP") {
            config.snapshotter.bind_ip = bind_ip;
        }

        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: SidecarConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.hostname.is_empty() {
            return Err("hostname must not be empty".to_string());
        }
        if self.bind_address.is_empty() {
            return Err("bind_address must not be empty".to_string());
        }
        if self.health.check_interval_secs == 0 {
            return Err("health.check_interval_secs must be > 0".to_string());
        }
        if self.discovery.cluster_api_enabled() && self.discovery.creds_path.is_empty() {
            return Err("discovery.creds_path is required when discovery.kube_host is set".to_string());
        }
        Ok(())
    }
}
