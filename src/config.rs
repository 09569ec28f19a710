use std::{collections::HashSet, fs, path::Path};

use anyhow::Context;
use serde::Deserialize;

/// Main gateway config, one YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    /// HTTP-route adapter configs keyed by type tag (`apisix`, ...); the
    /// value is the adapter's raw JSON config.
    #[serde(default)]
    pub http_routes: std::collections::HashMap<String, String>,
    pub listener_file: String,
    #[serde(default)]
    pub ssl_file: String,
    #[serde(default)]
    pub auto_reload: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: String,
}

impl GatewayConfig {
    /// Address the tunnel server binds. Operators may write `listen_addr`
    /// as just `:port`, which means every interface.
    pub fn bind_addr(&self) -> String {
        let addr = self.listen_addr.trim();
        match addr.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => addr.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("parse yaml {}", path.display()))?;
    if cfg.gateway.listen_addr.trim().is_empty() {
        anyhow::bail!("config: gateway.listen_addr is required");
    }
    if cfg.listener_file.trim().is_empty() {
        anyhow::bail!("config: listener_file is required");
    }
    Ok(cfg)
}

/// One public endpoint and the backend it maps to, from the listener file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListenerConfig {
    pub id: String,
    pub client_id: String,
    /// tcp | udp | http | https
    pub public_protocol: String,
    #[serde(default)]
    pub public_ip: String,
    pub public_port: u16,
    /// tcp | udp
    pub internal_protocol: String,
    pub internal_ip: String,
    pub internal_port: u16,
    #[serde(default)]
    pub http_route_type: Option<String>,
    #[serde(default)]
    pub http_param: Option<serde_json::Value>,
}

impl ListenerConfig {
    /// Public socket address for this endpoint. Listener files routinely
    /// leave `public_ip` empty to bind every interface.
    pub fn public_bind_addr(&self) -> String {
        let host = self.public_ip.trim();
        if host.is_empty() {
            format!("0.0.0.0:{}", self.public_port)
        } else {
            format!("{host}:{}", self.public_port)
        }
    }
}

/// Parses the listener file (a JSON array). Listener IDs must be unique;
/// a duplicate makes the whole file invalid so the watcher skips the cycle.
pub fn load_listener_configs(path: &Path) -> anyhow::Result<Vec<ListenerConfig>> {
    let data =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let configs: Vec<ListenerConfig> = serde_json::from_str(&data)
        .with_context(|| format!("parse listener file {}", path.display()))?;

    {
        let mut seen = HashSet::new();
        for cfg in &configs {
            if cfg.id.trim().is_empty() {
                anyhow::bail!("listener file {}: empty listener id", path.display());
            }
            if !seen.insert(cfg.id.as_str()) {
                anyhow::bail!(
                    "listener file {}: duplicate listener id {}",
                    path.display(),
                    cfg.id
                );
            }
        }
    }
    Ok(configs)
}

/// TLS material pushed to the external HTTP router at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct SslConfig {
    pub id: String,
    pub http_route_type: String,
    pub cert_file: String,
    pub key_file: String,
    #[serde(default)]
    pub snis: Vec<String>,
}

pub fn load_ssl_configs(path: &Path) -> anyhow::Result<Vec<SslConfig>> {
    let data =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let configs: Vec<SslConfig> = serde_json::from_str(&data)
        .with_context(|| format!("parse ssl file {}", path.display()))?;
    Ok(configs)
}
