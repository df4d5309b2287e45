use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for the relay.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// UDP port for the tunnel relay. Ports at or below 1024 fall back to the default.
    #[serde(default = "default_tunnel_port")]
    pub tunnel_port: u16,

    /// UDP port for the endpoint-reflection responder.
    #[serde(default = "default_reflection_port")]
    pub reflection_port: u16,

    /// Ceiling on the client table size.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Maximum admitted clients per source IP.
    #[serde(default = "default_ip_limit")]
    pub ip_limit: u32,

    /// Instance name reported to the master directory.
    #[serde(default = "default_name")]
    pub name: String,

    /// Master directory announce endpoint.
    #[serde(default)]
    pub master_url: String,

    /// Credential passed to the master on announce.
    #[serde(default)]
    pub master_password: String,

    /// Password gating the maintenance command. Absent disables the command.
    #[serde(default)]
    pub maintenance_password: Option<String>,

    /// Skip the HTTP announce step; cleanup still runs.
    #[serde(default)]
    pub no_master_announce: bool,

    /// Idle seconds before a client is evicted.
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tunnel_port: default_tunnel_port(),
            reflection_port: default_reflection_port(),
            max_clients: default_max_clients(),
            ip_limit: default_ip_limit(),
            name: default_name(),
            master_url: String::new(),
            master_password: String::new(),
            maintenance_password: None,
            no_master_announce: false,
            client_timeout_secs: default_client_timeout(),
        }
    }
}

fn default_tunnel_port() -> u16 {
    50001
}
fn default_reflection_port() -> u16 {
    8054
}
fn default_max_clients() -> usize {
    200
}
fn default_ip_limit() -> u32 {
    8
}
fn default_name() -> String {
    "Unnamed server".to_string()
}
fn default_client_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = toml::from_str(&content).context("Failed to parse TOML config")?;
        Ok(config)
    }

    /// Load from default paths or return default config.
    pub fn load_or_default() -> Self {
        let paths = [
            "/etc/gamerelay/config.toml",
            "~/.gamerelay/config.toml",
            "./config.toml",
        ];

        for path in &paths {
            let expanded = shellexpand::tilde(path).to_string();
            if Path::new(&expanded).exists() {
                if let Ok(config) = Self::load(&expanded) {
                    return config;
                }
            }
        }

        Self::default()
    }

    /// Coerce out-of-range values and sanitize the reported name.
    ///
    /// Returns the config with every field in its documented range, so the
    /// rest of the daemon never has to re-check.
    pub fn sanitized(mut self) -> Self {
        if self.tunnel_port <= 1024 {
            self.tunnel_port = default_tunnel_port();
        }
        if self.max_clients < 2 {
            self.max_clients = default_max_clients();
        }
        if self.ip_limit < 1 {
            self.ip_limit = default_ip_limit();
        }
        self.name = self.name.replace(';', "");
        if self.name.is_empty() {
            self.name = default_name();
        }
        if let Some(pw) = &self.maintenance_password {
            if pw.is_empty() {
                self.maintenance_password = None;
            }
        }
        self
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}
