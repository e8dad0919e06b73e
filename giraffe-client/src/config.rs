//! Client configuration: CLI/env flags layered over the JSON config file
//! at `$GIRAFFECLOUD_HOME/config.json`. Precedence: CLI > env > file.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

/// GiraffeCloud client agent.
///
/// Maintains the tunnel to the edge and forwards proxied requests to the
/// local service.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct ClientArgs {
    /// State directory (config, pid lock, certificates)
    #[arg(long, env = "GIRAFFECLOUD_HOME")]
    pub home: Option<PathBuf>,

    /// Tunnel token
    #[arg(long, env = "GIRAFFECLOUD_TOKEN")]
    pub token: Option<String>,

    /// Tunnel domain (optional when the account has exactly one enabled tunnel)
    #[arg(long, env = "GIRAFFECLOUD_DOMAIN")]
    pub domain: Option<String>,

    /// Local service port to expose
    #[arg(long, env = "GIRAFFECLOUD_LOCAL_PORT")]
    pub local_port: Option<u16>,

    /// Edge hostname
    #[arg(long, env = "GIRAFFECLOUD_SERVER_HOST")]
    pub server_host: Option<String>,

    /// Edge RPC tunnel port
    #[arg(long, env = "GIRAFFECLOUD_SERVER_PORT")]
    pub server_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "GIRAFFECLOUD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "GIRAFFECLOUD_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Raw-byte tunnel port; defaults to the RPC port + 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiSection {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecuritySection {
    #[serde(default)]
    pub ca_cert: Option<String>,
    #[serde(default)]
    pub client_cert: Option<String>,
    #[serde(default)]
    pub client_key: Option<String>,
}

/// On-disk config file (`config.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub local_port: Option<u16>,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default)]
    pub auto_update: bool,
}

impl ConfigFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no token configured (set `token` in config.json or --token)")]
    MissingToken,
    #[error("no local port configured")]
    MissingLocalPort,
    #[error("local port must be non-zero")]
    ZeroLocalPort,
    #[error("request deadline must be greater than zero")]
    ZeroDeadline,
    #[error("config file: {0}")]
    File(String),
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub home: PathBuf,
    pub token: String,
    pub domain: Option<String>,
    pub local_port: u16,
    pub server_host: String,
    pub server_port: u16,
    pub raw_port: u16,
    pub api_host: String,
    pub api_port: u16,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub test_mode: bool,
    pub auto_update: bool,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub stale_timeout_secs: u64,
    pub max_frame_bytes: usize,
    pub chunk_threshold: u64,
    pub log_level: String,
    pub log_json: bool,
}

impl ClientConfig {
    /// Merge CLI args over the config file under the chosen home.
    pub fn resolve(args: &ClientArgs) -> Result<Self, ConfigError> {
        let home = args.home.clone().unwrap_or_else(default_home);
        let file_path = home.join("config.json");
        let file = if file_path.exists() {
            ConfigFile::load(&file_path).map_err(|e| ConfigError::File(e.to_string()))?
        } else {
            ConfigFile::default()
        };

        let token = args
            .token
            .clone()
            .or(file.token)
            .ok_or(ConfigError::MissingToken)?;
        if token.is_empty() {
            return Err(ConfigError::MissingToken);
        }
        let local_port = args
            .local_port
            .or(file.local_port)
            .ok_or(ConfigError::MissingLocalPort)?;
        if local_port == 0 {
            return Err(ConfigError::ZeroLocalPort);
        }

        let server_host = args
            .server_host
            .clone()
            .or(file.server.host)
            .unwrap_or_else(|| "tunnel.giraffecloud.xyz".to_string());
        let server_port = args.server_port.or(file.server.port).unwrap_or(4443);
        let raw_port = file.server.raw_port.unwrap_or(server_port + 1);

        let resolve_path = |p: Option<String>| -> Option<PathBuf> {
            p.map(|p| {
                let path = PathBuf::from(&p);
                if path.is_absolute() {
                    path
                } else {
                    home.join(path)
                }
            })
        };

        Ok(Self {
            token,
            domain: args.domain.clone().or(file.domain),
            local_port,
            server_host,
            server_port,
            raw_port,
            api_host: file
                .api
                .host
                .unwrap_or_else(|| "api.giraffecloud.xyz".to_string()),
            api_port: file.api.port.unwrap_or(443),
            ca_cert: resolve_path(file.security.ca_cert),
            client_cert: resolve_path(file.security.client_cert),
            client_key: resolve_path(file.security.client_key),
            test_mode: file.test_mode,
            auto_update: file.auto_update,
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            stale_timeout_secs: 30,
            max_frame_bytes: 16 * 1024 * 1024,
            chunk_threshold: 16 * 1024 * 1024,
            log_level: args.log_level.clone(),
            log_json: args.log_json,
            home,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::ZeroDeadline);
        }
        Ok(())
    }

    pub fn pid_path(&self) -> PathBuf {
        self.home.join("tunnel.pid")
    }
}

fn default_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".giraffecloud")
}
