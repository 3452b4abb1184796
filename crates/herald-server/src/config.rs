//! Server configuration: TOML file + CLI overrides.

use crate::store::UserRecord;
use herald_core::{HeraldError, HeraldResult};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub queue: QueueSection,
    /// Seed records for the in-memory user directory.
    #[serde(default)]
    pub users: Vec<UserRecord>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_connections: default_max_connections(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_auth_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_minute: u32,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_auth_timeout(),
            max_attempts_per_minute: default_max_attempts(),
        }
    }
}

/// `[queue]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueSection {
    /// Per-user cap on queued payloads; 0 keeps everything.
    #[serde(default)]
    pub max_per_user: usize,
}

fn default_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_port() -> u16 {
    8765
}
fn default_max_connections() -> usize {
    10_000
}
fn default_outbound_buffer() -> usize {
    256
}
fn default_auth_timeout() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    20
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub max_connections: usize,
    pub outbound_buffer: usize,
    pub auth_timeout: Duration,
    pub max_auth_attempts_per_minute: u32,
    pub queue_cap: Option<usize>,
    pub users: Vec<UserRecord>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind: Option<IpAddr>,
        cli_port: Option<u16>,
        cli_max_connections: Option<usize>,
        cli_auth_timeout: Option<u64>,
    ) -> HeraldResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let mut config = Self::from_file(file_config);
        if let Some(bind) = cli_bind {
            config.bind = bind;
        }
        if let Some(port) = cli_port {
            config.port = port;
        }
        if let Some(max) = cli_max_connections {
            config.max_connections = max;
        }
        if let Some(secs) = cli_auth_timeout {
            config.auth_timeout = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> HeraldResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| HeraldError::Config(format!("config parse error: {e}")))
    }

    fn from_file(file: ConfigFile) -> Self {
        Self {
            bind: file.server.bind,
            port: file.server.port,
            max_connections: file.server.max_connections,
            outbound_buffer: file.server.outbound_buffer,
            auth_timeout: Duration::from_secs(file.auth.timeout_secs),
            max_auth_attempts_per_minute: file.auth.max_attempts_per_minute,
            queue_cap: (file.queue.max_per_user > 0).then_some(file.queue.max_per_user),
            users: file.users,
        }
    }

    fn validate(&self) -> HeraldResult<()> {
        if self.auth_timeout.is_zero() {
            return Err(HeraldError::Config("auth timeout must be at least 1 second".into()));
        }
        if self.max_connections == 0 {
            return Err(HeraldError::Config("max_connections must be positive".into()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
