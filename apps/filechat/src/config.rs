//! filechat configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/filechat/config.toml`
//! - Windows: `%APPDATA%/filechat/config.toml`

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use serde::{Deserialize, Serialize};

use filechat_data_channel::{
    ClientOptions, DEFAULT_RECEIVED_PREFIX, ReceivePolicy, ServerConfig,
};
use filechat_protocol::Identity;
use filechat_protocol::constants::{DEFAULT_HOST, DEFAULT_PORT};

/// filechat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server address to connect to, or interface to listen on.
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port (0 = auto-assign when serving).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Prefix for outgoing chat lines.
    #[serde(default = "default_nickname")]
    pub nickname: String,

    /// Where received files are stored.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    #[serde(default = "default_received_prefix")]
    pub received_prefix: String,

    /// Socket read/write deadline in seconds (0 = wait forever).
    #[serde(default)]
    pub io_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Largest accepted file in bytes; unset accepts any size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<u64>,

    /// Forward chat lines between clients when serving.
    #[serde(default = "default_true")]
    pub relay_chat: bool,
}

fn default_host() -> String {
    DEFAULT_HOST.into()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_nickname() -> String {
    format!("Client-{}", rand::thread_rng().gen_range(0..1000))
}

fn default_download_dir() -> PathBuf {
    home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_received_prefix() -> String {
    DEFAULT_RECEIVED_PREFIX.into()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            nickname: default_nickname(),
            download_dir: default_download_dir(),
            received_prefix: default_received_prefix(),
            io_timeout_secs: 0,
            connect_timeout_secs: default_connect_timeout(),
            max_file_size: None,
            relay_chat: default_true(),
        }
    }
}

impl Config {
    /// Loads configuration from `path` (or the platform default), creating
    /// a default file if none exists.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => Self::load_from(&config_path()?),
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Restrict permissions on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn identity(&self) -> anyhow::Result<Identity> {
        Identity::new(self.nickname.as_str()).context("invalid nickname")
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        (self.io_timeout_secs > 0).then(|| Duration::from_secs(self.io_timeout_secs))
    }

    pub fn policy(&self) -> ReceivePolicy {
        ReceivePolicy {
            max_file_size: self.max_file_size,
        }
    }

    /// `host:port` as a connect target.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let bind: SocketAddr = self
            .address()
            .parse()
            .with_context(|| format!("invalid listen address {}", self.address()))?;
        Ok(ServerConfig {
            bind,
            download_dir: self.download_dir.clone(),
            received_prefix: self.received_prefix.clone(),
            policy: self.policy(),
            io_timeout: self.io_timeout(),
            relay_chat: self.relay_chat,
        })
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            io_timeout: self.io_timeout(),
        }
    }
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    let var = "USERPROFILE";
    #[cfg(not(target_os = "windows"))]
    let var = "HOME";

    std::env::var_os(var).map(PathBuf::from)
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("filechat")
            .join("config.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("filechat").join("config.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/filechat/config.toml"))
    }
}
