use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::p2pproxy::{
    net::{self, AddrError},
    tunnel::{client::ClientOptions, netserver::NetServerOptions, server::ServerOptions},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Public side: accept the control channel and public connections.
    Server,
    /// NAT side: dial the server and connect to the backend.
    Client,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Server => write!(f, "server"),
            Mode::Client => write!(f, "client"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing {0} address (HOST:PORT)")]
    MissingAddress(&'static str),
    #[error("{field} address: {source}")]
    InvalidAddress {
        field: &'static str,
        #[source]
        source: AddrError,
    },
    #[error("config: unsupported config extension {0:?} (expected .toml or .yaml/.yml)")]
    UnsupportedExtension(String),
    #[error("config: read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config: parse {path}: {msg}")]
    Parse { path: String, msg: String },
}

impl ConfigError {
    /// Errors the user fixes on the command line; reported with usage text.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            ConfigError::MissingAddress(_) | ConfigError::InvalidAddress { .. }
        )
    }
}

/// Values given on the command line (or their env fallbacks). They win over
/// the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub mode: Option<Mode>,
    pub p2p_addr: Option<String>,
    pub server_addr: Option<String>,
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    /// Control-channel address: listened on in server mode, dialed in client mode.
    pub p2p_addr: String,
    /// Public proxy address in server mode, backend address in client mode.
    pub server_addr: String,
    pub admin_addr: String,
    pub read_buffer: usize,
    pub logging: LoggingConfig,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone)]
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

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub heartbeat_interval: Duration,
    pub dead_timeout: Duration,
    pub retry_backoff: Duration,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub login_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            dead_timeout: Duration::from_secs(120),
            retry_backoff: Duration::from_secs(8),
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            login_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    mode: Option<Mode>,
    p2p_addr: Option<String>,
    server_addr: Option<String>,
    #[serde(default)]
    admin_addr: String,
    read_buffer: Option<i64>,
    logging: Option<FileLogging>,
    timeouts: Option<FileTimeouts>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Default, Deserialize)]
struct FileTimeouts {
    heartbeat_interval_ms: Option<i64>,
    dead_timeout_ms: Option<i64>,
    retry_backoff_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
    handshake_timeout_ms: Option<i64>,
    login_grace_ms: Option<i64>,
}

pub fn load(over: Overrides) -> Result<Config, ConfigError> {
    let fc = match &over.config_path {
        Some(p) => read_file_config(p)?,
        None => FileConfig::default(),
    };
    Config::from_parts(fc, over)
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_file_config(&data, &ext, &path.display().to_string())
}

fn parse_file_config(s: &str, ext: &str, path: &str) -> Result<FileConfig, ConfigError> {
    let parse_err = |msg: String| ConfigError::Parse {
        path: path.to_string(),
        msg,
    };
    match ext {
        "toml" => toml::from_str(s).map_err(|e| parse_err(e.to_string())),
        "yaml" | "yml" => serde_yaml::from_str(s).map_err(|e| parse_err(e.to_string())),
        other => Err(ConfigError::UnsupportedExtension(other.to_string())),
    }
}

fn millis(v: Option<i64>, default: Duration) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => default,
    }
}

fn required_addr(v: Option<String>, field: &'static str) -> Result<String, ConfigError> {
    let v = v.unwrap_or_default();
    if v.trim().is_empty() {
        return Err(ConfigError::MissingAddress(field));
    }
    net::parse_host_port(&v).map_err(|source| ConfigError::InvalidAddress { field, source })
}

impl Config {
    fn from_parts(fc: FileConfig, over: Overrides) -> Result<Config, ConfigError> {
        let mode = over.mode.or(fc.mode).unwrap_or(Mode::Server);

        let p2p_addr = required_addr(over.p2p_addr.or(fc.p2p_addr), "p2p")?;
        let server_addr = required_addr(over.server_addr.or(fc.server_addr), "server")?;

        let admin_addr = fc.admin_addr.trim().to_string();
        if !admin_addr.is_empty() {
            net::parse_host_port(&admin_addr).map_err(|source| ConfigError::InvalidAddress {
                field: "admin",
                source,
            })?;
        }

        let mut logging = LoggingConfig::default();
        if let Some(l) = fc.logging {
            if let Some(v) = l.level.filter(|v| !v.trim().is_empty()) {
                logging.level = v.trim().to_ascii_lowercase();
            }
            if let Some(v) = l.format.filter(|v| !v.trim().is_empty()) {
                logging.format = v.trim().to_ascii_lowercase();
            }
            if let Some(v) = l.output.filter(|v| !v.trim().is_empty()) {
                logging.output = v.trim().to_string();
            }
            logging.add_source = l.add_source;
        }

        let d = Timeouts::default();
        let t = fc.timeouts.unwrap_or_default();
        let timeouts = Timeouts {
            heartbeat_interval: millis(t.heartbeat_interval_ms, d.heartbeat_interval),
            dead_timeout: millis(t.dead_timeout_ms, d.dead_timeout),
            retry_backoff: millis(t.retry_backoff_ms, d.retry_backoff),
            dial_timeout: millis(t.dial_timeout_ms, d.dial_timeout),
            handshake_timeout: millis(t.handshake_timeout_ms, d.handshake_timeout),
            // Zero is meaningful here: forward immediately.
            login_grace: match t.login_grace_ms {
                Some(ms) => Duration::from_millis(ms.max(0) as u64),
                None => d.login_grace,
            },
        };

        let read_buffer = match fc.read_buffer {
            Some(n) if n > 0 => n as usize,
            _ => 4096,
        };

        Ok(Config {
            mode,
            p2p_addr,
            server_addr,
            admin_addr,
            read_buffer,
            logging,
            timeouts,
        })
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            control_addr: self.p2p_addr.clone(),
            backend_addr: self.server_addr.clone(),
            dial_timeout: self.timeouts.dial_timeout,
            heartbeat_interval: self.timeouts.heartbeat_interval,
            dead_timeout: self.timeouts.dead_timeout,
            retry_backoff: self.timeouts.retry_backoff,
            read_buffer: self.read_buffer,
        }
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            listen_addr: self.p2p_addr.clone(),
            handshake_timeout: self.timeouts.handshake_timeout,
            dead_timeout: self.timeouts.dead_timeout,
            ..ServerOptions::default()
        }
    }

    pub fn netserver_options(&self) -> NetServerOptions {
        NetServerOptions {
            listen_addr: self.server_addr.clone(),
            read_buffer: self.read_buffer,
            login_grace: self.timeouts.login_grace,
        }
    }
}
