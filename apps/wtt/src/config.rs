use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::cli::{Cli, Commands};

// =============================================================================
// Unified config (figment-layered: config.yaml -> WTT_* env -> CLI flags)
// =============================================================================
//
// Three equivalent ways to configure, lowest to highest precedence:
//
//   config.yaml:     server:
//                      addr: ":8080"
//
//   env var:         WTT_SERVER_ADDR=":8080"
//
//   flag:            wtt server --addr :8080

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),
}

/// Tunnel transport protocol.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Top-level configuration, one section per subcommand.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// Relay settings (`wtt server`, `server:` section, `WTT_SERVER_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub addr: String,
    #[serde(default)]
    pub tls_cert_file: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_file: Option<PathBuf>,
    #[serde(default = "default_allowed_origins", deserialize_with = "string_or_list")]
    pub allowed_origins: Vec<String>,
    /// Bearer tokens accepted at the WebSocket handshake. Empty disables
    /// authentication.
    #[serde(default, deserialize_with = "string_or_list")]
    pub valid_tokens: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_listen_addr(),
            tls_cert_file: None,
            tls_key_file: None,
            allowed_origins: default_allowed_origins(),
            valid_tokens: Vec::new(),
        }
    }
}

/// Host settings (`wtt host`, `host:` section, `WTT_HOST_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Identity registered on the relay. Generated when empty.
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_signal_url")]
    pub signal: String,
    /// Local service to expose, `addr:port`.
    #[serde(default)]
    pub remote: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_stun_servers", deserialize_with = "string_or_list")]
    pub stun_servers: Vec<String>,
    #[serde(default)]
    pub token: String,
    /// Per-session handshake timeout in seconds.
    #[serde(default = "default_handshake_timeout")]
    pub timeout: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            signal: default_signal_url(),
            remote: String::new(),
            protocol: Protocol::Tcp,
            stun_servers: default_stun_servers(),
            token: String::new(),
            timeout: default_handshake_timeout(),
        }
    }
}

/// Client settings (`wtt client`, `client:` section, `WTT_CLIENT_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Identity of the host to tunnel to.
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_signal_url")]
    pub signal: String,
    /// Local endpoint to listen on, `addr:port`.
    #[serde(default)]
    pub local: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_stun_servers", deserialize_with = "string_or_list")]
    pub stun_servers: Vec<String>,
    #[serde(default)]
    pub token: String,
    /// Per-session handshake timeout in seconds.
    #[serde(default = "default_handshake_timeout")]
    pub timeout: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            signal: default_signal_url(),
            local: String::new(),
            protocol: Protocol::Tcp,
            stun_servers: default_stun_servers(),
            token: String::new(),
            timeout: default_handshake_timeout(),
        }
    }
}

fn default_listen_addr() -> String {
    ":8080".to_string()
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_signal_url() -> String {
    "ws://127.0.0.1:8080".to_string()
}

fn default_stun_servers() -> Vec<String> {
    vec![DEFAULT_STUN_SERVER.to_string()]
}

fn default_handshake_timeout() -> u64 {
    10
}

/// Accept either a YAML/JSON list or a comma-separated string. Env values
/// arrive as plain strings, so `WTT_SERVER_VALID_TOKENS=a,b` works too.
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        One(String),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::List(items) => items,
        Raw::One(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

/// Layer the YAML file, `WTT_*` environment and CLI flags into [`Settings`].
pub fn load(cli: &Cli) -> Result<Settings, ConfigError> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    if cli.config.is_some() && !path.exists() {
        return Err(ConfigError::Invalid(format!(
            "config file not found: {}",
            path.display()
        )));
    }

    let mut figment = Figment::new().merge(Yaml::file(path)).merge(
        // WTT_SERVER_ADDR -> server.addr; only the first underscore nests.
        Env::prefixed("WTT_")
            .map(|key| key.as_str().to_lowercase().replacen('_', ".", 1).into()),
    );

    figment = match &cli.command {
        Commands::Server(args) => figment.merge(Serialized::global("server", args)),
        Commands::Host(args) => figment.merge(Serialized::global("host", args)),
        Commands::Client(args) => figment.merge(Serialized::global("client", args)),
    };

    Ok(figment.extract()?)
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        resolve_listen_addr(&self.addr)?;
        match (&self.tls_cert_file, &self.tls_key_file) {
            (Some(_), None) | (None, Some(_)) => Err(ConfigError::Invalid(
                "tls requires both tls_cert_file and tls_key_file".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl HostConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signal.is_empty() {
            return Err(ConfigError::Invalid(
                "signaling server address is required".to_string(),
            ));
        }
        if self.remote.is_empty() {
            return Err(ConfigError::Invalid(
                "remote service address is required".to_string(),
            ));
        }
        if self.timeout == 0 {
            return Err(ConfigError::Invalid(
                "handshake timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::Invalid(
                "target host id is required".to_string(),
            ));
        }
        if self.signal.is_empty() {
            return Err(ConfigError::Invalid(
                "signaling server address is required".to_string(),
            ));
        }
        if self.local.is_empty() {
            return Err(ConfigError::Invalid(
                "local listen address is required".to_string(),
            ));
        }
        if self.timeout == 0 {
            return Err(ConfigError::Invalid(
                "handshake timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a listen endpoint. A bare `:port` binds all interfaces.
pub fn resolve_listen_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    let candidate = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    if let Ok(parsed) = candidate.parse::<SocketAddr>() {
        return Ok(parsed);
    }
    candidate
        .to_socket_addrs()
        .map_err(|err| ConfigError::Invalid(format!("invalid listen address {addr}: {err}")))?
        .next()
        .ok_or_else(|| ConfigError::Invalid(format!("listen address {addr} did not resolve")))
}
