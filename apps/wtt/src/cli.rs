use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use crate::config::Protocol;

#[derive(Parser, Debug)]
#[command(name = "wtt")]
#[command(version, about = "WebRTC tunnel for TCP and UDP traffic")]
#[command(
    long_about = "wtt forwards TCP or UDP traffic over WebRTC data channels, \
                  allowing NAT traversal. A host exposes a local service under \
                  an identity, a client makes it reachable on a local port, and \
                  the relay only couples the two during signaling."
)]
pub struct Cli {
    /// Config file (default ./config.yaml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the signaling relay
    Server(ServerArgs),
    /// Expose a local service under an identity
    Host(HostArgs),
    /// Forward a local port to a host identity
    Client(ClientArgs),
}

// Flags are Options so that only explicitly passed values override the
// config file and environment layers.

#[derive(Args, Debug, Serialize)]
pub struct ServerArgs {
    /// Listen endpoint, e.g. ":8080"
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,

    /// PEM certificate file; enables TLS together with --tls-key-file
    #[arg(long, value_name = "FILE")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cert_file: Option<PathBuf>,

    /// PEM private key file; enables TLS together with --tls-cert-file
    #[arg(long, value_name = "FILE")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_key_file: Option<PathBuf>,

    /// Allowed Origin header values; "*" disables the check
    #[arg(long, value_delimiter = ',')]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_origins: Option<Vec<String>>,

    /// Accepted bearer tokens; empty disables authentication
    #[arg(long, value_delimiter = ',')]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_tokens: Option<Vec<String>>,
}

#[derive(Args, Debug, Serialize)]
pub struct HostArgs {
    /// Identity to register on the relay (generated when omitted)
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Relay URL (ws:// or wss://)
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,

    /// Local service to expose, addr:port
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,

    /// Transport protocol of the tunneled service
    #[arg(short, long, value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,

    /// STUN server URLs
    #[arg(long = "stun-server", value_delimiter = ',')]
    #[serde(rename = "stun_servers", skip_serializing_if = "Option::is_none")]
    pub stun_server: Option<Vec<String>>,

    /// Bearer token presented to the relay
    #[arg(short = 'k', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Handshake timeout in seconds
    #[arg(short = 'T', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Args, Debug, Serialize)]
pub struct ClientArgs {
    /// Identity of the host to connect to
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Relay URL (ws:// or wss://)
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,

    /// Local endpoint to listen on, addr:port
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,

    /// Transport protocol of the tunneled service
    #[arg(short, long, value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,

    /// STUN server URLs
    #[arg(long = "stun-server", value_delimiter = ',')]
    #[serde(rename = "stun_servers", skip_serializing_if = "Option::is_none")]
    pub stun_server: Option<Vec<String>>,

    /// Bearer token presented to the relay
    #[arg(short = 'k', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Handshake timeout in seconds
    #[arg(short = 'T', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}
