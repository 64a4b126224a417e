//! NAT-traversing TCP/UDP port forwarding over WebRTC data channels.
//!
//! Three roles share this crate: `relay` is the stateless signaling
//! broker, `host` exposes a local service under an identity, and
//! `client` makes that identity reachable on a local endpoint. Once the
//! offer/answer/ICE handshake completes over the relay, application
//! bytes flow peer to peer through [`bridge`].

pub mod bridge;
pub mod cli;
pub mod client;
pub mod config;
pub mod host;
pub mod protocol;
pub mod relay;
pub mod signaling;
pub mod transport;
