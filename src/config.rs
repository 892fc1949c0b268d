//! Minimal configuration structs, populated directly from CLI flags.
//!
//! Spec §1 scopes "process bootstrap and command-line configuration of forwardings" to
//! external collaborators, so these structs intentionally stay flat — no config file,
//! no persistence, no keyring (contrast the teacher repo's `Config`, which has all
//! three). The ambient habit of centralizing configuration in a typed struct rather than
//! threading raw flags through the engine is kept (`SPEC_FULL.md` §10.4).

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the Server side.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the control-channel listener on.
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".parse().unwrap(),
        }
    }
}

/// Configuration for the Client side, describing one forwarding.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server's control-channel host.
    pub server_host: String,
    /// Server's control-channel port.
    pub server_port: u16,
    /// Internal target host this forwarding dials into.
    pub target_host: String,
    /// Internal target port this forwarding dials into.
    pub target_port: u16,
    /// Artificial delay inserted before each target dial. Always zero outside tests;
    /// not exposed via the CLI. This is an internal testability hook (mirroring
    /// `server::run`'s `ListenerBound` channel), not a protocol or CLI feature — it
    /// exists so the early-data race spec §8 scenario 2 describes can be driven
    /// deterministically over real sockets instead of racing real dial timing.
    pub dial_delay: Duration,
}

impl ClientConfig {
    /// Human-readable description sent in the `INIT` frame (spec §4.6), matching the
    /// Python original's `"Forwarding to {}:{}".format(host, port)`.
    pub fn info_string(&self) -> String {
        format!("Forwarding to {}:{}", self.target_host, self.target_port)
    }
}
