//! Relay server for reverse HTTP tunnels
//!
//! The relay accepts long-lived tunnel connections from clients on
//! `POST /_lobber/connect`, keeps one live session per hostname, and proxies
//! every other inbound HTTP request through the matching session as a framed
//! request/response exchange.

pub mod config;
pub mod domain;
pub mod registry;
pub mod server;
pub mod session;

mod pending;

pub use config::RelayConfig;
pub use domain::{verify_cname, DnsResolver, DomainError, SERVICE_DOMAIN};
pub use registry::TunnelRegistry;
pub use server::{RelayError, RelayServer};
pub use session::{DispatchError, OnClose, SessionState, TunnelSession};
