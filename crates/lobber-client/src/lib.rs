//! Tunnel client
//!
//! Connects outbound to a relay, registers a hostname, and services the
//! framed Request stream by replaying each request against a local HTTP
//! server. No inbound firewall rule is needed on the local side.

pub mod client;

pub use client::{ClientConfig, ClientError, TunnelClient, TunnelConnection};
