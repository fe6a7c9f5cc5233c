//! Tunnel configuration
//!
//! This module handles parsing of standard WireGuard `.conf` configuration
//! files into the in-memory [`TunnelConfig`] consumed by the adapter.

mod parser;

pub use parser::{Endpoint, InterfaceConfig, PeerConfig, TunnelConfig};
