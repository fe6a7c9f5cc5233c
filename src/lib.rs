//! wgbridge - Userspace WireGuard Tunnel Adapter
//!
//! Bridges a virtual network interface, per-peer UDP transport sessions, and
//! an opaque WireGuard protocol engine into a single tunnel with a clean
//! start/stop/reconfigure lifecycle.
//!
//! # Features
//!
//! - Single-task serialization of all engine and session state
//! - Per-peer UDP sessions (v4 and v6) with bounded readiness waits
//! - Byte counters readable from any thread
//! - Atomic reconfiguration (stop + start) and a settings-only block mode
//! - Network-settings generation (routes, DNS, MTU policy) as a pure function
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use wgbridge::adapter::Adapter;
//! use wgbridge::config::TunnelConfig;
//! use wgbridge::platform::{routes::SystemSettingsHost, tun::TunInterface, udp::UdpTransport};
//! use wgbridge::settings::DeviceProfile;
//! # fn engine_api() -> wgbridge::engine::EngineApi { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TunnelConfig::from_file("wireguard.conf")?;
//!     let tun = Arc::new(TunInterface::create("10.64.0.2".parse()?, 32, 1420).await?);
//!     let settings = Arc::new(SystemSettingsHost::new("utun5".to_string()));
//!     let adapter = Adapter::new(
//!         engine_api(),
//!         tun,
//!         Arc::new(UdpTransport),
//!         settings,
//!         DeviceProfile::native(),
//!     );
//!     adapter.start(config).await?;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod engine;
pub mod error;
pub mod platform;
pub mod settings;

#[cfg(test)]
pub(crate) mod testing;

pub use adapter::Adapter;
pub use config::TunnelConfig;
pub use error::WgBridgeError;
