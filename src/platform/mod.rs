//! Platform surface consumed by the adapter
//!
//! The packet-tunnel host is abstracted behind three traits: the virtual
//! interface carrying IP packets, the UDP transport carrying encrypted
//! datagrams, and the network-settings host. Production implementations live
//! in the submodules; tests substitute in-memory fakes.

pub mod routes;
pub mod tun;
pub mod udp;
pub mod utun;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{TransportError, TunnelError};
use crate::settings::NetworkSettings;

/// IP version of a tunneled packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    /// Classify a raw IP packet by its version nibble
    pub fn of_packet(bytes: &[u8]) -> Option<IpVersion> {
        match bytes.first()? >> 4 {
            4 => Some(IpVersion::V4),
            6 => Some(IpVersion::V6),
            _ => None,
        }
    }
}

/// An IP packet plus its address family, as batched by the virtual interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: IpVersion,
    pub bytes: Vec<u8>,
}

/// The virtual network interface through which the OS hands us IP packets
#[async_trait]
pub trait VirtualInterface: Send + Sync {
    /// Read the next batch of IP packets. Implementations may return a
    /// single-element batch.
    async fn read_packets(&self) -> Result<Vec<Packet>, TunnelError>;

    /// Enqueue IP packets back to the interface
    async fn write_packets(&self, packets: &[Packet]) -> Result<(), TunnelError>;

    /// Interface name, if known
    fn name(&self) -> Option<String>;
}

/// Factory for per-peer UDP transport sessions
#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn create_session(
        &self,
        endpoint: SocketAddr,
    ) -> Result<Arc<dyn UdpSession>, TransportError>;
}

/// Lifecycle state of a UDP transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Preparing,
    Waiting,
    Ready,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Ready)
    }

    /// Whether the session can no longer become ready
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Cancelled)
    }
}

/// A UDP transport session to a single peer endpoint
#[async_trait]
pub trait UdpSession: Send + Sync {
    /// Observe lifecycle state changes
    fn state(&self) -> watch::Receiver<SessionState>;

    /// Send one datagram to the peer
    async fn write_datagram(&self, datagram: &[u8]) -> Result<(), TransportError>;

    /// Receive a batch of datagrams, at most `max` per call
    async fn read_datagrams(&self, max: usize) -> Result<Vec<Vec<u8>>, TransportError>;

    /// Cancel the session; pending and future reads fail
    fn cancel(&self);
}

/// Installs routing/DNS settings on the host
#[async_trait]
pub trait SettingsHost: Send + Sync {
    async fn apply(
        &self,
        settings: &NetworkSettings,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}
