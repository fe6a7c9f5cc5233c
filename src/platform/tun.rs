//! TUN device implementation
//!
//! Cross-platform virtual interface support using the tun-rs crate.
//! Supports macOS (utun), Linux (/dev/net/tun), and Windows (Wintun).

use std::net::Ipv4Addr;
use std::ops::Deref;

use async_trait::async_trait;
use tun_rs::{AsyncDevice, DeviceBuilder};

use crate::error::TunnelError;
use crate::platform::{IpVersion, Packet, VirtualInterface};

/// Largest IP packet we accept from the device
const READ_BUFFER_SIZE: usize = 65535;

/// Async TUN device wrapper
pub struct TunInterface {
    /// The underlying async TUN device
    device: AsyncDevice,
    /// Device name (e.g., "utun5", "tun0")
    name: String,
}

impl TunInterface {
    /// Create a new TUN device with the given v4 address and MTU
    pub async fn create(address: Ipv4Addr, prefix_len: u8, mtu: u16) -> Result<Self, TunnelError> {
        // Check for required privileges first
        check_privileges()?;

        let device = DeviceBuilder::new()
            .ipv4(address, prefix_len, None)
            .mtu(mtu)
            .build_async()
            .map_err(|e| TunnelError::CreateFailed {
                reason: e.to_string(),
            })?;

        let name = device
            .deref()
            .name()
            .map_err(|e| TunnelError::CreateFailed {
                reason: format!("Failed to get device name: {}", e),
            })?;

        tracing::info!(
            "Created TUN device: {} with address {}/{}",
            name,
            address,
            prefix_len
        );

        Ok(Self { device, name })
    }
}

#[async_trait]
impl VirtualInterface for TunInterface {
    async fn read_packets(&self) -> Result<Vec<Packet>, TunnelError> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let len = self
            .device
            .recv(&mut buf)
            .await
            .map_err(|e| TunnelError::ReadFailed {
                reason: e.to_string(),
            })?;
        buf.truncate(len);

        // The device yields one packet per read
        match IpVersion::of_packet(&buf) {
            Some(version) => Ok(vec![Packet {
                version,
                bytes: buf,
            }]),
            None => {
                tracing::debug!("Dropping {}-byte non-IP frame from device", len);
                Ok(Vec::new())
            }
        }
    }

    async fn write_packets(&self, packets: &[Packet]) -> Result<(), TunnelError> {
        for packet in packets {
            self.device
                .send(&packet.bytes)
                .await
                .map_err(|e| TunnelError::WriteFailed {
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn name(&self) -> Option<String> {
        Some(self.name.clone())
    }
}

/// Check for required privileges to create TUN devices
fn check_privileges() -> Result<(), TunnelError> {
    #[cfg(unix)]
    {
        // On Unix, we need root or CAP_NET_ADMIN
        if unsafe { libc::geteuid() } != 0 {
            #[cfg(target_os = "linux")]
            {
                // The tun creation will fail with a clear error if the
                // capability is missing too
                tracing::warn!("Running without root. TUN creation may fail.");
                tracing::warn!("Either run with sudo or grant CAP_NET_ADMIN:");
                tracing::warn!("  sudo setcap cap_net_admin=eip ./wgbridge");
            }

            #[cfg(target_os = "macos")]
            {
                return Err(TunnelError::InsufficientPrivileges {
                    message: "Root privileges required on macOS. Run with sudo.".to_string(),
                });
            }
        }
    }

    Ok(())
}
