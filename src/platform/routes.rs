//! Route-table settings host
//!
//! Applies the generated network settings with the system route tools
//! (`route` on macOS, `ip` on Linux). Outside a packet-tunnel provider we
//! can only honor the route portion; DNS and MTU are surfaced in the log for
//! the operator. Cleanup is best effort.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::TunnelError;
use crate::platform::SettingsHost;
use crate::settings::NetworkSettings;

/// Installs included routes onto a named device
pub struct SystemSettingsHost {
    /// Device name for routing
    device_name: String,
    /// Routes that have been added, as destination strings
    added_routes: Mutex<Vec<String>>,
}

impl SystemSettingsHost {
    pub fn new(device_name: String) -> Self {
        Self {
            device_name,
            added_routes: Mutex::new(Vec::new()),
        }
    }

    /// Remove all routes that were added
    pub async fn cleanup(&self) {
        let routes: Vec<String> = self.added_routes.lock().unwrap().drain(..).collect();
        for destination in routes {
            if let Err(e) = remove_route_platform(&self.device_name, &destination).await {
                tracing::warn!("Failed to remove route {}: {}", destination, e);
            } else {
                tracing::debug!("Removed route: {}", destination);
            }
        }
    }

    async fn add_route(&self, destination: String) {
        match add_route_platform(&self.device_name, &destination).await {
            Ok(()) => {
                tracing::info!("Added route: {} via {}", destination, self.device_name);
                self.added_routes.lock().unwrap().push(destination);
            }
            Err(e) => {
                // Partial routing degrades reachability, not correctness
                tracing::warn!("Failed to add route for {}: {}", destination, e);
            }
        }
    }
}

#[async_trait]
impl SettingsHost for SystemSettingsHost {
    async fn apply(
        &self,
        settings: &NetworkSettings,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Some(ipv4) = &settings.ipv4 {
            for route in &ipv4.included_routes {
                self.add_route(route.destination.to_string()).await;
            }
        }
        if let Some(ipv6) = &settings.ipv6 {
            for route in &ipv6.included_routes {
                self.add_route(route.destination.to_string()).await;
            }
        }

        if let Some(dns) = &settings.dns {
            tracing::info!(
                "DNS servers {:?} (search {:?}) requested; configure the resolver manually",
                dns.servers,
                dns.search_domains
            );
        }
        if let Some(mtu) = settings.mtu {
            tracing::debug!("Settings request MTU {}", mtu);
        }

        Ok(())
    }
}

/// Platform-specific route addition
async fn add_route_platform(device: &str, destination: &str) -> Result<(), TunnelError> {
    #[cfg(target_os = "macos")]
    {
        let status = Command::new("route")
            .args(["-n", "add", "-net", destination, "-interface", device])
            .status()
            .await
            .map_err(|e| TunnelError::RouteSetupFailed {
                network: destination.to_string(),
                reason: e.to_string(),
            })?;

        if !status.success() {
            return Err(TunnelError::RouteSetupFailed {
                network: destination.to_string(),
                reason: format!("route command exited with {}", status),
            });
        }
    }

    #[cfg(target_os = "linux")]
    {
        let status = Command::new("ip")
            .args(["route", "add", destination, "dev", device])
            .status()
            .await
            .map_err(|e| TunnelError::RouteSetupFailed {
                network: destination.to_string(),
                reason: e.to_string(),
            })?;

        if !status.success() {
            return Err(TunnelError::RouteSetupFailed {
                network: destination.to_string(),
                reason: format!("ip route command exited with {}", status),
            });
        }
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let _ = (device, destination);
        tracing::warn!("Route installation not supported on this platform");
    }

    Ok(())
}

/// Platform-specific route removal
async fn remove_route_platform(device: &str, destination: &str) -> Result<(), TunnelError> {
    #[cfg(target_os = "macos")]
    {
        let _ = device;
        let status = Command::new("route")
            .args(["-n", "delete", "-net", destination])
            .status()
            .await
            .map_err(|e| TunnelError::RouteSetupFailed {
                network: destination.to_string(),
                reason: e.to_string(),
            })?;

        if !status.success() {
            return Err(TunnelError::RouteSetupFailed {
                network: destination.to_string(),
                reason: format!("route command exited with {}", status),
            });
        }
    }

    #[cfg(target_os = "linux")]
    {
        let status = Command::new("ip")
            .args(["route", "del", destination, "dev", device])
            .status()
            .await
            .map_err(|e| TunnelError::RouteSetupFailed {
                network: destination.to_string(),
                reason: e.to_string(),
            })?;

        if !status.success() {
            return Err(TunnelError::RouteSetupFailed {
                network: destination.to_string(),
                reason: format!("ip route command exited with {}", status),
            });
        }
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let _ = (device, destination);
    }

    Ok(())
}
