//! Network-settings generation
//!
//! Pure translation from a [`TunnelConfig`] to the routing/DNS/MTU settings
//! object handed to the platform. No I/O happens here; applying the result is
//! the [`SettingsHost`](crate::platform::SettingsHost) implementation's job.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::config::TunnelConfig;

/// The platform requires a single remote tunnel address even though a
/// WireGuard tunnel logically has none or many; this placeholder is installed
/// unconditionally.
pub const TUNNEL_REMOTE_PLACEHOLDER: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));

/// Default MTU forced on mobile profiles when the config leaves it unset
pub const MOBILE_DEFAULT_MTU: u16 = 1280;

/// Tunnel overhead reserved on desktop profiles when the MTU is unset
pub const DESKTOP_TUNNEL_OVERHEAD: u16 = 80;

/// The narrowest v6 prefix the platform stack honors; smaller prefixes are
/// widened to this.
pub const MIN_V6_PREFIX: u8 = 120;

/// Host device class, which decides the MTU fallback policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceProfile {
    Mobile,
    Desktop,
}

impl DeviceProfile {
    /// Profile of the compilation target
    pub fn native() -> Self {
        if cfg!(any(target_os = "ios", target_os = "android")) {
            DeviceProfile::Mobile
        } else {
            DeviceProfile::Desktop
        }
    }
}

/// Routing/DNS/MTU settings ready to hand to the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    pub tunnel_remote_address: IpAddr,
    pub ipv4: Option<Ipv4Settings>,
    pub ipv6: Option<Ipv6Settings>,
    pub dns: Option<DnsSettings>,
    pub mtu: Option<u16>,
    pub tunnel_overhead: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Settings {
    /// Interface addresses with their explicit subnet masks
    pub addresses: Vec<Ipv4Net>,
    pub included_routes: Vec<RouteV4>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Settings {
    /// Interface addresses, prefixes already clamped
    pub addresses: Vec<Ipv6Net>,
    pub included_routes: Vec<RouteV6>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteV4 {
    pub destination: Ipv4Net,
    pub gateway: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteV6 {
    pub destination: Ipv6Net,
    pub gateway: Option<Ipv6Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsSettings {
    pub servers: Vec<IpAddr>,
    pub search_domains: Vec<String>,
    /// `[""]` routes all queries through the tunnel resolver
    pub match_domains: Vec<String>,
}

/// Translate a tunnel configuration into platform network settings
pub fn generate(config: &TunnelConfig, profile: DeviceProfile) -> NetworkSettings {
    let mut v4_addresses = Vec::new();
    let mut v4_routes = Vec::new();
    let mut v6_addresses = Vec::new();
    let mut v6_routes = Vec::new();

    for address in &config.interface.addresses {
        match address {
            IpNet::V4(net) => {
                v4_addresses.push(*net);
                // Route the address's own prefix through the interface
                v4_routes.push(RouteV4 {
                    destination: net.trunc(),
                    gateway: Some(net.addr()),
                });
            }
            IpNet::V6(net) => {
                let clamped_prefix = net.prefix_len().max(MIN_V6_PREFIX);
                match Ipv6Net::new(net.addr(), clamped_prefix) {
                    Ok(clamped) => v6_addresses.push(clamped),
                    Err(_) => {
                        tracing::warn!("Skipping v6 address with bad prefix: {}", net);
                        continue;
                    }
                }
                v6_routes.push(RouteV6 {
                    destination: net.trunc(),
                    gateway: Some(net.addr()),
                });
            }
        }
    }

    for peer in &config.peers {
        for allowed in &peer.allowed_ips {
            match allowed {
                IpNet::V4(net) => v4_routes.push(RouteV4 {
                    destination: *net,
                    gateway: None,
                }),
                IpNet::V6(net) => v6_routes.push(RouteV6 {
                    destination: *net,
                    gateway: None,
                }),
            }
        }
    }

    let ipv4 = (!v4_addresses.is_empty() || !v4_routes.is_empty()).then(|| Ipv4Settings {
        addresses: v4_addresses,
        included_routes: v4_routes,
    });
    let ipv6 = (!v6_addresses.is_empty() || !v6_routes.is_empty()).then(|| Ipv6Settings {
        addresses: v6_addresses,
        included_routes: v6_routes,
    });

    let dns = dns_settings(config);

    let (mtu, tunnel_overhead) = match config.interface.mtu {
        Some(mtu) if mtu != 0 => (Some(mtu), None),
        _ => match profile {
            DeviceProfile::Mobile => (Some(MOBILE_DEFAULT_MTU), None),
            DeviceProfile::Desktop => (None, Some(DESKTOP_TUNNEL_OVERHEAD)),
        },
    };

    NetworkSettings {
        tunnel_remote_address: TUNNEL_REMOTE_PLACEHOLDER,
        ipv4,
        ipv6,
        dns,
        mtu,
        tunnel_overhead,
    }
}

fn dns_settings(config: &TunnelConfig) -> Option<DnsSettings> {
    let servers = &config.interface.dns_servers;
    let search_domains = &config.interface.dns_search_domains;

    if servers.is_empty() && search_domains.is_empty() {
        return None;
    }

    // A non-empty server list pulls every query through the tunnel
    let match_domains = if servers.is_empty() {
        Vec::new()
    } else {
        vec![String::new()]
    };

    Some(DnsSettings {
        servers: servers.clone(),
        search_domains: search_domains.clone(),
        match_domains,
    })
}
