//! WireGuard configuration file parser
//!
//! Parses standard WireGuard `.conf` files with [Interface] and [Peer] sections.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::IpNet;

use crate::error::ConfigError;

/// Complete tunnel configuration
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Interface configuration (our side)
    pub interface: InterfaceConfig,
    /// Peer configurations, in file order
    pub peers: Vec<PeerConfig>,
}

/// Interface (local) configuration
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Our private key (32 bytes)
    pub private_key: [u8; 32],
    /// Our tunnel addresses with prefix, v4 and v6
    pub addresses: Vec<IpNet>,
    /// DNS servers (optional)
    pub dns_servers: Vec<IpAddr>,
    /// DNS search domains (optional)
    pub dns_search_domains: Vec<String>,
    /// Listen port (optional)
    pub listen_port: Option<u16>,
    /// MTU (optional; 0 or absent means platform default)
    pub mtu: Option<u16>,
}

/// Peer configuration
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Peer's public key (32 bytes)
    pub public_key: [u8; 32],
    /// Pre-shared key (optional, 32 bytes)
    pub preshared_key: Option<[u8; 32]>,
    /// Peer's endpoint (optional)
    pub endpoint: Option<Endpoint>,
    /// Allowed IP ranges for this peer
    pub allowed_ips: Vec<IpNet>,
    /// Keepalive interval in seconds (optional)
    pub persistent_keepalive: Option<u16>,
}

/// A peer endpoint as written in the config.
///
/// The host may be a literal v4/v6 address or a hostname. Name resolution is
/// the caller's job; [`Endpoint::socket_addr`] yields an address only for
/// literal hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// The endpoint as a socket address, if the host is a literal IP.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl TunnelConfig {
    /// Parse a tunnel configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a tunnel configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut interface: Option<InterfaceConfig> = None;
        let mut peers: Vec<PeerConfig> = Vec::new();
        let mut current_section: Option<Section> = None;

        // Temporary storage for current peer being parsed
        let mut current_peer: Option<PeerBuilder> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1; // 1-indexed
            let line = line.trim();

            // Skip empty lines and comments
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // Check for section headers
            if line.eq_ignore_ascii_case("[interface]") {
                // Save any pending peer
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_section = Some(Section::Interface);
                continue;
            } else if line.eq_ignore_ascii_case("[peer]") {
                // Save any pending peer
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_section = Some(Section::Peer);
                current_peer = Some(PeerBuilder::new());
                continue;
            }

            // Parse key = value pairs
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match current_section {
                Some(Section::Interface) => {
                    let iface = interface.get_or_insert_with(|| InterfaceConfig {
                        private_key: [0u8; 32],
                        addresses: Vec::new(),
                        dns_servers: Vec::new(),
                        dns_search_domains: Vec::new(),
                        listen_port: None,
                        mtu: None,
                    });

                    match key.as_str() {
                        "privatekey" => {
                            iface.private_key = parse_key(value, "PrivateKey")?;
                        }
                        "address" => {
                            // May have multiple addresses separated by comma
                            for addr_str in value.split(',') {
                                let addr_str = addr_str.trim();
                                if addr_str.is_empty() {
                                    continue;
                                }
                                let ip_net: IpNet =
                                    addr_str.parse().map_err(|_| ConfigError::InvalidCidr {
                                        value: addr_str.to_string(),
                                    })?;
                                iface.addresses.push(ip_net);
                            }
                        }
                        "dns" => {
                            // IP entries are servers, anything else is a
                            // search domain (the wg-quick convention)
                            for dns_str in value.split(',') {
                                let dns_str = dns_str.trim();
                                if dns_str.is_empty() {
                                    continue;
                                }
                                match dns_str.parse::<IpAddr>() {
                                    Ok(server) => iface.dns_servers.push(server),
                                    Err(_) => iface.dns_search_domains.push(dns_str.to_string()),
                                }
                            }
                        }
                        "listenport" => {
                            iface.listen_port = Some(value.parse().map_err(|_| {
                                ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("Invalid ListenPort: {}", value),
                                }
                            })?);
                        }
                        "mtu" => {
                            iface.mtu =
                                Some(value.parse().map_err(|_| ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("Invalid MTU: {}", value),
                                })?);
                        }
                        _ => {
                            // Unknown key, ignore (forward compatibility)
                            tracing::debug!("Unknown interface key: {}", key);
                        }
                    }
                }
                Some(Section::Peer) => {
                    let peer = current_peer.as_mut().ok_or(ConfigError::ParseError {
                        line: line_num,
                        message: "Peer value outside of [Peer] section".to_string(),
                    })?;

                    match key.as_str() {
                        "publickey" => {
                            peer.public_key = Some(parse_key(value, "PublicKey")?);
                        }
                        "presharedkey" => {
                            peer.preshared_key = Some(parse_key(value, "PresharedKey")?);
                        }
                        "endpoint" => {
                            peer.endpoint = Some(parse_endpoint(value)?);
                        }
                        "allowedips" => {
                            for ip_str in value.split(',') {
                                let ip_str = ip_str.trim();
                                if ip_str.is_empty() {
                                    continue;
                                }
                                let ip: IpNet =
                                    ip_str.parse().map_err(|_| ConfigError::InvalidCidr {
                                        value: ip_str.to_string(),
                                    })?;
                                peer.allowed_ips.push(ip);
                            }
                        }
                        "persistentkeepalive" => {
                            peer.persistent_keepalive =
                                Some(value.parse().map_err(|_| ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("Invalid PersistentKeepalive: {}", value),
                                })?);
                        }
                        _ => {
                            // Unknown key, ignore
                            tracing::debug!("Unknown peer key: {}", key);
                        }
                    }
                }
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    });
                }
            }
        }

        // Save any pending peer
        if let Some(peer) = current_peer.take() {
            peers.push(peer.build()?);
        }

        let interface = interface.ok_or(ConfigError::MissingField {
            field: "[Interface] section".to_string(),
        })?;

        // Validate interface has required fields
        if interface.private_key == [0u8; 32] {
            return Err(ConfigError::MissingField {
                field: "PrivateKey".to_string(),
            });
        }

        Ok(TunnelConfig { interface, peers })
    }

    /// First peer that has a literal-address endpoint, if any
    pub fn first_routable_peer(&self) -> Option<(&PeerConfig, SocketAddr)> {
        self.peers.iter().find_map(|peer| {
            let endpoint = peer.endpoint.as_ref()?;
            match endpoint.socket_addr() {
                Some(addr) => Some((peer, addr)),
                None => {
                    tracing::warn!("Skipping non-literal endpoint {}", endpoint);
                    None
                }
            }
        })
    }
}

/// Section type during parsing
#[derive(Clone, Copy)]
enum Section {
    Interface,
    Peer,
}

/// Builder for PeerConfig during parsing
struct PeerBuilder {
    public_key: Option<[u8; 32]>,
    preshared_key: Option<[u8; 32]>,
    endpoint: Option<Endpoint>,
    allowed_ips: Vec<IpNet>,
    persistent_keepalive: Option<u16>,
}

impl PeerBuilder {
    fn new() -> Self {
        Self {
            public_key: None,
            preshared_key: None,
            endpoint: None,
            allowed_ips: Vec::new(),
            persistent_keepalive: None,
        }
    }

    fn build(self) -> Result<PeerConfig, ConfigError> {
        let public_key = self.public_key.ok_or(ConfigError::MissingField {
            field: "PublicKey in [Peer]".to_string(),
        })?;

        Ok(PeerConfig {
            public_key,
            preshared_key: self.preshared_key,
            endpoint: self.endpoint,
            allowed_ips: self.allowed_ips,
            persistent_keepalive: self.persistent_keepalive,
        })
    }
}

/// Parse a base64-encoded 32-byte key
fn parse_key(value: &str, field_name: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = BASE64.decode(value).map_err(|_| ConfigError::InvalidKey {
        field: field_name.to_string(),
    })?;

    if bytes.len() != 32 {
        return Err(ConfigError::InvalidKey {
            field: field_name.to_string(),
        });
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Parse an endpoint (`host:port`, `[v6]:port`, or `hostname:port`)
fn parse_endpoint(value: &str) -> Result<Endpoint, ConfigError> {
    // Bracketed v6 form
    if let Some(rest) = value.strip_prefix('[') {
        let (host, port_part) =
            rest.split_once("]:")
                .ok_or_else(|| ConfigError::InvalidAddress {
                    value: value.to_string(),
                })?;
        let port = port_part.parse().map_err(|_| ConfigError::InvalidAddress {
            value: value.to_string(),
        })?;
        return Ok(Endpoint {
            host: host.to_string(),
            port,
        });
    }

    // host:port with a single colon; hostnames are kept verbatim
    let (host, port_part) = value
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidAddress {
            value: value.to_string(),
        })?;
    if host.contains(':') {
        // Unbracketed v6 is ambiguous
        return Err(ConfigError::InvalidAddress {
            value: value.to_string(),
        });
    }
    let port = port_part.parse().map_err(|_| ConfigError::InvalidAddress {
        value: value.to_string(),
    })?;

    Ok(Endpoint {
        host: host.to_string(),
        port,
    })
}
