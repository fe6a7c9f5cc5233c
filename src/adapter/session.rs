//! Per-peer UDP session table
//!
//! One transport session per peer endpoint, v4 and v6 alike. Sessions are
//! created during start, observed until ready (with a bounded wait), read
//! from by one forwarding task each, and torn down on stop/update.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::TunnelConfig;
use crate::platform::{TransportProvider, UdpSession};

/// How long start waits for sessions to become ready
pub(crate) const READY_WAIT: Duration = Duration::from_secs(5);

/// Upper bound on datagrams forwarded per read
pub(crate) const MAX_DATAGRAMS_PER_READ: usize = 1024;

pub(crate) struct SessionTable {
    sessions: HashMap<SocketAddr, Arc<dyn UdpSession>>,
    readers: Vec<JoinHandle<()>>,
}

impl SessionTable {
    pub(crate) fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            readers: Vec::new(),
        }
    }

    /// Open a session to every peer with a literal endpoint. Per-session
    /// failures are logged and skipped; the handshake timers recover later.
    pub(crate) async fn create_sessions(
        &mut self,
        provider: &dyn TransportProvider,
        config: &TunnelConfig,
    ) {
        for peer in &config.peers {
            let Some(endpoint) = &peer.endpoint else {
                continue;
            };
            let Some(addr) = endpoint.socket_addr() else {
                tracing::warn!("Skipping non-literal endpoint {}", endpoint);
                continue;
            };
            if self.sessions.contains_key(&addr) {
                tracing::warn!("Duplicate peer endpoint {}, keeping first session", addr);
                continue;
            }
            match provider.create_session(addr).await {
                Ok(session) => {
                    tracing::debug!(
                        "Created session to {} (peer {}..)",
                        addr,
                        hex::encode(&peer.public_key[..4])
                    );
                    self.sessions.insert(addr, session);
                }
                Err(e) => {
                    tracing::warn!("Failed to create session to {}: {}", addr, e);
                }
            }
        }
    }

    /// Wait up to [`READY_WAIT`] for every session to settle. Sessions still
    /// pending at the deadline are abandoned; failed ones are removed (their
    /// traffic is dropped either way).
    pub(crate) async fn await_ready(&mut self) {
        let deadline = Instant::now() + READY_WAIT;

        let mut abandoned = Vec::new();
        for (addr, session) in &self.sessions {
            let mut state = session.state();
            let settled = tokio::time::timeout_at(
                deadline,
                state.wait_for(|s| s.is_ready() || s.is_terminal()),
            )
            .await;

            match settled {
                Ok(Ok(state)) if state.is_ready() => {}
                Ok(Ok(state)) => {
                    tracing::warn!("Session to {} ended in state {:?}", addr, *state);
                    abandoned.push(*addr);
                }
                Ok(Err(_)) => {
                    tracing::warn!("Session to {} dropped its state channel", addr);
                    abandoned.push(*addr);
                }
                Err(_) => {
                    tracing::warn!(
                        "Session to {} not ready after {:?}, abandoning",
                        addr,
                        READY_WAIT
                    );
                    abandoned.push(*addr);
                }
            }
        }

        for addr in abandoned {
            if let Some(session) = self.sessions.remove(&addr) {
                session.cancel();
            }
        }
    }

    /// Spawn one forwarding task per remaining (ready) session, delivering
    /// datagram batches into `tx`.
    pub(crate) fn install_readers(&mut self, tx: mpsc::Sender<Vec<Vec<u8>>>) {
        for (addr, session) in &self.sessions {
            let addr = *addr;
            let session = Arc::clone(session);
            let tx = tx.clone();
            self.readers.push(tokio::spawn(async move {
                loop {
                    match session.read_datagrams(MAX_DATAGRAMS_PER_READ).await {
                        Ok(batch) => {
                            if batch.is_empty() {
                                continue;
                            }
                            if tx.send(batch).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!("Session {} read ended: {}", addr, e);
                            break;
                        }
                    }
                }
            }));
        }
    }

    /// Session for an outbound destination, if one exists
    pub(crate) fn lookup(&self, to: &SocketAddr) -> Option<&Arc<dyn UdpSession>> {
        self.sessions.get(to)
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Cancel all sessions and their forwarding tasks
    pub(crate) fn teardown(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        for (_, session) in self.sessions.drain() {
            session.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, InterfaceConfig, PeerConfig};
    use crate::testing::{FakeTransport, SessionMode};

    fn config_with_peers(endpoints: &[&str]) -> TunnelConfig {
        TunnelConfig {
            interface: InterfaceConfig {
                private_key: [2u8; 32],
                addresses: vec!["10.64.0.2/32".parse().unwrap()],
                dns_servers: Vec::new(),
                dns_search_domains: Vec::new(),
                listen_port: None,
                mtu: None,
            },
            peers: endpoints
                .iter()
                .map(|ep| {
                    let (host, port) = ep.rsplit_once(':').unwrap();
                    PeerConfig {
                        public_key: [1u8; 32],
                        preshared_key: None,
                        endpoint: Some(Endpoint {
                            host: host.trim_matches(|c| c == '[' || c == ']').to_string(),
                            port: port.parse().unwrap(),
                        }),
                        allowed_ips: vec!["0.0.0.0/0".parse().unwrap()],
                        persistent_keepalive: None,
                    }
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_one_session_per_endpoint() {
        let transport = FakeTransport::new(SessionMode::Ready, false);
        let mut table = SessionTable::new();

        // Duplicate endpoints collapse to one session
        let config = config_with_peers(&["10.0.0.1:51820", "10.0.0.1:51820", "10.0.0.2:51820"]);
        table.create_sessions(&transport, &config).await;

        assert_eq!(table.len(), 2);
        assert!(table.lookup(&"10.0.0.1:51820".parse().unwrap()).is_some());
        assert!(table.lookup(&"10.0.0.2:51820".parse().unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_v4_and_v6_keyed_separately() {
        let transport = FakeTransport::new(SessionMode::Ready, false);
        let mut table = SessionTable::new();

        let config = config_with_peers(&["10.0.0.1:51820", "[fd00::1]:51820"]);
        table.create_sessions(&transport, &config).await;

        assert_eq!(table.len(), 2);
        assert!(table.lookup(&"[fd00::1]:51820".parse().unwrap()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_sessions_abandoned_at_deadline() {
        let transport = FakeTransport::new(SessionMode::NeverReady, false);
        let mut table = SessionTable::new();

        let config = config_with_peers(&["10.0.0.1:51820"]);
        table.create_sessions(&transport, &config).await;
        assert_eq!(table.len(), 1);

        let began = Instant::now();
        table.await_ready().await;
        assert!(began.elapsed() >= READY_WAIT);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sessions_removed() {
        let transport = FakeTransport::new(SessionMode::Fail, false);
        let mut table = SessionTable::new();

        let config = config_with_peers(&["10.0.0.1:51820"]);
        table.create_sessions(&transport, &config).await;

        let began = Instant::now();
        table.await_ready().await;
        // Terminal state resolves immediately, no deadline wait
        assert!(began.elapsed() < READY_WAIT);
        assert_eq!(table.len(), 0);
    }
}
