//! UDP transport sessions over tokio
//!
//! One connected socket per peer endpoint. Socket setup runs in a background
//! task so creation returns immediately in Preparing state; observers see the
//! transition to Ready or Failed through the state channel.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::error::TransportError;
use crate::platform::{SessionState, TransportProvider, UdpSession};

/// Receive buffer requested for each session socket
const RECV_BUFFER_SIZE: usize = 1 << 20;

/// Largest datagram we accept from a peer
const DATAGRAM_BUFFER_SIZE: usize = 65535;

/// Creates [`TokioUdpSession`]s
pub struct UdpTransport;

#[async_trait]
impl TransportProvider for UdpTransport {
    async fn create_session(
        &self,
        endpoint: SocketAddr,
    ) -> Result<Arc<dyn UdpSession>, TransportError> {
        Ok(TokioUdpSession::create(endpoint))
    }
}

/// A connected UDP socket with observable lifecycle state
pub struct TokioUdpSession {
    endpoint: SocketAddr,
    state_tx: watch::Sender<SessionState>,
    socket: OnceLock<Arc<UdpSocket>>,
}

impl TokioUdpSession {
    /// Start connecting to `endpoint`; the returned session is Preparing
    /// until the socket is up.
    pub fn create(endpoint: SocketAddr) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Preparing);
        let session = Arc::new(Self {
            endpoint,
            state_tx,
            socket: OnceLock::new(),
        });

        let setup = Arc::clone(&session);
        tokio::spawn(async move {
            match open_socket(endpoint).await {
                Ok(socket) => {
                    let _ = setup.socket.set(Arc::new(socket));
                    // A cancel may have won the race; don't resurrect
                    setup.state_tx.send_if_modified(|state| {
                        if *state == SessionState::Preparing {
                            *state = SessionState::Ready;
                            true
                        } else {
                            false
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("UDP session to {} failed: {}", endpoint, e);
                    setup.state_tx.send_if_modified(|state| {
                        if *state == SessionState::Preparing {
                            *state = SessionState::Failed;
                            true
                        } else {
                            false
                        }
                    });
                }
            }
        });

        session
    }

    fn ready_socket(&self) -> Result<Arc<UdpSocket>, TransportError> {
        if *self.state_tx.borrow() == SessionState::Cancelled {
            return Err(TransportError::Cancelled);
        }
        match self.socket.get() {
            Some(socket) => Ok(Arc::clone(socket)),
            None => Err(TransportError::SendFailed {
                reason: format!("session to {} not ready", self.endpoint),
            }),
        }
    }
}

async fn open_socket(endpoint: SocketAddr) -> std::io::Result<UdpSocket> {
    let (domain, bind_addr) = if endpoint.is_ipv4() {
        (Domain::IPV4, "0.0.0.0:0".parse::<SocketAddr>())
    } else {
        (Domain::IPV6, "[::]:0".parse::<SocketAddr>())
    };
    let bind_addr = bind_addr.map_err(std::io::Error::other)?;

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
        tracing::debug!("Could not grow receive buffer: {}", e);
    }
    socket.bind(&bind_addr.into())?;

    let socket = UdpSocket::from_std(socket.into())?;
    socket.connect(endpoint).await?;
    Ok(socket)
}

#[async_trait]
impl UdpSession for TokioUdpSession {
    fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    async fn write_datagram(&self, datagram: &[u8]) -> Result<(), TransportError> {
        let socket = self.ready_socket()?;
        socket
            .send(datagram)
            .await
            .map_err(|e| TransportError::SendFailed {
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn read_datagrams(&self, max: usize) -> Result<Vec<Vec<u8>>, TransportError> {
        let socket = self.ready_socket().map_err(|_| TransportError::Cancelled)?;

        let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];
        let len = socket
            .recv(&mut buf)
            .await
            .map_err(|e| TransportError::ReceiveFailed {
                reason: e.to_string(),
            })?;

        let mut batch = vec![buf[..len].to_vec()];

        // Drain whatever else is already queued, up to the batch limit
        while batch.len() < max {
            match socket.try_recv(&mut buf) {
                Ok(len) => batch.push(buf[..len].to_vec()),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::debug!("UDP drain from {} stopped: {}", self.endpoint, e);
                    break;
                }
            }
        }

        Ok(batch)
    }

    fn cancel(&self) {
        let _ = self.state_tx.send(SessionState::Cancelled);
    }
}
