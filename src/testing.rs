//! Shared test fixtures
//!
//! A loopback stub engine ("encryption" is the identity function, so a host
//! packet comes back out as a datagram to the peer and vice versa) plus
//! in-memory fakes for the platform traits. The stub keeps per-key call
//! counts in a process-wide registry so tests can observe init/drop/tick
//! balance without reaching into the adapter.

use std::collections::HashMap;
use std::ffi::c_void;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::engine::{CallbackContext, EngineApi, EngineParams};
use crate::error::{TransportError, TunnelError};
use crate::platform::{
    Packet, SessionState, SettingsHost, TransportProvider, UdpSession, VirtualInterface,
};
use crate::settings::NetworkSettings;

pub(crate) fn test_key(tag: u8) -> [u8; 32] {
    [tag; 32]
}

/// Stub engine call counts for one private key
#[derive(Default)]
pub(crate) struct StubCounts {
    inits: AtomicUsize,
    drops: AtomicUsize,
    ticks: AtomicUsize,
}

impl StubCounts {
    pub(crate) fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub(crate) fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }

    pub(crate) fn ticks(&self) -> usize {
        self.ticks.load(Ordering::SeqCst)
    }
}

fn registry() -> &'static Mutex<HashMap<[u8; 32], Arc<StubCounts>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<[u8; 32], Arc<StubCounts>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Counts for the engine instance keyed by `private_key`. Each test must use
/// a distinct key; tests run in parallel against the same registry.
pub(crate) fn stub_counts(private_key: [u8; 32]) -> Arc<StubCounts> {
    Arc::clone(
        registry()
            .lock()
            .unwrap()
            .entry(private_key)
            .or_default(),
    )
}

struct StubState {
    callbacks: CallbackContext,
    peer_family: i32,
    peer_addr: [u8; 16],
    peer_port: u16,
    counts: Arc<StubCounts>,
}

unsafe extern "C" fn stub_init(params: *const EngineParams) -> *mut c_void {
    let params = &*params;
    // An all-zero private key stands in for parameters the engine rejects
    if params.private_key == [0u8; 32] {
        return std::ptr::null_mut();
    }
    let counts = stub_counts(params.private_key);
    counts.inits.fetch_add(1, Ordering::SeqCst);

    Box::into_raw(Box::new(StubState {
        callbacks: params.callbacks,
        peer_family: params.peer_family,
        peer_addr: params.peer_addr,
        peer_port: params.peer_port,
        counts,
    })) as *mut c_void
}

unsafe extern "C" fn stub_host_traffic(handle: *mut c_void, buf: *const u8, len: usize) {
    let state = &*(handle as *const StubState);
    let cb = state.callbacks;
    match state.peer_family {
        2 => {
            let mut addr4 = [0u8; 4];
            addr4.copy_from_slice(&state.peer_addr[..4]);
            (cb.send_udp_v4)(cb.user, u32::from_be_bytes(addr4), state.peer_port, buf, len);
        }
        _ => {
            (cb.send_udp_v6)(cb.user, state.peer_addr.as_ptr(), state.peer_port, buf, len);
        }
    }
}

unsafe extern "C" fn stub_tunnel_traffic(handle: *mut c_void, buf: *const u8, len: usize) {
    let state = &*(handle as *const StubState);
    let cb = state.callbacks;
    if len == 0 || buf.is_null() {
        return; // keepalive, nothing to deliver
    }
    match *buf >> 4 {
        4 => (cb.deliver_v4)(cb.user, buf, len),
        6 => (cb.deliver_v6)(cb.user, buf, len),
        _ => {}
    }
}

unsafe extern "C" fn stub_timer_event(handle: *mut c_void) {
    let state = &*(handle as *const StubState);
    state.counts.ticks.fetch_add(1, Ordering::SeqCst);
}

unsafe extern "C" fn stub_drop(handle: *mut c_void) {
    let state = Box::from_raw(handle as *mut StubState);
    state.counts.drops.fetch_add(1, Ordering::SeqCst);
}

/// The loopback stub engine's entry points
pub(crate) fn stub_engine() -> EngineApi {
    EngineApi {
        init: stub_init,
        handle_host_traffic: stub_host_traffic,
        handle_tunnel_traffic: stub_tunnel_traffic,
        handle_timer_event: stub_timer_event,
        drop: stub_drop,
    }
}

/// In-memory virtual interface: tests inject inbound batches and inspect
/// what the adapter wrote back.
pub(crate) struct FakeTun {
    inbound_tx: mpsc::UnboundedSender<Vec<Packet>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<Packet>>>,
    written: Mutex<Vec<Packet>>,
}

impl FakeTun {
    pub(crate) fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            written: Mutex::new(Vec::new()),
        }
    }

    /// Hand a batch of host packets to the adapter's next read
    pub(crate) fn inject(&self, packets: Vec<Packet>) {
        let _ = self.inbound_tx.send(packets);
    }

    pub(crate) fn written(&self) -> Vec<Packet> {
        self.written.lock().unwrap().clone()
    }

    /// Wait until at least `n` packets have been written back
    pub(crate) async fn wait_written(&self, n: usize) -> Vec<Packet> {
        tokio::time::timeout(std::time::Duration::from_secs(10), async {
            loop {
                let written = self.written();
                if written.len() >= n {
                    return written;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("virtual interface never saw the expected writes")
    }
}

#[async_trait]
impl VirtualInterface for FakeTun {
    async fn read_packets(&self) -> Result<Vec<Packet>, TunnelError> {
        match self.inbound_rx.lock().await.recv().await {
            Some(batch) => Ok(batch),
            // The fake holds its own sender, so this cannot resolve
            None => std::future::pending().await,
        }
    }

    async fn write_packets(&self, packets: &[Packet]) -> Result<(), TunnelError> {
        self.written.lock().unwrap().extend_from_slice(packets);
        Ok(())
    }

    fn name(&self) -> Option<String> {
        Some("utun-test".to_string())
    }
}

/// How fake sessions behave after creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionMode {
    /// Immediately ready
    Ready,
    /// Stuck in Preparing forever
    NeverReady,
    /// Fails straight away
    Fail,
}

pub(crate) struct FakeSession {
    state_tx: watch::Sender<SessionState>,
    written: Mutex<Vec<Vec<u8>>>,
    read_tx: mpsc::UnboundedSender<Vec<u8>>,
    read_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    echo: bool,
}

impl FakeSession {
    fn new(mode: SessionMode, echo: bool) -> Self {
        let initial = match mode {
            SessionMode::Ready => SessionState::Ready,
            SessionMode::NeverReady => SessionState::Preparing,
            SessionMode::Fail => SessionState::Failed,
        };
        let (state_tx, _) = watch::channel(initial);
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        Self {
            state_tx,
            written: Mutex::new(Vec::new()),
            read_tx,
            read_rx: tokio::sync::Mutex::new(read_rx),
            echo,
        }
    }

    /// Inject a datagram as if the peer had sent it
    pub(crate) fn push_datagram(&self, bytes: Vec<u8>) {
        let _ = self.read_tx.send(bytes);
    }

    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl UdpSession for FakeSession {
    fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    async fn write_datagram(&self, datagram: &[u8]) -> Result<(), TransportError> {
        if *self.state_tx.borrow() == SessionState::Cancelled {
            return Err(TransportError::Cancelled);
        }
        self.written.lock().unwrap().push(datagram.to_vec());
        if self.echo {
            let _ = self.read_tx.send(datagram.to_vec());
        }
        Ok(())
    }

    async fn read_datagrams(&self, max: usize) -> Result<Vec<Vec<u8>>, TransportError> {
        if *self.state_tx.borrow() == SessionState::Cancelled {
            return Err(TransportError::Cancelled);
        }
        let mut rx = self.read_rx.lock().await;
        let first = match rx.recv().await {
            Some(datagram) => datagram,
            None => return Err(TransportError::Cancelled),
        };
        let mut batch = vec![first];
        while batch.len() < max {
            match rx.try_recv() {
                Ok(datagram) => batch.push(datagram),
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    fn cancel(&self) {
        let _ = self.state_tx.send(SessionState::Cancelled);
    }
}

pub(crate) struct FakeTransport {
    mode: SessionMode,
    echo: bool,
    created: Mutex<Vec<(SocketAddr, Arc<FakeSession>)>>,
}

impl FakeTransport {
    pub(crate) fn new(mode: SessionMode, echo: bool) -> Self {
        Self {
            mode,
            echo,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Sessions created so far, in creation order
    pub(crate) fn created(&self) -> Vec<(SocketAddr, Arc<FakeSession>)> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportProvider for FakeTransport {
    async fn create_session(
        &self,
        endpoint: SocketAddr,
    ) -> Result<Arc<dyn UdpSession>, TransportError> {
        let session = Arc::new(FakeSession::new(self.mode, self.echo));
        self.created
            .lock()
            .unwrap()
            .push((endpoint, Arc::clone(&session)));
        Ok(session)
    }
}

/// How the fake settings host responds to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SettingsMode {
    Ok,
    Fail,
    /// Never acknowledges
    Hang,
}

pub(crate) struct FakeSettingsHost {
    mode: SettingsMode,
    applied: Mutex<Vec<NetworkSettings>>,
}

impl FakeSettingsHost {
    pub(crate) fn new(mode: SettingsMode) -> Self {
        Self {
            mode,
            applied: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn applied(&self) -> Vec<NetworkSettings> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl SettingsHost for FakeSettingsHost {
    async fn apply(
        &self,
        settings: &NetworkSettings,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        match self.mode {
            SettingsMode::Ok => {
                self.applied.lock().unwrap().push(settings.clone());
                Ok(())
            }
            SettingsMode::Fail => Err("settings rejected by host".into()),
            SettingsMode::Hang => std::future::pending().await,
        }
    }
}
