//! Opaque WireGuard engine handle
//!
//! The protocol core (Noise handshake, transport crypto, retry and
//! keepalive timers) is an opaque library reached over a C ABI.
//! [`EngineHandle`] owns the engine pointer together with the pinned
//! [`CallbackSink`] the engine writes into; drop order guarantees a callback
//! can never outlive the sink it targets.
//!
//! The engine is not internally synchronized: all four mutating operations
//! must be serialized by the caller, which the adapter does by funneling
//! every call through its single driver task.

mod callback;

pub use callback::CallbackContext;
pub(crate) use callback::CallbackSink;

use std::ffi::c_void;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::adapter::TrafficCounters;
use crate::error::AdapterError;
use crate::platform::Packet;

/// Address family tags in the engine ABI
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4 = 2,
    V6 = 30,
}

/// Init parameters handed to the engine
#[repr(C)]
pub struct EngineParams {
    pub private_key: [u8; 32],
    pub peer_public_key: [u8; 32],
    pub peer_family: i32,
    /// Peer address; only the first 4 bytes are used for v4
    pub peer_addr: [u8; 16],
    pub peer_port: u16,
    pub callbacks: CallbackContext,
}

impl EngineParams {
    fn new(
        private_key: [u8; 32],
        peer_public_key: [u8; 32],
        peer_endpoint: SocketAddr,
        callbacks: CallbackContext,
    ) -> Self {
        let mut peer_addr = [0u8; 16];
        let peer_family = match peer_endpoint.ip() {
            IpAddr::V4(ip) => {
                peer_addr[..4].copy_from_slice(&ip.octets());
                AddressFamily::V4
            }
            IpAddr::V6(ip) => {
                peer_addr.copy_from_slice(&ip.octets());
                AddressFamily::V6
            }
        };

        Self {
            private_key,
            peer_public_key,
            peer_family: peer_family as i32,
            peer_addr,
            peer_port: peer_endpoint.port(),
            callbacks,
        }
    }
}

/// The engine's C entry points, supplied by the embedder (or by the
/// `system-engine` feature's extern block).
#[derive(Clone, Copy)]
pub struct EngineApi {
    pub init: unsafe extern "C" fn(*const EngineParams) -> *mut c_void,
    pub handle_host_traffic: unsafe extern "C" fn(*mut c_void, *const u8, usize),
    pub handle_tunnel_traffic: unsafe extern "C" fn(*mut c_void, *const u8, usize),
    pub handle_timer_event: unsafe extern "C" fn(*mut c_void),
    pub drop: unsafe extern "C" fn(*mut c_void),
}

/// An encrypted datagram the engine wants sent to a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundDatagram {
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Everything one engine call emitted through its callbacks
#[derive(Debug, Default)]
pub struct EngineOutput {
    /// Encrypted datagrams for the UDP transport
    pub datagrams: Vec<OutboundDatagram>,
    /// Decrypted IP packets for the virtual interface
    pub packets: Vec<Packet>,
}

impl EngineOutput {
    pub fn is_empty(&self) -> bool {
        self.datagrams.is_empty() && self.packets.is_empty()
    }
}

/// Owning handle over a running engine instance.
///
/// The raw pointer is non-null from init until drop and is dereferenced only
/// through the methods here. The sink is declared after the pointer and the
/// explicit [`Drop`] releases the engine first, so no callback can fire
/// against a freed sink.
pub struct EngineHandle {
    api: EngineApi,
    raw: Option<NonNull<c_void>>,
    sink: Pin<Box<CallbackSink>>,
}

// The adapter's driver task is the only caller of the mutating operations;
// the engine contract requires exactly that serialization.
unsafe impl Send for EngineHandle {}

// Only ever reached through `&self`/`&mut self` on the single driver task,
// never from two threads at once, so sharing the handle across an await
// point (which requires `Sync`) is as safe as the `Send` impl above.
unsafe impl Sync for EngineHandle {}

impl EngineHandle {
    /// Initialize the engine for a single peer
    pub fn init(
        api: EngineApi,
        private_key: [u8; 32],
        peer_public_key: [u8; 32],
        peer_endpoint: SocketAddr,
        counters: Arc<TrafficCounters>,
    ) -> Result<Self, AdapterError> {
        let sink = CallbackSink::new(counters);
        let params = EngineParams::new(
            private_key,
            peer_public_key,
            peer_endpoint,
            sink.as_ref().context(),
        );

        let raw = unsafe { (api.init)(&params) };
        let raw = NonNull::new(raw).ok_or(AdapterError::Initialization)?;

        tracing::debug!(
            "Engine initialized for peer {} (key {}..)",
            peer_endpoint,
            hex::encode(&peer_public_key[..4])
        );

        Ok(Self {
            api,
            raw: Some(raw),
            sink,
        })
    }

    /// Feed an outbound IP packet read from the virtual interface
    pub fn feed_host(&mut self, packet: &[u8]) -> EngineOutput {
        let Some(raw) = self.raw else {
            return EngineOutput::default();
        };
        unsafe { (self.api.handle_host_traffic)(raw.as_ptr(), packet.as_ptr(), packet.len()) };
        self.sink.take_output()
    }

    /// Feed an inbound UDP payload received from a peer
    pub fn feed_tunnel(&mut self, datagram: &[u8]) -> EngineOutput {
        let Some(raw) = self.raw else {
            return EngineOutput::default();
        };
        unsafe { (self.api.handle_tunnel_traffic)(raw.as_ptr(), datagram.as_ptr(), datagram.len()) };
        self.sink.take_output()
    }

    /// Advance the engine's timers
    pub fn tick(&mut self) -> EngineOutput {
        let Some(raw) = self.raw else {
            return EngineOutput::default();
        };
        unsafe { (self.api.handle_timer_event)(raw.as_ptr()) };
        self.sink.take_output()
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            unsafe { (self.api.drop)(raw.as_ptr()) };
        }
    }
}

/// Extern block for builds that link the engine library directly
#[cfg(feature = "system-engine")]
pub mod ffi {
    use super::EngineParams;
    use std::ffi::c_void;

    extern "C" {
        fn wgengine_init(params: *const EngineParams) -> *mut c_void;
        fn wgengine_handle_host_traffic(handle: *mut c_void, buf: *const u8, len: usize);
        fn wgengine_handle_tunnel_traffic(handle: *mut c_void, buf: *const u8, len: usize);
        fn wgengine_handle_timer_event(handle: *mut c_void);
        fn wgengine_drop(handle: *mut c_void);
    }

    /// The system engine's entry points
    pub fn system_engine() -> super::EngineApi {
        super::EngineApi {
            init: wgengine_init,
            handle_host_traffic: wgengine_handle_host_traffic,
            handle_tunnel_traffic: wgengine_handle_tunnel_traffic,
            handle_timer_event: wgengine_handle_timer_event,
            drop: wgengine_drop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{stub_counts, stub_engine, test_key};

    fn endpoint() -> SocketAddr {
        "10.0.0.1:51820".parse().unwrap()
    }

    #[test]
    fn test_init_and_drop_balance() {
        let key = test_key(0xA1);
        let counts = stub_counts(key);
        let counters = Arc::new(TrafficCounters::default());

        let handle =
            EngineHandle::init(stub_engine(), key, [1u8; 32], endpoint(), counters).unwrap();
        assert_eq!(counts.inits(), 1);
        assert_eq!(counts.drops(), 0);

        drop(handle);
        assert_eq!(counts.drops(), 1);
    }

    #[test]
    fn test_feed_host_emits_datagram_to_peer() {
        let key = test_key(0xA2);
        let counters = Arc::new(TrafficCounters::default());
        let mut handle =
            EngineHandle::init(stub_engine(), key, [1u8; 32], endpoint(), counters).unwrap();

        let packet = [0x45, 0, 0, 20, 1, 2, 3, 4];
        let out = handle.feed_host(&packet);

        assert_eq!(out.datagrams.len(), 1);
        assert_eq!(out.datagrams[0].to, endpoint());
        assert_eq!(out.datagrams[0].bytes, packet);
        assert!(out.packets.is_empty());
    }

    #[test]
    fn test_feed_tunnel_delivers_and_counts_rx() {
        let key = test_key(0xA3);
        let counters = Arc::new(TrafficCounters::default());
        let mut handle = EngineHandle::init(
            stub_engine(),
            key,
            [1u8; 32],
            endpoint(),
            Arc::clone(&counters),
        )
        .unwrap();

        let datagram = [0x45, 0, 0, 20, 9, 9];
        let out = handle.feed_tunnel(&datagram);

        assert_eq!(out.packets.len(), 1);
        assert_eq!(out.packets[0].bytes, datagram);
        assert_eq!(counters.snapshot(), (datagram.len() as u64, 0));
    }

    #[test]
    fn test_v6_peer_params() {
        let key = test_key(0xA4);
        let counters = Arc::new(TrafficCounters::default());
        let v6: SocketAddr = "[fd00::1]:51820".parse().unwrap();
        let mut handle =
            EngineHandle::init(stub_engine(), key, [1u8; 32], v6, counters).unwrap();

        let out = handle.feed_host(&[0x60, 0, 0, 0]);
        assert_eq!(out.datagrams[0].to, v6);
    }

    #[test]
    fn test_empty_keepalive_roundtrip() {
        let key = test_key(0xA5);
        let counters = Arc::new(TrafficCounters::default());
        let mut handle =
            EngineHandle::init(stub_engine(), key, [1u8; 32], endpoint(), counters).unwrap();

        let out = handle.feed_host(&[]);
        assert_eq!(out.datagrams.len(), 1);
        assert!(out.datagrams[0].bytes.is_empty());
    }

    #[test]
    fn test_failed_init() {
        let counters = Arc::new(TrafficCounters::default());
        // The stub engine rejects an all-zero private key
        let result = EngineHandle::init(stub_engine(), [0u8; 32], [1u8; 32], endpoint(), counters);
        assert!(matches!(result, Err(AdapterError::Initialization)));
    }
}
