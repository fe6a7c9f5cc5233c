//! Engine callback bridge
//!
//! The engine emits encrypted datagrams and decrypted IP packets through four
//! C callbacks that fire synchronously inside an engine call. The trampolines
//! here copy each borrowed buffer into the [`CallbackSink`] (the buffer is
//! only valid for the duration of the call) so the adapter can drain the
//! results after the engine call returns.

use std::cell::RefCell;
use std::ffi::c_void;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

use crate::adapter::TrafficCounters;
use crate::engine::{EngineOutput, OutboundDatagram};
use crate::platform::{IpVersion, Packet};

/// Callback table handed to the engine at init.
///
/// `user` is a non-owning pointer to the [`CallbackSink`]; it stays valid
/// because the engine is always dropped before the sink.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CallbackContext {
    pub user: *mut c_void,
    pub send_udp_v4: unsafe extern "C" fn(*mut c_void, u32, u16, *const u8, usize),
    pub send_udp_v6: unsafe extern "C" fn(*mut c_void, *const u8, u16, *const u8, usize),
    pub deliver_v4: unsafe extern "C" fn(*mut c_void, *const u8, usize),
    pub deliver_v6: unsafe extern "C" fn(*mut c_void, *const u8, usize),
}

/// Collects callback output during a single engine call.
///
/// Only the driver task touches the queues, and only synchronously inside an
/// engine call, so interior mutability via `RefCell` is sufficient.
pub(crate) struct CallbackSink {
    outbound: RefCell<Vec<OutboundDatagram>>,
    inbound: RefCell<Vec<Packet>>,
    counters: Arc<TrafficCounters>,
}

// Only the driver task touches the sink, and only synchronously inside an
// engine call, so it's never accessed from two threads at once; sharing it
// across an await point (which requires `Send`/`Sync`) is safe on that basis.
unsafe impl Send for CallbackSink {}
unsafe impl Sync for CallbackSink {}

impl CallbackSink {
    pub(crate) fn new(counters: Arc<TrafficCounters>) -> Pin<Box<Self>> {
        Box::pin(Self {
            outbound: RefCell::new(Vec::new()),
            inbound: RefCell::new(Vec::new()),
            counters,
        })
    }

    /// Build the callback table pointing at this sink
    pub(crate) fn context(self: Pin<&Self>) -> CallbackContext {
        CallbackContext {
            user: self.get_ref() as *const Self as *mut c_void,
            send_udp_v4,
            send_udp_v6,
            deliver_v4,
            deliver_v6,
        }
    }

    /// Drain everything queued since the last call
    pub(crate) fn take_output(&self) -> EngineOutput {
        EngineOutput {
            datagrams: std::mem::take(&mut *self.outbound.borrow_mut()),
            packets: std::mem::take(&mut *self.inbound.borrow_mut()),
        }
    }
}

/// Copy a borrowed callback buffer. Zero-length buffers (keepalives) are
/// legal and may carry a null pointer.
unsafe fn copy_buf(buf: *const u8, len: usize) -> Vec<u8> {
    if len == 0 || buf.is_null() {
        Vec::new()
    } else {
        std::slice::from_raw_parts(buf, len).to_vec()
    }
}

unsafe extern "C" fn send_udp_v4(user: *mut c_void, addr: u32, port: u16, buf: *const u8, len: usize) {
    let sink = &*(user as *const CallbackSink);
    // The engine hands the v4 address in host order
    let to = SocketAddr::from((Ipv4Addr::from(addr), port));
    sink.outbound.borrow_mut().push(OutboundDatagram {
        to,
        bytes: copy_buf(buf, len),
    });
}

unsafe extern "C" fn send_udp_v6(
    user: *mut c_void,
    addr: *const u8,
    port: u16,
    buf: *const u8,
    len: usize,
) {
    let sink = &*(user as *const CallbackSink);
    let mut octets = [0u8; 16];
    octets.copy_from_slice(std::slice::from_raw_parts(addr, 16));
    let to = SocketAddr::from((Ipv6Addr::from(octets), port));
    sink.outbound.borrow_mut().push(OutboundDatagram {
        to,
        bytes: copy_buf(buf, len),
    });
}

unsafe extern "C" fn deliver_v4(user: *mut c_void, buf: *const u8, len: usize) {
    let sink = &*(user as *const CallbackSink);
    sink.counters.add_rx(len as u64);
    sink.inbound.borrow_mut().push(Packet {
        version: IpVersion::V4,
        bytes: copy_buf(buf, len),
    });
}

unsafe extern "C" fn deliver_v6(user: *mut c_void, buf: *const u8, len: usize) {
    let sink = &*(user as *const CallbackSink);
    sink.counters.add_rx(len as u64);
    sink.inbound.borrow_mut().push(Packet {
        version: IpVersion::V6,
        bytes: copy_buf(buf, len),
    });
}
