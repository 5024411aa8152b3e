//! Connection slots.
//!
//! A slot is the managed form of an adopted descriptor: it owns the
//! descriptor, any protocol session state, and the list of bytes pending
//! replay. Slots live in the context's registry and refer to each other by
//! handle, never by direct ownership, so parent/child relationships cannot
//! form reference cycles.

use crate::buflist::SegmentQueue;
use crate::context::ParseContext;
use crate::descriptor::Descriptor;
use crate::vhost::{Session, Vhost};
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Instant;

/// Handle to a slot in the context registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub(crate) usize);

impl SlotId {
    /// Registry index, stable for the slot's lifetime.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Lifecycle state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Allocated, not yet bound to a role.
    Unconnected,
    /// Role binding completed; the slot is serviceable.
    Established,
    /// Waiting for the TLS handshake to complete.
    TlsNegotiating,
}

/// Why a slot is being torn down. Logged, and visible to embedders that
/// call [`Context::close_and_free`](crate::Context::close_and_free).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Adoption failed after the slot became visible to its thread.
    AdoptFailed,
    /// The protocol closed the connection while replayed bytes were being
    /// serviced.
    ReplayFailed,
    /// A protocol handler refused received bytes.
    HandlerRequested,
    /// The remote end closed the connection.
    PeerClosed,
    /// Orderly local shutdown.
    Shutdown,
}

/// A managed connection object.
pub struct Slot {
    pub(crate) tsi: usize,
    pub(crate) state: SlotState,
    pub(crate) vhost: Arc<Vhost>,
    pub(crate) protocol_idx: usize,
    pub(crate) desc: Option<Descriptor>,
    pub(crate) fds_pos: Option<usize>,
    pub(crate) parent: Option<SlotId>,
    pub(crate) children: Vec<SlotId>,
    pub(crate) session: Option<Session>,
    pub(crate) pending: SegmentQueue,
    pub(crate) peer: Option<IpAddr>,
    pub(crate) parse_ctx: Option<ParseContext>,
    pub(crate) initializing: bool,
    pub(crate) raw: bool,
    pub(crate) deadline: Option<Instant>,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<Box<rustls::ServerConnection>>,
}

impl Slot {
    pub(crate) fn new(tsi: usize, vhost: Arc<Vhost>) -> Self {
        Self {
            tsi,
            state: SlotState::Unconnected,
            vhost,
            protocol_idx: 0,
            desc: None,
            fds_pos: None,
            parent: None,
            children: Vec::new(),
            session: None,
            pending: SegmentQueue::new(),
            peer: None,
            parse_ctx: None,
            initializing: false,
            raw: false,
            deadline: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Index of the service thread that owns this slot. Never changes
    /// after creation.
    pub fn thread(&self) -> usize {
        self.tsi
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn vhost(&self) -> &Arc<Vhost> {
        &self.vhost
    }

    /// Index into the vhost's protocol table. Starts at the default
    /// protocol and changes at most once, at protocol selection.
    pub fn protocol_index(&self) -> usize {
        self.protocol_idx
    }

    /// Position in the owning thread's fd table; `None` until inserted.
    pub fn fd_position(&self) -> Option<usize> {
        self.fds_pos
    }

    pub fn parent(&self) -> Option<SlotId> {
        self.parent
    }

    pub fn children(&self) -> &[SlotId] {
        &self.children
    }

    /// True while the slot is still being set up from a thread other than
    /// its owner. The owning thread's service loop must not act on the
    /// slot until this clears.
    pub fn is_initializing(&self) -> bool {
        self.initializing
    }

    /// True for raw-passthrough adoptions (raw streams, datagram sockets,
    /// files).
    pub fn is_raw(&self) -> bool {
        self.raw
    }

    /// Bytes queued for replay, not yet delivered to the protocol.
    pub fn pending_bytes(&self) -> usize {
        self.pending.total_bytes()
    }

    /// Remote address counted against the peer ceiling, if any.
    pub fn peer_addr(&self) -> Option<IpAddr> {
        self.peer
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.desc.as_ref().map(|d| d.raw())
    }

    /// Local address the descriptor is bound to, if it is a socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.desc.as_ref().and_then(|d| d.local_addr())
    }

    /// Downcast the protocol session state.
    pub fn session_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.session.as_mut()?.downcast_mut::<T>()
    }

    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    pub fn clear_deadline(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}
