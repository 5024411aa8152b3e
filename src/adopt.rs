//! Descriptor adoption.
//!
//! Turns an already-open descriptor into a managed slot: admission check,
//! slot allocation, parent linkage, nonblocking enforcement, protocol
//! selection, role binding, fd-table insertion (or TLS handoff), the
//! new-connection announcement, and the wake of the owning thread.
//!
//! Failures unwind through exactly two paths. Before the slot can be
//! visible to any poll table, `bail` detaches and frees it directly.
//! From the backend-accept boundary onward the slot is a real tracked
//! object and `fail` delegates to [`Context::close_and_free`], which
//! retires every resource the slot accumulated.

use crate::context::{Context, ServiceOutcome};
use crate::descriptor::{self, Descriptor, DescriptorKind};
use crate::error::AdoptError;
use crate::metrics;
use crate::role::Role;
use crate::slot::{CloseReason, Slot, SlotId};
use crate::thread::idlest_thread;
use crate::vhost::{SlotEvent, Vhost};
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Options controlling how a descriptor is adopted.
#[derive(Debug, Clone, Default)]
pub struct AdoptOptions {
    /// Treat the stream as raw passthrough instead of protocol-framed.
    pub raw: bool,
    /// Permit TLS wrapping when the vhost carries TLS settings.
    pub allow_tls: bool,
    /// Bind the slot to this protocol instead of the vhost default.
    pub protocol: Option<String>,
    /// Adopting slot's parent; the child joins the parent's service
    /// thread.
    pub parent: Option<SlotId>,
}

/// Options for [`Context::create_udp_child`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpChildOptions {
    /// Bind the new socket to the local wildcard address. Leave false for
    /// sockets that will only send, or that share a parent's binding.
    pub bind: bool,
}

impl Context {
    /// Adopt a descriptor into a managed slot on `vhost`.
    ///
    /// On failure the descriptor is closed and no slot remains; the
    /// process-wide live-slot count is unchanged.
    pub fn adopt(
        &self,
        vhost: &Arc<Vhost>,
        desc: Descriptor,
        opts: AdoptOptions,
    ) -> Result<SlotId, AdoptError> {
        let kind = desc.kind();

        // peer admission applies to sockets only; the reservation is
        // recorded on the slot so every teardown path releases it
        let peer_key = if desc.is_socket() { desc.peer_addr() } else { None };
        if let Some(addr) = peer_key {
            if !self
                .peers
                .try_acquire(addr, self.config.max_connections_per_peer)
            {
                metrics::PEER_LIMIT_DENIED.increment();
                debug!(%addr, "peer reached connection ceiling");
                return Err(AdoptError::PeerLimit);
            }
        }

        // a child joins its parent's service thread; everything else is
        // load balanced
        let fixed_tsi = match opts.parent {
            Some(pid) => match self.slot(pid) {
                Some(parent) => Some(parent.thread()),
                None => {
                    if let Some(addr) = peer_key {
                        self.peers.release(addr);
                    }
                    metrics::ADOPT_FAILURES.increment();
                    return Err(AdoptError::ParentMissing);
                }
            },
            None => None,
        };

        let id = match self.create_server_slot(vhost, fixed_tsi) {
            Ok(id) => id,
            Err(e) => {
                if let Some(addr) = peer_key {
                    self.peers.release(addr);
                }
                metrics::ADOPT_FAILURES.increment();
                return Err(e);
            }
        };

        let role;
        let tsi;
        {
            let mut slots = self.slots.lock();

            if let Some(pid) = opts.parent {
                match slots.get2_mut(id.0, pid.0) {
                    Some((slot, parent)) => {
                        slot.parent = Some(pid);
                        parent.children.insert(0, id);
                    }
                    None => {
                        drop(slots);
                        return Err(self.bail(id, AdoptError::ParentMissing));
                    }
                }
            }

            let slot = &mut slots[id.0];
            slot.peer = peer_key;

            // every adopted descriptor must be nonblocking
            if let Err(e) = desc.set_nonblocking() {
                error!("unable to set descriptor nonblocking");
                drop(slots);
                return Err(self.bail(id, AdoptError::Nonblocking(e)));
            }
            slot.desc = Some(desc);

            if let Some(name) = opts.protocol.as_deref() {
                match vhost.protocol_index(name) {
                    Some(idx) => {
                        slot.protocol_idx = idx;
                        // the caller named a protocol, so session memory
                        // can be allocated now
                        if let Some(proto) = vhost.protocol(idx) {
                            slot.session = proto.handler.new_session();
                        }
                    }
                    None => {
                        error!(protocol = name, vhost = vhost.name(), "protocol not enabled on vhost");
                        drop(slots);
                        return Err(self.bail(id, AdoptError::UnknownProtocol(name.to_string())));
                    }
                }
            }

            // TLS only applies to stream sockets on a TLS-carrying vhost
            let effective_tls =
                opts.allow_tls && kind == DescriptorKind::Stream && vhost.tls_enabled();
            role = match Role::select(kind, effective_tls, opts.raw) {
                Some(role) => role,
                None => {
                    error!(?kind, "no role can adopt this descriptor");
                    drop(slots);
                    return Err(self.bail(id, AdoptError::NoMatchingRole));
                }
            };
            role.pre_bind(slot, opts.raw);
            tsi = slot.tsi;
        }

        if let Err(e) = self.backend.on_accept(self, id) {
            return Err(self.fail(id, AdoptError::BackendRefused(e)));
        }

        // From here the slot may become live on its owning thread, which
        // can be concurrent with this call. Mark it still-initializing so
        // that thread leaves it alone until the pipeline completes.
        {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(id.0) else {
                return Err(AdoptError::Closed);
            };
            slot.initializing = true;
        }

        let result = if role.requires_tls() {
            self.tls_handoff(id)
        } else {
            self.insert_into_fd_table(id, tsi).map(|_| ())
        };
        if let Err(e) = result {
            return Err(self.fail(id, e));
        }

        // The announcement is deferred until after insertion so that a
        // writable-notification request made from the callback has a poll
        // entry to attach to.
        let proto_idx = match self.slot(id) {
            Some(slot) => slot.protocol_index(),
            None => return Err(AdoptError::Closed),
        };
        if self.fire_event(id, proto_idx, role.announce()).is_err() {
            info!(slot = id.index(), "new-connection callback rejected the slot");
            return Err(self.fail(id, AdoptError::CallbackRejected));
        }

        // role may need to do something after all adoption completed
        {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(id.0) {
                role.finish(slot);
                slot.initializing = false;
            }
        }

        // the owning thread may be a different thread; have it reload its
        // poll set
        self.backend.wake(tsi);

        metrics::SLOTS_ADOPTED.increment();
        debug!(slot = id.index(), tsi, "descriptor adopted");
        Ok(id)
    }

    /// Adopt a descriptor together with bytes that were already read from
    /// it. The bytes are queued on the slot and delivered to the protocol
    /// before anything read from the live descriptor.
    pub fn adopt_with_readbuf(
        &self,
        vhost: &Arc<Vhost>,
        desc: Descriptor,
        opts: AdoptOptions,
        readbuf: &[u8],
    ) -> Result<SlotId, AdoptError> {
        let id = self.adopt(vhost, desc, opts)?;
        self.replay_readbuf(id, readbuf)
    }

    /// Adopt an accepted TCP stream with default options: protocol-framed,
    /// TLS permitted, no parent.
    pub fn adopt_stream(&self, vhost: &Arc<Vhost>, stream: TcpStream) -> Result<SlotId, AdoptError> {
        self.adopt(
            vhost,
            Descriptor::from_stream(stream),
            AdoptOptions {
                allow_tls: true,
                ..Default::default()
            },
        )
    }

    /// [`Context::adopt_stream`] composed with read-buffer replay.
    pub fn adopt_stream_with_readbuf(
        &self,
        vhost: &Arc<Vhost>,
        stream: TcpStream,
        readbuf: &[u8],
    ) -> Result<SlotId, AdoptError> {
        let id = self.adopt_stream(vhost, stream)?;
        self.replay_readbuf(id, readbuf)
    }

    /// Create a datagram socket on `port` and adopt it as a raw UDP child.
    /// The socket is bound to the local wildcard address only when
    /// `options.bind` is set.
    pub fn create_udp_child(
        &self,
        vhost: &Arc<Vhost>,
        port: u16,
        options: UdpChildOptions,
        protocol: Option<&str>,
        parent: Option<SlotId>,
    ) -> Result<SlotId, AdoptError> {
        let desc = descriptor::create_udp_socket(port, options.bind).map_err(|e| {
            error!("udp socket setup failed: {e}");
            AdoptError::UdpSetup(e)
        })?;
        let opts = AdoptOptions {
            raw: true,
            allow_tls: false,
            protocol: protocol.map(str::to_string),
            parent,
        };
        self.adopt(vhost, desc, opts).map_err(|e| {
            error!("udp adoption failed");
            e
        })
    }

    /// Allocate a slot bound to a thread: the given one, or the idlest.
    pub(crate) fn create_server_slot(
        &self,
        vhost: &Arc<Vhost>,
        fixed_tsi: Option<usize>,
    ) -> Result<SlotId, AdoptError> {
        if vhost.protocol_count() == 0 {
            error!(vhost = vhost.name(), "vhost has no protocols");
            return Err(AdoptError::NoProtocols);
        }
        let tsi = match fixed_tsi {
            Some(tsi) => tsi,
            None => match idlest_thread(&self.threads) {
                Some(tsi) => tsi,
                None => {
                    error!("no space for new connection");
                    return Err(AdoptError::NoThreadCapacity);
                }
            },
        };

        let id = {
            let mut slots = self.slots.lock();
            SlotId(slots.insert(Slot::new(tsi, vhost.clone())))
        };
        vhost.bind_slot();
        self.live_slots.fetch_add(1, Ordering::Relaxed);
        metrics::SLOTS_ACTIVE.increment();
        debug!(slot = id.index(), vhost = vhost.name(), tsi, "new slot joining vhost");

        // outermost create notification; no session because no protocol
        // has been selected
        let _ = self.fire_event(id, 0, SlotEvent::Created);

        Ok(id)
    }

    /// Insert a slot into its thread's fd table under that thread's lock,
    /// then register the descriptor with the backend.
    pub(crate) fn insert_into_fd_table(&self, id: SlotId, tsi: usize) -> Result<usize, AdoptError> {
        let Some(pt) = self.threads.get(tsi) else {
            return Err(AdoptError::InsertFailed);
        };

        let (fd, pos) = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(id.0) else {
                return Err(AdoptError::Closed);
            };
            let Some(fd) = slot.raw_fd() else {
                return Err(AdoptError::InsertFailed);
            };
            let mut fds = pt.fds.lock();
            let Some(pos) = fds.insert(id) else {
                // the capacity check at thread selection can lose a race
                // with concurrent adoptions onto the same thread
                error!(tsi, "failed inserting descriptor into fd table");
                return Err(AdoptError::InsertFailed);
            };
            drop(fds);
            slot.fds_pos = Some(pos);
            (fd, pos)
        };

        if let Err(e) = self.backend.register(tsi, fd, pos) {
            return Err(AdoptError::BackendRefused(e));
        }
        Ok(pos)
    }

    fn tls_handoff(&self, id: SlotId) -> Result<(), AdoptError> {
        #[cfg(feature = "tls")]
        {
            crate::tls::begin_negotiation(self, id)
        }
        #[cfg(not(feature = "tls"))]
        {
            let _ = id;
            Err(AdoptError::TlsNegotiation)
        }
    }

    /// Queue replayed bytes on a slot and service them if a parse context
    /// is available, deferring otherwise.
    pub(crate) fn replay_readbuf(&self, id: SlotId, readbuf: &[u8]) -> Result<SlotId, AdoptError> {
        if readbuf.is_empty() {
            return Ok(id);
        }

        let (tsi, first, have_ctx) = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(id.0) else {
                return Err(AdoptError::Closed);
            };
            // a slot that never made it into a poll table has nothing to
            // schedule against
            if slot.fds_pos.is_none() {
                return Ok(id);
            }
            let first = slot.pending.append(readbuf);
            let have_ctx = if slot.parse_ctx.is_some() {
                true
            } else if let Some(ctx) = self.parse_pool.try_attach() {
                slot.parse_ctx = Some(ctx);
                true
            } else {
                false
            };
            (slot.tsi, first, have_ctx)
        };

        if first {
            self.queue_pending_replay(tsi, id);
        }

        if have_ctx {
            // no network event will arrive for bytes we already hold, so
            // drive one service pass right now
            debug!(slot = id.index(), "servicing replayed bytes");
            match self.flush_pending(id) {
                ServiceOutcome::Live => Ok(id),
                ServiceOutcome::Closed => Err(AdoptError::Closed),
            }
        } else {
            metrics::READBUF_DEFERRED.increment();
            debug!(slot = id.index(), "deferring replay until a parse context frees");
            Ok(id)
        }
    }

    /// Unwind a slot that never became visible to a poll table: detach
    /// from its parent, release the peer reservation, unbind the vhost,
    /// and free it. Dropping the slot closes the descriptor.
    fn bail(&self, id: SlotId, err: AdoptError) -> AdoptError {
        let slot = {
            let mut slots = self.slots.lock();
            let Some(mut slot) = slots.try_remove(id.0) else {
                return err;
            };
            if let Some(pid) = slot.parent.take() {
                if let Some(parent) = slots.get_mut(pid.0) {
                    parent.children.retain(|child| *child != id);
                }
            }
            slot
        };

        if let Some(addr) = slot.peer {
            self.peers.release(addr);
        }
        slot.vhost.unbind_slot();
        self.live_slots.fetch_sub(1, Ordering::Relaxed);
        metrics::SLOTS_ACTIVE.decrement();
        metrics::ADOPT_FAILURES.increment();
        debug!(slot = id.index(), "exiting adoption on unwind");
        err
    }

    /// Unwind a slot that may already be installed in a poll table or
    /// counted by the peer registry: delegate to the general teardown.
    fn fail(&self, id: SlotId, err: AdoptError) -> AdoptError {
        metrics::ADOPT_FAILURES.increment();
        self.close_and_free(id, CloseReason::AdoptFailed);
        err
    }
}
