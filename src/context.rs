//! Process-wide context.
//!
//! The context owns the service-thread table, the slot registry, the peer
//! registry, and the shared parse-context pool. It also hosts the single
//! general-purpose teardown entry point, [`Context::close_and_free`],
//! which both adoption unwinding and normal connection close funnel
//! through.
//!
//! Lock order: the slot registry lock may be held while taking a thread's
//! fd-table lock, never the reverse. Service loops read the fd table
//! first, release it, then take the registry.

use crate::config::Config;
use crate::metrics;
use crate::peer::PeerRegistry;
use crate::slot::{CloseReason, Slot, SlotId};
use crate::thread::PerThread;
use crate::vhost::{HandlerRejected, SlotEvent};
use bytes::BytesMut;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use slab::Slab;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Hooks into the event-loop backend servicing the per-thread poll sets.
///
/// The default methods make every hook optional, so a backend only
/// implements what it needs. [`NullEventLoop`] implements none of them and
/// suits embeddings that drive service manually.
pub trait EventLoopOps: Send + Sync {
    /// Pre-insertion acceptance hook. Refusing unwinds the adoption.
    fn on_accept(&self, _ctx: &Context, _slot: SlotId) -> io::Result<()> {
        Ok(())
    }

    /// A descriptor entered thread `tsi`'s fd table at `pos`.
    fn register(&self, _tsi: usize, _fd: RawFd, _pos: usize) -> io::Result<()> {
        Ok(())
    }

    /// A descriptor left thread `tsi`'s fd table.
    fn deregister(&self, _tsi: usize, _fd: RawFd) {}

    /// Nudge thread `tsi`'s poll wait so it reconsiders its fd table.
    /// Fires at the end of every adoption because the slot may have been
    /// created from a different thread than the one that owns it.
    fn wake(&self, _tsi: usize) {}
}

/// Backend that does nothing; service is driven manually.
pub struct NullEventLoop;

impl EventLoopOps for NullEventLoop {}

/// Scratch state a slot must hold before replayed bytes can be delivered.
/// Contexts come from a bounded pool shared by all threads; a slot that
/// cannot get one defers its replay until one frees up.
pub struct ParseContext {
    pub(crate) rx: BytesMut,
}

impl ParseContext {
    fn new() -> Self {
        Self {
            rx: BytesMut::with_capacity(2048),
        }
    }
}

pub(crate) struct ParsePool {
    capacity: usize,
    in_use: Mutex<usize>,
}

impl ParsePool {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: Mutex::new(0),
        }
    }

    pub(crate) fn try_attach(&self) -> Option<ParseContext> {
        let mut in_use = self.in_use.lock();
        if *in_use >= self.capacity {
            return None;
        }
        *in_use += 1;
        Some(ParseContext::new())
    }

    pub(crate) fn release(&self) {
        let mut in_use = self.in_use.lock();
        *in_use = in_use.saturating_sub(1);
    }
}

/// Outcome of one service pass over a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// The slot is still live.
    Live,
    /// The slot was closed during service.
    Closed,
}

/// Process-wide library state. One per running instance.
pub struct Context {
    pub(crate) config: Config,
    pub(crate) threads: Box<[PerThread]>,
    pub(crate) slots: Mutex<Slab<Slot>>,
    pub(crate) peers: PeerRegistry,
    pub(crate) live_slots: AtomicUsize,
    pub(crate) backend: Arc<dyn EventLoopOps>,
    pub(crate) parse_pool: ParsePool,
}

impl Context {
    /// Create a context with no event backend attached.
    pub fn new(config: Config) -> Self {
        Self::with_backend(config, Arc::new(NullEventLoop))
    }

    /// Create a context wired to an event-loop backend.
    pub fn with_backend(config: Config, backend: Arc<dyn EventLoopOps>) -> Self {
        let threads = (0..config.threads)
            .map(|n| PerThread::new(n, config.fd_limit_per_thread))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let parse_pool = ParsePool::new(config.parse_contexts);

        Self {
            config,
            threads,
            slots: Mutex::new(Slab::new()),
            peers: PeerRegistry::new(),
            live_slots: AtomicUsize::new(0),
            backend,
            parse_pool,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Number of descriptors installed in thread `tsi`'s fd table.
    pub fn fd_count(&self, tsi: usize) -> usize {
        self.threads.get(tsi).map(PerThread::fd_count).unwrap_or(0)
    }

    /// Live connection slots across all threads.
    pub fn live_slots(&self) -> usize {
        self.live_slots.load(Ordering::Relaxed)
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Borrow a slot by handle. Holds the registry lock for the guard's
    /// lifetime; keep the borrow short.
    pub fn slot(&self, id: SlotId) -> Option<MappedMutexGuard<'_, Slot>> {
        let guard = self.slots.lock();
        MutexGuard::try_map(guard, |slots| slots.get_mut(id.0)).ok()
    }

    /// Slot installed at `pos` in thread `tsi`'s fd table.
    pub fn fd_at(&self, tsi: usize, pos: usize) -> Option<SlotId> {
        self.threads.get(tsi)?.fds.lock().get(pos)
    }

    /// Nudge thread `tsi`'s poll wait.
    pub fn wake(&self, tsi: usize) {
        self.backend.wake(tsi);
    }

    /// Deliver one event to the slot's protocol at `proto_idx`.
    pub(crate) fn fire_event(
        &self,
        id: SlotId,
        proto_idx: usize,
        event: SlotEvent<'_>,
    ) -> Result<(), HandlerRejected> {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(id.0) else {
            return Ok(());
        };
        let vhost = slot.vhost.clone();
        let Some(proto) = vhost.protocol(proto_idx) else {
            return Ok(());
        };
        proto.handler.on_event(slot, event)
    }

    /// Deliver every queued replay segment to the slot's protocol, oldest
    /// first. Closes the slot (and reports it) if the protocol refuses.
    pub fn flush_pending(&self, id: SlotId) -> ServiceOutcome {
        loop {
            let result = {
                let mut slots = self.slots.lock();
                let Some(slot) = slots.get_mut(id.0) else {
                    return ServiceOutcome::Closed;
                };
                let Some(segment) = slot.pending.pop() else {
                    let tsi = slot.tsi;
                    drop(slots);
                    if let Some(pt) = self.threads.get(tsi) {
                        pt.pending_replay.lock().retain(|queued| *queued != id);
                    }
                    return ServiceOutcome::Live;
                };

                // stage the segment through the parse context's rx buffer
                // so the protocol sees one contiguous slice
                let mut rx = slot
                    .parse_ctx
                    .as_mut()
                    .map(|p| std::mem::take(&mut p.rx))
                    .unwrap_or_default();
                rx.clear();
                rx.extend_from_slice(&segment);

                let vhost = slot.vhost.clone();
                let proto_idx = slot.protocol_idx;
                let result = match vhost.protocol(proto_idx) {
                    Some(proto) => proto.handler.on_event(slot, SlotEvent::Received(&rx)),
                    None => Ok(()),
                };
                if let Some(p) = slot.parse_ctx.as_mut() {
                    p.rx = rx;
                }
                result
            };

            if result.is_err() {
                self.close_and_free(id, CloseReason::ReplayFailed);
                return ServiceOutcome::Closed;
            }
        }
    }

    /// Deliver live-descriptor bytes to the slot's protocol. Any queued
    /// replay segments are delivered first, so pre-buffered bytes are
    /// always seen before bytes read from the descriptor.
    pub fn deliver_bytes(&self, id: SlotId, data: &[u8]) -> ServiceOutcome {
        if self.flush_pending(id) == ServiceOutcome::Closed {
            return ServiceOutcome::Closed;
        }

        let result = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(id.0) else {
                return ServiceOutcome::Closed;
            };
            let vhost = slot.vhost.clone();
            match vhost.protocol(slot.protocol_idx) {
                Some(proto) => proto.handler.on_event(slot, SlotEvent::Received(data)),
                None => Ok(()),
            }
        };

        if result.is_err() {
            self.close_and_free(id, CloseReason::HandlerRequested);
            return ServiceOutcome::Closed;
        }
        ServiceOutcome::Live
    }

    /// Retry replays deferred for lack of a parse context. Called by the
    /// service loop each pass.
    pub fn service_deferred_replays(&self, tsi: usize) {
        let Some(pt) = self.threads.get(tsi) else {
            return;
        };
        let ids: Vec<SlotId> = pt.pending_replay.lock().clone();
        for id in ids {
            let attached = {
                let mut slots = self.slots.lock();
                let Some(slot) = slots.get_mut(id.0) else {
                    continue;
                };
                if slot.parse_ctx.is_some() {
                    true
                } else if let Some(ctx) = self.parse_pool.try_attach() {
                    slot.parse_ctx = Some(ctx);
                    true
                } else {
                    false
                }
            };
            if attached {
                let _ = self.flush_pending(id);
            }
        }
    }

    pub(crate) fn queue_pending_replay(&self, tsi: usize, id: SlotId) {
        if let Some(pt) = self.threads.get(tsi) {
            let mut pending = pt.pending_replay.lock();
            if !pending.contains(&id) {
                pending.push(id);
            }
        }
    }

    /// Close a slot and release everything it holds: fd-table position,
    /// backend registration, peer reservation, parent/child links, parse
    /// context, session memory, vhost binding, and the descriptor itself.
    /// Safe to call twice; the second call is a no-op.
    pub fn close_and_free(&self, id: SlotId, reason: CloseReason) {
        let mut slot = {
            let mut slots = self.slots.lock();
            let Some(mut slot) = slots.try_remove(id.0) else {
                return;
            };
            // detach family links while the registry is still locked
            if let Some(pid) = slot.parent.take() {
                if let Some(parent) = slots.get_mut(pid.0) {
                    parent.children.retain(|child| *child != id);
                }
            }
            for cid in slot.children.drain(..) {
                if let Some(child) = slots.get_mut(cid.0) {
                    child.parent = None;
                }
            }
            slot
        };

        let tsi = slot.tsi;
        if let Some(pos) = slot.fds_pos.take() {
            let fd = slot.desc.as_ref().map(|d| d.raw());
            if let Some(pt) = self.threads.get(tsi) {
                pt.fds.lock().remove(pos);
            }
            if let Some(fd) = fd {
                self.backend.deregister(tsi, fd);
            }
        }
        if let Some(pt) = self.threads.get(tsi) {
            pt.pending_replay.lock().retain(|queued| *queued != id);
        }

        if slot.parse_ctx.take().is_some() {
            self.parse_pool.release();
        }

        // destroy notification goes to the selected protocol
        let vhost = slot.vhost.clone();
        if let Some(proto) = vhost.protocol(slot.protocol_idx) {
            let _ = proto.handler.on_event(&mut slot, SlotEvent::Destroyed);
        }

        if let Some(addr) = slot.peer.take() {
            self.peers.release(addr);
        }
        slot.vhost.unbind_slot();
        self.live_slots.fetch_sub(1, Ordering::Relaxed);
        metrics::SLOTS_ACTIVE.decrement();

        debug!(slot = id.index(), ?reason, "slot closed");
        // dropping the slot closes the descriptor and frees the session
    }
}
