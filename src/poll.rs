//! Reference event backend built on mio.
//!
//! One `Poll`/`Waker` pair per service thread. Descriptors are registered
//! under their fd-table position, so poll tokens map straight back to
//! slots. Embeddings with their own event loop implement [`EventLoopOps`]
//! instead; this backend exists so a server can be stood up with nothing
//! beyond this crate. The service pass handles readable events and
//! deferred replays; TLS handshake progression and timeouts belong to the
//! embedding.

use crate::context::{Context, EventLoopOps, ServiceOutcome};
use crate::slot::{CloseReason, SlotId};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::{trace, warn};

/// Token reserved for each thread's waker.
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

struct PollState {
    poll: Poll,
    events: Events,
}

struct PollThread {
    state: Mutex<PollState>,
    registry: mio::Registry,
    waker: Waker,
}

/// mio-backed reference backend.
pub struct MioBackend {
    threads: Box<[PollThread]>,
}

impl MioBackend {
    pub fn new(thread_count: usize) -> io::Result<Self> {
        let mut threads = Vec::with_capacity(thread_count);
        for _ in 0..thread_count {
            let poll = Poll::new()?;
            let registry = poll.registry().try_clone()?;
            let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
            threads.push(PollThread {
                state: Mutex::new(PollState {
                    poll,
                    events: Events::with_capacity(256),
                }),
                registry,
                waker,
            });
        }
        Ok(Self {
            threads: threads.into_boxed_slice(),
        })
    }

    /// One blocking service pass for thread `tsi`: wait for events,
    /// service readable slots, then retry deferred replays.
    pub fn poll_once(&self, ctx: &Context, tsi: usize, timeout: Option<Duration>) -> io::Result<()> {
        let Some(thread) = self.threads.get(tsi) else {
            return Ok(());
        };

        let ready: Vec<(usize, bool)> = {
            let mut state = thread.state.lock();
            let PollState { poll, events } = &mut *state;
            poll.poll(events, timeout)?;
            events
                .iter()
                .filter(|event| event.token() != WAKER_TOKEN)
                .map(|event| (event.token().0, event.is_readable()))
                .collect()
        };

        for (pos, readable) in ready {
            let Some(id) = ctx.fd_at(tsi, pos) else {
                continue;
            };
            // a slot still initializing from another thread isn't
            // actionable yet; the creator wakes us again when it's done
            if ctx.slot(id).map(|slot| slot.is_initializing()).unwrap_or(true) {
                continue;
            }
            if readable {
                self.service_read(ctx, id);
            }
        }

        ctx.service_deferred_replays(tsi);
        Ok(())
    }

    fn service_read(&self, ctx: &Context, id: SlotId) {
        // replayed bytes are always delivered before live bytes
        if ctx.flush_pending(id) == ServiceOutcome::Closed {
            return;
        }
        let Some(fd) = ctx.slot(id).and_then(|slot| slot.raw_fd()) else {
            return;
        };

        let mut buf = [0u8; 4096];
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n == 0 {
                ctx.close_and_free(id, CloseReason::PeerClosed);
                return;
            }
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => return,
                    io::ErrorKind::Interrupted => continue,
                    _ => {
                        trace!(slot = id.index(), "read failed: {err}");
                        ctx.close_and_free(id, CloseReason::PeerClosed);
                        return;
                    }
                }
            }
            if ctx.deliver_bytes(id, &buf[..n as usize]) == ServiceOutcome::Closed {
                return;
            }
            if (n as usize) < buf.len() {
                return;
            }
        }
    }
}

impl EventLoopOps for MioBackend {
    fn register(&self, tsi: usize, fd: RawFd, pos: usize) -> io::Result<()> {
        let Some(thread) = self.threads.get(tsi) else {
            return Ok(());
        };
        thread
            .registry
            .register(&mut SourceFd(&fd), Token(pos), Interest::READABLE)
    }

    fn deregister(&self, tsi: usize, fd: RawFd) {
        if let Some(thread) = self.threads.get(tsi) {
            if let Err(e) = thread.registry.deregister(&mut SourceFd(&fd)) {
                trace!("deregister failed: {e}");
            }
        }
    }

    fn wake(&self, tsi: usize) {
        if let Some(thread) = self.threads.get(tsi) {
            if let Err(e) = thread.waker.wake() {
                warn!("waker failed: {e}");
            }
        }
    }
}
