//! conn-core - connection adoption for a multi-threaded poll server.
//!
//! This crate turns raw, already-accepted OS descriptors (TCP/UDP sockets
//! or plain fds) into managed, protocol-bound, pollable connection slots.
//! New slots are load balanced across a fixed pool of service threads,
//! admission controlled per remote address, and unwound safely when any
//! initialization stage fails.
//!
//! # Quick start
//!
//! ```ignore
//! use conn_core::{AdoptOptions, Config, Context, Vhost};
//! use std::net::TcpListener;
//! use std::sync::Arc;
//!
//! let ctx = Context::new(Config::default());
//! let vhost = Vhost::builder("default")
//!     .protocol("echo", Arc::new(EchoHandler))
//!     .build();
//!
//! let listener = TcpListener::bind("0.0.0.0:8080")?;
//! loop {
//!     let (stream, _) = listener.accept()?;
//!     match ctx.adopt_stream(&vhost, stream) {
//!         Ok(slot) => tracing::debug!(slot = slot.index(), "adopted"),
//!         Err(e) => tracing::warn!("adoption failed: {e}"),
//!     }
//! }
//! ```
//!
//! # Threading model
//!
//! Each service thread owns a private fd table and poll loop; a slot is
//! assigned to exactly one thread at adoption and never migrates. The
//! only cross-thread table access is the insertion performed by the
//! adopting thread, under the owning thread's lock. A slot created from a
//! foreign thread carries an initializing flag until adoption completes;
//! the owning thread's loop must not service it before then.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod poll;

mod adopt;
mod buflist;
mod context;
mod descriptor;
mod error;
mod peer;
mod role;
mod slot;
mod thread;
mod vhost;

#[cfg(feature = "tls")]
pub mod tls;

pub use adopt::{AdoptOptions, UdpChildOptions};
pub use config::{Config, LogFormat, LoggingConfig};
pub use context::{Context, EventLoopOps, NullEventLoop, ParseContext, ServiceOutcome};
pub use descriptor::{Descriptor, DescriptorKind};
pub use error::AdoptError;
pub use peer::PeerRegistry;
pub use slot::{CloseReason, Slot, SlotId, SlotState};
pub use vhost::{HandlerRejected, Protocol, ProtocolHandler, Session, SlotEvent, Vhost, VhostBuilder};
