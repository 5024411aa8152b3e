//! Virtual hosts and their protocol tables.
//!
//! A vhost is a named, ordered bundle of protocol definitions. Connection
//! slots reference their vhost through an `Arc`; the vhost never owns
//! slots, it only counts them. The protocol at index 0 is the vhost's
//! default and receives lifecycle notifications for slots that have not
//! yet selected a protocol.

use crate::slot::Slot;
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[cfg(feature = "tls")]
use crate::tls::TlsSettings;

/// Per-connection protocol state, allocated by the protocol's handler.
pub type Session = Box<dyn Any + Send>;

/// Event delivered to a protocol handler for one slot.
#[derive(Debug)]
pub enum SlotEvent<'a> {
    /// The slot object exists. No protocol has been selected yet, so the
    /// vhost's default protocol receives this with no session attached.
    Created,
    /// The slot is being torn down.
    Destroyed,
    /// A server connection finished adoption (stream roles).
    NewClient,
    /// A raw descriptor finished adoption (raw roles).
    RawAdopted,
    /// Payload bytes for the selected protocol.
    Received(&'a [u8]),
    /// The descriptor is writable.
    Writable,
}

/// Returned by a handler to refuse an event. Refusing a new-connection
/// event unwinds the adoption; refusing received bytes closes the slot.
#[derive(Debug, thiserror::Error)]
#[error("protocol handler rejected event")]
pub struct HandlerRejected;

/// A protocol's behavior, shared by all slots bound to it.
///
/// Handlers run with the slot registry borrowed, so they must not call
/// back into adoption or teardown; return an error to request close
/// instead.
pub trait ProtocolHandler: Send + Sync {
    /// Allocate per-connection session state. `None` when the protocol
    /// keeps no per-connection state.
    fn new_session(&self) -> Option<Session> {
        None
    }

    /// Handle one event for one slot.
    fn on_event(&self, slot: &mut Slot, event: SlotEvent<'_>) -> Result<(), HandlerRejected>;
}

/// A named protocol in a vhost's table.
pub struct Protocol {
    pub name: String,
    pub handler: Arc<dyn ProtocolHandler>,
}

/// A named bundle of protocols and optional TLS settings.
pub struct Vhost {
    name: String,
    protocols: Vec<Protocol>,
    #[cfg(feature = "tls")]
    tls: Option<TlsSettings>,
    bound_slots: AtomicUsize,
}

impl Vhost {
    pub fn builder(name: impl Into<String>) -> VhostBuilder {
        VhostBuilder {
            name: name.into(),
            protocols: Vec::new(),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self, index: usize) -> Option<&Protocol> {
        self.protocols.get(index)
    }

    /// Resolve a protocol name to its table index.
    pub fn protocol_index(&self, name: &str) -> Option<usize> {
        self.protocols.iter().position(|p| p.name == name)
    }

    pub fn protocol_count(&self) -> usize {
        self.protocols.len()
    }

    /// Number of slots currently bound to this vhost.
    pub fn bound_slots(&self) -> usize {
        self.bound_slots.load(Ordering::Relaxed)
    }

    #[cfg(feature = "tls")]
    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    #[cfg(not(feature = "tls"))]
    pub fn tls_enabled(&self) -> bool {
        false
    }

    #[cfg(feature = "tls")]
    pub(crate) fn tls(&self) -> Option<&TlsSettings> {
        self.tls.as_ref()
    }

    pub(crate) fn bind_slot(&self) {
        self.bound_slots.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unbind_slot(&self) {
        self.bound_slots.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Builder for [`Vhost`].
pub struct VhostBuilder {
    name: String,
    protocols: Vec<Protocol>,
    #[cfg(feature = "tls")]
    tls: Option<TlsSettings>,
}

impl VhostBuilder {
    /// Append a protocol. The first protocol added becomes the vhost's
    /// default.
    pub fn protocol(mut self, name: impl Into<String>, handler: Arc<dyn ProtocolHandler>) -> Self {
        self.protocols.push(Protocol {
            name: name.into(),
            handler,
        });
        self
    }

    #[cfg(feature = "tls")]
    pub fn tls(mut self, settings: TlsSettings) -> Self {
        self.tls = Some(settings);
        self
    }

    pub fn build(self) -> Arc<Vhost> {
        Arc::new(Vhost {
            name: self.name,
            protocols: self.protocols,
            #[cfg(feature = "tls")]
            tls: self.tls,
            bound_slots: AtomicUsize::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl ProtocolHandler for Nop {
        fn on_event(&self, _slot: &mut Slot, _event: SlotEvent<'_>) -> Result<(), HandlerRejected> {
            Ok(())
        }
    }

    #[test]
    fn protocol_lookup_by_name() {
        let vhost = Vhost::builder("default")
            .protocol("http", Arc::new(Nop))
            .protocol("echo", Arc::new(Nop))
            .build();

        assert_eq!(vhost.protocol_count(), 2);
        assert_eq!(vhost.protocol_index("http"), Some(0));
        assert_eq!(vhost.protocol_index("echo"), Some(1));
        assert_eq!(vhost.protocol_index("missing"), None);
        assert_eq!(vhost.protocol(0).unwrap().name, "http");
    }

    #[test]
    fn bound_slot_counting() {
        let vhost = Vhost::builder("default").protocol("http", Arc::new(Nop)).build();
        assert_eq!(vhost.bound_slots(), 0);
        vhost.bind_slot();
        vhost.bind_slot();
        vhost.unbind_slot();
        assert_eq!(vhost.bound_slots(), 1);
    }
}
