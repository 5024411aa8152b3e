//! Connection roles.
//!
//! A role is the kind-specific behavior strategy bound to a slot during
//! adoption: plain stream, TLS-wrapped stream, raw datagram, or raw file.
//! Role selection is a pure match over the descriptor kind and adoption
//! options; binding happens in two phases, before and after the slot
//! enters its thread's fd table. Roles never close descriptors or free
//! slots; unwinding is the adoption pipeline's job.

use crate::descriptor::DescriptorKind;
use crate::slot::{Slot, SlotState};
use crate::vhost::SlotEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Protocol-framed or raw-passthrough TCP stream.
    PlainStream,
    /// Stream that must complete a TLS handshake before service.
    TlsStream,
    /// Datagram socket, always raw.
    RawUdp,
    /// Non-socket descriptor, always raw.
    RawFile,
}

impl Role {
    /// Pick the single role matching the descriptor kind and options.
    /// `tls` is the effective flag: requested, socket-kind, and the vhost
    /// actually carries TLS settings.
    pub(crate) fn select(kind: DescriptorKind, tls: bool, raw: bool) -> Option<Role> {
        match kind {
            DescriptorKind::Udp => Some(Role::RawUdp),
            DescriptorKind::File if raw => Some(Role::RawFile),
            // nothing frames a plain file; it must be adopted raw
            DescriptorKind::File => None,
            DescriptorKind::Stream if tls => Some(Role::TlsStream),
            DescriptorKind::Stream => Some(Role::PlainStream),
        }
    }

    pub(crate) fn requires_tls(self) -> bool {
        self == Role::TlsStream
    }

    /// Pre-registration phase: stamp role-specific state on the slot.
    pub(crate) fn pre_bind(self, slot: &mut Slot, raw: bool) {
        match self {
            Role::PlainStream => {
                slot.raw = raw;
                slot.state = SlotState::Established;
            }
            // state advances when the handshake is handed off
            Role::TlsStream => {
                slot.raw = raw;
            }
            Role::RawUdp | Role::RawFile => {
                slot.raw = true;
                slot.state = SlotState::Established;
            }
        }
    }

    /// Event announced on the slot's protocol once registration completes.
    pub(crate) fn announce(self) -> SlotEvent<'static> {
        match self {
            Role::PlainStream | Role::TlsStream => SlotEvent::NewClient,
            Role::RawUdp | Role::RawFile => SlotEvent::RawAdopted,
        }
    }

    /// Post-registration phase. Safe to call when `pre_bind` already did
    /// all the work; a TLS stream stays in its negotiating state until the
    /// handshake driver advances it.
    pub(crate) fn finish(self, slot: &mut Slot) {
        if self != Role::TlsStream && slot.state == SlotState::Unconnected {
            slot.state = SlotState::Established;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_table() {
        assert_eq!(
            Role::select(DescriptorKind::Stream, false, false),
            Some(Role::PlainStream)
        );
        assert_eq!(
            Role::select(DescriptorKind::Stream, false, true),
            Some(Role::PlainStream)
        );
        assert_eq!(
            Role::select(DescriptorKind::Stream, true, false),
            Some(Role::TlsStream)
        );
        assert_eq!(
            Role::select(DescriptorKind::Udp, false, true),
            Some(Role::RawUdp)
        );
        assert_eq!(
            Role::select(DescriptorKind::File, false, true),
            Some(Role::RawFile)
        );
        assert_eq!(Role::select(DescriptorKind::File, false, false), None);
    }

    #[test]
    fn announce_overrides_for_raw_roles() {
        assert!(matches!(Role::PlainStream.announce(), SlotEvent::NewClient));
        assert!(matches!(Role::RawUdp.announce(), SlotEvent::RawAdopted));
        assert!(matches!(Role::RawFile.announce(), SlotEvent::RawAdopted));
    }
}
