//! Adoption error types.

use std::io;

/// Errors returned by descriptor adoption.
///
/// Every variant maps onto exactly one unwind behavior: admission and
/// allocation failures never produce a slot, configuration failures unwind
/// a partially-built slot before it is pollable, and post-registration
/// failures retire the slot through [`Context::close_and_free`].
///
/// [`Context::close_and_free`]: crate::Context::close_and_free
#[derive(Debug, thiserror::Error)]
pub enum AdoptError {
    /// The remote address is at its concurrent-connection ceiling.
    #[error("peer connection limit reached")]
    PeerLimit,

    /// Every service thread's fd table is at capacity.
    #[error("no service thread has fd-table capacity")]
    NoThreadCapacity,

    /// The vhost carries no protocols, so no default protocol exists.
    #[error("vhost has no protocols")]
    NoProtocols,

    /// The supplied parent slot no longer exists.
    #[error("parent slot no longer exists")]
    ParentMissing,

    /// Setting the descriptor nonblocking failed.
    #[error("unable to set descriptor nonblocking")]
    Nonblocking(#[source] io::Error),

    /// A protocol was requested by name but the vhost does not carry it.
    #[error("protocol {0:?} not enabled on vhost")]
    UnknownProtocol(String),

    /// No role matched the descriptor kind and adoption options.
    #[error("no role can adopt this descriptor")]
    NoMatchingRole,

    /// The event backend refused the new connection.
    #[error("event backend rejected adoption")]
    BackendRefused(#[source] io::Error),

    /// fd-table insertion lost the capacity race.
    #[error("fd-table insertion failed")]
    InsertFailed,

    /// TLS negotiation could not be started.
    #[error("tls negotiation failed")]
    TlsNegotiation,

    /// The new-connection callback rejected the slot.
    #[error("new-connection callback rejected the slot")]
    CallbackRejected,

    /// The connection closed while servicing replayed bytes.
    #[error("connection closed while servicing replayed bytes")]
    Closed,

    /// Local address resolution or socket creation for a UDP child failed.
    #[error("udp socket setup failed")]
    UdpSetup(#[source] io::Error),
}
