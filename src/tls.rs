//! TLS adoption handoff.
//!
//! A stream adopted with TLS permitted, on a vhost carrying TLS settings,
//! is handed to negotiation instead of plain insertion: server-side
//! handshake state is created and the descriptor installed so the owning
//! thread can drive the handshake. The slot stays in the negotiating
//! state until the handshake driver advances it; protocols see nothing
//! before then.

use crate::context::Context;
use crate::error::AdoptError;
use crate::slot::{SlotId, SlotState};
use std::sync::Arc;
use tracing::info;

/// Server-side TLS settings attached to a vhost.
#[derive(Clone)]
pub struct TlsSettings {
    config: Arc<rustls::ServerConfig>,
}

impl TlsSettings {
    pub fn new(config: Arc<rustls::ServerConfig>) -> Self {
        Self { config }
    }

    pub(crate) fn config(&self) -> &Arc<rustls::ServerConfig> {
        &self.config
    }
}

/// Hand a freshly role-bound slot to TLS negotiation. A failure here is
/// unwound by the caller exactly like an insertion failure.
pub(crate) fn begin_negotiation(ctx: &Context, id: SlotId) -> Result<(), AdoptError> {
    let tsi = {
        let mut slots = ctx.slots.lock();
        let Some(slot) = slots.get_mut(id.0) else {
            return Err(AdoptError::Closed);
        };
        let vhost = slot.vhost.clone();
        let Some(settings) = vhost.tls() else {
            return Err(AdoptError::TlsNegotiation);
        };
        let conn = rustls::ServerConnection::new(settings.config().clone()).map_err(|e| {
            info!("tls negotiation failed: {e}");
            AdoptError::TlsNegotiation
        })?;
        slot.tls = Some(Box::new(conn));
        slot.state = SlotState::TlsNegotiating;
        slot.tsi
    };

    ctx.insert_into_fd_table(id, tsi)?;
    Ok(())
}
