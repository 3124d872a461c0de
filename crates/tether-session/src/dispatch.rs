//! Glue between the transport and the session layer: looks up the session
//! for the source connection, applies its filter hooks, drops stale update
//! frames, then runs its handle hooks.

use std::sync::Arc;

use tether_net::connection::{DualConnection, RecordHandler};
use tether_net::record::Record;

use crate::registry::SessionRegistry;
use crate::session::PlayerSession;

/// [`RecordHandler`] implementation wiring decoded records into sessions.
///
/// A handshake on a sessionless connection creates and starts the session;
/// everything else is filtered and relayed by the session owning the source
/// connection.
pub struct RelayDispatcher {
    registry: Arc<SessionRegistry>,
}

impl RelayDispatcher {
    /// Create a dispatcher over a registry.
    pub fn new(registry: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self { registry })
    }

    /// The registry this dispatcher serves.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

impl RecordHandler for RelayDispatcher {
    fn handle(&self, con: &Arc<DualConnection>, mut record: Record) {
        let session = self.registry.session_by_connection(con.id());

        match &record {
            Record::Handshake(handshake) => {
                if session.is_some() {
                    tracing::debug!("Duplicate handshake on {} ignored", con);
                    return;
                }
                let id = self.registry.allocate_id();
                let session =
                    PlayerSession::new(Arc::clone(&self.registry), Arc::clone(con), id);
                let registry = Arc::clone(&self.registry);
                con.set_on_teardown(move |dead| registry.dispose_by_connection(dead.id()));
                session.start(handshake);
                return;
            }
            // Answer port sniffers with the canned decoy response.
            Record::HttpProbe => {
                if let Err(e) = con.send(&Record::HttpProbe) {
                    tracing::debug!("Failed to write decoy response on {}: {e}", con);
                }
                return;
            }
            Record::Keepalive => return,
            _ => {}
        }

        let Some(session) = session else {
            tracing::debug!("Record on sessionless connection {} dropped", con);
            return;
        };

        if let Record::PlayerIdentity(identity) = &mut record {
            session.filter_identity_update(con.id(), identity);
            session.handle_identity_update(con.id(), identity);
            return;
        }

        session.filter_record(con.id(), &mut record);
        if let Some((owner, seq)) = record.update_sequence()
            && !self.registry.observe_order(owner, record.kind(), seq)
        {
            // Stale update frame: a newer one already went through.
            return;
        }
        session.handle_record(con.id(), &record);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
