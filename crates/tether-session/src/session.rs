//! Player sessions: the binding of a connection to a persistent identity.
//!
//! A session exists exactly while registered. Its ID and connection never
//! change; the published identity record is immutable from the client's
//! point of view — ownership filters force any inbound identity fields back
//! to the server-assigned values before relay.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tether_net::connection::{ConnectionId, DualConnection};
use tether_net::record::{
    Handshake, HandshakeAck, PROTOCOL_VERSION, PlayerId, PlayerIdentity, Record,
};

use crate::registry::SessionRegistry;

/// Strip control characters, trim whitespace, and clip to `max_len`
/// characters. An empty result falls back so removal notices (empty full
/// name) stay unambiguous.
pub fn sanitize_name(raw: &str, max_len: usize) -> String {
    let cleaned: String = raw.chars().filter(|c| !c.is_control()).collect();
    let trimmed: String = cleaned.trim().chars().take(max_len).collect();
    if trimmed.is_empty() {
        "Guest".to_string()
    } else {
        trimmed
    }
}

/// One player's server-side session.
pub struct PlayerSession {
    id: PlayerId,
    con: Arc<DualConnection>,
    registry: Arc<SessionRegistry>,
    disposed: AtomicBool,
}

impl PlayerSession {
    /// Bind a connection to a player ID. The session is inert until
    /// [`start`](Self::start) registers it.
    pub fn new(
        registry: Arc<SessionRegistry>,
        con: Arc<DualConnection>,
        id: PlayerId,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            con,
            registry,
            disposed: AtomicBool::new(false),
        })
    }

    /// The immutable player ID.
    pub fn id(&self) -> PlayerId {
        self.id
    }

    /// The owning connection.
    pub fn connection(&self) -> &Arc<DualConnection> {
        &self.con
    }

    /// The currently published identity.
    pub fn identity(&self) -> Option<PlayerIdentity> {
        self.registry.identity(self.id)
    }

    /// Register the session and run the join sequence: sanitize and
    /// deduplicate the requested name, publish the identity, acknowledge the
    /// handshake, and exchange state with every other active session.
    pub fn start(self: &Arc<Self>, handshake: &Handshake) {
        tracing::info!("Startup #{} {}", self.id, self.con);
        self.registry.register(self);

        let name = sanitize_name(&handshake.name, self.registry.settings().max_name_length);
        let full_name = self.registry.resolve_full_name(&name);
        let identity = PlayerIdentity {
            id: self.id,
            name,
            full_name,
        };
        self.registry.publish_identity(identity.clone());
        tracing::info!("Session #{} joined as '{}'", self.id, identity.full_name);

        self.con.enqueue(Record::HandshakeAck(HandshakeAck {
            protocol_version: PROTOCOL_VERSION,
            identity: identity.clone(),
        }));
        self.con.enqueue(Record::PlayerIdentity(identity));

        self.registry.sync_join(self);
    }

    /// Unregister, announce the departure, and release published state.
    /// Idempotent: a second call does nothing and broadcasts nothing.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutdown #{} {}", self.id, self.con);

        if self.registry.unregister(self) {
            self.registry
                .broadcast(&Record::PlayerIdentity(PlayerIdentity::removal(self.id)));
        }
        self.registry.release(self.id);
    }

    // -- filter hooks (records from this session's own connection) ----------

    /// A session may only change non-identity fields of its own record:
    /// ID, name, and full name are forced back to the published identity.
    pub fn filter_identity_update(&self, source: ConnectionId, updated: &mut PlayerIdentity) {
        if source != self.con.id() {
            return;
        }
        let Some(current) = self.identity() else {
            return;
        };
        updated.id = current.id;
        updated.name = current.name;
        updated.full_name = current.full_name;
    }

    /// Force the ownership fields of bound and player-update records to
    /// this session, so no record can be attributed to another player.
    pub fn filter_record(&self, source: ConnectionId, record: &mut Record) {
        if source != self.con.id() {
            return;
        }
        if let Some(bound_id) = record.bound_player_id_mut() {
            *bound_id = self.id;
        }
        if let Some(player) = record.player_identity_mut()
            && let Some(current) = self.identity()
        {
            *player = current;
        }
    }

    // -- handle hooks (post-acceptance relay) --------------------------------

    /// Identity updates relay to every other active session.
    pub fn handle_identity_update(&self, source: ConnectionId, updated: &PlayerIdentity) {
        if source != self.con.id() {
            return;
        }
        self.registry
            .relay_to_others(self.id, &Record::PlayerIdentity(updated.clone()));
    }

    /// Bound records publish the sender's last-known state and relay to all
    /// other sessions; player updates relay only within the sender's
    /// grouping context.
    pub fn handle_record(&self, source: ConnectionId, record: &Record) {
        if source != self.con.id() {
            return;
        }
        if record.bound_player_id().is_some() {
            self.registry.set_bound(self.id, record.clone());
            self.registry.relay_to_others(self.id, record);
        } else if record.is_player_update() {
            self.registry.relay_player_update(self.id, record);
        }
    }
}
