//! The server-wide session registry.
//!
//! One coarse lock guards the lookup tables, the keyed identity store, the
//! per-player bound records, and the update-order table. Registration,
//! broadcast, and teardown each hold the lock for their whole critical
//! section so a broadcast can never interleave with a table mutation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tether_net::connection::ConnectionId;
use tether_net::record::{PlayerId, PlayerIdentity, PlayerState, Record, RecordKind};

use crate::session::PlayerSession;

/// Session-layer settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Maximum display name length after sanitization, in characters.
    pub max_name_length: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_name_length: 30,
        }
    }
}

struct RegistryInner {
    by_id: HashMap<PlayerId, Arc<PlayerSession>>,
    by_con: HashMap<ConnectionId, Arc<PlayerSession>>,
    identities: HashMap<PlayerId, PlayerIdentity>,
    bound: HashMap<PlayerId, HashMap<RecordKind, Record>>,
    orders: HashMap<(PlayerId, RecordKind), u32>,
}

impl RegistryInner {
    fn bound_state(&self, id: PlayerId) -> Option<&PlayerState> {
        match self.bound.get(&id)?.get(&RecordKind::PlayerState)? {
            Record::PlayerState(state) => Some(state),
            _ => None,
        }
    }
}

/// Owns the authoritative set of active sessions and their published state.
pub struct SessionRegistry {
    settings: SessionSettings,
    next_id: AtomicU32,
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new(settings: SessionSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            next_id: AtomicU32::new(1),
            inner: Mutex::new(RegistryInner {
                by_id: HashMap::new(),
                by_con: HashMap::new(),
                identities: HashMap::new(),
                bound: HashMap::new(),
                orders: HashMap::new(),
            }),
        })
    }

    /// Session-layer settings.
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Allocate the next player ID.
    pub fn allocate_id(&self) -> PlayerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of active sessions.
    pub fn session_count(&self) -> usize {
        self.lock().by_id.len()
    }

    /// Look up an active session by player ID.
    pub fn session_by_id(&self, id: PlayerId) -> Option<Arc<PlayerSession>> {
        self.lock().by_id.get(&id).cloned()
    }

    /// Look up an active session by its connection.
    pub fn session_by_connection(&self, con: ConnectionId) -> Option<Arc<PlayerSession>> {
        self.lock().by_con.get(&con).cloned()
    }

    /// Dispose the session bound to a connection, if any. Safe to call from
    /// a connection teardown hook.
    pub fn dispose_by_connection(&self, con: ConnectionId) {
        let session = self.session_by_connection(con);
        if let Some(session) = session {
            session.dispose();
        }
    }

    /// The published identity of a player.
    pub fn identity(&self, id: PlayerId) -> Option<PlayerIdentity> {
        self.lock().identities.get(&id).cloned()
    }

    /// The last-known bound state of a player.
    pub fn bound_state(&self, id: PlayerId) -> Option<PlayerState> {
        self.lock().bound_state(id).cloned()
    }

    /// All bound records published for a player.
    pub fn bound_records(&self, id: PlayerId) -> Vec<Record> {
        self.lock()
            .bound
            .get(&id)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn register(&self, session: &Arc<PlayerSession>) {
        let mut inner = self.lock();
        inner.by_id.insert(session.id(), Arc::clone(session));
        inner
            .by_con
            .insert(session.connection().id(), Arc::clone(session));
    }

    /// Remove a session from both tables. Returns whether it was present
    /// (idempotent teardown relies on this).
    pub(crate) fn unregister(&self, session: &PlayerSession) -> bool {
        let mut inner = self.lock();
        let was_registered = inner.by_id.remove(&session.id()).is_some();
        inner.by_con.remove(&session.connection().id());
        was_registered
    }

    pub(crate) fn publish_identity(&self, identity: PlayerIdentity) {
        self.lock().identities.insert(identity.id, identity);
    }

    /// Resolve a sanitized base name into a full name unique among active
    /// players by appending "#N" (N from 2) until it no longer collides.
    pub(crate) fn resolve_full_name(&self, base: &str) -> String {
        let inner = self.lock();
        let mut full_name = base.to_string();
        let mut n = 2;
        while inner
            .identities
            .values()
            .any(|identity| identity.full_name == full_name)
        {
            full_name = format!("{base}#{n}");
            n += 1;
        }
        full_name
    }

    /// Publish a bound record for a player, replacing the previous record of
    /// the same kind.
    pub(crate) fn set_bound(&self, owner: PlayerId, record: Record) {
        self.lock()
            .bound
            .entry(owner)
            .or_default()
            .insert(record.kind(), record);
    }

    /// Track the newest update counter per (player, kind). Returns `true`
    /// when `seq` is newer than anything seen before (wrap-aware), `false`
    /// for stale or duplicate updates.
    pub fn observe_order(&self, owner: PlayerId, kind: RecordKind, seq: u32) -> bool {
        let mut inner = self.lock();
        match inner.orders.get_mut(&(owner, kind)) {
            Some(last) => {
                if (seq.wrapping_sub(*last) as i32) > 0 {
                    *last = seq;
                    true
                } else {
                    false
                }
            }
            None => {
                inner.orders.insert((owner, kind), seq);
                true
            }
        }
    }

    /// Drop a departed player's identity, bound records, and order history.
    pub(crate) fn release(&self, id: PlayerId) {
        let mut inner = self.lock();
        inner.identities.remove(&id);
        inner.bound.remove(&id);
        inner.orders.retain(|(owner, _), _| *owner != id);
    }

    /// Enqueue a record to every active session.
    pub fn broadcast(&self, record: &Record) {
        let inner = self.lock();
        for session in inner.by_id.values() {
            session.connection().enqueue(record.clone());
        }
    }

    /// Enqueue a record to every active session except the sender.
    pub fn relay_to_others(&self, sender: PlayerId, record: &Record) {
        let inner = self.lock();
        for (id, session) in &inner.by_id {
            if *id == sender {
                continue;
            }
            session.connection().enqueue(record.clone());
        }
    }

    /// Enqueue a player-update record to every other session whose
    /// last-known state shares the sender's grouping context. Sessions with
    /// no resolvable state, or a different context, are skipped.
    pub fn relay_player_update(&self, sender: PlayerId, record: &Record) {
        let inner = self.lock();
        let Some(state) = inner.bound_state(sender).cloned() else {
            return;
        };
        for (id, session) in &inner.by_id {
            if *id == sender {
                continue;
            }
            match inner.bound_state(*id) {
                Some(other_state) if other_state.same_context(&state) => {
                    session.connection().enqueue(record.clone());
                }
                _ => {}
            }
        }
    }

    /// Full state sync on join: under one lock, give every other session the
    /// joining player's identity and give the joining player every other
    /// identity plus its bound records.
    pub(crate) fn sync_join(&self, joining: &PlayerSession) {
        let inner = self.lock();
        let Some(my_identity) = inner.identities.get(&joining.id()).cloned() else {
            return;
        };
        for (id, other) in &inner.by_id {
            if *id == joining.id() {
                continue;
            }
            other
                .connection()
                .enqueue(Record::PlayerIdentity(my_identity.clone()));
            if let Some(other_identity) = inner.identities.get(id) {
                joining
                    .connection()
                    .enqueue(Record::PlayerIdentity(other_identity.clone()));
            }
            if let Some(bound) = inner.bound.get(id) {
                for record in bound.values() {
                    joining.connection().enqueue(record.clone());
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
