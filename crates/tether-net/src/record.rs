//! Wire record types exchanged through the relay.
//!
//! Every record is a variant of the [`Record`] enum; the enum discriminant is
//! the type tag. Capabilities (update-flagged, structurally bound,
//! player-update) are exposed through explicit accessors so dispatch sites
//! can check tags instead of downcasting.

use serde::{Deserialize, Serialize};

/// Current relay protocol version, carried in the handshake exchange.
pub const PROTOCOL_VERSION: u16 = 2;

/// Numeric player identifier, unique per server run.
pub type PlayerId = u32;

// ---------------------------------------------------------------------------
// Record flags
// ---------------------------------------------------------------------------

/// Transport flags attached to a record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFlags(u8);

impl RecordFlags {
    /// No flags.
    pub const NONE: RecordFlags = RecordFlags(0);
    /// Frequent, droppable state update: routed over the unreliable channel.
    pub const UPDATE: RecordFlags = RecordFlags(1);

    /// Whether all flags in `other` are set.
    pub fn contains(&self, other: RecordFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Client-to-server join request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Handshake {
    /// Protocol version the client speaks.
    pub protocol_version: u16,
    /// Requested display name (sanitized server-side).
    pub name: String,
}

/// Server-to-client join acknowledgment, carrying the assigned identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeAck {
    /// Protocol version the server speaks.
    pub protocol_version: u16,
    /// The identity assigned to the joining player.
    pub identity: PlayerIdentity,
}

/// A player's persistent identity record.
///
/// An identity with an empty `full_name` is an identity-removal notice: the
/// player with that ID has left.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerIdentity {
    /// Server-assigned player ID.
    pub id: PlayerId,
    /// Sanitized display name.
    pub name: String,
    /// Display name made unique among active players ("Ada", "Ada#2", ...).
    pub full_name: String,
}

impl PlayerIdentity {
    /// ID-only removal notice for a departing player.
    pub fn removal(id: PlayerId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Whether this record announces a departure rather than an identity.
    pub fn is_removal(&self) -> bool {
        self.full_name.is_empty()
    }
}

/// A player's grouping state, structurally bound to their identity.
///
/// Two sessions share relayed player updates only when their states agree on
/// the whole `(channel, level, mode)` context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerState {
    /// Owning player ID (forced server-side; cannot be forged).
    pub player_id: PlayerId,
    /// Chat/relay channel the player is in.
    pub channel: u32,
    /// Level or world identifier.
    pub level: String,
    /// Game mode within the level.
    pub mode: u8,
}

impl PlayerState {
    /// Whether two states share the same grouping context.
    pub fn same_context(&self, other: &PlayerState) -> bool {
        self.channel == other.channel && self.level == other.level && self.mode == other.mode
    }
}

/// A frequent player state update (position, animation, ...).
///
/// Flagged UPDATE: relayed over the unreliable channel, droppable, and
/// deduplicated by `sequence` so stale frames are discarded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerFrame {
    /// Identity of the player this frame describes (forced server-side).
    pub player: PlayerIdentity,
    /// Monotonic per-player frame counter, for staleness checks.
    pub sequence: u32,
    /// Opaque codec-defined frame payload.
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Record enum
// ---------------------------------------------------------------------------

/// Top-level relay record. The enum discriminant is the type tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Record {
    /// Client join request.
    Handshake(Handshake),
    /// Server join acknowledgment.
    HandshakeAck(HandshakeAck),
    /// Player identity (or ID-only removal notice).
    PlayerIdentity(PlayerIdentity),
    /// Player grouping state, bound to an identity.
    PlayerState(PlayerState),
    /// Frequent player update.
    PlayerFrame(PlayerFrame),
    /// Liveness probe; carries nothing.
    Keepalive,
    /// Decoy sentinel: a plaintext HTTP probe was detected on the reliable
    /// channel. Sending it writes the canned decoy response instead of an
    /// encoded record.
    HttpProbe,
}

/// Tag identifying a record type without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// [`Record::Handshake`]
    Handshake,
    /// [`Record::HandshakeAck`]
    HandshakeAck,
    /// [`Record::PlayerIdentity`]
    PlayerIdentity,
    /// [`Record::PlayerState`]
    PlayerState,
    /// [`Record::PlayerFrame`]
    PlayerFrame,
    /// [`Record::Keepalive`]
    Keepalive,
    /// [`Record::HttpProbe`]
    HttpProbe,
}

impl Record {
    /// Extract the type tag without consuming the record.
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Handshake(_) => RecordKind::Handshake,
            Record::HandshakeAck(_) => RecordKind::HandshakeAck,
            Record::PlayerIdentity(_) => RecordKind::PlayerIdentity,
            Record::PlayerState(_) => RecordKind::PlayerState,
            Record::PlayerFrame(_) => RecordKind::PlayerFrame,
            Record::Keepalive => RecordKind::Keepalive,
            Record::HttpProbe => RecordKind::HttpProbe,
        }
    }

    /// Transport flags for this record type.
    pub fn flags(&self) -> RecordFlags {
        match self {
            Record::PlayerFrame(_) => RecordFlags::UPDATE,
            _ => RecordFlags::NONE,
        }
    }

    /// Whether this record is routed over the unreliable channel.
    pub fn is_update(&self) -> bool {
        self.flags().contains(RecordFlags::UPDATE)
    }

    /// The bound-owner ID of a structurally-bound record, if any.
    pub fn bound_player_id(&self) -> Option<PlayerId> {
        match self {
            Record::PlayerState(state) => Some(state.player_id),
            _ => None,
        }
    }

    /// Mutable bound-owner ID of a structurally-bound record, if any.
    pub fn bound_player_id_mut(&mut self) -> Option<&mut PlayerId> {
        match self {
            Record::PlayerState(state) => Some(&mut state.player_id),
            _ => None,
        }
    }

    /// The embedded player identity of a player-update record, if any.
    pub fn player_identity_mut(&mut self) -> Option<&mut PlayerIdentity> {
        match self {
            Record::PlayerFrame(frame) => Some(&mut frame.player),
            _ => None,
        }
    }

    /// Whether this record carries the player-update capability.
    pub fn is_player_update(&self) -> bool {
        matches!(self, Record::PlayerFrame(_))
    }

    /// `(owner, sequence)` of an order-tracked update record, if any.
    pub fn update_sequence(&self) -> Option<(PlayerId, u32)> {
        match self {
            Record::PlayerFrame(frame) => Some((frame.player.id, frame.sequence)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
