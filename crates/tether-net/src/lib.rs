//! Dual-transport networking for the Tether relay: records, framing, rate
//! heuristics, send queues, connections, and the sender worker role.

pub mod codec;
pub mod connection;
pub mod frame;
pub mod listener;
pub mod queue;
pub mod rate;
pub mod record;
pub mod sender;

pub use codec::{CodecContext, CodecError, PostcardCodec, RecordCodec};
pub use connection::{
    ConnectionError, ConnectionId, ConnectionParams, DualConnection, IdGenerator, NetSettings,
    RecordHandler, SharedTickRate, UplinkLimits,
};
pub use frame::{FrameConfig, FrameError};
pub use listener::{ListenerConfig, RelayListener};
pub use queue::{ChannelKind, FlushRequest, FlushScheduler, SendQueue};
pub use rate::{RateHeuristic, RateMetrics, RatePair};
pub use record::{
    Handshake, HandshakeAck, PROTOCOL_VERSION, PlayerFrame, PlayerId, PlayerIdentity, PlayerState,
    Record, RecordFlags, RecordKind,
};
pub use sender::SenderRole;
