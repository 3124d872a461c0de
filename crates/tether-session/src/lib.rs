//! Session layer for the Tether relay: player sessions, the server-wide
//! registry, and the dispatcher that relays records between sessions
//! sharing a grouping context.

pub mod dispatch;
pub mod registry;
pub mod session;

pub use dispatch::RelayDispatcher;
pub use registry::{SessionRegistry, SessionSettings};
pub use session::{PlayerSession, sanitize_name};
