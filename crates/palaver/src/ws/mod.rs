//! Real-time messaging hub.
//!
//! One WebSocket per client, topic rooms per channel/guild/user, and a
//! publish/subscribe broker carrying every event so members connected to
//! other instances of the service see the same fan-out.
//!
//! ```text
//! client ──► read loop ──► dispatch ──► hub / room ──► broker publish
//!                                                         │
//!            write loop ◄── outbound queue ◄── room ◄── subscription
//! ```
//!
//! All mutable registries (the hub's connection and room sets, each room's
//! member set) are owned by a single task and changed only through its
//! command channel. Local delivery always takes the broker round-trip, so
//! one instance and many instances behave identically.

mod broker;
mod connection;
mod handler;
mod hub;
mod room;
mod types;

pub use broker::{Broker, InProcessBroker, Subscription};
pub use connection::{ConnectionHandle, ConnectionId};
pub use handler::ws_handler;
pub use hub::HubHandle;
pub use room::RoomHandle;
pub use types::{EventKind, InboundMessage, OutboundMessage};
