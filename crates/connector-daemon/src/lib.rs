//! connector-daemon: runs a cluster connector on real sockets.
//!
//! - [`announcer`]: UDP master claims (unicast, multicast, broadcast or relay)
//! - [`link`]: WebSocket links with inactivity timeouts and redial
//! - [`runtime`]: the tokio task driving a `connector_core::Connector`
//! - [`config`]: the JSON configuration file

pub mod announcer;
pub mod config;
pub mod link;
pub mod runtime;

pub use announcer::{Announcer, BroadcastTarget, CastKind, Datagram};
pub use config::{DaemonConfig, RedialPolicy};
pub use link::{LinkEvent, LinkHandle};
pub use runtime::{ConnectorHandle, start};
