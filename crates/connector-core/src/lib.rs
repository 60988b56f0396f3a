//! connector-core: master election and cluster membership.
//!
//! This crate provides, without doing any I/O itself:
//! - The five-state connector (offline, announcing, master, connecting, member)
//! - Master-claim scoring
//! - The node registry with revisioned state and master expectations
//! - The link pool and its identity handshake
//! - The JSON wire protocol and per-state schemas
//!
//! A driver feeds [`Input`]s into a [`Connector`] and performs the
//! [`Action`]s it returns.

pub mod config;
pub mod connector;
pub mod error;
pub mod events;
pub mod node;
pub mod node_id;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod score;
pub mod states;
pub mod timer;

pub use config::{ConfigError, ConnectorConfig, Endpoint, Timeouts};
pub use connector::Connector;
pub use error::{ConnectorError, ErrorCode, ProtocolError};
pub use events::{Action, ConnectorEvent, Destination, Input, Redial, Status};
pub use node::{Node, NodeStates};
pub use node_id::{NodeId, NodeIdError};
pub use pool::{LinkId, LinkPool, PoolEntry};
pub use protocol::{Envelope, LinkUsage};
pub use registry::{Expectation, NodeRegistry, Topology};
pub use score::Score;
pub use states::StateTag;
pub use timer::{Timer, TimerToken};
