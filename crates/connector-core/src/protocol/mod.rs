//! Connector wire protocol.
//!
//! - `envelope`: the `{event, data}` JSON envelope
//! - `messages`: typed payloads (`master-claim`, `id`, `redir`, `sync`, `error`)
//! - `schema`: per-state schema sets and validation
//!
//! The `refresh` payload is the registry's [`Topology`](crate::Topology).

pub mod envelope;
pub mod messages;
pub mod schema;

pub use envelope::Envelope;
pub use messages::{ErrorReply, Identity, LinkUsage, MasterClaim, SyncReport, Target};
pub use schema::{Event, Message, Schema};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A typed payload bound to one protocol event.
pub trait Payload: Serialize + DeserializeOwned {
    const EVENT: Event;
}
