//! Per-state schema sets.
//!
//! Each connector state understands a fixed set of protocol events. An
//! envelope whose event is in the set is decoded into a typed [`Message`];
//! a bad payload is `BADATTR`. Events outside the set are not protocol
//! traffic for that state and are handed to the application instead.

use super::{Envelope, ErrorReply, Identity, MasterClaim, SyncReport, Target};
use crate::error::ProtocolError;
use crate::registry::Topology;
use serde::de::DeserializeOwned;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Protocol event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    MasterClaim,
    Id,
    Redir,
    Refresh,
    Sync,
    Error,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::MasterClaim => "master-claim",
            Event::Id => "id",
            Event::Redir => "redir",
            Event::Refresh => "refresh",
            Event::Sync => "sync",
            Event::Error => "error",
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Event {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "master-claim" => Event::MasterClaim,
            "id" => Event::Id,
            "redir" => Event::Redir,
            "refresh" => Event::Refresh,
            "sync" => Event::Sync,
            "error" => Event::Error,
            other => return Err(ProtocolError::bad_msg(format!("Invalid message: {}", other))),
        })
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    MasterClaim(MasterClaim),
    Id(Identity),
    Redir(Target),
    Refresh(Topology),
    Sync(SyncReport),
    Error(ErrorReply),
}

/// The set of events a state understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schema {
    name: &'static str,
    events: &'static [Event],
}

impl Schema {
    /// UDP traffic.
    pub const ANNOUNCE: Schema = Schema::new("announce", &[Event::MasterClaim]);
    /// First frame of an accepted link.
    pub const ID: Schema = Schema::new("id", &[Event::Id]);
    /// Links held by a master or a node announcing itself.
    pub const LEADER: Schema = Schema::new("leader", &[Event::Sync]);
    /// The link of a node connecting to a master, and stray links it receives.
    pub const CONNECT: Schema = Schema::new(
        "connect",
        &[Event::Redir, Event::Refresh, Event::Sync, Event::Error],
    );
    /// The membership link of a member.
    pub const MEMBER: Schema = Schema::new("member", &[Event::Redir, Event::Refresh]);
    /// States with no protocol traffic.
    pub const NONE: Schema = Schema::new("none", &[]);

    const fn new(name: &'static str, events: &'static [Event]) -> Self {
        Self { name, events }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lookup(&self, event: &str) -> Option<Event> {
        self.events.iter().copied().find(|e| e.as_str() == event)
    }

    /// Whether `event` is protocol traffic for this schema.
    pub fn accepts(&self, event: &str) -> bool {
        self.lookup(event).is_some()
    }

    /// Decode an envelope. Unknown events are `BADMSG`, bad payloads `BADATTR`.
    pub fn parse(&self, envelope: &Envelope) -> Result<Message, ProtocolError> {
        let event = self.lookup(&envelope.event).ok_or_else(|| {
            ProtocolError::bad_msg(format!("Invalid message: {}", envelope.event))
        })?;

        Ok(match event {
            Event::MasterClaim => Message::MasterClaim(payload(envelope)?),
            Event::Id => Message::Id(payload(envelope)?),
            Event::Redir => Message::Redir(payload(envelope)?),
            Event::Refresh => Message::Refresh(payload(envelope)?),
            Event::Sync => Message::Sync(payload(envelope)?),
            Event::Error => Message::Error(payload(envelope)?),
        })
    }

    /// Decode raw bytes against this schema.
    pub fn decode(&self, data: &[u8]) -> Result<Message, ProtocolError> {
        self.parse(&Envelope::decode(data)?)
    }
}

fn payload<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, ProtocolError> {
    T::deserialize(&envelope.data)
        .map_err(|e| ProtocolError::bad_attr(format!("Invalid {} attributes: {}", envelope.event, e)))
}
