//! Typed payloads of the connector protocol.

use super::{Event, Payload};
use crate::error::ErrorCode;
use crate::registry::Topology;
use crate::{NodeId, NodeStates, Score};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, SocketAddr};

/// What a link is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkUsage {
    /// Election link between a member and its master
    Membership,
    /// Peer to peer application traffic
    Communicate,
}

impl Display for LinkUsage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LinkUsage::Membership => f.write_str("membership"),
            LinkUsage::Communicate => f.write_str("communicate"),
        }
    }
}

/// UDP master claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterClaim {
    pub id: NodeId,
    pub cluster: String,
    pub address: IpAddr,
    pub port: u16,
    pub score: Score,
}

impl MasterClaim {
    pub fn target(&self) -> Target {
        Target {
            id: self.id.clone(),
            address: self.address,
            port: self.port,
        }
    }
}

/// First message on every link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: NodeId,
    pub cluster: String,
    pub address: IpAddr,
    pub port: u16,
    pub usage: LinkUsage,
}

/// A master candidate; the `redir` payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub id: NodeId,
    pub address: IpAddr,
    pub port: u16,
}

impl Target {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.socket_addr())
    }
}

/// Member heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub id: NodeId,
    /// Registry revision the member currently holds
    pub revision: u64,
    #[serde(default)]
    pub states: NodeStates,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: ErrorCode,
    #[serde(default)]
    pub message: String,
}

impl Payload for MasterClaim {
    const EVENT: Event = Event::MasterClaim;
}

impl Payload for Identity {
    const EVENT: Event = Event::Id;
}

impl Payload for Target {
    const EVENT: Event = Event::Redir;
}

impl Payload for Topology {
    const EVENT: Event = Event::Refresh;
}

impl Payload for SyncReport {
    const EVENT: Event = Event::Sync;
}

impl Payload for ErrorReply {
    const EVENT: Event = Event::Error;
}
