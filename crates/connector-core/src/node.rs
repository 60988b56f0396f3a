//! Node: one member of the cluster as seen by the registry.

use crate::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};

/// Versioned state published by a node.
///
/// `actual` is owned by the node itself; `expect` is only ever written by the
/// master and is carried back to the node inside `refresh` snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStates {
    /// Bumped every time `actual` is replaced
    #[serde(default)]
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<Value>,
}

impl NodeStates {
    /// Copy of these states without the master-owned `expect` part.
    pub fn reported(&self) -> Self {
        Self {
            revision: self.revision,
            actual: self.actual.clone(),
            expect: None,
        }
    }
}

/// A node of the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub address: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub states: NodeStates,
    /// Liveness counter maintained by the master's retire cycle.
    /// Never leaves the process.
    #[serde(skip)]
    pub(crate) liveness: i32,
}

impl Node {
    pub fn new(id: NodeId, address: IpAddr, port: u16) -> Self {
        Self {
            id,
            address,
            port,
            states: NodeStates::default(),
            liveness: 1,
        }
    }

    pub fn with_states(mut self, states: NodeStates) -> Self {
        self.states = states;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Whether a report of (address, port, revision) differs from what this
    /// node currently holds.
    pub(crate) fn differs(&self, address: IpAddr, port: u16, revision: u64) -> bool {
        self.address != address || self.port != port || self.states.revision != revision
    }
}
