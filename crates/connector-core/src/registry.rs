//! Node registry: the local node, the known peers and a global revision.
//!
//! Only the master's registry is authoritative. It is mutated through
//! `refresh`, `retire`, `remove` and `set_expectations`, and published to
//! members as a [`Topology`]. Members never merge: they `reload` the whole
//! snapshot.
//!
//! Every mutation that changes observable state bumps `revision` exactly once
//! and raises a single pending update, which the connector collects with
//! [`NodeRegistry::take_update`] after each dispatch.

use crate::{Node, NodeId, NodeStates};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// One keyed expectation set by the master: a value per node id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Expectation {
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub nodes: HashMap<NodeId, Value>,
}

/// The `{revision, master, nodes[]}` snapshot carried by `refresh`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub master: NodeId,
    pub revision: u64,
    pub nodes: Vec<Node>,
}

#[derive(Debug)]
pub struct NodeRegistry {
    local: Node,
    peers: HashMap<NodeId, Node>,
    master_id: Option<NodeId>,
    revision: u64,
    expectations: HashMap<String, Expectation>,
    /// Set by every observable mutation, cleared by `take_update`
    updated: bool,
}

impl NodeRegistry {
    pub fn new(local: Node) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            master_id: None,
            revision: 0,
            expectations: HashMap::new(),
            updated: false,
        }
    }

    pub fn local(&self) -> &Node {
        &self.local
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local.id
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn master_id(&self) -> Option<&NodeId> {
        self.master_id.as_ref()
    }

    pub fn is_master(&self) -> bool {
        self.master_id.as_ref() == Some(&self.local.id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peer ids in a stable order.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn bump(&mut self) {
        self.revision += 1;
        self.updated = true;
    }

    /// Returns the new revision if anything changed since the last call.
    pub fn take_update(&mut self) -> Option<u64> {
        if std::mem::take(&mut self.updated) {
            Some(self.revision)
        } else {
            None
        }
    }

    /// Move the local node to a new endpoint (reconfigure).
    pub fn set_local_endpoint(&mut self, address: IpAddr, port: u16) {
        self.local.address = address;
        self.local.port = port;
    }

    /// Returns true if the master id changed.
    pub fn set_master_id(&mut self, id: NodeId) -> bool {
        if self.master_id.as_ref() == Some(&id) {
            return false;
        }
        info!("Master is now {}", id);
        self.master_id = Some(id);
        self.bump();
        true
    }

    /// Record a member report on the master.
    ///
    /// Creates or replaces the peer if address, port or state revision differ
    /// from what is stored, and marks it alive either way. Returns whether
    /// the registry changed.
    pub fn refresh(&mut self, id: &NodeId, address: IpAddr, port: u16, states: &NodeStates) -> bool {
        if *id == self.local.id {
            warn!("Ignoring refresh for the local node {}", id);
            return false;
        }

        if let Some(existing) = self.peers.get_mut(id)
            && !existing.differs(address, port, states.revision)
        {
            existing.liveness = 1;
            return false;
        }

        debug!("Refreshing node {} ({}:{}, states rev {})", id, address, port, states.revision);
        let node = Node::new(id.clone(), address, port).with_states(states.reported());
        self.peers.insert(id.clone(), node);
        self.bump();
        true
    }

    /// Drop a peer. Returns whether it was known.
    pub fn remove(&mut self, id: &NodeId) -> bool {
        if self.peers.remove(id).is_some() {
            info!("Node {} removed", id);
            self.bump();
            true
        } else {
            false
        }
    }

    /// Replace everything with the master's snapshot.
    ///
    /// The local entry of the snapshot only contributes its `expect` value.
    /// Always raises an update.
    pub fn reload(&mut self, topology: Topology) {
        let Topology {
            master,
            revision,
            nodes,
        } = topology;

        let mut peers = HashMap::with_capacity(nodes.len());
        let mut expect = None;
        for mut node in nodes {
            if node.id == self.local.id {
                expect = node.states.expect.take();
                continue;
            }
            node.liveness = 1;
            peers.insert(node.id.clone(), node);
        }

        debug!(
            "Reloaded {} nodes at revision {} (master {})",
            peers.len(),
            revision,
            master
        );
        self.peers = peers;
        self.master_id = Some(master);
        self.revision = revision;
        self.local.states.expect = expect;
        self.updated = true;
    }

    /// One liveness tick. Peers that missed two consecutive ticks are removed.
    pub fn retire(&mut self) -> Vec<NodeId> {
        let mut retired = Vec::new();
        for node in self.peers.values_mut() {
            node.liveness -= 1;
            if node.liveness < 0 {
                retired.push(node.id.clone());
            }
        }

        if !retired.is_empty() {
            retired.sort();
            for id in &retired {
                self.peers.remove(id);
            }
            info!("Retired {} stale node(s): {:?}", retired.len(), retired);
            self.bump();
        }
        retired
    }

    /// Replace the local `actual` state. Returns the new local revision.
    pub fn update_local_states(&mut self, actual: Value) -> u64 {
        self.local.states.actual = Some(actual);
        self.local.states.revision += 1;
        self.local.states.revision
    }

    /// Mark a change made by the master itself (its own state) as observable.
    pub fn master_updated(&mut self) {
        self.bump();
    }

    pub fn set_expectations(&mut self, expectations: HashMap<String, Expectation>) {
        self.expectations = expectations;
        self.bump();
    }

    fn expect_for(&self, id: &NodeId) -> Option<Value> {
        let mut expect = Map::new();
        for (key, expectation) in &self.expectations {
            if let Some(value) = expectation.nodes.get(id) {
                expect.insert(key.clone(), value.clone());
            }
        }
        (!expect.is_empty()).then_some(Value::Object(expect))
    }

    /// Outward snapshot published by the master: local node first, every
    /// node carrying its expectation values.
    pub fn topology(&self) -> Topology {
        let mut nodes = Vec::with_capacity(self.peers.len() + 1);

        let mut local = self.local.clone();
        local.states.expect = self.expect_for(&local.id);
        nodes.push(local);

        for id in self.peer_ids() {
            if let Some(node) = self.peers.get(&id) {
                let mut node = node.clone();
                node.states.expect = self.expect_for(&id);
                nodes.push(node);
            }
        }

        Topology {
            master: self
                .master_id
                .clone()
                .unwrap_or_else(|| self.local.id.clone()),
            revision: self.revision,
            nodes,
        }
    }

    /// Every known node as held locally, local node first.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes = Vec::with_capacity(self.peers.len() + 1);
        nodes.push(self.local.clone());
        for id in self.peer_ids() {
            if let Some(node) = self.peers.get(&id) {
                nodes.push(node.clone());
            }
        }
        nodes
    }
}
