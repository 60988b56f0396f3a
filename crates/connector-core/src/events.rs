//! Inputs, actions and events exchanged between the connector and its driver.
//!
//! The connector is sans-IO. A driver (the daemon runtime, or a simulated
//! network in tests) feeds it [`Input`]s and performs the [`Action`]s it
//! queues, in order. [`ConnectorEvent`]s are the application-facing subset
//! of actions.

use crate::pool::LinkId;
use crate::protocol::{Envelope, LinkUsage};
use crate::states::StateTag;
use crate::timer::TimerToken;
use crate::{Node, NodeId};
use serde::Serialize;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Something that happened outside the connector.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// A UDP datagram not sent by this node
    Datagram { data: Vec<u8>, from: SocketAddr },
    /// A frame received on a link
    LinkMessage { link: LinkId, data: Vec<u8> },
    /// A link closed on its own (not after a `Disconnect` action)
    LinkClosed { link: LinkId },
    /// A scheduled timer fired
    Timer(TimerToken),
}

/// How to transparently re-open a communicate link that dropped with
/// unsent frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redial {
    pub address: IpAddr,
    pub port: u16,
    /// The `id` frame to send first on the new transport
    pub hello: Vec<u8>,
}

/// Something the driver must do.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send a datagram, to `target` or to the broadcast target when `None`
    Announce {
        data: Vec<u8>,
        target: Option<SocketAddr>,
    },
    /// Open an outbound link and send `hello` as its first frame
    Connect {
        link: LinkId,
        address: IpAddr,
        port: u16,
        usage: LinkUsage,
        timeout: Duration,
        hello: Vec<u8>,
        redial: Option<Redial>,
    },
    /// An accepted link identified itself; apply its usage timeout
    Promote {
        link: LinkId,
        usage: LinkUsage,
        timeout: Duration,
        redial: Option<Redial>,
    },
    Send { link: LinkId, data: Vec<u8> },
    /// Close the link after flushing what was sent before. The connector
    /// has already forgotten it; no `LinkClosed` is expected back.
    Disconnect { link: LinkId },
    Schedule { token: TimerToken, after: Duration },
    Cancel { token: TimerToken },
    Emit(ConnectorEvent),
}

/// Application-facing notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    StateChanged {
        from: StateTag,
        to: StateTag,
        master: Option<NodeId>,
    },
    /// The node registry changed
    NodesUpdated { revision: u64 },
    /// Application traffic received from a peer
    Message { src: NodeId, origin: Envelope },
}

/// Where an application message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Every known peer
    All,
    /// Whoever is master at send time
    Master,
    Node(NodeId),
    Nodes(Vec<NodeId>),
}

impl From<NodeId> for Destination {
    fn from(id: NodeId) -> Self {
        Destination::Node(id)
    }
}

impl From<Vec<NodeId>> for Destination {
    fn from(ids: Vec<NodeId>) -> Self {
        Destination::Nodes(ids)
    }
}

/// Point-in-time view of a connector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub state: StateTag,
    pub revision: u64,
    pub master: Option<NodeId>,
    /// Local node first
    pub nodes: Vec<Node>,
}

/// Ordered queue of pending actions.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    actions: VecDeque<Action>,
}

impl Outbox {
    pub fn push(&mut self, action: Action) {
        self.actions.push_back(action);
    }

    pub fn pop(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn send(&mut self, link: LinkId, envelope: &Envelope) {
        self.push(Action::Send {
            link,
            data: envelope.to_json(),
        });
    }

    pub fn disconnect(&mut self, link: LinkId) {
        self.push(Action::Disconnect { link });
    }

    pub fn emit(&mut self, event: ConnectorEvent) {
        self.push(Action::Emit(event));
    }
}
