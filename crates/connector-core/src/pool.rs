//! Link pool: the peer links owned by the active state, keyed by node id.
//!
//! The pool also tracks accepted links that have not identified themselves
//! yet, and creates outbound `communicate` links on demand when an
//! application message targets a peer without a link.

use crate::error::{ConnectorError, ErrorCode, ProtocolError, Result};
use crate::events::{Action, Destination, Outbox, Redial};
use crate::protocol::{Envelope, Identity, LinkUsage, Message, Schema};
use crate::registry::NodeRegistry;
use crate::NodeId;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// Connector-assigned handle of one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Display for LinkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// A link bound to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntry {
    pub id: NodeId,
    pub link: LinkId,
    pub usage: LinkUsage,
    pub address: IpAddr,
    pub port: u16,
}

impl PoolEntry {
    pub fn from_identity(link: LinkId, identity: &Identity) -> Self {
        Self {
            id: identity.id.clone(),
            link,
            usage: identity.usage,
            address: identity.address,
            port: identity.port,
        }
    }
}

/// What the pool needs to open a `communicate` link by itself.
#[derive(Debug, Clone)]
pub(crate) struct Dialer {
    pub identity: Identity,
    pub timeout: Duration,
}

impl Dialer {
    pub fn hello(&self) -> Vec<u8> {
        Envelope::of(&self.identity).to_json()
    }
}

#[derive(Debug, Default)]
pub struct LinkPool {
    next_link: u64,
    /// Accepted links waiting for their `id` frame
    pending: HashSet<LinkId>,
    entries: HashMap<NodeId, PoolEntry>,
    owners: HashMap<LinkId, NodeId>,
}

impl LinkPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh link id.
    pub fn allocate(&mut self) -> LinkId {
        self.next_link += 1;
        LinkId(self.next_link)
    }

    /// Register a freshly accepted transport.
    pub fn accept(&mut self) -> LinkId {
        let link = self.allocate();
        self.pending.insert(link);
        link
    }

    pub fn is_pending(&self, link: LinkId) -> bool {
        self.pending.contains(&link)
    }

    /// Forget a pending link (closed or timed out). Returns whether it was pending.
    pub fn drop_pending(&mut self, link: LinkId) -> bool {
        self.pending.remove(&link)
    }

    /// Validate the first frame of a pending link.
    ///
    /// The link leaves the pending set whatever the outcome; on error the
    /// caller replies with the error and disconnects.
    pub fn handshake(&mut self, link: LinkId, data: &[u8], cluster: &str) -> std::result::Result<Identity, ProtocolError> {
        self.pending.remove(&link);

        let identity = match Schema::ID.decode(data)? {
            Message::Id(identity) => identity,
            _ => return Err(ProtocolError::bad_msg("Expected id")),
        };

        if identity.cluster != cluster {
            return Err(ProtocolError::new(
                ErrorCode::BadAttr,
                format!("Cluster mismatch: {}", identity.cluster),
            ));
        }
        Ok(identity)
    }

    /// Add a link, replacing (and disconnecting) any link held for the same id.
    pub(crate) fn add(&mut self, entry: PoolEntry, out: &mut Outbox) -> Option<PoolEntry> {
        self.owners.insert(entry.link, entry.id.clone());
        let replaced = self.entries.insert(entry.id.clone(), entry);
        if let Some(old) = &replaced {
            debug!("Replacing {} for {}", old.link, old.id);
            self.owners.remove(&old.link);
            out.disconnect(old.link);
        }
        replaced
    }

    pub fn get(&self, id: &NodeId) -> Option<&PoolEntry> {
        self.entries.get(id)
    }

    pub fn owner(&self, link: LinkId) -> Option<&PoolEntry> {
        self.owners.get(&link).and_then(|id| self.entries.get(id))
    }

    /// Forget a link that closed. Returns its entry if it was pooled.
    pub fn remove_link(&mut self, link: LinkId) -> Option<PoolEntry> {
        let id = self.owners.remove(&link)?;
        self.entries.remove(&id)
    }

    /// Forget and disconnect the link of `id`.
    pub(crate) fn disconnect(&mut self, id: &NodeId, out: &mut Outbox) -> Option<PoolEntry> {
        let entry = self.entries.remove(id)?;
        self.owners.remove(&entry.link);
        out.disconnect(entry.link);
        Some(entry)
    }

    /// Disconnect every pooled link.
    pub(crate) fn clear(&mut self, out: &mut Outbox) {
        if self.entries.is_empty() {
            return;
        }
        debug!("Clearing {} link(s)", self.entries.len());
        let mut links: Vec<LinkId> = self.entries.values().map(|e| e.link).collect();
        links.sort();
        for link in links {
            out.disconnect(link);
        }
        self.entries.clear();
        self.owners.clear();
    }

    /// Number of pooled links.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Send `envelope` on every pooled link of the given usage.
    pub(crate) fn broadcast(&self, envelope: &Envelope, usage: LinkUsage, out: &mut Outbox) -> usize {
        let data = envelope.to_json();
        let mut links: Vec<LinkId> = self
            .entries
            .values()
            .filter(|e| e.usage == usage)
            .map(|e| e.link)
            .collect();
        links.sort();
        for link in &links {
            out.push(Action::Send {
                link: *link,
                data: data.clone(),
            });
        }
        links.len()
    }

    /// Send an application message.
    ///
    /// Explicit targets are all validated before anything is sent. `All`
    /// covers every registry peer and skips the master when no link to it
    /// exists. Peers without a link get a new `communicate` link, except the
    /// master: master links only come out of the election.
    pub(crate) fn send(
        &mut self,
        envelope: &Envelope,
        destination: &Destination,
        registry: &NodeRegistry,
        dialer: &Dialer,
        out: &mut Outbox,
    ) -> Result<usize> {
        let (targets, strict) = match destination {
            Destination::All => (registry.peer_ids(), false),
            Destination::Master => {
                let master = registry.master_id().ok_or(ConnectorError::NoMaster)?;
                (vec![master.clone()], true)
            }
            Destination::Node(id) => (vec![id.clone()], true),
            Destination::Nodes(ids) => {
                let mut seen = HashSet::new();
                let ids = ids.iter().filter(|id| seen.insert(*id)).cloned().collect();
                (ids, true)
            }
        };

        let mut linked = Vec::with_capacity(targets.len());
        let mut dial = Vec::new();
        for id in targets {
            if let Some(entry) = self.entries.get(&id) {
                linked.push(entry.link);
            } else if registry.master_id() == Some(&id) && id != *registry.local_id() {
                if strict {
                    return Err(ConnectorError::MasterLinkUnavailable(id));
                }
                debug!("No link to master {}, skipping", id);
            } else if let Some(node) = registry.get(&id) {
                dial.push((id, node.address, node.port));
            } else if strict {
                return Err(ConnectorError::UnknownNode(id));
            }
        }

        let hello = dialer.hello();
        for (id, address, port) in dial {
            let link = self.allocate();
            debug!("Opening {} to {} ({}:{})", link, id, address, port);
            out.push(Action::Connect {
                link,
                address,
                port,
                usage: LinkUsage::Communicate,
                timeout: dialer.timeout,
                hello: hello.clone(),
                redial: Some(Redial {
                    address,
                    port,
                    hello: hello.clone(),
                }),
            });
            self.add(
                PoolEntry {
                    id,
                    link,
                    usage: LinkUsage::Communicate,
                    address,
                    port,
                },
                out,
            );
            linked.push(link);
        }

        let data = envelope.to_json();
        for link in &linked {
            out.push(Action::Send {
                link: *link,
                data: data.clone(),
            });
        }
        Ok(linked.len())
    }
}
