//! The connector: single dispatch point of the election state machine.
//!
//! Tracks the active state and the resources every state shares (registry,
//! link pool, timers). The caller is responsible for:
//! - Feeding every [`Input`] through `handle()` with a monotonic `now_ms`
//! - Draining `poll_action()` after each call and performing the actions
//!   in order
//! - Calling `accept()` for each inbound transport before feeding its frames

use crate::config::{ConfigError, ConnectorConfig, Endpoint};
use crate::error::{ConnectorError, Result};
use crate::events::{Action, ConnectorEvent, Destination, Input, Outbox, Status};
use crate::pool::{LinkId, LinkPool, PoolEntry};
use crate::protocol::{Envelope, Message, Schema};
use crate::registry::{Expectation, NodeRegistry};
use crate::states::{Context, State, StateTag, Transition};
use crate::timer::{Timer, Timers};
use crate::Node;
use serde_json::Value;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::{debug, info, warn};

pub struct Connector {
    ctx: Context,
    state: State,
    configured: bool,
}

impl Connector {
    /// Create an offline connector.
    pub fn new(config: ConnectorConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let local = Node::new(config.id.clone(), IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        Ok(Self {
            ctx: Context {
                config,
                registry: NodeRegistry::new(local),
                pool: LinkPool::new(),
                timers: Timers::new(),
                out: Outbox::default(),
                now_ms: 0,
            },
            state: State::Offline,
            configured: false,
        })
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.ctx.config
    }

    pub fn state(&self) -> StateTag {
        self.state.tag()
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.ctx.registry
    }

    pub fn pool(&self) -> &LinkPool {
        &self.ctx.pool
    }

    pub fn status(&self) -> Status {
        Status {
            state: self.state.tag(),
            revision: self.ctx.registry.revision(),
            master: self.ctx.registry.master_id().cloned(),
            nodes: self.ctx.registry.nodes(),
        }
    }

    /// Next action for the driver.
    pub fn poll_action(&mut self) -> Option<Action> {
        self.ctx.out.pop()
    }

    /// Bind to an endpoint and (re)start the election.
    pub fn configure(&mut self, endpoint: Endpoint, now_ms: u64) {
        self.ctx.now_ms = now_ms;
        self.ctx
            .registry
            .set_local_endpoint(endpoint.address, endpoint.port);
        self.configured = true;
        self.apply(Some(Transition::Configured));
        self.flush_updates();
    }

    /// Drop every link and go offline.
    pub fn unconfigure(&mut self, now_ms: u64) {
        self.ctx.now_ms = now_ms;
        self.configured = false;
        self.apply(Some(Transition::Unconfigured));
        self.flush_updates();
    }

    /// Register an inbound transport. Its first frame must be an `id`
    /// arriving within the identity timeout.
    pub fn accept(&mut self, now_ms: u64) -> LinkId {
        self.ctx.now_ms = now_ms;
        let link = self.ctx.pool.accept();
        let timeout = self.ctx.config.timeouts.identity;
        self.ctx.schedule(Timer::Identity(link), timeout);
        link
    }

    pub fn handle(&mut self, input: Input, now_ms: u64) {
        self.ctx.now_ms = now_ms;
        let transition = match input {
            Input::Datagram { data, from } => self.on_datagram(&data, from),
            Input::LinkMessage { link, data } => self.on_link_message(link, &data),
            Input::LinkClosed { link } => self.on_link_closed(link),
            Input::Timer(token) => {
                if !self.ctx.timers.fire(token) {
                    debug!("Stale timer {:?}", token.timer);
                    None
                } else if let Timer::Identity(link) = token.timer {
                    if self.ctx.pool.drop_pending(link) {
                        warn!("{} did not identify in time", link);
                        self.ctx.out.disconnect(link);
                    }
                    None
                } else {
                    self.state.on_timer(&mut self.ctx, token.timer)
                }
            }
        };
        self.apply(transition);
        self.flush_updates();
    }

    /// Send an application message.
    ///
    /// Returns how many links the message was queued on.
    pub fn send(&mut self, message: Envelope, destination: Destination) -> Result<usize> {
        if !self.configured {
            return Err(ConnectorError::NotConfigured);
        }
        let dialer = self.ctx.dialer();
        self.ctx.pool.send(
            &message,
            &destination,
            &self.ctx.registry,
            &dialer,
            &mut self.ctx.out,
        )
    }

    /// Publish new local state. Returns the local state revision.
    pub fn update_local_states(&mut self, actual: Value) -> u64 {
        let revision = self.ctx.registry.update_local_states(actual);
        if self.state.is_leader() {
            self.ctx.registry.master_updated();
        }
        self.flush_updates();
        revision
    }

    /// Replace the expectation table (master only).
    pub fn set_expectations(&mut self, expectations: HashMap<String, Expectation>) -> Result<()> {
        if !self.state.is_leader() {
            return Err(ConnectorError::NotMaster);
        }
        self.ctx.registry.set_expectations(expectations);
        self.flush_updates();
        Ok(())
    }

    fn on_datagram(&mut self, data: &[u8], from: SocketAddr) -> Option<Transition> {
        match Schema::ANNOUNCE.decode(data) {
            Ok(Message::MasterClaim(claim)) => self.state.on_announce(&mut self.ctx, claim, from),
            Ok(_) => None,
            Err(err) => {
                debug!("Dropping datagram from {}: {}", from, err);
                None
            }
        }
    }

    fn on_link_message(&mut self, link: LinkId, data: &[u8]) -> Option<Transition> {
        if self.ctx.pool.is_pending(link) {
            self.ctx.cancel(Timer::Identity(link));
            let cluster = self.ctx.config.cluster.clone();
            match self.ctx.pool.handshake(link, data, &cluster) {
                Ok(identity) => {
                    debug!("{} identified as {} ({})", link, identity.id, identity.usage);
                    if let Err(err) = self.state.on_connection(&mut self.ctx, link, &identity) {
                        info!("Rejecting {} from {}: {}", identity.usage, identity.id, err);
                        self.ctx.reject(link, &err);
                    }
                }
                Err(err) => {
                    info!("Handshake on {} failed: {}", link, err);
                    self.ctx.reject(link, &err);
                }
            }
            return None;
        }

        if let Some(entry) = self.ctx.pool.owner(link).cloned() {
            return self.on_pooled_message(&entry, data);
        }

        self.state.on_private_message(&mut self.ctx, link, data)
    }

    fn on_pooled_message(&mut self, entry: &PoolEntry, data: &[u8]) -> Option<Transition> {
        let envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("Malformed frame from {}: {}", entry.id, err);
                self.ctx.reply_error(entry.link, &err);
                return None;
            }
        };

        let schema = self.state.schema();
        if !schema.accepts(&envelope.event) {
            self.ctx.out.emit(ConnectorEvent::Message {
                src: entry.id.clone(),
                origin: envelope,
            });
            return None;
        }

        match schema.parse(&envelope) {
            Ok(message) => self.state.on_message(&mut self.ctx, entry, message),
            Err(err) => {
                warn!("Invalid {} from {} in {}: {}", envelope.event, entry.id, schema.name(), err);
                self.ctx.reply_error(entry.link, &err);
                None
            }
        }
    }

    fn on_link_closed(&mut self, link: LinkId) -> Option<Transition> {
        if self.ctx.pool.drop_pending(link) {
            self.ctx.cancel(Timer::Identity(link));
            return None;
        }
        if let Some(entry) = self.ctx.pool.remove_link(link) {
            debug!("{} to {} closed", link, entry.id);
            return self.state.on_disconnect(&mut self.ctx, &entry);
        }
        self.state.on_private_closed(link)
    }

    /// Run a transition and whatever the entered states ask for next.
    fn apply(&mut self, mut transition: Option<Transition>) {
        while let Some(next) = transition.take() {
            let from = self.state.tag();
            let event = next.event();
            let Some(mut state) = State::resolve(from, next.clone(), self.ctx.now_ms) else {
                debug!("Ignoring {} while {}", event, from);
                return;
            };

            self.state.leave(&mut self.ctx, &next);
            info!("{} -> {} ({})", from, state.tag(), event);
            transition = state.enter(&mut self.ctx);
            self.state = state;
            self.ctx.out.emit(ConnectorEvent::StateChanged {
                from,
                to: self.state.tag(),
                master: self.ctx.registry.master_id().cloned(),
            });
        }
    }

    /// Announce registry changes, once per batch.
    fn flush_updates(&mut self) {
        while let Some(revision) = self.ctx.registry.take_update() {
            self.ctx.out.emit(ConnectorEvent::NodesUpdated { revision });
            self.state.on_nodes_updated(&mut self.ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;
    use crate::error::ErrorCode;
    use crate::protocol::{Identity, LinkUsage, MasterClaim};
    use crate::registry::Topology;
    use crate::timer::TimerToken;
    use crate::{NodeId, Score};
    use serde_json::json;
    use std::time::Duration;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn connector(name: &str) -> Connector {
        let config = ConnectorConfig::new(id(name), "test")
            .with_timeouts(Timeouts {
                identity: Duration::from_millis(100),
                communicate: Duration::from_millis(600),
                membership: Duration::from_millis(300),
            })
            .with_announce_intervals(vec![
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(200),
            ]);
        Connector::new(config).unwrap()
    }

    fn drain(c: &mut Connector) -> Vec<Action> {
        std::iter::from_fn(|| c.poll_action()).collect()
    }

    fn scheduled(actions: &[Action], timer: Timer) -> Option<TimerToken> {
        actions.iter().rev().find_map(|a| match a {
            Action::Schedule { token, .. } if token.timer == timer => Some(*token),
            _ => None,
        })
    }

    fn hello(name: &str, cluster: &str, port: u16, usage: LinkUsage) -> Vec<u8> {
        Envelope::of(&Identity {
            id: id(name),
            cluster: cluster.into(),
            address: IP,
            port,
            usage,
        })
        .to_json()
    }

    fn claim(name: &str, cluster: &str, port: u16, score: [i64; 4]) -> Vec<u8> {
        Envelope::of(&MasterClaim {
            id: id(name),
            cluster: cluster.into(),
            address: IP,
            port,
            score: Score(score),
        })
        .to_json()
    }

    fn sent_errors(actions: &[Action]) -> Vec<ErrorCode> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send { data, .. } => {
                    let env = Envelope::decode(data).ok()?;
                    (env.event == "error")
                        .then(|| serde_json::from_value(env.data["code"].clone()).ok())
                        .flatten()
                }
                _ => None,
            })
            .collect()
    }

    fn sent_events(actions: &[Action], link: LinkId) -> Vec<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send { link: l, data } if *l == link => {
                    Envelope::decode(data).ok().map(|e| e.event)
                }
                _ => None,
            })
            .collect()
    }

    /// Drive `name` (port 7001) into Member of "m" (port 7000), with "b" known.
    fn member(name: &str) -> (Connector, LinkId) {
        let mut c = connector(name);
        c.configure(Endpoint::new(IP, 7001), 0);
        drain(&mut c);

        let from = SocketAddr::new(IP, 7000);
        c.handle(
            Input::Datagram {
                data: claim("m", "test", 7000, [5, 0, 0, 7000]),
                from,
            },
            10,
        );
        let actions = drain(&mut c);
        let link = actions
            .iter()
            .find_map(|a| match a {
                Action::Connect { link, .. } => Some(*link),
                _ => None,
            })
            .unwrap();

        let topology = Topology {
            master: id("m"),
            revision: 7,
            nodes: vec![
                Node::new(id("m"), IP, 7000),
                Node::new(id(name), IP, 7001),
                Node::new(id("b"), IP, 7002),
            ],
        };
        c.handle(
            Input::LinkMessage {
                link,
                data: Envelope::of(&topology).to_json(),
            },
            12,
        );
        (c, link)
    }

    // ==================== Offline ====================

    #[test]
    fn test_offline_rejects_connections() {
        let mut c = connector("a");
        let link = c.accept(0);
        c.handle(
            Input::LinkMessage {
                link,
                data: hello("b", "test", 7000, LinkUsage::Membership),
            },
            1,
        );
        let actions = drain(&mut c);
        assert_eq!(sent_errors(&actions), vec![ErrorCode::NoSvc]);
        assert_eq!(actions.last(), Some(&Action::Disconnect { link }));
    }

    #[test]
    fn test_offline_ignores_claims() {
        let mut c = connector("a");
        c.handle(
            Input::Datagram {
                data: claim("b", "test", 7000, [9, 9, 9, 9]),
                from: SocketAddr::new(IP, 7000),
            },
            1,
        );
        assert_eq!(c.state(), StateTag::Offline);
        assert!(drain(&mut c).is_empty());
    }

    #[test]
    fn test_send_requires_configuration() {
        let mut c = connector("a");
        let err = c
            .send(Envelope::new("x", json!(1)), Destination::All)
            .unwrap_err();
        assert_eq!(err, ConnectorError::NotConfigured);
    }

    // ==================== Handshake ====================

    #[test]
    fn test_identity_timeout_drops_link() {
        let mut c = connector("a");
        c.configure(Endpoint::new(IP, 7000), 0);
        drain(&mut c);

        let link = c.accept(5);
        let token = scheduled(&drain(&mut c), Timer::Identity(link)).unwrap();
        c.handle(Input::Timer(token), 105);
        assert_eq!(drain(&mut c), vec![Action::Disconnect { link }]);

        // A late frame is not treated as a handshake
        c.handle(
            Input::LinkMessage {
                link,
                data: hello("b", "test", 7001, LinkUsage::Membership),
            },
            106,
        );
        assert!(!c.registry().contains(&id("b")));
    }

    #[test]
    fn test_handshake_cluster_mismatch() {
        let mut c = connector("a");
        c.configure(Endpoint::new(IP, 7000), 0);
        drain(&mut c);

        let link = c.accept(1);
        c.handle(
            Input::LinkMessage {
                link,
                data: hello("b", "elsewhere", 7001, LinkUsage::Membership),
            },
            2,
        );
        let actions = drain(&mut c);
        assert_eq!(sent_errors(&actions), vec![ErrorCode::BadAttr]);
        assert_eq!(actions.last(), Some(&Action::Disconnect { link }));
        assert_eq!(c.pool().count(), 0);
    }

    #[test]
    fn test_handshake_requires_id_first() {
        let mut c = connector("a");
        c.configure(Endpoint::new(IP, 7000), 0);
        drain(&mut c);

        let link = c.accept(1);
        c.handle(
            Input::LinkMessage {
                link,
                data: Envelope::new("test", json!({})).to_json(),
            },
            2,
        );
        assert_eq!(sent_errors(&drain(&mut c)), vec![ErrorCode::BadMsg]);
    }

    // ==================== Announcing ====================

    #[test]
    fn test_announcing_becomes_master_after_schedule() {
        let mut c = connector("a");
        c.configure(Endpoint::new(IP, 7000), 0);
        assert_eq!(c.state(), StateTag::Announcing);
        assert_eq!(c.registry().master_id(), Some(&id("a")));

        let mut now = 0;
        let mut claims = 0;
        let mut fires = 0;
        while c.state() == StateTag::Announcing {
            let actions = drain(&mut c);
            claims += actions
                .iter()
                .filter(|a| matches!(a, Action::Announce { target: None, .. }))
                .count();
            let token = scheduled(&actions, Timer::Announce).unwrap();
            now += 100;
            fires += 1;
            c.handle(Input::Timer(token), now);
        }

        assert_eq!(c.state(), StateTag::Master);
        assert_eq!(claims, 3);
        assert_eq!(fires, 3);
        let actions = drain(&mut c);
        assert!(scheduled(&actions, Timer::Retire).is_some());
        assert!(scheduled(&actions, Timer::Announce).is_some());
    }

    #[test]
    fn test_weaker_claim_gets_unicast_reply() {
        let mut c = connector("a");
        c.configure(Endpoint::new(IP, 7001), 0);
        drain(&mut c);

        let from = SocketAddr::new(IP, 7000);
        c.handle(
            Input::Datagram {
                data: claim("b", "test", 7000, [0, 0, 0x7f00_0001, 7000]),
                from,
            },
            0,
        );
        assert_eq!(c.state(), StateTag::Announcing);
        let actions = drain(&mut c);
        assert!(
            actions
                .iter()
                .any(|a| matches!(a, Action::Announce { target: Some(t), .. } if *t == from))
        );
    }

    #[test]
    fn test_stronger_claim_triggers_connect() {
        let mut c = connector("a");
        c.configure(Endpoint::new(IP, 7001), 0);
        drain(&mut c);

        c.handle(
            Input::Datagram {
                data: claim("b", "test", 7000, [1, 0, 0, 7000]),
                from: SocketAddr::new(IP, 7000),
            },
            50,
        );
        assert_eq!(c.state(), StateTag::Connecting);
        let actions = drain(&mut c);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Connect { usage: LinkUsage::Membership, port: 7000, .. }
        )));
        assert!(actions.iter().any(|a| matches!(a, Action::Cancel { .. })));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Emit(ConnectorEvent::StateChanged {
                from: StateTag::Announcing,
                to: StateTag::Connecting,
                ..
            })
        )));
    }

    #[test]
    fn test_claims_from_other_clusters_or_self_are_ignored() {
        let mut c = connector("a");
        c.configure(Endpoint::new(IP, 7001), 0);
        drain(&mut c);

        for data in [
            claim("b", "other", 7000, [9, 9, 9, 9]),
            claim("a", "test", 7000, [9, 9, 9, 9]),
        ] {
            c.handle(
                Input::Datagram {
                    data,
                    from: SocketAddr::new(IP, 7000),
                },
                5,
            );
        }
        assert_eq!(c.state(), StateTag::Announcing);
        assert!(drain(&mut c).is_empty());
    }

    #[test]
    fn test_announcing_rejects_communicate() {
        let mut c = connector("a");
        c.configure(Endpoint::new(IP, 7000), 0);
        drain(&mut c);

        let link = c.accept(1);
        c.handle(
            Input::LinkMessage {
                link,
                data: hello("b", "test", 7001, LinkUsage::Communicate),
            },
            2,
        );
        assert_eq!(sent_errors(&drain(&mut c)), vec![ErrorCode::BadUsage]);
    }

    #[test]
    fn test_leader_rejects_its_own_id() {
        let mut c = connector("a");
        c.configure(Endpoint::new(IP, 7000), 0);
        drain(&mut c);

        let link = c.accept(1);
        c.handle(
            Input::LinkMessage {
                link,
                data: hello("a", "test", 7001, LinkUsage::Membership),
            },
            2,
        );
        let actions = drain(&mut c);
        assert_eq!(sent_errors(&actions), vec![ErrorCode::BadId]);
        assert_eq!(actions.last(), Some(&Action::Disconnect { link }));
        assert!(c.pool().get(&id("a")).is_none());
    }

    // ==================== Leader ====================

    #[test]
    fn test_leader_admits_member_and_publishes() {
        let mut c = connector("a");
        c.configure(Endpoint::new(IP, 7000), 0);
        drain(&mut c);

        let link = c.accept(1);
        c.handle(
            Input::LinkMessage {
                link,
                data: hello("b", "test", 7001, LinkUsage::Membership),
            },
            2,
        );
        let actions = drain(&mut c);
        assert!(c.registry().contains(&id("b")));
        assert_eq!(c.pool().get(&id("b")).unwrap().link, link);
        assert_eq!(sent_events(&actions, link), vec!["refresh"]);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Promote { usage: LinkUsage::Membership, .. }
        )));
        assert!(
            actions
                .iter()
                .any(|a| matches!(a, Action::Emit(ConnectorEvent::NodesUpdated { .. })))
        );
    }

    #[test]
    fn test_leader_answers_lagging_sync() {
        let mut c = connector("a");
        c.configure(Endpoint::new(IP, 7000), 0);
        let link = c.accept(1);
        c.handle(
            Input::LinkMessage {
                link,
                data: hello("b", "test", 7001, LinkUsage::Membership),
            },
            2,
        );
        drain(&mut c);

        let current = c.registry().revision();
        let sync = |revision: u64| {
            Envelope::new(
                "sync",
                json!({"id": "b", "revision": revision, "states": {"revision": 0}}),
            )
            .to_json()
        };

        c.handle(Input::LinkMessage { link, data: sync(current) }, 3);
        assert!(sent_events(&drain(&mut c), link).is_empty());

        c.handle(Input::LinkMessage { link, data: sync(0) }, 4);
        assert_eq!(sent_events(&drain(&mut c), link), vec!["refresh"]);
    }

    #[test]
    fn test_leader_removes_member_when_link_closes() {
        let mut c = connector("a");
        c.configure(Endpoint::new(IP, 7000), 0);
        let link = c.accept(1);
        c.handle(
            Input::LinkMessage {
                link,
                data: hello("b", "test", 7001, LinkUsage::Membership),
            },
            2,
        );
        drain(&mut c);

        c.handle(Input::LinkClosed { link }, 3);
        assert!(!c.registry().contains(&id("b")));
        assert_eq!(c.pool().count(), 0);
    }

    #[test]
    fn test_leader_yields_and_redirects_members() {
        let mut c = connector("a");
        c.configure(Endpoint::new(IP, 7000), 0);
        let link = c.accept(1);
        c.handle(
            Input::LinkMessage {
                link,
                data: hello("b", "test", 7001, LinkUsage::Membership),
            },
            2,
        );
        drain(&mut c);

        c.handle(
            Input::Datagram {
                data: claim("z", "test", 7009, [10, 0, 0, 7009]),
                from: SocketAddr::new(IP, 7009),
            },
            3,
        );
        assert_eq!(c.state(), StateTag::Connecting);
        let actions = drain(&mut c);
        assert_eq!(sent_events(&actions, link), vec!["redir"]);
        let redir_at = actions
            .iter()
            .position(|a| matches!(a, Action::Send { link: l, .. } if *l == link))
            .unwrap();
        let disconnect_at = actions
            .iter()
            .position(|a| *a == Action::Disconnect { link })
            .unwrap();
        assert!(redir_at < disconnect_at);
    }

    #[test]
    fn test_set_expectations_requires_leader() {
        let mut c = connector("a");
        assert_eq!(
            c.set_expectations(HashMap::new()),
            Err(ConnectorError::NotMaster)
        );
        c.configure(Endpoint::new(IP, 7000), 0);
        let revision = c.registry().revision();
        c.set_expectations(HashMap::new()).unwrap();
        assert_eq!(c.registry().revision(), revision + 1);
    }

    // ==================== Connecting / Member ====================

    #[test]
    fn test_join_flow() {
        let (mut c, link) = member("x");
        assert_eq!(c.state(), StateTag::Member);
        assert_eq!(c.registry().master_id(), Some(&id("m")));
        assert_eq!(c.registry().revision(), 7);
        assert_eq!(c.pool().get(&id("m")).unwrap().link, link);

        let actions = drain(&mut c);
        assert_eq!(sent_events(&actions, link), vec!["sync"]);
        assert!(scheduled(&actions, Timer::Heartbeat).is_some());

        let status = c.status();
        assert_eq!(status.state, StateTag::Member);
        assert_eq!(status.master, Some(id("m")));
        assert_eq!(status.nodes.len(), 3);
        assert_eq!(status.nodes[0].id, id("x"));
    }

    #[test]
    fn test_connecting_follows_redirect() {
        let mut c = connector("x");
        c.configure(Endpoint::new(IP, 7001), 0);
        c.handle(
            Input::Datagram {
                data: claim("m", "test", 7000, [5, 0, 0, 7000]),
                from: SocketAddr::new(IP, 7000),
            },
            1,
        );
        let link = drain(&mut c)
            .iter()
            .find_map(|a| match a {
                Action::Connect { link, .. } => Some(*link),
                _ => None,
            })
            .unwrap();

        let redir = Envelope::new("redir", json!({"id": "n", "address": "127.0.0.1", "port": 7005}));
        c.handle(
            Input::LinkMessage {
                link,
                data: redir.to_json(),
            },
            2,
        );
        let actions = drain(&mut c);
        assert_eq!(actions[0], Action::Disconnect { link });
        assert!(matches!(actions[1], Action::Connect { port: 7005, .. }));
        assert_eq!(c.state(), StateTag::Connecting);
    }

    #[test]
    fn test_connecting_fails_on_redirect_to_self() {
        let mut c = connector("x");
        c.configure(Endpoint::new(IP, 7001), 0);
        c.handle(
            Input::Datagram {
                data: claim("m", "test", 7000, [5, 0, 0, 7000]),
                from: SocketAddr::new(IP, 7000),
            },
            1,
        );
        let link = drain(&mut c)
            .iter()
            .find_map(|a| match a {
                Action::Connect { link, .. } => Some(*link),
                _ => None,
            })
            .unwrap();

        let redir = Envelope::new("redir", json!({"id": "x", "address": "127.0.0.1", "port": 7001}));
        c.handle(
            Input::LinkMessage {
                link,
                data: redir.to_json(),
            },
            2,
        );
        assert_eq!(c.state(), StateTag::Announcing);
    }

    #[test]
    fn test_connecting_fails_when_link_closes() {
        let mut c = connector("x");
        c.configure(Endpoint::new(IP, 7001), 0);
        c.handle(
            Input::Datagram {
                data: claim("m", "test", 7000, [5, 0, 0, 7000]),
                from: SocketAddr::new(IP, 7000),
            },
            1,
        );
        let link = drain(&mut c)
            .iter()
            .find_map(|a| match a {
                Action::Connect { link, .. } => Some(*link),
                _ => None,
            })
            .unwrap();

        c.handle(Input::LinkClosed { link }, 2);
        assert_eq!(c.state(), StateTag::Announcing);
    }

    #[test]
    fn test_connecting_bounces_joiners_to_candidate() {
        let mut c = connector("x");
        c.configure(Endpoint::new(IP, 7001), 0);
        c.handle(
            Input::Datagram {
                data: claim("m", "test", 7000, [5, 0, 0, 7000]),
                from: SocketAddr::new(IP, 7000),
            },
            1,
        );
        drain(&mut c);

        let link = c.accept(2);
        c.handle(
            Input::LinkMessage {
                link,
                data: hello("y", "test", 7003, LinkUsage::Membership),
            },
            3,
        );
        let actions = drain(&mut c);
        assert_eq!(sent_events(&actions, link), vec!["redir"]);
        assert_eq!(actions.last(), Some(&Action::Disconnect { link }));
        assert_eq!(c.pool().count(), 0);
        assert_eq!(c.state(), StateTag::Connecting);
    }

    #[test]
    fn test_failed_connect_drops_peer_links() {
        let (mut c, link) = member("x");
        drain(&mut c);
        c.handle(Input::LinkClosed { link }, 20);
        let candidate = drain(&mut c)
            .iter()
            .find_map(|a| match a {
                Action::Connect { link, port: 7000, .. } => Some(*link),
                _ => None,
            })
            .unwrap();
        assert_eq!(c.state(), StateTag::Connecting);

        let sent = c.send(Envelope::new("hi", json!(1)), Destination::All).unwrap();
        assert_eq!(sent, 1);
        let peer = drain(&mut c)
            .iter()
            .find_map(|a| match a {
                Action::Connect { link, port: 7002, .. } => Some(*link),
                _ => None,
            })
            .unwrap();
        assert_eq!(c.pool().count(), 1);

        c.handle(Input::LinkClosed { link: candidate }, 21);
        assert_eq!(c.state(), StateTag::Announcing);
        assert_eq!(c.pool().count(), 0);

        let actions = drain(&mut c);
        assert!(actions.contains(&Action::Disconnect { link: peer }));
        let claim = actions
            .iter()
            .find_map(|a| match a {
                Action::Announce { data, target: None } => Schema::ANNOUNCE.decode(data).ok(),
                _ => None,
            })
            .unwrap();
        match claim {
            Message::MasterClaim(claim) => assert_eq!(claim.score.0[0], 0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_member_reconnects_when_master_link_closes() {
        let (mut c, link) = member("x");
        drain(&mut c);
        c.handle(Input::LinkClosed { link }, 20);
        assert_eq!(c.state(), StateTag::Connecting);
        assert!(
            drain(&mut c)
                .iter()
                .any(|a| matches!(a, Action::Connect { port: 7000, .. }))
        );
    }

    #[test]
    fn test_member_accepts_known_peers_once() {
        let (mut c, _) = member("x");
        drain(&mut c);

        let first = c.accept(20);
        c.handle(
            Input::LinkMessage {
                link: first,
                data: hello("b", "test", 7002, LinkUsage::Communicate),
            },
            21,
        );
        let actions = drain(&mut c);
        assert!(sent_errors(&actions).is_empty());
        assert_eq!(c.pool().get(&id("b")).unwrap().link, first);

        let cases = [
            ("b", ErrorCode::Exist),
            ("ghost", ErrorCode::BadId),
            ("m", ErrorCode::BadId),
        ];
        for (peer, code) in cases {
            let link = c.accept(22);
            c.handle(
                Input::LinkMessage {
                    link,
                    data: hello(peer, "test", 7003, LinkUsage::Communicate),
                },
                23,
            );
            let actions = drain(&mut c);
            assert_eq!(sent_errors(&actions), vec![code], "peer {}", peer);
            assert_eq!(actions.last(), Some(&Action::Disconnect { link }));
        }
    }

    #[test]
    fn test_member_bounces_membership_links_to_master() {
        let (mut c, _) = member("x");
        drain(&mut c);

        let link = c.accept(20);
        c.handle(
            Input::LinkMessage {
                link,
                data: hello("y", "test", 7003, LinkUsage::Membership),
            },
            21,
        );
        let actions = drain(&mut c);
        assert_eq!(sent_events(&actions, link), vec!["redir"]);
        assert_eq!(actions.last(), Some(&Action::Disconnect { link }));
    }

    #[test]
    fn test_unknown_events_reach_the_application() {
        let (mut c, link) = member("x");
        drain(&mut c);

        let data = Envelope::new("test", json!({"val": "hello"})).to_json();
        c.handle(Input::LinkMessage { link, data }, 20);
        let actions = drain(&mut c);
        assert_eq!(
            actions,
            vec![Action::Emit(ConnectorEvent::Message {
                src: id("m"),
                origin: Envelope::new("test", json!({"val": "hello"})),
            })]
        );
    }

    #[test]
    fn test_invalid_protocol_payload_gets_error_reply() {
        let (mut c, link) = member("x");
        drain(&mut c);

        let data = Envelope::new("redir", json!({"id": "n"})).to_json();
        c.handle(Input::LinkMessage { link, data }, 20);
        assert_eq!(sent_errors(&drain(&mut c)), vec![ErrorCode::BadAttr]);
        assert_eq!(c.state(), StateTag::Member);
    }

    #[test]
    fn test_member_sends_to_master_over_membership_link() {
        let (mut c, link) = member("x");
        drain(&mut c);

        let sent = c
            .send(Envelope::new("hi", json!(1)), Destination::Master)
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(sent_events(&drain(&mut c), link), vec!["hi"]);
    }

    #[test]
    fn test_unconfigure_goes_offline_and_clears_links() {
        let (mut c, link) = member("x");
        drain(&mut c);

        c.unconfigure(30);
        assert_eq!(c.state(), StateTag::Offline);
        assert_eq!(c.pool().count(), 0);
        let actions = drain(&mut c);
        assert!(actions.contains(&Action::Disconnect { link }));
        assert!(actions.iter().any(|a| matches!(a, Action::Cancel { .. })));
    }

    #[test]
    fn test_stale_timer_is_ignored() {
        let (mut c, _) = member("x");
        let token = scheduled(&drain(&mut c), Timer::Heartbeat).unwrap();
        c.unconfigure(30);
        drain(&mut c);

        c.handle(Input::Timer(token), 100);
        assert!(drain(&mut c).is_empty());
    }
}
