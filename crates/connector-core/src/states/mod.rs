//! The five connector states.
//!
//! Exactly one [`State`] is active. Handlers receive the shared [`Context`]
//! and may return a [`Transition`]; the connector resolves it against the
//! transition table, calls `leave` on the old state and `enter` on a freshly
//! built new one. A state value is never touched again after `leave`.

mod announcing;
mod connecting;
mod master;
mod member;

pub(crate) use announcing::Announcing;
pub(crate) use connecting::Connecting;
pub(crate) use master::{Leader, Master};
pub(crate) use member::Member;

use crate::config::ConnectorConfig;
use crate::error::{ErrorCode, ProtocolError};
use crate::events::{Action, Outbox, Redial};
use crate::pool::{Dialer, LinkId, LinkPool, PoolEntry};
use crate::protocol::{Envelope, Identity, LinkUsage, MasterClaim, Message, Schema, Target};
use crate::registry::NodeRegistry;
use crate::timer::{Timer, Timers};
use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StateTag {
    Offline,
    Announcing,
    Master,
    Connecting,
    Member,
}

impl StateTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateTag::Offline => "offline",
            StateTag::Announcing => "announcing",
            StateTag::Master => "master",
            StateTag::Connecting => "connecting",
            StateTag::Member => "member",
        }
    }
}

impl Display for StateTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change request.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Transition {
    Configured,
    Unconfigured,
    /// Announce schedule exhausted without a stronger claim
    Ready,
    /// A master accepted us over `link`
    Joined { master: Target, link: LinkId },
    /// A stronger claim was seen
    Connect(Target),
    /// The link to the master candidate failed
    Fail,
    /// The membership link closed
    Disconnected(Target),
    /// The master sent us elsewhere
    Redirected(Target),
}

impl Transition {
    pub fn event(&self) -> &'static str {
        match self {
            Transition::Configured => "configured",
            Transition::Unconfigured => "unconfigured",
            Transition::Ready | Transition::Joined { .. } => "ready",
            Transition::Connect(_) => "connect",
            Transition::Fail => "fail",
            Transition::Disconnected(_) => "disconnected",
            Transition::Redirected(_) => "redirected",
        }
    }

    /// Whether the next state takes over the current links.
    pub fn hands_over(&self) -> bool {
        matches!(self, Transition::Ready | Transition::Joined { .. })
    }
}

/// Everything the states share. Owned by the connector.
#[derive(Debug)]
pub(crate) struct Context {
    pub config: ConnectorConfig,
    pub registry: NodeRegistry,
    pub pool: LinkPool,
    pub timers: Timers,
    pub out: Outbox,
    pub now_ms: u64,
}

impl Context {
    pub fn schedule(&mut self, timer: Timer, after: Duration) {
        let token = self.timers.arm(timer);
        self.out.push(Action::Schedule { token, after });
    }

    pub fn cancel(&mut self, timer: Timer) {
        if let Some(token) = self.timers.disarm(timer) {
            self.out.push(Action::Cancel { token });
        }
    }

    pub fn timeout(&self, usage: LinkUsage) -> Duration {
        match usage {
            LinkUsage::Membership => self.config.timeouts.membership,
            LinkUsage::Communicate => self.config.timeouts.communicate,
        }
    }

    /// The `id` message this node opens links with.
    pub fn identity(&self, usage: LinkUsage) -> Identity {
        let local = self.registry.local();
        Identity {
            id: local.id.clone(),
            cluster: self.config.cluster.clone(),
            address: local.address,
            port: local.port,
            usage,
        }
    }

    /// This node as a redirect target.
    pub fn local_target(&self) -> Target {
        let local = self.registry.local();
        Target {
            id: local.id.clone(),
            address: local.address,
            port: local.port,
        }
    }

    pub fn dialer(&self) -> Dialer {
        Dialer {
            identity: self.identity(LinkUsage::Communicate),
            timeout: self.config.timeouts.communicate,
        }
    }

    pub fn announce(&mut self, claim: &MasterClaim, target: Option<SocketAddr>) {
        self.out.push(Action::Announce {
            data: Envelope::of(claim).to_json(),
            target,
        });
    }

    /// Open the membership link toward a master candidate.
    pub fn connect(&mut self, target: &Target) -> LinkId {
        let link = self.pool.allocate();
        self.out.push(Action::Connect {
            link,
            address: target.address,
            port: target.port,
            usage: LinkUsage::Membership,
            timeout: self.config.timeouts.membership,
            hello: Envelope::of(&self.identity(LinkUsage::Membership)).to_json(),
            redial: None,
        });
        link
    }

    /// Send an `error` reply without dropping the link.
    pub fn reply_error(&mut self, link: LinkId, err: &ProtocolError) {
        self.out.send(link, &Envelope::error(err));
    }

    /// Send an `error` reply, then drop the link.
    pub fn reject(&mut self, link: LinkId, err: &ProtocolError) {
        self.reply_error(link, err);
        self.out.disconnect(link);
    }

    /// Bounce a membership link toward `target`.
    pub fn redirect(&mut self, link: LinkId, target: &Target) {
        self.out.send(link, &Envelope::of(target));
        self.out.disconnect(link);
    }

    /// Turn an identified accepted link into a pooled one.
    pub fn admit(&mut self, link: LinkId, identity: &Identity) -> PoolEntry {
        let entry = PoolEntry::from_identity(link, identity);
        let redial = (identity.usage == LinkUsage::Communicate).then(|| Redial {
            address: identity.address,
            port: identity.port,
            hello: Envelope::of(&self.identity(LinkUsage::Communicate)).to_json(),
        });
        self.out.push(Action::Promote {
            link,
            usage: identity.usage,
            timeout: self.timeout(identity.usage),
            redial,
        });
        self.pool.add(entry.clone(), &mut self.out);
        entry
    }

    /// Accept a `communicate` link from a known, not yet linked peer.
    pub fn admit_peer(&mut self, link: LinkId, identity: &Identity) -> Result<(), ProtocolError> {
        if !self.registry.contains(&identity.id) {
            return Err(ProtocolError::new(
                ErrorCode::BadId,
                format!("Unknown node: {}", identity.id),
            ));
        }
        if self.pool.get(&identity.id).is_some() {
            return Err(ProtocolError::new(
                ErrorCode::Exist,
                format!("Already linked: {}", identity.id),
            ));
        }
        self.admit(link, identity);
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) enum State {
    Offline,
    Announcing(Announcing),
    Master(Master),
    Connecting(Connecting),
    Member(Member),
}

impl State {
    pub fn tag(&self) -> StateTag {
        match self {
            State::Offline => StateTag::Offline,
            State::Announcing(_) => StateTag::Announcing,
            State::Master(_) => StateTag::Master,
            State::Connecting(_) => StateTag::Connecting,
            State::Member(_) => StateTag::Member,
        }
    }

    /// Transition table. `None` means the event is not valid in `from`.
    pub fn resolve(from: StateTag, transition: Transition, now_ms: u64) -> Option<State> {
        use StateTag as S;
        use Transition as T;

        match (from, transition) {
            (_, T::Configured) => Some(State::Announcing(Announcing::new(now_ms))),
            (S::Offline, _) => None,
            (_, T::Unconfigured) => Some(State::Offline),
            (S::Announcing, T::Ready) => Some(State::Master(Master::new(now_ms))),
            (S::Announcing | S::Master, T::Connect(target)) => {
                Some(State::Connecting(Connecting::new(target)))
            }
            (S::Connecting, T::Joined { master, link }) => {
                Some(State::Member(Member::new(master, link)))
            }
            (S::Connecting, T::Fail) => Some(State::Announcing(Announcing::new(now_ms))),
            (S::Member, T::Disconnected(target) | T::Redirected(target)) => {
                Some(State::Connecting(Connecting::new(target)))
            }
            _ => None,
        }
    }

    pub fn schema(&self) -> Schema {
        match self {
            State::Offline => Schema::NONE,
            State::Announcing(_) | State::Master(_) => Schema::LEADER,
            State::Connecting(_) => Schema::CONNECT,
            State::Member(_) => Schema::MEMBER,
        }
    }

    pub fn enter(&mut self, ctx: &mut Context) -> Option<Transition> {
        match self {
            State::Offline => None,
            State::Announcing(s) => s.enter(ctx),
            State::Master(s) => s.enter(ctx),
            State::Connecting(s) => s.enter(ctx),
            State::Member(s) => s.enter(ctx),
        }
    }

    pub fn leave(&mut self, ctx: &mut Context, transition: &Transition) {
        match self {
            State::Offline => {}
            State::Announcing(s) => s.leave(ctx, transition),
            State::Master(s) => s.leave(ctx),
            State::Connecting(s) => s.leave(ctx, transition),
            State::Member(s) => s.leave(ctx),
        }
    }

    pub fn on_announce(&mut self, ctx: &mut Context, claim: MasterClaim, from: SocketAddr) -> Option<Transition> {
        match self {
            State::Announcing(s) => s.leader.on_announce(ctx, claim, from),
            State::Master(s) => s.leader.on_announce(ctx, claim, from),
            _ => None,
        }
    }

    /// An accepted link identified itself.
    pub fn on_connection(&mut self, ctx: &mut Context, link: LinkId, identity: &Identity) -> Result<(), ProtocolError> {
        match self {
            State::Offline => Err(ProtocolError::new(
                ErrorCode::NoSvc,
                "Not accepting connections",
            )),
            State::Announcing(s) => s.leader.on_connection(ctx, link, identity, false),
            State::Master(s) => s.leader.on_connection(ctx, link, identity, true),
            State::Connecting(s) => s.on_connection(ctx, link, identity),
            State::Member(s) => s.on_connection(ctx, link, identity),
        }
    }

    /// A pooled link closed.
    pub fn on_disconnect(&mut self, ctx: &mut Context, entry: &PoolEntry) -> Option<Transition> {
        match self {
            State::Announcing(s) => {
                s.leader.on_disconnect(ctx, entry);
                None
            }
            State::Master(s) => {
                s.leader.on_disconnect(ctx, entry);
                None
            }
            State::Member(s) => s.on_disconnect(entry),
            State::Offline | State::Connecting(_) => None,
        }
    }

    /// A protocol message on a pooled link.
    pub fn on_message(&mut self, ctx: &mut Context, entry: &PoolEntry, message: Message) -> Option<Transition> {
        match self {
            State::Announcing(s) => {
                s.leader.on_message(ctx, entry, message);
                None
            }
            State::Master(s) => {
                s.leader.on_message(ctx, entry, message);
                None
            }
            State::Member(s) => s.on_message(ctx, entry, message),
            State::Offline | State::Connecting(_) => None,
        }
    }

    /// A frame on a link that is neither pending nor pooled.
    pub fn on_private_message(&mut self, ctx: &mut Context, link: LinkId, data: &[u8]) -> Option<Transition> {
        match self {
            State::Connecting(s) => s.on_link_message(ctx, link, data),
            _ => None,
        }
    }

    /// Closure of a link that is neither pending nor pooled.
    pub fn on_private_closed(&mut self, link: LinkId) -> Option<Transition> {
        match self {
            State::Connecting(s) => s.on_link_closed(link),
            _ => None,
        }
    }

    pub fn on_nodes_updated(&mut self, ctx: &mut Context) {
        match self {
            State::Announcing(s) => s.leader.publish(ctx),
            State::Master(s) => s.leader.publish(ctx),
            _ => {}
        }
    }

    pub fn on_timer(&mut self, ctx: &mut Context, timer: Timer) -> Option<Transition> {
        match self {
            State::Announcing(s) => s.on_timer(ctx, timer),
            State::Master(s) => {
                s.on_timer(ctx, timer);
                None
            }
            State::Member(s) => {
                s.on_timer(ctx, timer);
                None
            }
            State::Offline | State::Connecting(_) => None,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, State::Announcing(_) | State::Master(_))
    }
}
