//! Master state, and the leader behaviour it shares with Announcing.

use super::{Context, Transition};
use crate::error::{ErrorCode, ProtocolError};
use crate::pool::{LinkId, PoolEntry};
use crate::protocol::{Envelope, Identity, LinkUsage, MasterClaim, Message, SyncReport};
use crate::timer::Timer;
use crate::{NodeStates, Score};
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// A node that claims (or holds) the master role.
#[derive(Debug)]
pub(crate) struct Leader {
    started_at: u64,
}

impl Leader {
    pub fn new(now_ms: u64) -> Self {
        Self { started_at: now_ms }
    }

    pub fn enter(&mut self, ctx: &mut Context) {
        self.started_at = ctx.now_ms;
        let local = ctx.registry.local_id().clone();
        ctx.registry.set_master_id(local);
    }

    /// Our claim with a freshly computed score.
    pub fn claim(&self, ctx: &Context) -> MasterClaim {
        let local = ctx.registry.local();
        MasterClaim {
            id: local.id.clone(),
            cluster: ctx.config.cluster.clone(),
            address: local.address,
            port: local.port,
            score: Score::new(
                ctx.pool.count(),
                ctx.now_ms.saturating_sub(self.started_at),
                local.address,
                local.port,
            ),
        }
    }

    pub fn broadcast_claim(&self, ctx: &mut Context) {
        let claim = self.claim(ctx);
        ctx.announce(&claim, None);
    }

    /// Compare a remote claim with ours. The loser follows the winner.
    pub fn on_announce(&mut self, ctx: &mut Context, claim: MasterClaim, from: SocketAddr) -> Option<Transition> {
        if claim.cluster != ctx.config.cluster || claim.id == *ctx.registry.local_id() {
            return None;
        }

        let mine = self.claim(ctx);
        if claim.score.takes_over(&mine.score) {
            info!(
                "Claim of {} ({:?}) beats ours ({:?}), following",
                claim.id, claim.score.0, mine.score.0
            );
            let target = claim.target();
            ctx.pool
                .broadcast(&Envelope::of(&target), LinkUsage::Membership, &mut ctx.out);
            Some(Transition::Connect(target))
        } else {
            debug!("Answering weaker claim of {} at {}", claim.id, from);
            ctx.announce(&mine, Some(from));
            None
        }
    }

    pub fn on_connection(
        &mut self,
        ctx: &mut Context,
        link: LinkId,
        identity: &Identity,
        accepts_communicate: bool,
    ) -> Result<(), ProtocolError> {
        if identity.id == *ctx.registry.local_id() {
            return Err(ProtocolError::new(
                ErrorCode::BadId,
                format!("Id {} is taken by the master", identity.id),
            ));
        }

        match identity.usage {
            LinkUsage::Membership => {
                info!("Node {} joined from {}:{}", identity.id, identity.address, identity.port);
                let changed = ctx.registry.refresh(
                    &identity.id,
                    identity.address,
                    identity.port,
                    &NodeStates::default(),
                );
                ctx.admit(link, identity);
                // A changed registry is published to every member anyway
                if !changed {
                    let topology = ctx.registry.topology();
                    ctx.out.send(link, &Envelope::of(&topology));
                }
                Ok(())
            }
            LinkUsage::Communicate if accepts_communicate => ctx.admit_peer(link, identity),
            LinkUsage::Communicate => Err(ProtocolError::new(
                ErrorCode::BadUsage,
                "Only membership links are accepted while announcing",
            )),
        }
    }

    pub fn on_message(&mut self, ctx: &mut Context, entry: &PoolEntry, message: Message) {
        match message {
            Message::Sync(report) => self.on_sync(ctx, entry, report),
            other => debug!("Ignoring {:?} from {}", other, entry.id),
        }
    }

    fn on_sync(&mut self, ctx: &mut Context, entry: &PoolEntry, report: SyncReport) {
        if entry.usage != LinkUsage::Membership {
            ctx.reply_error(
                entry.link,
                &ProtocolError::new(ErrorCode::BadUsage, "sync requires a membership link"),
            );
            return;
        }
        if report.id != entry.id {
            ctx.reply_error(
                entry.link,
                &ProtocolError::new(
                    ErrorCode::BadId,
                    format!("sync for {} on the link of {}", report.id, entry.id),
                ),
            );
            return;
        }

        let changed = ctx
            .registry
            .refresh(&entry.id, entry.address, entry.port, &report.states);
        if !changed && report.revision != ctx.registry.revision() {
            debug!(
                "{} is at revision {}, sending {}",
                entry.id,
                report.revision,
                ctx.registry.revision()
            );
            let topology = ctx.registry.topology();
            ctx.out.send(entry.link, &Envelope::of(&topology));
        }
    }

    pub fn on_disconnect(&mut self, ctx: &mut Context, entry: &PoolEntry) {
        if entry.usage == LinkUsage::Membership {
            info!("Node {} left", entry.id);
            ctx.registry.remove(&entry.id);
        }
    }

    /// Push the topology to every member.
    pub fn publish(&self, ctx: &mut Context) {
        let topology = ctx.registry.topology();
        let sent = ctx
            .pool
            .broadcast(&Envelope::of(&topology), LinkUsage::Membership, &mut ctx.out);
        debug!("Published revision {} to {} member(s)", topology.revision, sent);
    }
}

#[derive(Debug)]
pub(crate) struct Master {
    pub leader: Leader,
}

impl Master {
    pub fn new(now_ms: u64) -> Self {
        Self {
            leader: Leader::new(now_ms),
        }
    }

    pub fn enter(&mut self, ctx: &mut Context) -> Option<Transition> {
        self.leader.enter(ctx);
        info!("Elected master with {} member(s)", ctx.pool.count());
        self.leader.broadcast_claim(ctx);
        ctx.schedule(Timer::Announce, ctx.config.steady_announce_interval());
        ctx.schedule(Timer::Retire, ctx.config.timeouts.membership);
        None
    }

    pub fn leave(&mut self, ctx: &mut Context) {
        ctx.cancel(Timer::Announce);
        ctx.cancel(Timer::Retire);
        ctx.pool.clear(&mut ctx.out);
    }

    pub fn on_timer(&mut self, ctx: &mut Context, timer: Timer) {
        match timer {
            Timer::Announce => {
                self.leader.broadcast_claim(ctx);
                ctx.schedule(Timer::Announce, ctx.config.steady_announce_interval());
            }
            Timer::Retire => {
                for id in ctx.registry.retire() {
                    warn!("Node {} stopped syncing", id);
                    ctx.pool.disconnect(&id, &mut ctx.out);
                }
                ctx.schedule(Timer::Retire, ctx.config.timeouts.membership);
            }
            other => debug!("Master ignoring timer {:?}", other),
        }
    }
}
