//! Member: hold the membership link to the master and heartbeat on it.

use super::{Context, Transition};
use crate::error::{ErrorCode, ProtocolError};
use crate::pool::{LinkId, PoolEntry};
use crate::protocol::{Envelope, Identity, LinkUsage, Message, SyncReport, Target};
use crate::timer::Timer;
use tracing::{debug, info};

#[derive(Debug)]
pub(crate) struct Member {
    master: Target,
    link: LinkId,
}

impl Member {
    pub fn new(master: Target, link: LinkId) -> Self {
        Self { master, link }
    }

    pub fn enter(&mut self, ctx: &mut Context) -> Option<Transition> {
        info!("Member of {} ({} peers)", self.master, ctx.registry.len());
        ctx.pool.add(
            PoolEntry {
                id: self.master.id.clone(),
                link: self.link,
                usage: LinkUsage::Membership,
                address: self.master.address,
                port: self.master.port,
            },
            &mut ctx.out,
        );
        self.heartbeat(ctx);
        None
    }

    pub fn leave(&mut self, ctx: &mut Context) {
        ctx.cancel(Timer::Heartbeat);
        ctx.pool.clear(&mut ctx.out);
    }

    fn heartbeat(&mut self, ctx: &mut Context) {
        let report = SyncReport {
            id: ctx.registry.local_id().clone(),
            revision: ctx.registry.revision(),
            states: ctx.registry.local().states.reported(),
        };
        ctx.out.send(self.link, &Envelope::of(&report));
        ctx.schedule(Timer::Heartbeat, ctx.config.heartbeat_interval());
    }

    pub fn on_timer(&mut self, ctx: &mut Context, timer: Timer) {
        match timer {
            Timer::Heartbeat => self.heartbeat(ctx),
            other => debug!("Member ignoring timer {:?}", other),
        }
    }

    pub fn on_message(&mut self, ctx: &mut Context, entry: &PoolEntry, message: Message) -> Option<Transition> {
        if entry.link != self.link {
            ctx.reply_error(
                entry.link,
                &ProtocolError::new(ErrorCode::BadUsage, "Only the master may steer membership"),
            );
            return None;
        }

        match message {
            Message::Refresh(topology) => {
                ctx.registry.reload(topology);
                None
            }
            Message::Redir(target) => {
                info!("Master {} redirected us to {}", self.master, target);
                Some(Transition::Redirected(target))
            }
            other => {
                debug!("Member ignoring {:?}", other);
                None
            }
        }
    }

    pub fn on_disconnect(&mut self, entry: &PoolEntry) -> Option<Transition> {
        if entry.link == self.link {
            info!("Lost master {}", self.master);
            Some(Transition::Disconnected(self.master.clone()))
        } else {
            None
        }
    }

    pub fn on_connection(&mut self, ctx: &mut Context, link: LinkId, identity: &Identity) -> Result<(), ProtocolError> {
        match identity.usage {
            LinkUsage::Membership => {
                debug!("Bouncing {} to master {}", identity.id, self.master);
                ctx.redirect(link, &self.master);
                Ok(())
            }
            LinkUsage::Communicate if identity.id == self.master.id => Err(ProtocolError::new(
                ErrorCode::BadId,
                format!("{} is the master", identity.id),
            )),
            LinkUsage::Communicate => ctx.admit_peer(link, identity),
        }
    }
}
