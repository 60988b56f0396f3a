//! Connecting: open a membership link to a master candidate, following
//! redirects, until a `refresh` confirms we are a member.

use super::{Context, Transition};
use crate::error::{ErrorCode, ProtocolError};
use crate::pool::LinkId;
use crate::protocol::{Identity, LinkUsage, Message, Schema, Target};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub(crate) struct Connecting {
    target: Target,
    /// Link to the candidate, not pooled until we become a member
    link: Option<LinkId>,
}

impl Connecting {
    pub fn new(target: Target) -> Self {
        Self { target, link: None }
    }

    pub fn enter(&mut self, ctx: &mut Context) -> Option<Transition> {
        self.dial(ctx)
    }

    /// Peer links opened while connecting do not outlive a failed attempt.
    pub fn leave(&mut self, ctx: &mut Context, transition: &Transition) {
        if transition.hands_over() {
            return;
        }
        if let Some(link) = self.link.take() {
            ctx.out.disconnect(link);
        }
        ctx.pool.clear(&mut ctx.out);
    }

    fn dial(&mut self, ctx: &mut Context) -> Option<Transition> {
        if self.target.id == *ctx.registry.local_id() {
            warn!("Master candidate {} is ourselves, giving up", self.target);
            return Some(Transition::Fail);
        }
        info!("Connecting to {}", self.target);
        self.link = Some(ctx.connect(&self.target));
        None
    }

    pub fn on_link_message(&mut self, ctx: &mut Context, link: LinkId, data: &[u8]) -> Option<Transition> {
        if self.link != Some(link) {
            debug!("Frame on unknown {}", link);
            return None;
        }

        let message = match Schema::CONNECT.decode(data) {
            Ok(message) => message,
            Err(err) => {
                warn!("Bad frame from {}: {}", self.target, err);
                return None;
            }
        };

        match message {
            Message::Error(reply) => {
                warn!("{} refused us: {} {}", self.target, reply.code, reply.message);
                if let Some(link) = self.link.take() {
                    ctx.out.disconnect(link);
                }
                Some(Transition::Fail)
            }
            Message::Redir(target) => {
                info!("{} redirected us to {}", self.target, target);
                if let Some(link) = self.link.take() {
                    ctx.out.disconnect(link);
                }
                self.target = target;
                self.dial(ctx)
            }
            Message::Refresh(topology) => {
                let mut master = self.target.clone();
                master.id = topology.master.clone();
                ctx.registry.reload(topology);
                Some(Transition::Joined { master, link })
            }
            other => {
                debug!("Connecting ignoring {:?}", other);
                None
            }
        }
    }

    pub fn on_link_closed(&mut self, link: LinkId) -> Option<Transition> {
        if self.link == Some(link) {
            self.link = None;
            info!("Link to {} closed", self.target);
            Some(Transition::Fail)
        } else {
            None
        }
    }

    /// Anyone trying to join us is sent to our candidate.
    pub fn on_connection(&mut self, ctx: &mut Context, link: LinkId, identity: &Identity) -> Result<(), ProtocolError> {
        match identity.usage {
            LinkUsage::Membership => {
                debug!("Bouncing {} to {}", identity.id, self.target);
                ctx.redirect(link, &self.target);
                Ok(())
            }
            LinkUsage::Communicate => Err(ProtocolError::new(
                ErrorCode::NoSvc,
                "Not accepting peer links while connecting",
            )),
        }
    }
}
