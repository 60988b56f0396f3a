//! Announcing: claim the master role on an increasing backoff and become
//! master if nobody stronger shows up.

use super::{Context, Leader, Transition};
use crate::timer::Timer;
use tracing::{debug, info};

#[derive(Debug)]
pub(crate) struct Announcing {
    pub leader: Leader,
    /// Number of claims sent so far
    sent: usize,
}

impl Announcing {
    pub fn new(now_ms: u64) -> Self {
        Self {
            leader: Leader::new(now_ms),
            sent: 0,
        }
    }

    pub fn enter(&mut self, ctx: &mut Context) -> Option<Transition> {
        self.leader.enter(ctx);
        info!("Announcing as {}", ctx.local_target());
        self.announce(ctx);
        None
    }

    pub fn leave(&mut self, ctx: &mut Context, transition: &Transition) {
        ctx.cancel(Timer::Announce);
        if !transition.hands_over() {
            ctx.pool.clear(&mut ctx.out);
        }
    }

    /// Send one claim and wait for the next slot of the schedule.
    fn announce(&mut self, ctx: &mut Context) {
        let intervals = &ctx.config.announce_intervals;
        let wait = intervals[self.sent.min(intervals.len() - 1)];
        self.sent += 1;
        self.leader.broadcast_claim(ctx);
        ctx.schedule(Timer::Announce, wait);
    }

    pub fn on_timer(&mut self, ctx: &mut Context, timer: Timer) -> Option<Transition> {
        match timer {
            Timer::Announce if self.sent >= ctx.config.announce_intervals.len() => {
                Some(Transition::Ready)
            }
            Timer::Announce => {
                self.announce(ctx);
                None
            }
            other => {
                debug!("Announcing ignoring timer {:?}", other);
                None
            }
        }
    }
}
