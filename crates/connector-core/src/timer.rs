//! Timer bookkeeping.
//!
//! The connector never sleeps: it asks its driver to schedule a [`TimerToken`]
//! and gets the token back as an input when it fires. Every timer kind has
//! at most one live token. Re-arming bumps the epoch and cancelling forgets it, so a
//! token that fires after its timer was cancelled is recognised as stale and
//! dropped instead of reaching a state that already left.

use crate::pool::LinkId;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    /// Next master claim (announcing backoff or master steady period)
    Announce,
    /// Master liveness sweep
    Retire,
    /// Member sync to the master
    Heartbeat,
    /// Accepted link that has not identified itself yet
    Identity(LinkId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken {
    pub timer: Timer,
    epoch: u64,
}

#[derive(Debug, Default)]
pub struct Timers {
    next_epoch: u64,
    armed: HashMap<Timer, u64>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `timer`, replacing any previous arming. Returns the token to schedule.
    pub fn arm(&mut self, timer: Timer) -> TimerToken {
        self.next_epoch += 1;
        self.armed.insert(timer, self.next_epoch);
        TimerToken {
            timer,
            epoch: self.next_epoch,
        }
    }

    /// Disarm `timer`. Returns the token that was live, if any.
    pub fn disarm(&mut self, timer: Timer) -> Option<TimerToken> {
        self.armed
            .remove(&timer)
            .map(|epoch| TimerToken { timer, epoch })
    }

    /// Consume a fired token. Returns false for stale tokens.
    pub fn fire(&mut self, token: TimerToken) -> bool {
        match self.armed.get(&token.timer) {
            Some(epoch) if *epoch == token.epoch => {
                self.armed.remove(&token.timer);
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, timer: Timer) -> bool {
        self.armed.contains_key(&timer)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}
