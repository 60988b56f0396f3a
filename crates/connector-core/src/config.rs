//! Connector configuration.

use crate::NodeId;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Cluster name must not be empty")]
    EmptyCluster,
    #[error("Announce schedule must contain at least one interval")]
    EmptySchedule,
    #[error("Timeouts must satisfy identity < membership < communicate")]
    TimeoutOrder,
    #[error("Membership timeout must be at least 3ms")]
    MembershipTooShort,
}

/// Per-usage link inactivity timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// How long an accepted link may stay silent before sending `id` (default: 5s)
    pub identity: Duration,
    /// Inactivity timeout of `communicate` links (default: 60s)
    pub communicate: Duration,
    /// Inactivity timeout of `membership` links, also the retire period (default: 10s)
    pub membership: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            identity: Duration::from_secs(5),
            communicate: Duration::from_secs(60),
            membership: Duration::from_secs(10),
        }
    }
}

/// Default announce backoff, in milliseconds.
pub const DEFAULT_ANNOUNCE_INTERVALS: [u64; 11] =
    [100, 200, 200, 500, 500, 500, 1000, 1000, 1000, 5000, 30000];

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub id: NodeId,
    /// Nodes only talk to nodes announcing the same cluster name
    pub cluster: String,
    pub timeouts: Timeouts,
    /// Delays between master claims while announcing. The last one is also
    /// the master's steady announce period.
    pub announce_intervals: Vec<Duration>,
}

impl ConnectorConfig {
    pub fn new(id: NodeId, cluster: impl Into<String>) -> Self {
        Self {
            id,
            cluster: cluster.into(),
            timeouts: Timeouts::default(),
            announce_intervals: DEFAULT_ANNOUNCE_INTERVALS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_announce_intervals(mut self, intervals: Vec<Duration>) -> Self {
        self.announce_intervals = intervals;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.is_empty() {
            return Err(ConfigError::EmptyCluster);
        }
        if self.announce_intervals.is_empty() {
            return Err(ConfigError::EmptySchedule);
        }
        let t = &self.timeouts;
        if t.membership < Duration::from_millis(3) {
            return Err(ConfigError::MembershipTooShort);
        }
        if !(t.identity < t.membership && t.membership < t.communicate) {
            return Err(ConfigError::TimeoutOrder);
        }
        Ok(())
    }

    /// Period between master claims once elected.
    pub fn steady_announce_interval(&self) -> Duration {
        self.announce_intervals
            .last()
            .copied()
            .unwrap_or(Duration::from_secs(30))
    }

    /// Period between member heartbeats.
    pub fn heartbeat_interval(&self) -> Duration {
        self.timeouts.membership / 3
    }
}

/// Address and port the local node listens on (UDP and TCP alike).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}
