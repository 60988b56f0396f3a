//! Daemon configuration file.
//!
//! A JSON object with camelCase keys. Every key is optional:
//!
//! ```json
//! {
//!   "id": "node-1",
//!   "cluster": "default",
//!   "address": "127.0.0.1",
//!   "port": 11100,
//!   "broadcast": "239.255.11.100",
//!   "identityTimeout": 5000,
//!   "communicateTimeout": 60000,
//!   "membershipTimeout": 10000,
//!   "announceIntervals": [100, 200, 200, 500],
//!   "redial": { "initialDelay": 200, "maxDelay": 5000, "backoffFactor": 2.0, "maxAttempts": 5 }
//! }
//! ```
//!
//! Durations are in milliseconds.

use crate::announcer::BroadcastTarget;
use anyhow::{Context, Result};
use connector_core::config::DEFAULT_ANNOUNCE_INTERVALS;
use connector_core::{ConnectorConfig, Endpoint, NodeId, Timeouts};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonConfig {
    /// Node id (generated if not provided)
    pub id: Option<String>,
    pub cluster: String,
    /// Address announced to peers and bound for UDP and TCP
    pub address: IpAddr,
    pub port: u16,
    /// `addr[:port]`; a `*` prefix marks a broadcast address
    pub broadcast: String,
    pub identity_timeout: u64,
    pub communicate_timeout: u64,
    pub membership_timeout: u64,
    pub announce_intervals: Vec<u64>,
    pub redial: RedialPolicy,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let timeouts = Timeouts::default();
        Self {
            id: None,
            cluster: "default".to_string(),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 11100,
            broadcast: "239.255.11.100".to_string(),
            identity_timeout: timeouts.identity.as_millis() as u64,
            communicate_timeout: timeouts.communicate.as_millis() as u64,
            membership_timeout: timeouts.membership.as_millis() as u64,
            announce_intervals: DEFAULT_ANNOUNCE_INTERVALS.to_vec(),
            redial: RedialPolicy::default(),
        }
    }
}

impl DaemonConfig {
    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        serde_json::from_str(&text).with_context(|| format!("Invalid config file {:?}", path))
    }

    /// The configured node id, or a fresh random one.
    pub fn node_id(&self) -> Result<NodeId> {
        match &self.id {
            Some(id) => NodeId::new(id.as_str()).with_context(|| format!("Invalid node id {:?}", id)),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                info!("Generated node id: {}", id);
                Ok(NodeId::new(id)?)
            }
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.address, self.port)
    }

    pub fn broadcast_target(&self) -> Result<BroadcastTarget> {
        self.broadcast
            .parse()
            .with_context(|| format!("Invalid broadcast target {:?}", self.broadcast))
    }

    /// Build and validate the core configuration for node `id`.
    pub fn connector_config(&self, id: NodeId) -> Result<ConnectorConfig> {
        let config = ConnectorConfig::new(id, self.cluster.as_str())
            .with_timeouts(Timeouts {
                identity: Duration::from_millis(self.identity_timeout),
                communicate: Duration::from_millis(self.communicate_timeout),
                membership: Duration::from_millis(self.membership_timeout),
            })
            .with_announce_intervals(
                self.announce_intervals
                    .iter()
                    .copied()
                    .map(Duration::from_millis)
                    .collect(),
            );
        config.validate()?;
        Ok(config)
    }
}

/// Reconnect-and-replay behavior of `communicate` links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedialPolicy {
    /// Delay after the first failed attempt, in ms
    pub initial_delay: u64,
    /// Upper bound on the delay between attempts, in ms
    pub max_delay: u64,
    pub backoff_factor: f64,
    /// Attempts before the link is declared closed (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for RedialPolicy {
    fn default() -> Self {
        Self {
            initial_delay: 200,
            max_delay: 5000,
            backoff_factor: 2.0,
            max_attempts: Some(5),
        }
    }
}

impl RedialPolicy {
    /// Delay before attempt `attempt + 1`, after `attempt` failures.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay_ms =
            self.initial_delay as f64 * self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis(delay_ms.min(self.max_delay as f64) as u64)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.map(|max| attempts >= max).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // ==================== Loading ====================

    #[test]
    fn test_defaults_match_core() {
        let config = DaemonConfig::default();
        let id = NodeId::new("a").unwrap();
        let core = config.connector_config(id).unwrap();
        assert_eq!(core.timeouts, Timeouts::default());
        assert_eq!(core.announce_intervals.len(), DEFAULT_ANNOUNCE_INTERVALS.len());
        assert_eq!(core.cluster, "default");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"id": "node-7", "cluster": "lab", "port": 12000, "membershipTimeout": 3000}}"#
        )
        .unwrap();

        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.id.as_deref(), Some("node-7"));
        assert_eq!(config.cluster, "lab");
        assert_eq!(config.port, 12000);
        assert_eq!(config.membership_timeout, 3000);
        assert_eq!(config.identity_timeout, 5000);
        assert_eq!(config.redial, RedialPolicy::default());
    }

    #[test]
    fn test_nested_redial_policy() {
        let config: DaemonConfig =
            serde_json::from_str(r#"{"redial": {"maxAttempts": null, "initialDelay": 50}}"#).unwrap();
        assert_eq!(config.redial.initial_delay, 50);
        assert_eq!(config.redial.max_attempts, None);
        assert_eq!(config.redial.max_delay, 5000);
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DaemonConfig::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_malformed_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(DaemonConfig::load(file.path()).is_err());
    }

    // ==================== Derived values ====================

    #[test]
    fn test_node_id_generated_when_missing() {
        let config = DaemonConfig::default();
        let a = config.node_id().unwrap();
        let b = config.node_id().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_node_id_rejects_empty() {
        let config = DaemonConfig {
            id: Some(String::new()),
            ..Default::default()
        };
        assert!(config.node_id().is_err());
    }

    #[test]
    fn test_invalid_timeouts_rejected() {
        let config = DaemonConfig {
            identity_timeout: 20_000,
            ..Default::default()
        };
        let id = NodeId::new("a").unwrap();
        assert!(config.connector_config(id).is_err());
    }

    // ==================== Redial ====================

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RedialPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(10), Duration::from_millis(5000));
    }

    #[test]
    fn test_exhausted() {
        let policy = RedialPolicy::default();
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));

        let unlimited = RedialPolicy {
            max_attempts: None,
            ..Default::default()
        };
        assert!(!unlimited.exhausted(u32::MAX));
    }
}
