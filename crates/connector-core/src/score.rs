//! Master election score.
//!
//! A score is `[active_links, announcing_elapsed_ms, ip_as_int, port]`.
//! Two scores are compared lexicographically: the first position where they
//! differ decides, and only a strictly greater value takes over. Equal scores
//! never take over each other.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Score(pub [i64; 4]);

impl Score {
    pub fn new(links: usize, elapsed_ms: u64, address: IpAddr, port: u16) -> Self {
        Self([
            links as i64,
            i64::try_from(elapsed_ms).unwrap_or(i64::MAX),
            i64::from(ip_to_int(address)),
            i64::from(port),
        ])
    }

    /// Whether `self` wins against `other`.
    pub fn takes_over(&self, other: &Score) -> bool {
        for (mine, theirs) in self.0.iter().zip(other.0.iter()) {
            if mine != theirs {
                return mine > theirs;
            }
        }
        false
    }
}

/// IPv4 address as its big-endian integer value.
///
/// IPv4-mapped IPv6 addresses use their IPv4 value; any other IPv6 address
/// scores 0.
pub fn ip_to_int(address: IpAddr) -> u32 {
    match address {
        IpAddr::V4(v4) => u32::from(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(u32::from).unwrap_or(0),
    }
}
