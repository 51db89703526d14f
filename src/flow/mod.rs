//! Flow reconstruction
//!
//! Groups packets into bidirectional flows, accumulates per-flow statistics,
//! and decides when a flow has ended.
//!
//! # Lifecycle
//!
//! An accumulator is created on the first packet of an unseen 5-tuple pair,
//! mutated by every later matching packet, and destroyed the instant it is
//! snapshotted into a `FlowRecord`. Exactly one record is ever emitted per
//! flow, through exactly one of: TCP termination, timeout eviction, capacity
//! eviction, or shutdown drain.

pub mod accumulator;
pub mod key;
pub mod record;
pub mod table;

pub use accumulator::{CloseReason, FlowAccumulator, FlowState};
pub use key::{FlowKey, FlowTuple};
pub use record::FlowRecord;
pub use table::FlowTable;

use serde::{Deserialize, Serialize};

use crate::core::IpProtocol;

/// Flow tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Maximum concurrent flows; the oldest-idle flow is force-closed to
    /// make room when the table is full
    pub table_size: usize,

    /// Idle eviction timeout (seconds)
    pub idle_timeout_secs: u64,

    /// UDP override for the idle timeout (seconds)
    pub udp_idle_secs: Option<u64>,

    /// ICMP override for the idle timeout (seconds)
    pub icmp_idle_secs: Option<u64>,

    /// Maximum flow age before forced close (seconds)
    pub max_age_secs: u64,

    /// Grace window after the first FIN for the peer's final packets
    /// (milliseconds)
    pub fin_grace_ms: u64,

    /// Silence gap that ends an active period and starts an idle one
    /// (seconds)
    pub activity_timeout_secs: u64,

    /// Eviction sweep interval (seconds)
    pub scan_interval_secs: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            table_size: 262_144,
            idle_timeout_secs: 120,
            udp_idle_secs: None,
            icmp_idle_secs: None,
            max_age_secs: 3600,
            fin_grace_ms: 1000,
            activity_timeout_secs: 5,
            scan_interval_secs: 1,
        }
    }
}

impl FlowConfig {
    /// Idle timeout for a protocol, in microseconds
    pub fn idle_timeout_us(&self, protocol: IpProtocol) -> u64 {
        let secs = match protocol {
            IpProtocol::Udp => self.udp_idle_secs.unwrap_or(self.idle_timeout_secs),
            IpProtocol::Icmp | IpProtocol::Icmpv6 => {
                self.icmp_idle_secs.unwrap_or(self.idle_timeout_secs)
            }
            _ => self.idle_timeout_secs,
        };
        secs * 1_000_000
    }

    pub fn max_age_us(&self) -> u64 {
        self.max_age_secs * 1_000_000
    }

    pub fn fin_grace_us(&self) -> u64 {
        self.fin_grace_ms * 1_000
    }

    pub fn activity_timeout_us(&self) -> u64 {
        self.activity_timeout_secs * 1_000_000
    }
}

/// Flow table counters
#[derive(Debug, Clone, Default)]
pub struct TableStats {
    /// Table lookups
    pub lookups: u64,
    /// Lookups that matched an open flow
    pub hits: u64,
    /// New flows created
    pub inserts: u64,
    /// Flows closed by TCP signaling (FIN/RST)
    pub completed: u64,
    /// Flows force-closed by idle/age timeout
    pub expired: u64,
    /// Flows force-closed to make room in a full table
    pub capacity_evicted: u64,
    /// Flows force-closed by the shutdown drain
    pub drained: u64,
    /// Packets that arrived behind the flow clock
    pub out_of_order: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FlowConfig::default();
        assert_eq!(config.idle_timeout_secs, 120);
        assert_eq!(config.activity_timeout_secs, 5);
        assert_eq!(config.idle_timeout_us(IpProtocol::Tcp), 120_000_000);
    }

    #[test]
    fn test_per_protocol_overrides() {
        let config = FlowConfig {
            udp_idle_secs: Some(30),
            icmp_idle_secs: Some(10),
            ..Default::default()
        };
        assert_eq!(config.idle_timeout_us(IpProtocol::Udp), 30_000_000);
        assert_eq!(config.idle_timeout_us(IpProtocol::Icmp), 10_000_000);
        assert_eq!(config.idle_timeout_us(IpProtocol::Tcp), 120_000_000);
    }
}
