//! Flow hash table
//!
//! Sole owner of open-flow state. Every path that ends a flow goes through
//! `remove` + snapshot here, which is what makes the single-emission
//! invariant hold: a flow leaves the map exactly once, and only removed
//! flows are ever converted to records.

use std::collections::HashMap;

use crate::core::PacketDescriptor;

use super::accumulator::{CloseReason, FlowAccumulator, FlowParams};
use super::key::FlowKey;
use super::record::FlowRecord;
use super::{FlowConfig, TableStats};

/// Hash table of open flows
pub struct FlowTable {
    flows: HashMap<FlowKey, FlowAccumulator>,
    config: FlowConfig,
    params: FlowParams,
    pub stats: TableStats,
}

impl FlowTable {
    pub fn new(config: FlowConfig) -> Self {
        let params = FlowParams::from_config(&config);
        Self {
            flows: HashMap::with_capacity(config.table_size.min(65_536)),
            config,
            params,
            stats: TableStats::default(),
        }
    }

    /// Fold one packet into the table
    ///
    /// Returns the records this packet terminated: the flow itself on
    /// FIN/RST, a predecessor whose own clock had already expired, or a
    /// victim evicted from a full table. Usually empty.
    pub fn process(&mut self, desc: &PacketDescriptor) -> Vec<FlowRecord> {
        let key = FlowKey::from_descriptor(desc);
        let mut closed = Vec::new();
        self.stats.lookups += 1;

        // A packet arriving on a flow that its own clock shows expired ends
        // the old flow and starts a new one, so replayed captures terminate
        // flows without any wall-clock involvement.
        if let Some(reason) = self.expiry_reason_for(&key, desc.timestamp_us) {
            if let Some(acc) = self.flows.remove(&key) {
                self.stats.expired += 1;
                closed.push(self.snapshot(acc, reason));
            }
        }

        let terminated = if let Some(acc) = self.flows.get_mut(&key) {
            self.stats.hits += 1;
            acc.update(desc, &self.params);
            acc.is_closed()
        } else {
            if self.flows.len() >= self.config.table_size {
                if let Some(record) = self.evict_oldest() {
                    closed.push(record);
                }
            }

            self.stats.inserts += 1;
            let acc = FlowAccumulator::new(desc, &self.params);
            if acc.is_closed() {
                // A lone RST never enters the table
                self.stats.completed += 1;
                let reason = acc.close_reason().unwrap_or(CloseReason::Rst);
                closed.push(self.snapshot(acc, reason));
            } else {
                self.flows.insert(key, acc);
            }
            false
        };

        if terminated {
            if let Some(acc) = self.flows.remove(&key) {
                self.stats.completed += 1;
                let reason = acc.close_reason().unwrap_or(CloseReason::Fin);
                closed.push(self.snapshot(acc, reason));
            }
        }

        closed
    }

    /// Periodic sweep: force-close flows idle past their timeout, older than
    /// the maximum age, or stuck in the FIN grace window.
    pub fn sweep(&mut self, now_us: u64) -> Vec<FlowRecord> {
        let max_age = self.config.max_age_us();
        let expired: Vec<(FlowKey, CloseReason)> = self
            .flows
            .iter()
            .filter_map(|(key, acc)| {
                let reason = if acc.grace_expired(now_us) {
                    CloseReason::Fin
                } else if acc.age_us(now_us) >= max_age {
                    CloseReason::AgeTimeout
                } else if acc.idle_time_us(now_us)
                    >= self.config.idle_timeout_us(acc.protocol())
                {
                    CloseReason::IdleTimeout
                } else {
                    return None;
                };
                Some((*key, reason))
            })
            .collect();

        let mut records = Vec::with_capacity(expired.len());
        for (key, reason) in expired {
            if let Some(acc) = self.flows.remove(&key) {
                match reason {
                    CloseReason::Fin => self.stats.completed += 1,
                    _ => self.stats.expired += 1,
                }
                records.push(self.snapshot(acc, reason));
            }
        }
        records
    }

    /// Zero-threshold sweep for shutdown: every remaining flow closes now
    pub fn drain(&mut self) -> Vec<FlowRecord> {
        let keys: Vec<FlowKey> = self.flows.keys().copied().collect();
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(acc) = self.flows.remove(&key) {
                self.stats.drained += 1;
                records.push(self.snapshot(acc, CloseReason::Shutdown));
            }
        }
        records
    }

    /// Open flow count
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    fn expiry_reason_for(&self, key: &FlowKey, ts_us: u64) -> Option<CloseReason> {
        let acc = self.flows.get(key)?;
        if acc.age_us(ts_us) >= self.config.max_age_us() {
            Some(CloseReason::AgeTimeout)
        } else if acc.idle_time_us(ts_us) >= self.config.idle_timeout_us(acc.protocol()) {
            Some(CloseReason::IdleTimeout)
        } else {
            None
        }
    }

    /// Make room in a full table by force-closing the longest-idle flow
    fn evict_oldest(&mut self) -> Option<FlowRecord> {
        let oldest = self
            .flows
            .iter()
            .min_by_key(|(_, acc)| acc.last_seen_us)
            .map(|(key, _)| *key)?;
        let acc = self.flows.remove(&oldest)?;
        self.stats.capacity_evicted += 1;
        Some(self.snapshot(acc, CloseReason::CapacityEvicted))
    }

    fn snapshot(&mut self, mut acc: FlowAccumulator, reason: CloseReason) -> FlowRecord {
        acc.close(reason);
        self.stats.out_of_order += acc.out_of_order;
        FlowRecord::from_accumulator(&acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{IpProtocol, TcpFlags};
    use std::net::IpAddr;

    fn config() -> FlowConfig {
        FlowConfig::default()
    }

    fn tcp_desc(ts_us: u64, sport: u16, flags: TcpFlags) -> PacketDescriptor {
        PacketDescriptor {
            timestamp_us: ts_us,
            src_ip: "192.168.1.100".parse::<IpAddr>().unwrap(),
            dst_ip: "10.0.0.1".parse::<IpAddr>().unwrap(),
            src_port: sport,
            dst_port: 80,
            protocol: IpProtocol::Tcp,
            wire_len: 60,
            payload_len: 0,
            header_len: 40,
            tcp_flags: Some(flags),
            window: Some(1024),
        }
    }

    fn reply_desc(ts_us: u64, dport: u16, flags: TcpFlags) -> PacketDescriptor {
        PacketDescriptor {
            timestamp_us: ts_us,
            src_ip: "10.0.0.1".parse::<IpAddr>().unwrap(),
            dst_ip: "192.168.1.100".parse::<IpAddr>().unwrap(),
            src_port: 80,
            dst_port: dport,
            protocol: IpProtocol::Tcp,
            wire_len: 60,
            payload_len: 0,
            header_len: 40,
            tcp_flags: Some(flags),
            window: Some(512),
        }
    }

    const SYN: TcpFlags = TcpFlags {
        fin: false, syn: true, rst: false, psh: false,
        ack: false, urg: false, ece: false, cwr: false,
    };
    const ACK: TcpFlags = TcpFlags {
        fin: false, syn: false, rst: false, psh: false,
        ack: true, urg: false, ece: false, cwr: false,
    };
    const RST: TcpFlags = TcpFlags {
        fin: false, syn: false, rst: true, psh: false,
        ack: false, urg: false, ece: false, cwr: false,
    };

    #[test]
    fn test_both_directions_share_one_flow() {
        let mut table = FlowTable::new(config());
        assert!(table.process(&tcp_desc(0, 54321, SYN)).is_empty());
        assert!(table.process(&reply_desc(1_000, 54321, ACK)).is_empty());

        assert_eq!(table.len(), 1);
        assert_eq!(table.stats.inserts, 1);
        assert_eq!(table.stats.hits, 1);
    }

    #[test]
    fn test_rst_closes_and_emits_once() {
        let mut table = FlowTable::new(config());
        table.process(&tcp_desc(0, 54321, SYN));
        let closed = table.process(&reply_desc(1_000, 54321, RST));

        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].close_reason, CloseReason::Rst);
        assert!(table.is_empty());
    }

    #[test]
    fn test_expired_predecessor_yields_fresh_flow() {
        let mut table = FlowTable::new(config());
        table.process(&tcp_desc(0, 54321, SYN));

        // Next packet on the same tuple arrives 10 minutes later
        let closed = table.process(&tcp_desc(600_000_000, 54321, ACK));

        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].close_reason, CloseReason::IdleTimeout);
        assert_eq!(closed[0].tot_fwd_pkts, 1);
        // The late packet started a new flow
        assert_eq!(table.len(), 1);
        assert_eq!(table.stats.inserts, 2);
    }

    #[test]
    fn test_sweep_evicts_idle_flows() {
        let mut table = FlowTable::new(config());
        table.process(&tcp_desc(0, 54321, SYN));
        table.process(&tcp_desc(1_000_000, 54322, SYN));

        // Only the first flow is past the 120 s idle timeout at t=121s
        let records = table.sweep(121_000_000);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].close_reason, CloseReason::IdleTimeout);
        assert_eq!(records[0].src_port, 54321);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_sweep_closes_expired_grace_window() {
        let mut table = FlowTable::new(config());
        let fin = TcpFlags { fin: true, ack: true, ..SYN };
        table.process(&tcp_desc(0, 54321, fin));
        assert_eq!(table.len(), 1);

        // Grace (1 s) expired, well before the idle timeout
        let records = table.sweep(2_000_000);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].close_reason, CloseReason::Fin);
    }

    #[test]
    fn test_drain_emits_every_open_flow() {
        let mut table = FlowTable::new(config());
        for port in 0..5u16 {
            table.process(&tcp_desc(port as u64, 50_000 + port, SYN));
        }
        assert_eq!(table.len(), 5);

        let records = table.drain();
        assert_eq!(records.len(), 5);
        assert!(table.is_empty());
        assert!(records.iter().all(|r| r.close_reason == CloseReason::Shutdown));
        assert_eq!(table.stats.drained, 5);
    }

    #[test]
    fn test_capacity_eviction_makes_room() {
        let mut table = FlowTable::new(FlowConfig {
            table_size: 2,
            ..FlowConfig::default()
        });
        table.process(&tcp_desc(0, 50_001, SYN));
        table.process(&tcp_desc(1_000, 50_002, SYN));

        let closed = table.process(&tcp_desc(2_000, 50_003, SYN));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].close_reason, CloseReason::CapacityEvicted);
        // The longest-idle flow was the victim
        assert_eq!(closed[0].src_port, 50_001);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_every_flow_emitted_exactly_once() {
        let mut table = FlowTable::new(config());
        let mut emitted = Vec::new();

        for port in 0..10u16 {
            emitted.extend(table.process(&tcp_desc(port as u64 * 100, 40_000 + port, SYN)));
        }
        // Close half by RST
        for port in 0..5u16 {
            emitted.extend(table.process(&reply_desc(10_000, 40_000 + port, RST)));
        }
        emitted.extend(table.drain());

        assert_eq!(emitted.len(), 10);
        let mut ids: Vec<String> = emitted.iter().map(|r| r.flow_id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10);
    }
}
