//! Per-flow running statistics
//!
//! The accumulator folds one packet at a time into online statistics; no
//! packet is ever retained. All distribution fields (lengths, inter-arrival
//! times, active/idle periods) use `RunningStats`, so per-flow memory is
//! constant regardless of flow length.

use crate::core::{Direction, IpProtocol, PacketDescriptor, RunningStats, TcpFlags};

use super::key::{FlowKey, FlowTuple};
use super::FlowConfig;

/// Minimum consecutive same-direction packets that count as a bulk transfer
const BULK_MIN_PACKETS: u32 = 4;
/// Smallest payload that extends a bulk run; anything below flushes it
const BULK_PAYLOAD_FLOOR: u32 = 1;
/// Same-direction silence that starts a new subflow
const SUBFLOW_GAP_US: u64 = 1_000_000;

/// Timing knobs the accumulator needs on every update, precomputed to µs
#[derive(Debug, Clone, Copy)]
pub struct FlowParams {
    pub activity_timeout_us: u64,
    pub fin_grace_us: u64,
}

impl FlowParams {
    pub fn from_config(config: &FlowConfig) -> Self {
        Self {
            activity_timeout_us: config.activity_timeout_us(),
            fin_grace_us: config.fin_grace_us(),
        }
    }
}

/// Why a flow was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// TCP termination via FIN (or FIN grace expiry)
    Fin,
    /// TCP reset
    Rst,
    /// Idle longer than the idle timeout
    IdleTimeout,
    /// Older than the maximum flow age
    AgeTimeout,
    /// Force-closed to make room in a full table
    CapacityEvicted,
    /// Force-closed by the shutdown drain
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Fin => write!(f, "fin"),
            CloseReason::Rst => write!(f, "rst"),
            CloseReason::IdleTimeout => write!(f, "idle_timeout"),
            CloseReason::AgeTimeout => write!(f, "age_timeout"),
            CloseReason::CapacityEvicted => write!(f, "capacity"),
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Termination state
///
/// TCP: `Open → Closing` on the first FIN; a second FIN, a RST, or grace
/// expiry forces `Closed`. UDP/ICMP stay `Open` until evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Open,
    /// First FIN seen; the deadline bounds the peer's final packets
    Closing { deadline_us: u64 },
    Closed(CloseReason),
}

/// Statistics tracked separately for each direction
#[derive(Debug, Clone, Default)]
pub struct DirectionStats {
    pub packets: u64,
    /// Payload bytes
    pub bytes: u64,
    /// Payload length distribution
    pub len_stats: RunningStats,
    /// Same-direction inter-arrival times (µs)
    pub iat: RunningStats,
    pub last_ts: Option<u64>,
    /// IP + transport header bytes
    pub header_bytes: u64,
    pub psh_flags: u32,
    pub urg_flags: u32,
    /// TCP window of this direction's first packet
    pub init_window: Option<u16>,
    pub bulk: BulkState,
}

/// Bulk-transfer accumulator for one direction
///
/// A run of consecutive same-direction packets at or above the payload
/// floor; a direction change or an undersized packet flushes the run, which
/// only counts if it reached `BULK_MIN_PACKETS`.
#[derive(Debug, Clone, Default)]
pub struct BulkState {
    run_packets: u32,
    run_bytes: u64,
    run_start_us: u64,
    run_end_us: u64,

    pub bulk_count: u32,
    pub bulk_packets: u64,
    pub bulk_bytes: u64,
    pub bulk_duration_us: u64,
}

impl BulkState {
    fn extend(&mut self, ts_us: u64, payload: u64) {
        if self.run_packets == 0 {
            self.run_start_us = ts_us;
        }
        self.run_packets += 1;
        self.run_bytes += payload;
        self.run_end_us = ts_us;
    }

    fn flush(&mut self) {
        if self.run_packets >= BULK_MIN_PACKETS {
            self.bulk_count += 1;
            self.bulk_packets += self.run_packets as u64;
            self.bulk_bytes += self.run_bytes;
            self.bulk_duration_us += self.run_end_us - self.run_start_us;
        }
        self.run_packets = 0;
        self.run_bytes = 0;
        self.run_start_us = 0;
        self.run_end_us = 0;
    }
}

/// Mutable per-flow state, exclusively owned by the flow table while open
#[derive(Debug, Clone)]
pub struct FlowAccumulator {
    pub key: FlowKey,
    /// The flow's defining orientation (its first packet's 5-tuple)
    pub tuple: FlowTuple,
    pub state: FlowState,

    pub first_seen_us: u64,
    pub last_seen_us: u64,

    pub fwd: DirectionStats,
    pub bwd: DirectionStats,

    /// Combined payload length distribution
    pub pkt_len: RunningStats,
    /// Either-direction inter-arrival times (µs)
    pub flow_iat: RunningStats,

    pub fin_count: u32,
    pub syn_count: u32,
    pub rst_count: u32,
    pub psh_count: u32,
    pub ack_count: u32,
    pub urg_count: u32,
    pub cwr_count: u32,
    pub ece_count: u32,

    /// Forward packets carrying payload
    pub fwd_data_packets: u64,
    /// Smallest forward payload seen (u32::MAX sentinel until the first)
    pub fwd_seg_size_min: u32,

    /// Completed active-period durations (µs)
    pub active: RunningStats,
    /// Completed idle-gap durations (µs)
    pub idle: RunningStats,
    active_start_us: u64,
    active_end_us: u64,

    /// Maximal packet runs separated by >1 s gaps
    pub subflow_count: u32,

    /// Packets that arrived behind the flow clock
    pub out_of_order: u64,

    last_bulk_dir: Option<Direction>,
}

impl FlowAccumulator {
    /// Create a flow from its first packet
    pub fn new(desc: &PacketDescriptor, params: &FlowParams) -> Self {
        let ts = desc.timestamp_us;
        let mut acc = Self {
            key: FlowKey::from_descriptor(desc),
            tuple: FlowTuple::from_descriptor(desc),
            state: FlowState::Open,
            first_seen_us: ts,
            last_seen_us: ts,
            fwd: DirectionStats::default(),
            bwd: DirectionStats::default(),
            pkt_len: RunningStats::new(),
            flow_iat: RunningStats::new(),
            fin_count: 0,
            syn_count: 0,
            rst_count: 0,
            psh_count: 0,
            ack_count: 0,
            urg_count: 0,
            cwr_count: 0,
            ece_count: 0,
            fwd_data_packets: 0,
            fwd_seg_size_min: u32::MAX,
            active: RunningStats::new(),
            idle: RunningStats::new(),
            active_start_us: ts,
            active_end_us: ts,
            subflow_count: 1,
            out_of_order: 0,
            last_bulk_dir: None,
        };
        acc.fold_packet(desc, Direction::Forward);
        acc.update_bulk(Direction::Forward, ts, desc.payload_len);
        acc.fwd.last_ts = Some(ts);
        acc.advance_state(desc, params);
        acc
    }

    /// Fold a subsequent packet into the flow
    pub fn update(&mut self, desc: &PacketDescriptor, params: &FlowParams) {
        let ts = desc.timestamp_us;
        let direction = self.tuple.direction_of(desc);

        self.fold_packet(desc, direction);

        // Time-derived statistics only advance for in-order packets; a late
        // packet is counted above but must not regress the flow clock.
        if ts < self.last_seen_us {
            self.out_of_order += 1;
        } else {
            let gap = ts - self.last_seen_us;
            self.flow_iat.push(gap);

            if gap > SUBFLOW_GAP_US {
                self.subflow_count += 1;
            }

            // Active/idle transition on the either-direction gap
            if gap > params.activity_timeout_us {
                if self.active_end_us > self.active_start_us {
                    self.active.push(self.active_end_us - self.active_start_us);
                }
                self.idle.push(gap);
                self.active_start_us = ts;
            }
            self.active_end_us = ts;

            self.update_bulk(direction, ts, desc.payload_len);

            let dir_stats = self.dir_stats_mut(direction);
            if let Some(last) = dir_stats.last_ts {
                if ts >= last {
                    dir_stats.iat.push(ts - last);
                }
            }
            dir_stats.last_ts = Some(ts);

            self.last_seen_us = ts;
        }

        self.advance_state(desc, params);
    }

    /// Force the flow closed and flush pending statistics
    ///
    /// Keeps the original reason if TCP signaling already closed the flow.
    pub fn close(&mut self, reason: CloseReason) {
        if !matches!(self.state, FlowState::Closed(_)) {
            self.state = FlowState::Closed(reason);
        }
        self.finalize();
    }

    /// Flush pending bulk runs and the trailing active period
    fn finalize(&mut self) {
        self.fwd.bulk.flush();
        self.bwd.bulk.flush();
        if self.active_end_us > self.active_start_us {
            self.active.push(self.active_end_us - self.active_start_us);
            self.active_start_us = self.active_end_us;
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, FlowState::Closed(_))
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match self.state {
            FlowState::Closed(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn protocol(&self) -> IpProtocol {
        self.tuple.protocol
    }

    pub fn total_packets(&self) -> u64 {
        self.fwd.packets + self.bwd.packets
    }

    pub fn total_bytes(&self) -> u64 {
        self.fwd.bytes + self.bwd.bytes
    }

    /// Flow duration in µs
    pub fn duration_us(&self) -> u64 {
        self.last_seen_us - self.first_seen_us
    }

    /// Silence since the last packet, relative to `now_us`
    pub fn idle_time_us(&self, now_us: u64) -> u64 {
        now_us.saturating_sub(self.last_seen_us)
    }

    /// Flow age, relative to `now_us`
    pub fn age_us(&self, now_us: u64) -> u64 {
        now_us.saturating_sub(self.first_seen_us)
    }

    /// Grace deadline passed while in `Closing`
    pub fn grace_expired(&self, now_us: u64) -> bool {
        matches!(self.state, FlowState::Closing { deadline_us } if now_us > deadline_us)
    }

    fn dir_stats_mut(&mut self, direction: Direction) -> &mut DirectionStats {
        match direction {
            Direction::Forward => &mut self.fwd,
            Direction::Backward => &mut self.bwd,
        }
    }

    /// Order-independent per-packet counters
    fn fold_packet(&mut self, desc: &PacketDescriptor, direction: Direction) {
        self.pkt_len.push(desc.payload_len as u64);

        if direction == Direction::Forward {
            if desc.payload_len > 0 {
                self.fwd_data_packets += 1;
            }
            self.fwd_seg_size_min = self.fwd_seg_size_min.min(desc.payload_len);
        }

        let dir_stats = self.dir_stats_mut(direction);
        dir_stats.packets += 1;
        dir_stats.bytes += desc.payload_len as u64;
        dir_stats.len_stats.push(desc.payload_len as u64);
        dir_stats.header_bytes += desc.header_len as u64;
        if dir_stats.init_window.is_none() {
            dir_stats.init_window = desc.window;
        }

        if let Some(flags) = desc.tcp_flags {
            self.count_flags(flags, direction);
        }
    }

    fn count_flags(&mut self, flags: TcpFlags, direction: Direction) {
        if flags.fin { self.fin_count += 1; }
        if flags.syn { self.syn_count += 1; }
        if flags.rst { self.rst_count += 1; }
        if flags.ack { self.ack_count += 1; }
        if flags.cwr { self.cwr_count += 1; }
        if flags.ece { self.ece_count += 1; }
        if flags.psh {
            self.psh_count += 1;
            self.dir_stats_mut(direction).psh_flags += 1;
        }
        if flags.urg {
            self.urg_count += 1;
            self.dir_stats_mut(direction).urg_flags += 1;
        }
    }

    fn update_bulk(&mut self, direction: Direction, ts_us: u64, payload_len: u32) {
        // A direction change flushes the other side's pending run
        if let Some(last) = self.last_bulk_dir {
            if last != direction {
                self.dir_stats_mut(last).bulk.flush();
            }
        }
        self.last_bulk_dir = Some(direction);

        let bulk = &mut self.dir_stats_mut(direction).bulk;
        if payload_len >= BULK_PAYLOAD_FLOOR {
            bulk.extend(ts_us, payload_len as u64);
        } else {
            bulk.flush();
        }
    }

    /// TCP termination state machine; UDP/ICMP close only via eviction
    fn advance_state(&mut self, desc: &PacketDescriptor, params: &FlowParams) {
        if self.tuple.protocol != IpProtocol::Tcp {
            return;
        }

        if desc.is_rst() {
            if !self.is_closed() {
                self.state = FlowState::Closed(CloseReason::Rst);
                self.finalize();
            }
            return;
        }

        match self.state {
            FlowState::Open => {
                if desc.is_fin() {
                    self.state = FlowState::Closing {
                        deadline_us: desc.timestamp_us + params.fin_grace_us,
                    };
                }
            }
            FlowState::Closing { deadline_us } => {
                // A second FIN closes immediately; so does any packet that
                // arrives past the grace deadline.
                if desc.is_fin() || desc.timestamp_us > deadline_us {
                    self.state = FlowState::Closed(CloseReason::Fin);
                    self.finalize();
                }
            }
            FlowState::Closed(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn params() -> FlowParams {
        FlowParams {
            activity_timeout_us: 5_000_000,
            fin_grace_us: 1_000_000,
        }
    }

    fn tcp_desc(
        ts_us: u64,
        forward: bool,
        payload_len: u32,
        flags: TcpFlags,
        window: u16,
    ) -> PacketDescriptor {
        let (src_ip, dst_ip, src_port, dst_port) = if forward {
            ("192.168.1.100", "10.0.0.1", 54321, 80)
        } else {
            ("10.0.0.1", "192.168.1.100", 80, 54321)
        };
        PacketDescriptor {
            timestamp_us: ts_us,
            src_ip: src_ip.parse::<IpAddr>().unwrap(),
            dst_ip: dst_ip.parse::<IpAddr>().unwrap(),
            src_port,
            dst_port,
            protocol: IpProtocol::Tcp,
            wire_len: 54 + payload_len,
            payload_len,
            header_len: 40,
            tcp_flags: Some(flags),
            window: Some(window),
        }
    }

    fn udp_desc(ts_us: u64, payload_len: u32) -> PacketDescriptor {
        PacketDescriptor {
            timestamp_us: ts_us,
            src_ip: "192.168.1.100".parse().unwrap(),
            dst_ip: "10.0.0.53".parse().unwrap(),
            src_port: 49152,
            dst_port: 53,
            protocol: IpProtocol::Udp,
            wire_len: 42 + payload_len,
            payload_len,
            header_len: 28,
            tcp_flags: None,
            window: None,
        }
    }

    const ACK: TcpFlags = TcpFlags {
        fin: false, syn: false, rst: false, psh: false,
        ack: true, urg: false, ece: false, cwr: false,
    };
    const FIN_ACK: TcpFlags = TcpFlags {
        fin: true, syn: false, rst: false, psh: false,
        ack: true, urg: false, ece: false, cwr: false,
    };
    const RST: TcpFlags = TcpFlags {
        fin: false, syn: false, rst: true, psh: false,
        ack: false, urg: false, ece: false, cwr: false,
    };

    #[test]
    fn test_directional_split() {
        let p = params();
        let mut acc = FlowAccumulator::new(&tcp_desc(0, true, 40, ACK, 8192), &p);
        acc.update(&tcp_desc(10_000, false, 40, ACK, 4096), &p);
        acc.update(&tcp_desc(20_000, true, 512, ACK, 8192), &p);
        acc.update(&tcp_desc(30_000, false, 1200, ACK, 4096), &p);
        acc.update(&tcp_desc(50_000, true, 40, ACK, 8192), &p);

        assert_eq!(acc.fwd.packets, 3);
        assert_eq!(acc.bwd.packets, 2);
        assert_eq!(acc.fwd.bytes, 592);
        assert_eq!(acc.bwd.bytes, 1240);
        assert_eq!(acc.duration_us(), 50_000);
        assert_eq!(acc.fwd.len_stats.max(), 512);
        assert_eq!(acc.fwd.len_stats.min(), 40);
        assert_eq!(acc.fwd.init_window, Some(8192));
        assert_eq!(acc.bwd.init_window, Some(4096));
        assert_eq!(acc.ack_count, 5);
    }

    #[test]
    fn test_iat_per_direction() {
        let p = params();
        let mut acc = FlowAccumulator::new(&tcp_desc(0, true, 0, ACK, 1), &p);
        acc.update(&tcp_desc(100, false, 0, ACK, 1), &p);
        acc.update(&tcp_desc(300, true, 0, ACK, 1), &p);
        acc.update(&tcp_desc(700, true, 0, ACK, 1), &p);

        // Flow-level gaps: 100, 200, 400
        assert_eq!(acc.flow_iat.count(), 3);
        assert_eq!(acc.flow_iat.sum(), 700);
        assert_eq!(acc.flow_iat.min(), 100);
        assert_eq!(acc.flow_iat.max(), 400);

        // Forward gaps: 300, 400; backward has a single packet, no gap
        assert_eq!(acc.fwd.iat.count(), 2);
        assert_eq!(acc.fwd.iat.sum(), 700);
        assert_eq!(acc.bwd.iat.count(), 0);
    }

    #[test]
    fn test_fin_then_grace_then_second_fin() {
        let p = params();
        let mut acc = FlowAccumulator::new(&tcp_desc(0, true, 0, ACK, 1), &p);
        acc.update(&tcp_desc(1_000, true, 0, FIN_ACK, 1), &p);
        assert!(matches!(acc.state, FlowState::Closing { .. }));

        // Peer's final ACK inside the grace window keeps it open
        acc.update(&tcp_desc(2_000, false, 0, ACK, 1), &p);
        assert!(matches!(acc.state, FlowState::Closing { .. }));

        // Second FIN closes immediately
        acc.update(&tcp_desc(3_000, false, 0, FIN_ACK, 1), &p);
        assert_eq!(acc.close_reason(), Some(CloseReason::Fin));
        assert_eq!(acc.fin_count, 2);
    }

    #[test]
    fn test_packet_past_grace_deadline_closes() {
        let p = params();
        let mut acc = FlowAccumulator::new(&tcp_desc(0, true, 0, FIN_ACK, 1), &p);
        assert!(matches!(acc.state, FlowState::Closing { .. }));

        acc.update(&tcp_desc(2_000_000, false, 0, ACK, 1), &p);
        assert_eq!(acc.close_reason(), Some(CloseReason::Fin));
    }

    #[test]
    fn test_rst_closes_immediately() {
        let p = params();
        let mut acc = FlowAccumulator::new(&tcp_desc(0, true, 0, ACK, 1), &p);
        acc.update(&tcp_desc(500, false, 0, RST, 1), &p);
        assert_eq!(acc.close_reason(), Some(CloseReason::Rst));
    }

    #[test]
    fn test_udp_never_closes_by_signaling() {
        let p = params();
        let mut acc = FlowAccumulator::new(&udp_desc(0, 33), &p);
        acc.update(&udp_desc(1_000, 64), &p);
        assert_eq!(acc.state, FlowState::Open);
    }

    #[test]
    fn test_active_idle_transition() {
        let p = params();
        let mut acc = FlowAccumulator::new(&tcp_desc(0, true, 10, ACK, 1), &p);
        acc.update(&tcp_desc(1_000_000, true, 10, ACK, 1), &p);
        // 6 s of silence: closes the 1 s active period, records the gap
        acc.update(&tcp_desc(7_000_000, true, 10, ACK, 1), &p);

        assert_eq!(acc.active.count(), 1);
        assert_eq!(acc.active.max(), 1_000_000);
        assert_eq!(acc.idle.count(), 1);
        assert_eq!(acc.idle.max(), 6_000_000);
        assert_eq!(acc.subflow_count, 2);

        // Closing flushes the trailing (zero-length) active period as nothing
        acc.close(CloseReason::Shutdown);
        assert_eq!(acc.active.count(), 1);
    }

    #[test]
    fn test_bulk_run_committed_on_direction_change() {
        let p = params();
        let mut acc = FlowAccumulator::new(&tcp_desc(0, true, 500, ACK, 1), &p);
        acc.update(&tcp_desc(1_000, true, 500, ACK, 1), &p);
        acc.update(&tcp_desc(2_000, true, 500, ACK, 1), &p);
        acc.update(&tcp_desc(3_000, true, 500, ACK, 1), &p);
        // Direction flip flushes the 4-packet forward run
        acc.update(&tcp_desc(4_000, false, 40, ACK, 1), &p);

        assert_eq!(acc.fwd.bulk.bulk_count, 1);
        assert_eq!(acc.fwd.bulk.bulk_packets, 4);
        assert_eq!(acc.fwd.bulk.bulk_bytes, 2000);
        assert_eq!(acc.fwd.bulk.bulk_duration_us, 3_000);
    }

    #[test]
    fn test_short_run_does_not_count_as_bulk() {
        let p = params();
        let mut acc = FlowAccumulator::new(&tcp_desc(0, true, 500, ACK, 1), &p);
        acc.update(&tcp_desc(1_000, true, 500, ACK, 1), &p);
        acc.update(&tcp_desc(2_000, false, 40, ACK, 1), &p);
        acc.close(CloseReason::Shutdown);

        assert_eq!(acc.fwd.bulk.bulk_count, 0);
        assert_eq!(acc.bwd.bulk.bulk_count, 0);
    }

    #[test]
    fn test_out_of_order_packet_counted_without_clock_regression() {
        let p = params();
        let mut acc = FlowAccumulator::new(&tcp_desc(10_000, true, 40, ACK, 1), &p);
        acc.update(&tcp_desc(20_000, true, 40, ACK, 1), &p);
        // Arrives behind the flow clock
        acc.update(&tcp_desc(15_000, false, 60, ACK, 1), &p);

        assert_eq!(acc.out_of_order, 1);
        assert_eq!(acc.bwd.packets, 1);
        assert_eq!(acc.bwd.bytes, 60);
        assert_eq!(acc.last_seen_us, 20_000);
        assert_eq!(acc.duration_us(), 10_000);
        // The late packet contributed no inter-arrival sample
        assert_eq!(acc.flow_iat.count(), 1);
    }

    #[test]
    fn test_fwd_segment_tracking() {
        let p = params();
        let mut acc = FlowAccumulator::new(&tcp_desc(0, true, 0, ACK, 1), &p);
        acc.update(&tcp_desc(1_000, true, 512, ACK, 1), &p);
        acc.update(&tcp_desc(2_000, true, 40, ACK, 1), &p);

        assert_eq!(acc.fwd_data_packets, 2);
        assert_eq!(acc.fwd_seg_size_min, 0);
    }
}
