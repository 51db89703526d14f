//! Metering engine
//!
//! Wires the pipeline together: one ingestion loop driving the flow table,
//! one periodic eviction scanner, one output writer. The flow table sits
//! behind a single mutex so packet arrival and eviction are atomic with
//! respect to each other; no path holds that lock across capture reads or
//! channel sends.
//!
//! ```text
//! ┌──────────────┐    ┌───────────────┐    ┌─────────────────┐
//! │ PacketSource │───▶│  Flow Table   │───▶│   RecordSink    │
//! │ (pcap/replay)│    │ (mutex-owned) │    │ (bounded chan)  │
//! └──────────────┘    └───────▲───────┘    └────────┬────────┘
//!                             │                     │
//!                     ┌───────┴───────┐    ┌────────▼────────┐
//!                     │ Eviction scan │    │   CSV writer    │
//!                     │  (interval)   │    │    (thread)     │
//!                     └───────────────┘    └─────────────────┘
//! ```

pub mod capture;
pub mod emitter;

pub use capture::{
    open_source, FileSource, LinkKind, LiveSource, PacketSource, RawFrame, ReplaySource,
    SourceEvent, SourceStats,
};
pub use emitter::{CsvWriter, RecordSink};

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::{dissect_ethernet, dissect_ip, DissectSkip};
use crate::error::Result;
use crate::flow::FlowTable;

/// Engine counters, shared across threads
#[derive(Debug, Default)]
pub struct EngineStats {
    pub packets_seen: AtomicU64,
    pub packets_parsed: AtomicU64,
    pub parse_failures: AtomicU64,
    pub non_ip: AtomicU64,
    pub records_emitted: AtomicU64,
    pub records_dropped: AtomicU64,
    pub emit_retries: AtomicU64,
    pub active_flows: AtomicU64,
}

impl EngineStats {
    /// Consistent point-in-time copy for reporting
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            packets_seen: self.packets_seen.load(Ordering::Relaxed),
            packets_parsed: self.packets_parsed.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            non_ip: self.non_ip.load(Ordering::Relaxed),
            records_emitted: self.records_emitted.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            emit_retries: self.emit_retries.load(Ordering::Relaxed),
            active_flows: self.active_flows.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time engine counters
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStatsSnapshot {
    pub packets_seen: u64,
    pub packets_parsed: u64,
    pub parse_failures: u64,
    pub non_ip: u64,
    pub records_emitted: u64,
    pub records_dropped: u64,
    pub emit_retries: u64,
    pub active_flows: u64,
}

/// Wall clock in µs since the epoch, the same clock live capture stamps use
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// The metering engine
pub struct FlowEngine {
    config: Config,
    stats: Arc<EngineStats>,
    stop: Arc<AtomicBool>,
}

impl FlowEngine {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            stats: Arc::new(EngineStats::default()),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag observed between packets and between scan cycles; setting it
    /// triggers the drain-and-exit sequence. Safe to set more than once.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    /// Run to completion: source EOF or stop signal, then drain
    ///
    /// Every flow still open when ingestion ends is force-closed and
    /// emitted before the output channel closes.
    pub fn run(
        &self,
        mut source: Box<dyn PacketSource>,
        out: Box<dyn Write + Send>,
    ) -> Result<EngineStatsSnapshot> {
        let columns = self.config.output.resolved_columns();
        let (tx, rx) = crossbeam_channel::bounded(self.config.output.channel_capacity);

        let writer = CsvWriter::new(rx, columns, out).spawn();
        let sink = RecordSink::new(tx, Arc::clone(&self.stats));
        let table = Arc::new(Mutex::new(FlowTable::new(self.config.flow.clone())));

        let scanner = self.spawn_scanner(Arc::clone(&table), sink.clone());

        // Ingestion loop: the only reader of the capture handle
        let link = source.link_kind();
        let status_interval = Duration::from_secs(self.config.output.status_interval_secs);
        let mut last_status = Instant::now();
        let mut last_packet_count = 0u64;
        let mut read_error = None;

        while !self.stop.load(Ordering::Relaxed) {
            match source.next_frame() {
                Ok(SourceEvent::Frame(frame)) => {
                    self.stats.packets_seen.fetch_add(1, Ordering::Relaxed);
                    self.ingest(&table, &sink, link, &frame);
                }
                Ok(SourceEvent::Timeout) => {}
                Ok(SourceEvent::Eof) => {
                    info!("packet source exhausted");
                    break;
                }
                Err(e) => {
                    // Capture read failure is fatal; reported once, after a
                    // clean drain so completed flows are not lost.
                    error!(error = %e, "capture read failed");
                    read_error = Some(e);
                    break;
                }
            }

            if last_status.elapsed() >= status_interval {
                let seen = self.stats.packets_seen.load(Ordering::Relaxed);
                let pps = (seen - last_packet_count) as f64 / last_status.elapsed().as_secs_f64();
                self.log_status(&table, &mut source, pps);
                last_packet_count = seen;
                last_status = Instant::now();
            }
        }

        // Drain: zero-threshold flush of everything still open
        let remaining = {
            let mut table = table.lock();
            table.drain()
        };
        let drained = remaining.len();
        for record in remaining {
            sink.emit(record);
        }

        // Stop the scanner, then close the channel so the writer finishes
        self.stop.store(true, Ordering::Relaxed);
        if scanner.join().is_err() {
            warn!("eviction scanner panicked");
        }
        drop(sink);

        let mut writer_error = None;
        match writer.join() {
            Ok(Ok(written)) => {
                info!(records = written, drained, "output channel closed");
            }
            Ok(Err(e)) => {
                error!(error = %e, "output writer failed");
                writer_error = Some(e);
            }
            Err(_) => warn!("output writer panicked"),
        }

        match (read_error, writer_error) {
            (Some(e), _) => Err(e),
            (None, Some(e)) => Err(e.into()),
            (None, None) => Ok(self.stats.snapshot()),
        }
    }

    fn ingest(
        &self,
        table: &Arc<Mutex<FlowTable>>,
        sink: &RecordSink,
        link: LinkKind,
        frame: &RawFrame,
    ) {
        let parsed = match link {
            LinkKind::Ethernet => dissect_ethernet(&frame.data, frame.timestamp_us),
            LinkKind::RawIp => dissect_ip(&frame.data, frame.timestamp_us),
        };

        let desc = match parsed {
            Ok(desc) => desc,
            Err(DissectSkip::NonIp) => {
                self.stats.non_ip.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(DissectSkip::Malformed) => {
                self.stats.parse_failures.fetch_add(1, Ordering::Relaxed);
                debug!("dropped malformed frame");
                return;
            }
        };
        self.stats.packets_parsed.fetch_add(1, Ordering::Relaxed);

        // Lock covers the table mutation only; emission happens after
        let closed = {
            let mut table = table.lock();
            table.process(&desc)
        };
        for record in closed {
            sink.emit(record);
        }
    }

    fn spawn_scanner(
        &self,
        table: Arc<Mutex<FlowTable>>,
        sink: RecordSink,
    ) -> std::thread::JoinHandle<()> {
        let stop = Arc::clone(&self.stop);
        let stats = Arc::clone(&self.stats);
        let interval = Duration::from_secs(self.config.flow.scan_interval_secs.max(1));

        std::thread::spawn(move || {
            // Sleep in short steps so the stop flag is observed promptly
            let step = Duration::from_millis(50);
            'scan: loop {
                let mut waited = Duration::ZERO;
                while waited < interval {
                    if stop.load(Ordering::Relaxed) {
                        break 'scan;
                    }
                    std::thread::sleep(step);
                    waited += step;
                }

                let evicted = {
                    let mut table = table.lock();
                    let records = table.sweep(now_us());
                    stats
                        .active_flows
                        .store(table.len() as u64, Ordering::Relaxed);
                    records
                };
                if !evicted.is_empty() {
                    debug!(count = evicted.len(), "eviction sweep closed flows");
                }
                for record in evicted {
                    sink.emit(record);
                }
            }
        })
    }

    fn log_status(&self, table: &Arc<Mutex<FlowTable>>, source: &mut Box<dyn PacketSource>, pps: f64) {
        let active = table.lock().len() as u64;
        self.stats.active_flows.store(active, Ordering::Relaxed);
        let snap = self.stats.snapshot();
        let source_stats = source.stats();
        info!(
            packets = snap.packets_seen,
            pps = pps as u64,
            parsed = snap.packets_parsed,
            parse_failures = snap.parse_failures,
            active_flows = active,
            emitted = snap.records_emitted,
            dropped = snap.records_dropped,
            kernel_dropped = source_stats.dropped,
            "engine status"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = EngineStats::default();
        stats.packets_seen.fetch_add(3, Ordering::Relaxed);
        stats.records_emitted.fetch_add(1, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.packets_seen, 3);
        assert_eq!(snap.records_emitted, 1);
        assert_eq!(snap.records_dropped, 0);
    }

    #[test]
    fn test_now_us_is_epoch_scaled() {
        // Sanity: after 2020, before 2100
        let now = now_us();
        assert!(now > 1_577_836_800_000_000);
        assert!(now < 4_102_444_800_000_000);
    }
}
