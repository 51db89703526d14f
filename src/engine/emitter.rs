//! Record emission
//!
//! Terminated flows travel over one bounded channel from the metering
//! threads to a single writer thread that owns the output handle. Producers
//! apply bounded-retry backpressure on a full channel; a record that still
//! cannot be queued is dropped with a visible counter and an error log,
//! never silently, and capture never stalls indefinitely.

use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, error};

use crate::flow::record::{header_line, FlowRecord};

use super::EngineStats;

/// Attempts before a record is counted as dropped
const EMIT_RETRIES: u32 = 50;
/// Backoff between attempts
const EMIT_BACKOFF: Duration = Duration::from_millis(10);

/// Producer half: publishes records with bounded-retry backpressure
#[derive(Clone)]
pub struct RecordSink {
    tx: Sender<FlowRecord>,
    stats: Arc<EngineStats>,
}

impl RecordSink {
    pub fn new(tx: Sender<FlowRecord>, stats: Arc<EngineStats>) -> Self {
        Self { tx, stats }
    }

    /// Publish one record
    pub fn emit(&self, record: FlowRecord) {
        let mut record = match self.tx.try_send(record) {
            Ok(()) => {
                self.stats.records_emitted.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(TrySendError::Disconnected(record)) => {
                // Writer already gone; only reachable after a writer failure
                self.count_drop(record, "output channel closed");
                return;
            }
            Err(TrySendError::Full(record)) => record,
        };

        for _ in 0..EMIT_RETRIES {
            self.stats.emit_retries.fetch_add(1, Ordering::Relaxed);
            match self.tx.send_timeout(record, EMIT_BACKOFF) {
                Ok(()) => {
                    self.stats.records_emitted.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(crossbeam_channel::SendTimeoutError::Timeout(r)) => record = r,
                Err(crossbeam_channel::SendTimeoutError::Disconnected(r)) => {
                    self.count_drop(r, "output channel closed");
                    return;
                }
            }
        }
        self.count_drop(record, "output channel saturated");
    }

    fn count_drop(&self, record: FlowRecord, why: &str) {
        self.stats.records_dropped.fetch_add(1, Ordering::Relaxed);
        error!(flow = %record.flow_id, "record dropped: {}", why);
    }
}

/// Consumer half: the single owner of the output handle
pub struct CsvWriter {
    rx: Receiver<FlowRecord>,
    columns: Vec<String>,
    out: Box<dyn Write + Send>,
}

impl CsvWriter {
    pub fn new(rx: Receiver<FlowRecord>, columns: Vec<String>, out: Box<dyn Write + Send>) -> Self {
        Self { rx, columns, out }
    }

    /// Write the header, then one line per record until every sender is gone
    pub fn run(mut self) -> std::io::Result<u64> {
        writeln!(self.out, "{}", header_line(&self.columns))?;
        self.out.flush()?;

        let mut written = 0u64;
        while let Ok(record) = self.rx.recv() {
            writeln!(self.out, "{}", record.csv_line(&self.columns))?;
            self.out.flush()?;
            written += 1;
        }

        debug!(records = written, "output writer finished");
        Ok(written)
    }

    pub fn spawn(self) -> JoinHandle<std::io::Result<u64>> {
        std::thread::spawn(move || self.run())
    }
}
