//! Packet sources
//!
//! Pull-based capture contract: the engine asks for the next frame and gets
//! a frame, a timeout (live capture woke up so the stop flag can be polled),
//! or end-of-input. Implementations cover a live interface, an offline pcap
//! file, and an in-memory replay used by tests.

use std::path::Path;

use pcap::{Active, Capture, Linktype, Offline};
use tracing::info;

use crate::config::CaptureConfig;
use crate::error::{FlowtapError, Result};

/// One captured frame with its capture timestamp (µs since epoch)
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub timestamp_us: u64,
}

/// Outcome of one pull on a source
#[derive(Debug)]
pub enum SourceEvent {
    Frame(RawFrame),
    /// Read timeout expired; poll the stop flag and pull again
    Timeout,
    /// Source exhausted (file EOF)
    Eof,
}

/// Link layer the source produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Ethernet,
    /// DLT_RAW: frames start at the IP header
    RawIp,
}

/// Source-side counters
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceStats {
    /// Frames handed to the engine
    pub received: u64,
    /// Kernel-reported drops (live capture only)
    pub dropped: u64,
}

/// Pull-based packet source
pub trait PacketSource: Send {
    /// Next frame, or timeout, or end of input
    fn next_frame(&mut self) -> Result<SourceEvent>;

    fn link_kind(&self) -> LinkKind;

    fn stats(&mut self) -> SourceStats;
}

/// Open the source described by the capture configuration
pub fn open_source(config: &CaptureConfig) -> Result<Box<dyn PacketSource>> {
    if let Some(ref path) = config.read_file {
        Ok(Box::new(FileSource::open(path, config.filter.as_deref())?))
    } else if let Some(ref iface) = config.interface {
        Ok(Box::new(LiveSource::open(iface, config)?))
    } else {
        Err(FlowtapError::NoSource)
    }
}

fn timestamp_us(header: &pcap::PacketHeader) -> u64 {
    header.ts.tv_sec as u64 * 1_000_000 + header.ts.tv_usec as u64
}

fn link_kind_of(datalink: Linktype) -> LinkKind {
    if datalink == Linktype::RAW {
        LinkKind::RawIp
    } else {
        LinkKind::Ethernet
    }
}

/// Live capture on one interface
pub struct LiveSource {
    capture: Capture<Active>,
    link: LinkKind,
    received: u64,
}

impl LiveSource {
    pub fn open(interface: &str, config: &CaptureConfig) -> Result<Self> {
        let mut capture = Capture::from_device(interface)?
            .promisc(config.promiscuous)
            .snaplen(config.snaplen)
            // Bounded read timeout so the stop flag is observed between packets
            .timeout(config.timeout_ms)
            .open()?;

        if let Some(ref filter) = config.filter {
            capture.filter(filter, true)?;
        }

        let link = link_kind_of(capture.get_datalink());
        info!(interface, ?link, "live capture started");

        Ok(Self {
            capture,
            link,
            received: 0,
        })
    }
}

impl PacketSource for LiveSource {
    fn next_frame(&mut self) -> Result<SourceEvent> {
        match self.capture.next_packet() {
            Ok(packet) => {
                self.received += 1;
                Ok(SourceEvent::Frame(RawFrame {
                    data: packet.data.to_vec(),
                    timestamp_us: timestamp_us(packet.header),
                }))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(SourceEvent::Timeout),
            Err(e) => Err(FlowtapError::Capture(e)),
        }
    }

    fn link_kind(&self) -> LinkKind {
        self.link
    }

    fn stats(&mut self) -> SourceStats {
        let dropped = self
            .capture
            .stats()
            .map(|s| s.dropped as u64 + s.if_dropped as u64)
            .unwrap_or(0);
        SourceStats {
            received: self.received,
            dropped,
        }
    }
}

/// Offline pcap file replay
pub struct FileSource {
    capture: Capture<Offline>,
    link: LinkKind,
    received: u64,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P, filter: Option<&str>) -> Result<Self> {
        let mut capture = Capture::from_file(path.as_ref())?;
        if let Some(filter) = filter {
            capture.filter(filter, true)?;
        }

        let link = link_kind_of(capture.get_datalink());
        info!(file = %path.as_ref().display(), ?link, "replaying capture file");

        Ok(Self {
            capture,
            link,
            received: 0,
        })
    }
}

impl PacketSource for FileSource {
    fn next_frame(&mut self) -> Result<SourceEvent> {
        match self.capture.next_packet() {
            Ok(packet) => {
                self.received += 1;
                Ok(SourceEvent::Frame(RawFrame {
                    data: packet.data.to_vec(),
                    timestamp_us: timestamp_us(packet.header),
                }))
            }
            Err(pcap::Error::NoMorePackets) => Ok(SourceEvent::Eof),
            Err(e) => Err(FlowtapError::Capture(e)),
        }
    }

    fn link_kind(&self) -> LinkKind {
        self.link
    }

    fn stats(&mut self) -> SourceStats {
        SourceStats {
            received: self.received,
            dropped: 0,
        }
    }
}

/// In-memory frame sequence, for deterministic tests
pub struct ReplaySource {
    frames: std::vec::IntoIter<RawFrame>,
    received: u64,
    hold_open: bool,
}

impl ReplaySource {
    /// Yield the frames, then EOF
    pub fn new(frames: Vec<RawFrame>) -> Self {
        Self {
            frames: frames.into_iter(),
            received: 0,
            hold_open: false,
        }
    }

    /// Yield the frames, then behave like an idle live interface (timeouts
    /// until the engine is stopped)
    pub fn new_hold_open(frames: Vec<RawFrame>) -> Self {
        Self {
            frames: frames.into_iter(),
            received: 0,
            hold_open: true,
        }
    }
}

impl PacketSource for ReplaySource {
    fn next_frame(&mut self) -> Result<SourceEvent> {
        match self.frames.next() {
            Some(frame) => {
                self.received += 1;
                Ok(SourceEvent::Frame(frame))
            }
            None if self.hold_open => {
                // Pace like a live capture read timeout
                std::thread::sleep(std::time::Duration::from_millis(10));
                Ok(SourceEvent::Timeout)
            }
            None => Ok(SourceEvent::Eof),
        }
    }

    fn link_kind(&self) -> LinkKind {
        LinkKind::Ethernet
    }

    fn stats(&mut self) -> SourceStats {
        SourceStats {
            received: self.received,
            dropped: 0,
        }
    }
}
