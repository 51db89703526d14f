//! Normalized packet representation
//!
//! One `PacketDescriptor` per captured frame, carrying everything the flow
//! accumulator needs and nothing else. Payload bytes are never retained.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// IP protocol numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Icmpv6,
    Other(u8),
}

impl From<u8> for IpProtocol {
    fn from(val: u8) -> Self {
        match val {
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            58 => IpProtocol::Icmpv6,
            other => IpProtocol::Other(other),
        }
    }
}

impl From<IpProtocol> for u8 {
    fn from(val: IpProtocol) -> Self {
        match val {
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Icmpv6 => 58,
            IpProtocol::Other(v) => v,
        }
    }
}

impl std::fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpProtocol::Icmp => write!(f, "ICMP"),
            IpProtocol::Tcp => write!(f, "TCP"),
            IpProtocol::Udp => write!(f, "UDP"),
            IpProtocol::Icmpv6 => write!(f, "ICMPv6"),
            IpProtocol::Other(n) => write!(f, "Proto({})", n),
        }
    }
}

/// TCP flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
            ece: flags & 0x40 != 0,
            cwr: flags & 0x80 != 0,
        }
    }

    pub fn to_u8(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        if self.urg { flags |= 0x20; }
        if self.ece { flags |= 0x40; }
        if self.cwr { flags |= 0x80; }
        flags
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        if self.syn { s.push('S'); }
        if self.ack { s.push('A'); }
        if self.fin { s.push('F'); }
        if self.rst { s.push('R'); }
        if self.psh { s.push('P'); }
        if self.urg { s.push('U'); }
        if self.ece { s.push('E'); }
        if self.cwr { s.push('C'); }
        if s.is_empty() { s.push('.'); }
        write!(f, "{}", s)
    }
}

/// Packet direction relative to the flow's first-seen orientation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Same orientation as the flow's first packet
    Forward,
    /// Opposite orientation
    Backward,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }
}

/// Normalized view of one captured packet
///
/// Timestamps are microseconds since the Unix epoch, taken from the capture
/// header so live and replayed traffic share one clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketDescriptor {
    /// Capture timestamp (µs)
    pub timestamp_us: u64,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    /// Source port; for ICMP a type/code discriminator (see `FlowKey`)
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: IpProtocol,
    /// Total frame length on the wire
    pub wire_len: u32,
    /// Transport payload length
    pub payload_len: u32,
    /// IP + transport header bytes
    pub header_len: u32,
    /// TCP flags, `None` for non-TCP
    pub tcp_flags: Option<TcpFlags>,
    /// TCP receive window, `None` for non-TCP
    pub window: Option<u16>,
}

impl PacketDescriptor {
    /// True when the packet carries a FIN
    pub fn is_fin(&self) -> bool {
        self.tcp_flags.map(|f| f.fin).unwrap_or(false)
    }

    /// True when the packet carries a RST
    pub fn is_rst(&self) -> bool {
        self.tcp_flags.map(|f| f.rst).unwrap_or(false)
    }
}
