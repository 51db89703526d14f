//! Flow identity
//!
//! A flow is a bidirectional 5-tuple: both orientations of the same exchange
//! must land on one table entry, so the key orders its endpoints and the
//! accumulator keeps the original forward tuple to resolve direction later.

use std::net::IpAddr;

use crate::core::{Direction, IpProtocol, PacketDescriptor};

/// Normalized 5-tuple table key (smaller endpoint first)
///
/// Port fields hold the ICMP type/code discriminator for port-less
/// protocols; the dissector fills those in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub ip_a: IpAddr,
    pub ip_b: IpAddr,
    pub port_a: u16,
    pub port_b: u16,
    pub protocol: IpProtocol,
}

impl FlowKey {
    pub fn from_descriptor(desc: &PacketDescriptor) -> Self {
        if (desc.src_ip, desc.src_port) <= (desc.dst_ip, desc.dst_port) {
            Self {
                ip_a: desc.src_ip,
                ip_b: desc.dst_ip,
                port_a: desc.src_port,
                port_b: desc.dst_port,
                protocol: desc.protocol,
            }
        } else {
            Self {
                ip_a: desc.dst_ip,
                ip_b: desc.src_ip,
                port_a: desc.dst_port,
                port_b: desc.src_port,
                protocol: desc.protocol,
            }
        }
    }
}

/// The flow's defining orientation: the 5-tuple of its first packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTuple {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: IpProtocol,
}

impl FlowTuple {
    pub fn from_descriptor(desc: &PacketDescriptor) -> Self {
        Self {
            src_ip: desc.src_ip,
            dst_ip: desc.dst_ip,
            src_port: desc.src_port,
            dst_port: desc.dst_port,
            protocol: desc.protocol,
        }
    }

    /// Forward iff the packet matches this orientation
    pub fn direction_of(&self, desc: &PacketDescriptor) -> Direction {
        if desc.src_ip == self.src_ip && desc.src_port == self.src_port {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }

    /// Human-readable flow identifier for the output record
    pub fn id(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            self.src_ip,
            self.dst_ip,
            self.src_port,
            self.dst_port,
            u8::from(self.protocol)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TcpFlags;

    fn descriptor(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> PacketDescriptor {
        PacketDescriptor {
            timestamp_us: 0,
            src_ip: IpAddr::from(src),
            dst_ip: IpAddr::from(dst),
            src_port: sport,
            dst_port: dport,
            protocol: IpProtocol::Tcp,
            wire_len: 60,
            payload_len: 0,
            header_len: 40,
            tcp_flags: Some(TcpFlags::default()),
            window: Some(1024),
        }
    }

    #[test]
    fn test_key_folds_both_directions() {
        let fwd = descriptor([192, 168, 1, 100], 54321, [10, 0, 0, 1], 80);
        let bwd = descriptor([10, 0, 0, 1], 80, [192, 168, 1, 100], 54321);

        assert_eq!(FlowKey::from_descriptor(&fwd), FlowKey::from_descriptor(&bwd));
    }

    #[test]
    fn test_distinct_flows_get_distinct_keys() {
        let a = descriptor([192, 168, 1, 100], 54321, [10, 0, 0, 1], 80);
        let b = descriptor([192, 168, 1, 100], 54322, [10, 0, 0, 1], 80);

        assert_ne!(FlowKey::from_descriptor(&a), FlowKey::from_descriptor(&b));
    }

    #[test]
    fn test_direction_resolves_against_first_orientation() {
        let first = descriptor([10, 0, 0, 1], 80, [192, 168, 1, 100], 54321);
        let tuple = FlowTuple::from_descriptor(&first);

        let reply = descriptor([192, 168, 1, 100], 54321, [10, 0, 0, 1], 80);
        assert_eq!(tuple.direction_of(&first), Direction::Forward);
        assert_eq!(tuple.direction_of(&reply), Direction::Backward);
    }

    #[test]
    fn test_tuple_id_format() {
        let desc = descriptor([192, 168, 1, 100], 54321, [10, 0, 0, 1], 80);
        let tuple = FlowTuple::from_descriptor(&desc);
        assert_eq!(tuple.id(), "192.168.1.100-10.0.0.1-54321-80-6");
    }
}
