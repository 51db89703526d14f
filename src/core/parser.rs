//! Frame dissection
//!
//! Turns raw capture bytes into a `PacketDescriptor`, or a typed skip reason
//! for anything that cannot feed flow state (non-IP, truncated, malformed).
//! Dissection never panics; the engine counts skips and moves on.

use std::net::IpAddr;

use etherparse::SlicedPacket;

use super::packet::{IpProtocol, PacketDescriptor, TcpFlags};

/// Why a frame was not turned into a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DissectSkip {
    /// Frame did not slice cleanly (truncated or malformed headers)
    Malformed,
    /// Parsed, but carries no IP layer (ARP and friends)
    NonIp,
}

impl std::fmt::Display for DissectSkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DissectSkip::Malformed => write!(f, "malformed frame"),
            DissectSkip::NonIp => write!(f, "non-IP frame"),
        }
    }
}

/// Dissect an Ethernet frame
pub fn dissect_ethernet(data: &[u8], timestamp_us: u64) -> Result<PacketDescriptor, DissectSkip> {
    let sliced = SlicedPacket::from_ethernet(data).map_err(|_| DissectSkip::Malformed)?;
    build_descriptor(&sliced, data.len() as u32, timestamp_us)
}

/// Dissect a frame with no link layer (DLT_RAW captures)
pub fn dissect_ip(data: &[u8], timestamp_us: u64) -> Result<PacketDescriptor, DissectSkip> {
    let sliced = SlicedPacket::from_ip(data).map_err(|_| DissectSkip::Malformed)?;
    build_descriptor(&sliced, data.len() as u32, timestamp_us)
}

fn build_descriptor(
    sliced: &SlicedPacket<'_>,
    wire_len: u32,
    timestamp_us: u64,
) -> Result<PacketDescriptor, DissectSkip> {
    // Layer 3
    let (src_ip, dst_ip, mut protocol, ip_header_len, ip_payload_len) = match &sliced.net {
        Some(etherparse::NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            let ihl = header.ihl() as u32 * 4;
            let payload = (header.total_len() as u32).saturating_sub(ihl);
            (
                IpAddr::from(header.source_addr()),
                IpAddr::from(header.destination_addr()),
                IpProtocol::from(header.protocol().0),
                ihl,
                payload,
            )
        }
        Some(etherparse::NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            (
                IpAddr::from(header.source_addr()),
                IpAddr::from(header.destination_addr()),
                IpProtocol::from(header.next_header().0),
                40u32,
                header.payload_length() as u32,
            )
        }
        _ => return Err(DissectSkip::NonIp),
    };

    // Layer 4
    let mut src_port = 0u16;
    let mut dst_port = 0u16;
    let mut tcp_flags = None;
    let mut window = None;
    let transport_header_len;
    let payload_len;

    match &sliced.transport {
        Some(etherparse::TransportSlice::Tcp(tcp)) => {
            // The sliced transport wins over the IP header's next-header
            // field, which names the first extension header on IPv6
            protocol = IpProtocol::Tcp;
            src_port = tcp.source_port();
            dst_port = tcp.destination_port();
            tcp_flags = Some(TcpFlags {
                fin: tcp.fin(),
                syn: tcp.syn(),
                rst: tcp.rst(),
                psh: tcp.psh(),
                ack: tcp.ack(),
                urg: tcp.urg(),
                ece: tcp.ece(),
                cwr: tcp.cwr(),
            });
            window = Some(tcp.window_size());
            transport_header_len = tcp.data_offset() as u32 * 4;
            payload_len = tcp.payload().len() as u32;
        }
        Some(etherparse::TransportSlice::Udp(udp)) => {
            protocol = IpProtocol::Udp;
            src_port = udp.source_port();
            dst_port = udp.destination_port();
            transport_header_len = 8;
            payload_len = udp.payload().len() as u32;
        }
        Some(etherparse::TransportSlice::Icmpv4(icmp)) => {
            // Flows keyed on type/code rather than ports; see FlowKey
            protocol = IpProtocol::Icmp;
            let bytes = icmp.slice();
            if bytes.len() >= 2 {
                src_port = ((bytes[0] as u16) << 8) | bytes[1] as u16;
            }
            transport_header_len = 8;
            payload_len = icmp.payload().len() as u32;
        }
        Some(etherparse::TransportSlice::Icmpv6(icmp)) => {
            protocol = IpProtocol::Icmpv6;
            let bytes = icmp.slice();
            if bytes.len() >= 2 {
                src_port = ((bytes[0] as u16) << 8) | bytes[1] as u16;
            }
            transport_header_len = 8;
            payload_len = icmp.payload().len() as u32;
        }
        _ => {
            // Unknown transport over IP is still metered, port-less
            transport_header_len = 0;
            payload_len = ip_payload_len;
        }
    }

    Ok(PacketDescriptor {
        timestamp_us,
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol,
        wire_len,
        payload_len,
        header_len: ip_header_len + transport_header_len,
        tcp_flags,
        window,
    })
}
