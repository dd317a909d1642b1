//! Inner IPv4/UDP datagram handling.
//!
//! The tunnel carries raw IP datagrams. The server only ever looks inside
//! IPv4/UDP packets addressed to the reserved control port; everything else
//! is forwarded verbatim to the egress interface.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::CONTROL_PORT;

const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const PROTO_UDP: u8 = 17;

/// A parsed inner UDP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    /// Inner source socket (the client's tunnel endpoint).
    pub source: SocketAddrV4,
    /// Inner destination socket.
    pub destination: SocketAddrV4,
    /// UDP payload.
    pub payload: Bytes,
}

/// How the pipeline should treat an inner packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Addressed to the reserved control port; consumed by the server.
    Control(UdpDatagram),
    /// Anything routable that is not control traffic.
    Forward,
    /// Unparseable as an IP datagram.
    Malformed,
}

/// Classifies an inner packet from the tunnel.
///
/// Only IPv4/UDP datagrams to [`CONTROL_PORT`] are control traffic. IPv6
/// and non-UDP IPv4 pass through untouched.
pub fn classify(packet: &[u8]) -> Flow {
    let Some(version) = packet.first().map(|byte| byte >> 4) else {
        return Flow::Malformed;
    };
    match version {
        6 => Flow::Forward,
        4 => classify_v4(packet),
        _ => Flow::Malformed,
    }
}

fn classify_v4(packet: &[u8]) -> Flow {
    if packet.len() < IPV4_HEADER_LEN {
        return Flow::Malformed;
    }
    let header_len = ((packet[0] & 0x0F) as usize) * 4;
    let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if header_len < IPV4_HEADER_LEN || total_len < header_len || packet.len() < total_len {
        return Flow::Malformed;
    }

    if packet[9] != PROTO_UDP {
        return Flow::Forward;
    }

    let udp = &packet[header_len..total_len];
    if udp.len() < UDP_HEADER_LEN {
        return Flow::Malformed;
    }
    let destination_port = u16::from_be_bytes([udp[2], udp[3]]);
    if destination_port != CONTROL_PORT {
        return Flow::Forward;
    }

    let udp_len = u16::from_be_bytes([udp[4], udp[5]]) as usize;
    if udp_len < UDP_HEADER_LEN || udp_len > udp.len() {
        return Flow::Malformed;
    }

    let source_ip = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let destination_ip = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    let source_port = u16::from_be_bytes([udp[0], udp[1]]);

    Flow::Control(UdpDatagram {
        source: SocketAddrV4::new(source_ip, source_port),
        destination: SocketAddrV4::new(destination_ip, destination_port),
        payload: Bytes::from(udp[UDP_HEADER_LEN..udp_len].to_vec()),
    })
}

/// Builds an IPv4/UDP datagram around `payload`, with valid checksums.
pub fn build_udp(source: SocketAddrV4, destination: SocketAddrV4, payload: &[u8]) -> Bytes {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;
    let mut buf = BytesMut::with_capacity(total_len);

    // IPv4 header.
    buf.put_u8(0x45);
    buf.put_u8(0);
    buf.put_u16(total_len as u16);
    buf.put_u32(0); // identification + flags/fragment
    buf.put_u8(64); // ttl
    buf.put_u8(PROTO_UDP);
    buf.put_u16(0); // checksum placeholder
    buf.put_slice(&source.ip().octets());
    buf.put_slice(&destination.ip().octets());
    let ip_checksum = ones_complement_sum(&buf[..IPV4_HEADER_LEN], 0);
    buf[10..12].copy_from_slice(&(!ip_checksum).to_be_bytes());

    // UDP header + payload.
    buf.put_u16(source.port());
    buf.put_u16(destination.port());
    buf.put_u16(udp_len as u16);
    buf.put_u16(0); // checksum placeholder
    buf.put_slice(payload);

    // UDP checksum over the pseudo-header and the UDP segment.
    let mut pseudo = BytesMut::with_capacity(12);
    pseudo.put_slice(&source.ip().octets());
    pseudo.put_slice(&destination.ip().octets());
    pseudo.put_u8(0);
    pseudo.put_u8(PROTO_UDP);
    pseudo.put_u16(udp_len as u16);
    let partial = ones_complement_sum(&pseudo, 0);
    let udp_checksum = !ones_complement_sum(&buf[IPV4_HEADER_LEN..], partial);
    let udp_checksum = if udp_checksum == 0 { 0xFFFF } else { udp_checksum };
    buf[IPV4_HEADER_LEN + 6..IPV4_HEADER_LEN + 8].copy_from_slice(&udp_checksum.to_be_bytes());

    buf.freeze()
}

fn ones_complement_sum(data: &[u8], initial: u16) -> u16 {
    let mut sum = initial as u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}
