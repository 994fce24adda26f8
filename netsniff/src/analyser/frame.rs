//! Link, network and transport header decoding.
//!
//! Captured bytes are untrusted. Each layer is sliced with etherparse and
//! any slicing error simply yields `None`.
use etherparse::{Ethernet2HeaderSlice, IpNumber, Ipv4HeaderSlice, PacketBuilder, TcpHeaderSlice, UdpHeaderSlice};
use std::net::Ipv4Addr;
use std::ops::Range;

use crate::error::{CaptureError, CaptureResult};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

const UDP_HEADER_LEN: usize = 8;

const TCP_FLAG_NAMES: [(u8, &str); 8] = [
    (0x01, "FIN"),
    (0x02, "SYN"),
    (0x04, "RST"),
    (0x08, "PSH"),
    (0x10, "ACK"),
    (0x20, "URG"),
    (0x40, "ECE"),
    (0x80, "CWR"),
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transport {
    Tcp {
        src_port: u16,
        dst_port: u16,
        header_len: usize,
        flags: u8,
    },
    Udp {
        src_port: u16,
        dst_port: u16,
    },
    /// Any other IP protocol number; no ports.
    Other(u8),
}

impl Transport {
    pub fn ports(&self) -> Option<(u16, u16)> {
        match *self {
            Transport::Tcp { src_port, dst_port, .. } | Transport::Udp { src_port, dst_port } => {
                Some((src_port, dst_port))
            }
            Transport::Other(_) => None,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Transport::Tcp { .. } => "TCP".into(),
            Transport::Udp { .. } => "UDP".into(),
            Transport::Other(1) => "ICMP".into(),
            Transport::Other(n) => format!("IP-{n}"),
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Transport::Tcp { .. })
    }

    fn header_len(&self) -> usize {
        match self {
            Transport::Tcp { header_len, .. } => *header_len,
            Transport::Udp { .. } => UDP_HEADER_LEN,
            Transport::Other(_) => 0,
        }
    }
}

/// Headers of one frame plus where the application payload sits in it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedFrame {
    pub source_mac: [u8; 6],
    pub dest_mac: [u8; 6],
    pub source_ip: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
    pub ip_header_len: usize,
    pub ttl: u8,
    pub transport: Transport,
    /// Ends at the IPv4 total length, so Ethernet trailer padding is excluded.
    pub payload_range: Range<usize>,
}

impl DecodedFrame {
    pub fn payload<'a>(&self, raw: &'a [u8]) -> &'a [u8] {
        raw.get(self.payload_range.clone()).unwrap_or(&[])
    }

    /// Names of the TCP control bits that are set.
    pub fn tcp_flag_names(&self) -> Vec<String> {
        match self.transport {
            Transport::Tcp { flags, .. } => TCP_FLAG_NAMES
                .iter()
                .filter(|(bit, _)| flags & bit != 0)
                .map(|(_, name)| name.to_string())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// True when either endpoint is `target`.
    pub fn involves(&self, target: Ipv4Addr) -> bool {
        self.source_ip == target || self.dest_ip == target
    }
}

fn tcp_flags(tcp: &TcpHeaderSlice) -> u8 {
    [tcp.fin(), tcp.syn(), tcp.rst(), tcp.psh(), tcp.ack(), tcp.urg(), tcp.ece(), tcp.cwr()]
        .iter()
        .enumerate()
        .filter(|(_, set)| **set)
        .fold(0, |bits, (i, _)| bits | 1 << i)
}

/// Decodes an Ethernet II / IPv4 frame. Non-IPv4 and truncated frames give `None`.
pub fn decode(raw: &[u8]) -> Option<DecodedFrame> {
    let eth = Ethernet2HeaderSlice::from_slice(raw).ok()?;
    if eth.ether_type().0 != ETHERTYPE_IPV4 {
        return None;
    }

    let ip_start = eth.slice().len();
    let ipv4 = Ipv4HeaderSlice::from_slice(&raw[ip_start..]).ok()?;
    let ip_header_len = ipv4.slice().len();
    let total_len = usize::from(ipv4.total_len());
    if total_len < ip_header_len {
        return None;
    }
    // A snap-length cut frame keeps what was captured
    let ip_end = (ip_start + total_len).min(raw.len());
    let l4_start = ip_start + ip_header_len;
    let segment = raw.get(l4_start..ip_end)?;

    let transport = match ipv4.protocol().0 {
        IPPROTO_TCP => {
            let tcp = TcpHeaderSlice::from_slice(segment).ok()?;
            Transport::Tcp {
                src_port: tcp.source_port(),
                dst_port: tcp.destination_port(),
                header_len: tcp.slice().len(),
                flags: tcp_flags(&tcp),
            }
        }
        IPPROTO_UDP => {
            let udp = UdpHeaderSlice::from_slice(segment).ok()?;
            Transport::Udp {
                src_port: udp.source_port(),
                dst_port: udp.destination_port(),
            }
        }
        other => Transport::Other(other),
    };
    let payload_start = l4_start + transport.header_len();

    Some(DecodedFrame {
        source_mac: eth.source(),
        dest_mac: eth.destination(),
        source_ip: ipv4.source_addr(),
        dest_ip: ipv4.destination_addr(),
        ip_header_len,
        ttl: ipv4.ttl(),
        transport,
        payload_range: payload_start..ip_end,
    })
}

/// Fields for [`build_frame`].
#[derive(Clone, Debug)]
pub struct FrameSpec<'a> {
    pub source_mac: [u8; 6],
    pub dest_mac: [u8; 6],
    pub source_ip: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
    pub protocol: u8,
    pub ports: Option<(u16, u16)>,
    pub tcp_flags: u8,
    pub ttl: u8,
    pub payload: &'a [u8],
}

/// Serializes Ethernet/IPv4/(TCP|UDP) headers around a payload.
///
/// Used to rebuild frames from analyzer fields. Sequence numbers are zero;
/// checksums are computed.
pub fn build_frame(spec: &FrameSpec) -> CaptureResult<Vec<u8>> {
    let ip = PacketBuilder::ethernet2(spec.source_mac, spec.dest_mac).ipv4(
        spec.source_ip.octets(),
        spec.dest_ip.octets(),
        spec.ttl,
    );

    let mut out = Vec::new();
    let written = match (spec.protocol, spec.ports) {
        (IPPROTO_TCP, Some((src, dst))) => {
            let flags = spec.tcp_flags;
            let mut tcp = ip.tcp(src, dst, 0, u16::MAX);
            if flags & 0x01 != 0 {
                tcp = tcp.fin();
            }
            if flags & 0x02 != 0 {
                tcp = tcp.syn();
            }
            if flags & 0x04 != 0 {
                tcp = tcp.rst();
            }
            if flags & 0x08 != 0 {
                tcp = tcp.psh();
            }
            if flags & 0x10 != 0 {
                tcp = tcp.ack(0);
            }
            if flags & 0x20 != 0 {
                tcp = tcp.urg(0);
            }
            if flags & 0x40 != 0 {
                tcp = tcp.ece();
            }
            if flags & 0x80 != 0 {
                tcp = tcp.cwr();
            }
            out.reserve(tcp.size(spec.payload.len()));
            tcp.write(&mut out, spec.payload)
        }
        (IPPROTO_UDP, Some((src, dst))) => {
            let udp = ip.udp(src, dst);
            out.reserve(udp.size(spec.payload.len()));
            udp.write(&mut out, spec.payload)
        }
        (protocol, _) => {
            out.reserve(ip.size(spec.payload.len()));
            ip.write(&mut out, IpNumber(protocol), spec.payload)
        }
    };
    written.map_err(|e| CaptureError::MalformedFrame(format!("cannot rebuild frame: {e}")))?;
    Ok(out)
}
