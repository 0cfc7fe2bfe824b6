//! Raw IP/UDP packet helpers.

use etherparse::{IpNumber, Ipv4HeaderSlice, Ipv6HeaderSlice, PacketBuilder, UdpHeaderSlice};
use std::net::{IpAddr, Ipv4Addr};

const UDP_HEADER_LEN: usize = 8;
const UDP_PROTOCOL: u8 = 17;
const IPV6_HEADER_LEN: usize = 40;

/// Addressing of one UDP datagram, kept so a reply can be addressed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub hop_limit: u8,
}

#[derive(Debug)]
pub struct UdpPacket<'a> {
    pub envelope: Envelope,
    pub payload: &'a [u8],
}

pub fn is_ipv4(packet: &[u8]) -> bool {
    packet.first().map(|b| b >> 4) == Some(4)
}

pub fn is_ipv6(packet: &[u8]) -> bool {
    packet.first().map(|b| b >> 4) == Some(6)
}

/// Parses a UDP-over-IP packet. Anything else, including truncated
/// packets, yields `None`.
pub fn parse_udp(packet: &[u8]) -> Option<UdpPacket<'_>> {
    let (src, dst, hop_limit, transport) = if is_ipv4(packet) {
        let ip = Ipv4HeaderSlice::from_slice(packet).ok()?;
        if ip.protocol() != IpNumber::UDP {
            return None;
        }
        let total = (ip.total_len() as usize).min(packet.len());
        let transport = packet.get(ip.slice().len()..total)?;
        (
            IpAddr::V4(ip.source_addr()),
            IpAddr::V4(ip.destination_addr()),
            ip.ttl(),
            transport,
        )
    } else if is_ipv6(packet) {
        let ip = Ipv6HeaderSlice::from_slice(packet).ok()?;
        if ip.next_header() != IpNumber::UDP {
            return None;
        }
        let total = (IPV6_HEADER_LEN + ip.payload_length() as usize).min(packet.len());
        let transport = packet.get(IPV6_HEADER_LEN..total)?;
        (
            IpAddr::V6(ip.source_addr()),
            IpAddr::V6(ip.destination_addr()),
            ip.hop_limit(),
            transport,
        )
    } else {
        return None;
    };

    let udp = UdpHeaderSlice::from_slice(transport).ok()?;
    let end = (udp.length() as usize).clamp(UDP_HEADER_LEN, transport.len());
    Some(UdpPacket {
        envelope: Envelope {
            src,
            dst,
            src_port: udp.source_port(),
            dst_port: udp.destination_port(),
            hop_limit,
        },
        payload: &transport[UDP_HEADER_LEN..end],
    })
}

/// Builds an IP/UDP packet with correct lengths and checksums. The two
/// addresses must be of the same family.
pub fn build_udp(
    src: IpAddr,
    dst: IpAddr,
    src_port: u16,
    dst_port: u16,
    hop_limit: u8,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let builder = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            PacketBuilder::ipv4(s.octets(), d.octets(), hop_limit).udp(src_port, dst_port)
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            PacketBuilder::ipv6(s.octets(), d.octets(), hop_limit).udp(src_port, dst_port)
        }
        _ => return None,
    };
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, payload).ok()?;
    Some(out)
}

/// Addresses `response` as the reply to the datagram described by `origin`.
pub fn to_device(response: &[u8], origin: &Envelope) -> Option<Vec<u8>> {
    build_udp(
        origin.dst,
        origin.src,
        origin.dst_port,
        origin.src_port,
        origin.hop_limit,
        response,
    )
}

pub fn rewrite_ipv4_destination(packet: &mut [u8], addr: Ipv4Addr) -> bool {
    rewrite_ipv4_address(packet, 16, addr)
}

pub fn rewrite_ipv4_source(packet: &mut [u8], addr: Ipv4Addr) -> bool {
    rewrite_ipv4_address(packet, 12, addr)
}

pub fn ipv4_source(packet: &[u8]) -> Option<Ipv4Addr> {
    Ipv4HeaderSlice::from_slice(packet).ok().map(|ip| ip.source_addr())
}

pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    Ipv4HeaderSlice::from_slice(packet).ok().map(|ip| ip.destination_addr())
}

fn rewrite_ipv4_address(packet: &mut [u8], offset: usize, addr: Ipv4Addr) -> bool {
    if !is_ipv4(packet) || Ipv4HeaderSlice::from_slice(packet).is_err() {
        return false;
    }
    packet[offset..offset + 4].copy_from_slice(&addr.octets());
    fix_checksums(packet);
    true
}

/// Recomputes the IPv4 header checksum and, for UDP, the datagram checksum.
fn fix_checksums(packet: &mut [u8]) {
    let ihl = ((packet[0] & 0x0f) as usize) * 4;
    let total = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    let end = total.clamp(ihl, packet.len());

    packet[10] = 0;
    packet[11] = 0;
    let ip_checksum = fold(sum_words(&packet[..ihl], 0));
    packet[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    if packet[9] != UDP_PROTOCOL || end < ihl + UDP_HEADER_LEN {
        return;
    }
    packet[ihl + 6] = 0;
    packet[ihl + 7] = 0;
    let udp_len = end - ihl;
    let mut sum = sum_words(&packet[12..20], 0);
    sum += UDP_PROTOCOL as u32;
    sum += udp_len as u32;
    sum = sum_words(&packet[ihl..end], sum);
    let checksum = match fold(sum) {
        0 => 0xffff,
        c => c,
    };
    packet[ihl + 6..ihl + 8].copy_from_slice(&checksum.to_be_bytes());
}

fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn v4(a: [u8; 4]) -> IpAddr {
        IpAddr::V4(Ipv4Addr::from(a))
    }

    #[test]
    fn test_parse_built_ipv4_packet() {
        let packet = build_udp(v4([10, 0, 0, 2]), v4([203, 0, 113, 2]), 5353, 53, 64, b"query").unwrap();
        let udp = parse_udp(&packet).unwrap();

        assert_eq!(udp.envelope.src, v4([10, 0, 0, 2]));
        assert_eq!(udp.envelope.dst_port, 53);
        assert_eq!(udp.payload, b"query");
        assert!(is_ipv4(&packet));
    }

    #[test]
    fn test_parse_ipv6_packet() {
        let src = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let dst = IpAddr::V6("2001:db8::2".parse().unwrap());
        let packet = build_udp(src, dst, 1000, 53, 32, b"x").unwrap();
        let udp = parse_udp(&packet).unwrap();

        assert!(is_ipv6(&packet));
        assert_eq!(udp.envelope.dst, dst);
        assert_eq!(udp.envelope.hop_limit, 32);
    }

    #[test]
    fn test_non_udp_and_garbage_are_ignored() {
        assert!(parse_udp(&[]).is_none());
        assert!(parse_udp(&[0x45, 0, 0]).is_none());

        let mut packet = build_udp(v4([1, 1, 1, 1]), v4([2, 2, 2, 2]), 1, 2, 64, b"x").unwrap();
        // protocol = TCP
        packet[9] = 6;
        assert!(parse_udp(&packet).is_none());
        assert!(build_udp(v4([1, 1, 1, 1]), IpAddr::V6(Ipv6Addr::LOCALHOST), 1, 2, 64, b"").is_none());
    }

    /// Checks the reply's addressing against `origin` and both checksums
    /// against a fresh computation.
    fn assert_valid_reply(reply: &[u8], origin: &Envelope, payload: &[u8]) {
        let parsed = parse_udp(reply).unwrap();
        assert_eq!(parsed.envelope.src, origin.dst);
        assert_eq!(parsed.envelope.dst, origin.src);
        assert_eq!(parsed.envelope.src_port, origin.dst_port);
        assert_eq!(parsed.envelope.dst_port, origin.src_port);
        assert_eq!(parsed.payload, payload);

        if is_ipv4(reply) {
            let ip = Ipv4HeaderSlice::from_slice(reply).unwrap();
            assert_eq!(ip.header_checksum(), ip.to_header().calc_header_checksum());
            let udp = UdpHeaderSlice::from_slice(&reply[ip.slice().len()..]).unwrap();
            let expected = udp.to_header().calc_checksum_ipv4(&ip.to_header(), payload).unwrap();
            assert_eq!(udp.checksum(), expected);
        } else {
            let ip = Ipv6HeaderSlice::from_slice(reply).unwrap();
            let udp = UdpHeaderSlice::from_slice(&reply[IPV6_HEADER_LEN..]).unwrap();
            let expected = udp.to_header().calc_checksum_ipv6(&ip.to_header(), payload).unwrap();
            assert_ne!(udp.checksum(), 0);
            assert_eq!(udp.checksum(), expected);
        }
    }

    #[test]
    fn test_to_device_swaps_addressing() {
        let query = build_udp(v4([10, 0, 0, 2]), v4([203, 0, 113, 3]), 40000, 53, 64, b"q").unwrap();
        let origin = parse_udp(&query).unwrap().envelope;

        let reply = to_device(b"answer", &origin).unwrap();
        assert_valid_reply(&reply, &origin, b"answer");
    }

    #[test]
    fn test_to_device_swaps_ipv6_addressing() {
        let device = IpAddr::V6("fdad:b10c:a::2".parse().unwrap());
        let server = IpAddr::V6("2001:db8::53".parse().unwrap());
        let query = build_udp(device, server, 40001, 53, 64, b"q").unwrap();
        let origin = parse_udp(&query).unwrap().envelope;

        let reply = to_device(b"an odd answer", &origin).unwrap();
        assert!(is_ipv6(&reply));
        assert_valid_reply(&reply, &origin, b"an odd answer");
    }

    #[test]
    fn test_rewrite_recomputes_checksums() {
        let mut packet = build_udp(v4([10, 0, 0, 2]), v4([203, 0, 113, 2]), 4000, 53, 64, b"dns!!").unwrap();
        assert!(rewrite_ipv4_destination(&mut packet, Ipv4Addr::new(1, 1, 1, 1)));

        let expected = build_udp(v4([10, 0, 0, 2]), v4([1, 1, 1, 1]), 4000, 53, 64, b"dns!!").unwrap();
        assert_eq!(packet, expected);

        assert!(rewrite_ipv4_source(&mut packet, Ipv4Addr::new(203, 0, 113, 9)));
        assert_eq!(ipv4_source(&packet), Some(Ipv4Addr::new(203, 0, 113, 9)));
        assert_eq!(ipv4_destination(&packet), Some(Ipv4Addr::new(1, 1, 1, 1)));

        let mut v6 = build_udp(IpAddr::V6(Ipv6Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST), 1, 2, 1, b"").unwrap();
        assert!(!rewrite_ipv4_source(&mut v6, Ipv4Addr::LOCALHOST));
    }
}
