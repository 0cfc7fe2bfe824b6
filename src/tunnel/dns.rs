//! DNS interception: decides whether a query leaves the device or gets a
//! synthetic "no such host" answer.

use super::packet::{self, Envelope};
use crate::engine::DomainMatcher;
use crate::events::{Event, EventBus};
use crate::logger::Request;
use crate::stats::StatsCollector;
use hickory_server::proto::error::ProtoResult;
use hickory_server::proto::op::{Message, MessageType, ResponseCode};
use hickory_server::proto::rr::rdata::SOA;
use hickory_server::proto::rr::{Name, RData, Record};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, warn};

pub const DNS_PORT: u16 = 53;

/// Zone named in the SOA record of every deny response.
pub const DENY_ZONE: &str = "org.blokada.invalid.";
pub const DENY_TTL: u32 = 5;

/// TEST-NET-3 and the IPv6 documentation prefix. The device is told to use
/// these as its resolvers; the low octet selects the real upstream server.
pub const FAKE_DNS_PREFIX_V4: [u8; 3] = [203, 0, 113];
pub const FAKE_DNS_PREFIX_V6: [u16; 7] = [0x2001, 0x0db8, 0, 0, 0, 0, 0];

// Octet 1 belongs to the gateway, so server n lives at n + 2.
const INDEX_OFFSET: usize = 2;

/// Maps fake resolver addresses to the configured upstream servers.
#[derive(Debug, Clone, Default)]
pub struct DnsAddressing {
    servers: Vec<SocketAddr>,
}

impl DnsAddressing {
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        Self { servers }
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn fake_v4(index: usize) -> Option<Ipv4Addr> {
        let octet = u8::try_from(index + INDEX_OFFSET).ok().filter(|o| *o < 255)?;
        let [a, b, c] = FAKE_DNS_PREFIX_V4;
        Some(Ipv4Addr::new(a, b, c, octet))
    }

    pub fn fake_v6(index: usize) -> Option<Ipv6Addr> {
        let low = u16::try_from(index + INDEX_OFFSET).ok()?;
        let [a, b, c, d, e, f, g] = FAKE_DNS_PREFIX_V6;
        Some(Ipv6Addr::new(a, b, c, d, e, f, g, low))
    }

    /// Fake IPv4 addresses for every configured server, in order.
    pub fn fake_servers_v4(&self) -> Vec<Ipv4Addr> {
        (0..self.servers.len()).filter_map(Self::fake_v4).collect()
    }

    pub fn fake_servers_v6(&self) -> Vec<Ipv6Addr> {
        (0..self.servers.len()).filter_map(Self::fake_v6).collect()
    }

    /// True if `dst` lies in the fake IPv4 resolver range.
    pub fn matches_prefix(dst: Ipv4Addr) -> bool {
        dst.octets()[..3] == FAKE_DNS_PREFIX_V4
    }

    /// The upstream server a fake destination stands for.
    pub fn server_for(&self, dst: IpAddr) -> Option<SocketAddr> {
        let low = match dst {
            IpAddr::V4(v4) => v4.octets()[3],
            IpAddr::V6(v6) => v6.octets()[15],
        };
        let index = (low as usize).checked_sub(INDEX_OFFSET)?;
        self.servers.get(index).copied()
    }

    /// Like [`DnsAddressing::server_for`] but falls back to `dst` itself on
    /// the DNS port.
    pub fn resolve(&self, dst: IpAddr) -> SocketAddr {
        self.server_for(dst)
            .unwrap_or_else(|| SocketAddr::new(dst, DNS_PORT))
    }

    /// The fake IPv4 address standing for an upstream server address.
    pub fn fake_for(&self, server: Ipv4Addr) -> Option<Ipv4Addr> {
        let index = self
            .servers
            .iter()
            .position(|s| s.ip() == IpAddr::V4(server))?;
        Self::fake_v4(index)
    }
}

fn deny_soa() -> ProtoResult<Record> {
    let zone = Name::from_ascii(DENY_ZONE)?;
    let soa = SOA::new(zone.clone(), zone.clone(), 0, 0, 0, 0, DENY_TTL);
    Ok(Record::from_rdata(zone, DENY_TTL, RData::SOA(soa)))
}

/// Turns a query into a NOERROR answer with an SOA for the deny zone in the
/// authority section and no answers. The question is echoed.
pub fn deny_response(mut query: Message) -> ProtoResult<Vec<u8>> {
    query.set_message_type(MessageType::Response);
    query.set_response_code(ResponseCode::NoError);
    query.add_name_server(deny_soa()?);
    query.to_vec()
}

/// SERVFAIL for a query that cannot be forwarded. The question is echoed.
pub fn failure_response(mut query: Message) -> ProtoResult<Vec<u8>> {
    query.set_message_type(MessageType::Response);
    query.set_response_code(ResponseCode::ServFail);
    query.to_vec()
}

/// Lower-cased name of the first question, without the trailing dot.
pub fn question_host(message: &Message) -> Option<String> {
    let query = message.queries().first()?;
    let host = query.name().to_ascii();
    let host = host.trim_end_matches('.');
    if host.is_empty() {
        return None;
    }
    Some(host.to_lowercase())
}

#[derive(Debug)]
pub enum Verdict<'a> {
    /// Not a DNS query we understand; leave it alone.
    Ignore,
    /// A UDP datagram without payload, to be passed on unfiltered.
    Empty { envelope: Envelope, server: SocketAddr },
    Forward {
        host: String,
        envelope: Envelope,
        server: SocketAddr,
        payload: &'a [u8],
    },
    /// `response` is a complete IP packet addressed back to the device.
    Deny { host: String, response: Vec<u8> },
}

pub struct Interceptor {
    matcher: Arc<dyn DomainMatcher>,
    addressing: DnsAddressing,
    events: EventBus,
    stats: Arc<StatsCollector>,
}

impl Interceptor {
    pub fn new(
        matcher: Arc<dyn DomainMatcher>,
        addressing: DnsAddressing,
        events: EventBus,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            matcher,
            addressing,
            events,
            stats,
        }
    }

    pub fn addressing(&self) -> &DnsAddressing {
        &self.addressing
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        !(self.matcher.allowed(host) || !self.matcher.denied(host))
    }

    pub fn inspect<'a>(&self, raw: &'a [u8]) -> Verdict<'a> {
        let Some(udp) = packet::parse_udp(raw) else {
            return Verdict::Ignore;
        };
        let envelope = udp.envelope;
        let server = self.addressing.resolve(envelope.dst);

        if udp.payload.is_empty() {
            return Verdict::Empty {
                envelope,
                server: SocketAddr::new(server.ip(), envelope.dst_port),
            };
        }

        let message = match Message::from_vec(udp.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed reading DNS message: {}", e);
                return Verdict::Ignore;
            }
        };
        let Some(host) = question_host(&message) else {
            return Verdict::Ignore;
        };

        if !self.is_blocked(&host) {
            self.stats.inc_forwarded();
            self.events.emit(Event::Request(Request::new(host.clone(), false)));
            return Verdict::Forward {
                host,
                envelope,
                server,
                payload: udp.payload,
            };
        }

        let response = match deny_response(message) {
            Ok(dns) => packet::to_device(&dns, &envelope),
            Err(e) => {
                warn!("Failed building deny response for {}: {}", host, e);
                None
            }
        };
        let Some(response) = response else {
            return Verdict::Ignore;
        };
        debug!("Blocked {}", host);
        self.stats.inc_blocked();
        self.events.emit(Event::Request(Request::new(host.clone(), true)));
        Verdict::Deny { host, response }
    }
}
