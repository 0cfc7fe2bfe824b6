//! Encrypted tunnel mode: device packets are sealed with WireGuard and sent
//! to the gateway; DNS queries to the fake resolvers are still filtered
//! locally first.

use super::buffer::Loopback;
use super::dns::{failure_response, DnsAddressing, Interceptor, Verdict, DNS_PORT};
use super::packet;
use super::proxy::{Proxy, SocketFactory};
use super::sys;
use crate::config::BlockaConfig;
use crate::error::{TunnelError, TunnelResult};
use crate::stats::StatsCollector;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use hickory_server::proto::op::Message;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const TICK_INTERVAL: Duration = Duration::from_millis(500);
pub const MAX_ERRORS: usize = 50;
/// Ticks after which the error count starts over.
pub const ERROR_WINDOW_TICKS: u32 = 60;
/// Forwarded DNS queries allowed without any DNS reply coming back.
pub const MAX_ONE_WAY_DNS_REQUESTS: usize = 10;

/// Datagrams read from the gateway per wakeup.
const RECV_BURST: usize = 16;
/// Room for WireGuard framing on top of the device MTU.
const WG_OVERHEAD: usize = 256;

/// What one call into the WireGuard state machine produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    WriteToNetwork,
    WriteToTunnelV4,
    WriteToTunnelV6,
    Done,
    Error,
}

impl Outcome {
    pub fn of(result: &TunnResult<'_>) -> Self {
        match result {
            TunnResult::Done => Outcome::Done,
            TunnResult::Err(_) => Outcome::Error,
            TunnResult::WriteToNetwork(_) => Outcome::WriteToNetwork,
            TunnResult::WriteToTunnelV4(..) => Outcome::WriteToTunnelV4,
            TunnResult::WriteToTunnelV6(..) => Outcome::WriteToTunnelV6,
        }
    }
}

/// Counts errors over a window of ticks and fails once there were too many.
#[derive(Debug)]
pub struct ErrorBudget {
    max: usize,
    window: u32,
    errors: usize,
    ticks: u32,
}

impl ErrorBudget {
    pub fn new(max: usize, window: u32) -> Self {
        Self {
            max,
            window: window.max(1),
            errors: 0,
            ticks: 0,
        }
    }

    pub fn record(&mut self, what: impl Into<String>) -> TunnelResult<()> {
        self.errors += 1;
        if self.errors > self.max {
            return Err(TunnelError::TooManyErrors(what.into()));
        }
        Ok(())
    }

    pub fn tick(&mut self) {
        self.ticks += 1;
        if self.ticks >= self.window {
            self.ticks = 0;
            self.errors = 0;
        }
    }

    pub fn errors(&self) -> usize {
        self.errors
    }
}

impl Default for ErrorBudget {
    fn default() -> Self {
        Self::new(MAX_ERRORS, ERROR_WINDOW_TICKS)
    }
}

/// Decodes a base64 x25519 key.
pub fn decode_key(encoded: &str) -> TunnelResult<[u8; 32]> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| TunnelError::Config(format!("Invalid key encoding: {}", e)))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| TunnelError::Config(format!("Key must be 32 bytes, got {}", bytes.len())))
}

pub fn gateway_endpoint(config: &BlockaConfig) -> TunnelResult<SocketAddr> {
    let ip: IpAddr = config
        .gateway_ip
        .parse()
        .map_err(|_| TunnelError::Config(format!("Invalid gateway ip: {}", config.gateway_ip)))?;
    Ok(SocketAddr::new(ip, config.gateway_port))
}

/// Everything that consumes WireGuard output, kept apart from the state
/// machine so results borrowing its buffer can be handled in place.
struct Wire {
    gateway: UdpSocket,
    loopback: Loopback,
    stats: Arc<StatsCollector>,
    errors: ErrorBudget,
    addressing: DnsAddressing,
    adblocking: bool,
    one_way_dns: usize,
}

impl Wire {
    fn apply(&mut self, result: TunnResult<'_>) -> TunnelResult<Outcome> {
        let outcome = Outcome::of(&result);
        match result {
            TunnResult::Done => {}
            TunnResult::Err(e) => {
                let what = format!("{:?}", e);
                warn!("WireGuard error: {}", what);
                self.stats.inc_errors();
                self.errors.record(what)?;
            }
            TunnResult::WriteToNetwork(datagram) => self.send(datagram)?,
            TunnResult::WriteToTunnelV4(plain, _) => {
                if self.adblocking {
                    self.restore_dns_source(plain);
                }
                self.loopback.push(plain);
            }
            TunnResult::WriteToTunnelV6(plain, _) => {
                self.loopback.push(plain);
            }
        }
        Ok(outcome)
    }

    fn send(&mut self, datagram: &[u8]) -> TunnelResult<()> {
        match self.gateway.send(datagram) {
            Ok(_) => {
                self.stats.inc_gateway_tx();
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("Gateway socket busy, dropping datagram");
                Ok(())
            }
            Err(e) => {
                let e = TunnelError::from_io(e);
                if e.is_permission() {
                    return Err(e);
                }
                warn!("Failed sending to gateway: {}", e);
                self.stats.inc_errors();
                self.errors.record(e.to_string())
            }
        }
    }

    /// A reply from a real DNS server is made to look like it came from the
    /// fake resolver the device asked.
    fn restore_dns_source(&mut self, plain: &mut [u8]) {
        if packet::parse_udp(plain).is_none() {
            return;
        }
        let Some(source) = packet::ipv4_source(plain) else {
            return;
        };
        if let Some(fake) = self.addressing.fake_for(source) {
            packet::rewrite_ipv4_source(plain, fake);
            self.one_way_dns = 0;
        }
    }
}

pub struct WgProxy {
    tunn: Box<Tunn>,
    interceptor: Interceptor,
    wire: Wire,
    buffer: Box<[u8]>,
    recv: Box<[u8]>,
}

impl WgProxy {
    pub fn new(
        config: &BlockaConfig,
        interceptor: Interceptor,
        sockets: &dyn SocketFactory,
        loopback: Loopback,
        stats: Arc<StatsCollector>,
        mtu: usize,
    ) -> TunnelResult<Self> {
        let private_key = decode_key(&config.private_key)?;
        let gateway_key = decode_key(&config.gateway_id)?;
        let endpoint = gateway_endpoint(config)?;

        let gateway = sockets.udp_socket(endpoint)?;
        gateway.connect(endpoint)?;

        let tunn = Tunn::new(
            StaticSecret::from(private_key),
            PublicKey::from(gateway_key),
            None,
            None,
            0,
            None,
        )
        .map_err(|e| TunnelError::Config(e.to_string()))?;
        info!("WireGuard tunnel to {} ready", endpoint);

        let size = mtu + WG_OVERHEAD;
        Ok(Self {
            tunn: Box::new(tunn),
            wire: Wire {
                gateway,
                loopback,
                stats,
                errors: ErrorBudget::default(),
                addressing: interceptor.addressing().clone(),
                adblocking: config.adblocking,
                one_way_dns: 0,
            },
            interceptor,
            buffer: vec![0u8; size].into_boxed_slice(),
            recv: vec![0u8; size].into_boxed_slice(),
        })
    }

    pub fn gateway_local_addr(&self) -> io::Result<SocketAddr> {
        self.wire.gateway.local_addr()
    }

    pub fn error_count(&self) -> usize {
        self.wire.errors.errors()
    }

    /// Filters DNS queries aimed at the fake resolvers. Returns true when the
    /// packet was answered locally and must not be encrypted.
    fn intercept(&mut self, raw: &mut [u8]) -> TunnelResult<bool> {
        if !packet::is_ipv4(raw) {
            if packet::is_ipv6(raw) {
                debug!("ipv6 ad blocking not supported");
            }
            return Ok(false);
        }
        match packet::ipv4_destination(raw) {
            Some(dst) if DnsAddressing::matches_prefix(dst) => {}
            _ => return Ok(false),
        }

        let upstream = match self.interceptor.inspect(raw) {
            Verdict::Ignore | Verdict::Empty { .. } => return Ok(false),
            Verdict::Deny { response, .. } => {
                self.wire.loopback.push(&response);
                return Ok(true);
            }
            Verdict::Forward {
                host,
                envelope,
                server,
                payload,
            } => match server {
                SocketAddr::V4(v4) if v4.port() == DNS_PORT => *v4.ip(),
                _ => {
                    // Only the destination address is rewritten, so the
                    // query could never reach this server.
                    warn!("Cannot reach {} for {} through the gateway", server, host);
                    if let Some(response) = failure_packet(payload, &envelope) {
                        self.wire.loopback.push(&response);
                    }
                    return Ok(true);
                }
            },
        };

        packet::rewrite_ipv4_destination(raw, upstream);
        self.wire.one_way_dns += 1;
        if self.wire.one_way_dns > MAX_ONE_WAY_DNS_REQUESTS {
            return Err(TunnelError::TooManyErrors(
                "DNS requests are not being answered".to_string(),
            ));
        }
        Ok(false)
    }

    fn encrypt(&mut self, raw: &[u8]) -> TunnelResult<()> {
        let result = self.tunn.encapsulate(raw, &mut self.buffer);
        match self.wire.apply(result)? {
            Outcome::WriteToNetwork => self.drain(),
            Outcome::Done => {
                debug!("did not do anything with packet: {} bytes", raw.len());
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn decrypt(&mut self, len: usize) -> TunnelResult<()> {
        self.wire.stats.inc_gateway_rx();
        let result = self
            .tunn
            .decapsulate(None, &self.recv[..len], &mut self.buffer);
        if self.wire.apply(result)? == Outcome::WriteToNetwork {
            self.drain()?;
        }
        Ok(())
    }

    /// Flushes packets the state machine queued, e.g. while a handshake was
    /// in flight.
    fn drain(&mut self) -> TunnelResult<()> {
        loop {
            let result = self.tunn.decapsulate(None, &[], &mut self.buffer);
            if self.wire.apply(result)? != Outcome::WriteToNetwork {
                return Ok(());
            }
        }
    }
}

/// SERVFAIL for `query`, addressed back to the device.
fn failure_packet(query: &[u8], envelope: &packet::Envelope) -> Option<Vec<u8>> {
    let message = Message::from_vec(query).ok()?;
    let dns = failure_response(message).ok()?;
    packet::to_device(&dns, envelope)
}

impl Proxy for WgProxy {
    fn from_device(&mut self, raw: &mut [u8]) -> TunnelResult<()> {
        if self.wire.adblocking && self.intercept(raw)? {
            return Ok(());
        }
        self.encrypt(raw)
    }

    fn register(&self, fds: &mut Vec<libc::pollfd>) {
        fds.push(sys::pollfd(self.wire.gateway.as_raw_fd(), libc::POLLIN));
    }

    fn on_ready(&mut self, fds: &[libc::pollfd]) -> TunnelResult<()> {
        let Some(fd) = fds.first() else {
            return Ok(());
        };
        if sys::hung_up(fd) {
            return Err(TunnelError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "gateway socket closed",
            )));
        }
        if !sys::has_event(fd, libc::POLLIN) {
            return Ok(());
        }
        for _ in 0..RECV_BURST {
            match self.wire.gateway.recv(&mut self.recv) {
                Ok(n) => self.decrypt(n)?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(TunnelError::from_io(e)),
            }
        }
        Ok(())
    }

    fn tick(&mut self) -> TunnelResult<()> {
        self.wire.errors.tick();
        let result = self.tunn.update_timers(&mut self.buffer);
        if self.wire.apply(result)? == Outcome::WriteToNetwork {
            self.drain()?;
        }
        Ok(())
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(TICK_INTERVAL)
    }

    fn loopback(&mut self) -> &mut Loopback {
        &mut self.wire.loopback
    }

    fn cleanup(&mut self) {
        if !self.wire.loopback.is_consistent() {
            warn!("Loopback buffers leaked, resetting queue");
            self.wire.loopback.clear();
        }
    }

    fn close(&mut self) {
        self.wire.loopback.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::tunnel::dns::tests::{query_packet, StaticMatcher};
    use crate::tunnel::proxy::ProtectedSockets;
    use std::net::Ipv4Addr;

    const CLIENT_SECRET: [u8; 32] = [1; 32];
    const GATEWAY_SECRET: [u8; 32] = [2; 32];

    fn public(secret: [u8; 32]) -> [u8; 32] {
        *PublicKey::from(&StaticSecret::from(secret)).as_bytes()
    }

    struct Gateway {
        tunn: Tunn,
        socket: UdpSocket,
        buf: Vec<u8>,
        peer: Option<SocketAddr>,
    }

    impl Gateway {
        fn new() -> Self {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            socket
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();
            Self {
                tunn: Tunn::new(
                    StaticSecret::from(GATEWAY_SECRET),
                    PublicKey::from(public(CLIENT_SECRET)),
                    None,
                    None,
                    1,
                    None,
                )
                .unwrap(),
                socket,
                buf: vec![0u8; 2048],
                peer: None,
            }
        }

        /// Handles one datagram and returns any decrypted packet.
        fn recv_once(&mut self) -> Option<Vec<u8>> {
            let mut datagram = [0u8; 2048];
            let (n, from) = self.socket.recv_from(&mut datagram).unwrap();
            self.peer = Some(from);
            let mut result = self.tunn.decapsulate(Some(from.ip()), &datagram[..n], &mut self.buf);
            loop {
                match result {
                    TunnResult::WriteToNetwork(out) => {
                        self.socket.send_to(out, from).unwrap();
                        result = self.tunn.decapsulate(None, &[], &mut self.buf);
                    }
                    TunnResult::WriteToTunnelV4(plain, _) => return Some(plain.to_vec()),
                    _ => return None,
                }
            }
        }

        fn send_plain(&mut self, plain: &[u8]) {
            match self.tunn.encapsulate(plain, &mut self.buf) {
                TunnResult::WriteToNetwork(out) => {
                    self.socket.send_to(out, self.peer.unwrap()).unwrap();
                }
                other => panic!("expected network write, got {:?}", Outcome::of(&other)),
            }
        }
    }

    fn config(gateway: SocketAddr) -> BlockaConfig {
        BlockaConfig {
            private_key: STANDARD.encode(CLIENT_SECRET),
            gateway_id: STANDARD.encode(public(GATEWAY_SECRET)),
            gateway_ip: gateway.ip().to_string(),
            gateway_port: gateway.port(),
            vpn: true,
            ..BlockaConfig::default()
        }
    }

    fn proxy(config: &BlockaConfig) -> WgProxy {
        proxy_with(config, vec!["1.1.1.1:53".parse().unwrap()])
    }

    fn proxy_with(config: &BlockaConfig, servers: Vec<SocketAddr>) -> WgProxy {
        let stats = StatsCollector::new();
        let interceptor = Interceptor::new(
            Arc::new(StaticMatcher {
                denied: vec!["ads.example.com"],
                allowed: vec![],
            }),
            DnsAddressing::new(servers),
            EventBus::new(),
            stats.clone(),
        );
        WgProxy::new(
            config,
            interceptor,
            &ProtectedSockets::default(),
            Loopback::new(8, 1600),
            stats,
            1600,
        )
        .unwrap()
    }

    fn pump(proxy: &mut WgProxy) {
        let mut fds = Vec::new();
        proxy.register(&mut fds);
        sys::poll(&mut fds, 2000).unwrap();
        proxy.on_ready(&fds).unwrap();
    }

    #[test]
    fn test_error_budget_resets_per_window() {
        let mut budget = ErrorBudget::new(2, 3);
        assert!(budget.record("a").is_ok());
        assert!(budget.record("b").is_ok());
        budget.tick();
        budget.tick();
        budget.tick();
        assert_eq!(budget.errors(), 0);
        assert!(budget.record("c").is_ok());
        assert!(budget.record("d").is_ok());
        assert!(matches!(budget.record("e"), Err(TunnelError::TooManyErrors(_))));
    }

    #[test]
    fn test_decode_key() {
        assert_eq!(decode_key(&STANDARD.encode([7u8; 32])).unwrap(), [7u8; 32]);
        assert!(decode_key("not base64!").is_err());
        assert!(decode_key(&STANDARD.encode([7u8; 16])).is_err());
    }

    #[test]
    fn test_bad_gateway_config_is_rejected() {
        let mut config = config("127.0.0.1:51820".parse().unwrap());
        config.gateway_ip = "nowhere".into();
        assert!(matches!(gateway_endpoint(&config), Err(TunnelError::Config(_))));
    }

    #[test]
    fn test_blocked_dns_never_leaves_the_device() {
        let gateway = Gateway::new();
        let mut proxy = proxy(&config(gateway.socket.local_addr().unwrap()));
        let mut raw = query_packet("ads.example.com.", Ipv4Addr::new(203, 0, 113, 2));

        proxy.from_device(&mut raw).unwrap();

        assert_eq!(proxy.loopback().len(), 1);
        gateway
            .socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut buf = [0u8; 64];
        assert!(gateway.socket.recv_from(&mut buf).is_err());
    }

    #[test]
    fn test_unroutable_upstream_gets_servfail() {
        let gateway = Gateway::new();
        let servers = vec![
            "[2606:4700::1111]:53".parse().unwrap(),
            "8.8.8.8:5353".parse().unwrap(),
        ];
        let mut proxy = proxy_with(&config(gateway.socket.local_addr().unwrap()), servers);

        for (index, fake) in [(0u8, 2u8), (1, 3)] {
            let mut raw = query_packet("good.example.com.", Ipv4Addr::new(203, 0, 113, fake));
            proxy.from_device(&mut raw).unwrap();

            assert_eq!(proxy.loopback().len(), usize::from(index) + 1);
        }
        while let Some(reply) = proxy.loopback().front().map(<[u8]>::to_vec) {
            let udp = packet::parse_udp(&reply).unwrap();
            let message = Message::from_vec(udp.payload).unwrap();
            assert_eq!(
                message.response_code(),
                hickory_server::proto::op::ResponseCode::ServFail
            );
            assert_eq!(udp.envelope.dst_port, 40000);
            proxy.loopback().pop();
        }

        gateway
            .socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut buf = [0u8; 64];
        assert!(gateway.socket.recv_from(&mut buf).is_err());
    }

    #[test]
    fn test_unanswered_dns_trips_the_limit() {
        let gateway = Gateway::new();
        let mut proxy = proxy(&config(gateway.socket.local_addr().unwrap()));

        for _ in 0..MAX_ONE_WAY_DNS_REQUESTS {
            let mut raw = query_packet("good.example.com.", Ipv4Addr::new(203, 0, 113, 2));
            proxy.from_device(&mut raw).unwrap();
        }
        let mut raw = query_packet("good.example.com.", Ipv4Addr::new(203, 0, 113, 2));
        let err = proxy.from_device(&mut raw).unwrap_err();
        assert!(matches!(err, TunnelError::TooManyErrors(_)));
    }

    #[test]
    fn test_dns_roundtrip_through_gateway() {
        let mut gateway = Gateway::new();
        let mut proxy = proxy(&config(gateway.socket.local_addr().unwrap()));

        let mut query = query_packet("good.example.com.", Ipv4Addr::new(203, 0, 113, 2));
        proxy.from_device(&mut query).unwrap();

        // Handshake initiation, answered by the gateway.
        assert!(gateway.recv_once().is_none());
        pump(&mut proxy);

        // Keepalive and the queued query follow, with the real resolver as
        // destination.
        let mut delivered = None;
        for _ in 0..3 {
            if let Some(plain) = gateway.recv_once() {
                delivered = Some(plain);
                break;
            }
        }
        let delivered = delivered.expect("query never reached the gateway");
        assert_eq!(packet::ipv4_destination(&delivered), Some(Ipv4Addr::new(1, 1, 1, 1)));

        let reply = packet::build_udp(
            IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            53,
            40000,
            64,
            b"answer",
        )
        .unwrap();
        gateway.send_plain(&reply);
        pump(&mut proxy);

        let looped = proxy.loopback().front().map(<[u8]>::to_vec).unwrap();
        assert_eq!(packet::ipv4_source(&looped), Some(Ipv4Addr::new(203, 0, 113, 2)));
        assert_eq!(packet::parse_udp(&looped).unwrap().payload, b"answer");
        assert_eq!(proxy.error_count(), 0);
    }
}
