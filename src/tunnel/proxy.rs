//! The seam between the poll loop and a tunnel mode, plus the plain DNS mode.

use super::buffer::Loopback;
use super::dns::{Interceptor, Verdict};
use super::forwarder::Forwarder;
use super::packet::{self, Envelope};
use super::sys;
use crate::error::{TunnelError, TunnelResult};
use crate::stats::StatsCollector;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One tunnel mode as seen by the runner.
///
/// Each loop iteration the runner asks the proxy for its descriptors, polls,
/// hands back exactly the slice it registered via [`Proxy::on_ready`], then
/// feeds at most one device packet through [`Proxy::from_device`].
pub trait Proxy: Send {
    /// Handles one packet read from the device. The packet may be rewritten
    /// in place.
    fn from_device(&mut self, packet: &mut [u8]) -> TunnelResult<()>;

    /// Appends the descriptors this proxy wants polled for reading.
    fn register(&self, fds: &mut Vec<libc::pollfd>);

    /// Called with the descriptors appended by the last [`Proxy::register`],
    /// in the same order, after poll filled in `revents`.
    fn on_ready(&mut self, fds: &[libc::pollfd]) -> TunnelResult<()>;

    /// Periodic protocol housekeeping.
    fn tick(&mut self) -> TunnelResult<()> {
        Ok(())
    }

    /// How often [`Proxy::tick`] must run; `None` lets the loop block on
    /// poll indefinitely.
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    /// Packets waiting to be written to the device.
    fn loopback(&mut self) -> &mut Loopback;

    /// Bounded-memory sweep, run every so many iterations.
    fn cleanup(&mut self);

    /// Releases every socket. Called on each exit path of the loop.
    fn close(&mut self);
}

impl<P: Proxy + ?Sized> Proxy for Box<P> {
    fn from_device(&mut self, packet: &mut [u8]) -> TunnelResult<()> {
        (**self).from_device(packet)
    }

    fn register(&self, fds: &mut Vec<libc::pollfd>) {
        (**self).register(fds)
    }

    fn on_ready(&mut self, fds: &[libc::pollfd]) -> TunnelResult<()> {
        (**self).on_ready(fds)
    }

    fn tick(&mut self) -> TunnelResult<()> {
        (**self).tick()
    }

    fn tick_interval(&self) -> Option<Duration> {
        (**self).tick_interval()
    }

    fn loopback(&mut self) -> &mut Loopback {
        (**self).loopback()
    }

    fn cleanup(&mut self) {
        (**self).cleanup()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Decides whether a raw socket may bypass the tunnel. Returning false only
/// logs; the socket is still used.
pub type ProtectFn = Arc<dyn Fn(RawFd) -> bool + Send + Sync>;

/// Creates the outbound UDP sockets a proxy sends on.
pub trait SocketFactory: Send + Sync {
    fn udp_socket(&self, target: SocketAddr) -> io::Result<UdpSocket>;
}

/// Binds an ephemeral socket of the target's family and runs the protect
/// hook on it, so its traffic is not routed back into the tunnel.
#[derive(Clone, Default)]
pub struct ProtectedSockets {
    protect: Option<ProtectFn>,
}

impl ProtectedSockets {
    pub fn new(protect: Option<ProtectFn>) -> Self {
        Self { protect }
    }

    pub fn protect(&self, socket: &UdpSocket) {
        if let Some(protect) = &self.protect {
            if !protect(socket.as_raw_fd()) {
                warn!("Could not protect socket, traffic may loop through the tunnel");
            }
        }
    }
}

impl SocketFactory for ProtectedSockets {
    fn udp_socket(&self, target: SocketAddr) -> io::Result<UdpSocket> {
        let local = match target {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(local)?;
        self.protect(&socket);
        socket.set_nonblocking(true)?;
        Ok(socket)
    }
}

/// DNS-only mode: allowed queries go straight to the upstream resolver over
/// a fresh socket, blocked ones are answered locally.
pub struct DnsProxy {
    interceptor: Interceptor,
    forwarder: Forwarder,
    sockets: Arc<dyn SocketFactory>,
    loopback: Loopback,
    stats: Arc<StatsCollector>,
    reply: Box<[u8]>,
}

impl DnsProxy {
    pub fn new(
        interceptor: Interceptor,
        forwarder: Forwarder,
        sockets: Arc<dyn SocketFactory>,
        loopback: Loopback,
        stats: Arc<StatsCollector>,
    ) -> Self {
        // A reply never needs more room than the packet it ends up in.
        let reply = vec![0u8; loopback.packet_size()].into_boxed_slice();
        Self {
            interceptor,
            forwarder,
            sockets,
            loopback,
            stats,
            reply,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.forwarder.len()
    }

    /// Sends `payload` to `server` on a new socket. With an envelope the
    /// socket is kept until the reply arrives; without one it is closed
    /// right away.
    fn forward(&mut self, payload: &[u8], server: SocketAddr, origin: Option<Envelope>) -> TunnelResult<()> {
        let socket = match self.sockets.udp_socket(server) {
            Ok(socket) => socket,
            Err(e) => return self.send_failed(e),
        };
        if let Err(e) = socket.send_to(payload, server) {
            return self.send_failed(e);
        }
        if let Some(origin) = origin {
            self.forwarder.add(socket, origin);
        }
        Ok(())
    }

    fn send_failed(&self, e: io::Error) -> TunnelResult<()> {
        let e = TunnelError::from_io(e);
        if e.is_permission() {
            return Err(e);
        }
        warn!("Failed sending forwarded udp: {}", e);
        self.stats.inc_errors();
        Ok(())
    }

    fn receive(&mut self, index: usize) {
        let Some(rule) = self.forwarder.take(index) else {
            return;
        };
        let n = match rule.socket.recv(&mut self.reply) {
            Ok(n) => n,
            Err(e) => {
                warn!("Failed receiving forwarded reply: {}", e);
                return;
            }
        };
        match packet::to_device(&self.reply[..n], &rule.envelope) {
            Some(response) => {
                self.loopback.push(&response);
            }
            None => debug!("Could not address reply back to {:?}", rule.envelope.src),
        }
    }
}

impl Proxy for DnsProxy {
    fn from_device(&mut self, packet: &mut [u8]) -> TunnelResult<()> {
        match self.interceptor.inspect(packet) {
            Verdict::Ignore => Ok(()),
            Verdict::Empty { server, .. } => self.forward(&[], server, None),
            Verdict::Forward {
                envelope,
                server,
                payload,
                ..
            } => self.forward(payload, server, Some(envelope)),
            Verdict::Deny { response, .. } => {
                self.loopback.push(&response);
                Ok(())
            }
        }
    }

    fn register(&self, fds: &mut Vec<libc::pollfd>) {
        fds.extend(
            self.forwarder
                .iter()
                .map(|rule| sys::pollfd(rule.socket.as_raw_fd(), libc::POLLIN)),
        );
    }

    fn on_ready(&mut self, fds: &[libc::pollfd]) -> TunnelResult<()> {
        // Back to front so earlier indices stay valid while rules are taken.
        for (index, fd) in fds.iter().enumerate().rev() {
            if sys::has_event(fd, libc::POLLIN) {
                self.receive(index);
            } else if sys::hung_up(fd) {
                self.forwarder.take(index);
            }
        }
        Ok(())
    }

    fn loopback(&mut self) -> &mut Loopback {
        &mut self.loopback
    }

    fn cleanup(&mut self) {
        let evicted = self.forwarder.evict_expired();
        if evicted > 0 {
            debug!("Evicted {} stale forward rules", evicted);
        }
        if !self.loopback.is_consistent() {
            warn!("Loopback buffers leaked, resetting queue");
            self.loopback.clear();
        }
    }

    fn close(&mut self) {
        self.forwarder.clear();
        self.loopback.clear();
    }
}
