//! The poll loop that moves packets between the device and a [`Proxy`], and
//! the retry loop around it.

use super::proxy::Proxy;
use super::sys;
use crate::error::{TunnelError, TunnelResult};
use crate::events::{Event, EventBus};
use crate::stats::StatsCollector;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Iterations between two [`Proxy::cleanup`] calls.
pub const CLEANUP_EVERY: u64 = 1024;
pub const COOLDOWN_BASE: Duration = Duration::from_millis(300);
pub const COOLDOWN_MAX: Duration = Duration::from_millis(3000);
/// Consecutive EPERM failures that, with powersave on, mean the OS is
/// cutting the app off.
pub const EPERM_LIMIT: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    pub mtu: usize,
    pub powersave: bool,
}

pub struct TunnelRunner {
    device: Arc<OwnedFd>,
    stop: Arc<OwnedFd>,
    events: EventBus,
    stats: Arc<StatsCollector>,
    settings: RunnerSettings,
    cooldown_counter: u32,
    eperm_counter: u32,
    iterations: u64,
}

impl TunnelRunner {
    /// `stop` is the read end of a pipe; any event on it, including the
    /// hang-up from closing the write end, ends the loop.
    pub fn new(
        device: Arc<OwnedFd>,
        stop: Arc<OwnedFd>,
        events: EventBus,
        stats: Arc<StatsCollector>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            device,
            stop,
            events,
            stats,
            settings,
            cooldown_counter: 1,
            eperm_counter: 0,
            iterations: 0,
        }
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Runs one attempt until it fails, is stopped or the device closes.
    /// The proxy is closed on every exit path.
    pub fn run<P: Proxy>(&mut self, proxy: &mut P) -> TunnelResult<()> {
        debug!("Running tunnel thread");
        let result = self.poll_loop(proxy);
        debug!("Cleaning up tunnel resources");
        proxy.close();

        if let Err(e) = &result {
            if e.is_permission() {
                self.eperm_counter += 1;
                if self.eperm_counter >= EPERM_LIMIT && self.settings.powersave {
                    warn!("Repeated permission errors, the system is likely saving power");
                    self.events.emit(Event::TunnelPowerSaving);
                    self.eperm_counter = 0;
                }
            } else if !e.is_interrupted() {
                self.eperm_counter = 0;
            }
        }
        result
    }

    /// Keeps the tunnel running, building a fresh proxy for each attempt,
    /// until it is stopped or the device goes away.
    pub fn run_with_retry<P, F>(&mut self, mut make_proxy: F)
    where
        P: Proxy,
        F: FnMut() -> TunnelResult<P>,
    {
        loop {
            let result = make_proxy().and_then(|mut proxy| self.run(&mut proxy));
            match result {
                Ok(()) => {
                    info!("Device closed, tunnel thread exiting");
                    break;
                }
                Err(e) if e.is_interrupted() => {
                    debug!("Tunnel thread interrupted");
                    break;
                }
                Err(e) => {
                    self.events.emit(Event::TunnelRestart);
                    let cooldown = self.next_cooldown();
                    error!("Tunnel thread error, will restart after {:?}: {}", cooldown, e);
                    if self.wait_for_stop(cooldown) {
                        break;
                    }
                }
            }
        }
        info!("Tunnel thread shutdown");
    }

    /// Doubles on every failure, starts over after a clean loop iteration.
    fn next_cooldown(&mut self) -> Duration {
        let cooldown = COOLDOWN_BASE
            .saturating_mul(self.cooldown_counter)
            .min(COOLDOWN_MAX);
        self.cooldown_counter = self.cooldown_counter.saturating_mul(2);
        cooldown
    }

    /// Sleeps for `timeout` unless a stop arrives first. Returns true if it
    /// did.
    fn wait_for_stop(&self, timeout: Duration) -> bool {
        let mut fds = [sys::pollfd(self.stop.as_raw_fd(), libc::POLLIN)];
        match sys::poll(&mut fds, timeout.as_millis() as i32) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => {
                warn!("Failed waiting for restart: {}", e);
                true
            }
        }
    }

    fn poll_loop<P: Proxy>(&mut self, proxy: &mut P) -> TunnelResult<()> {
        let mut buffer = vec![0u8; self.settings.mtu];
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(8);
        let tick_every = proxy.tick_interval();
        let timeout = tick_every.map_or(-1, |every| every.as_millis() as i32);
        let mut last_tick = Instant::now();

        loop {
            fds.clear();
            fds.push(sys::pollfd(self.stop.as_raw_fd(), libc::POLLIN));
            let mut device_events = libc::POLLIN;
            if !proxy.loopback().is_empty() {
                device_events |= libc::POLLOUT;
            }
            fds.push(sys::pollfd(self.device.as_raw_fd(), device_events));
            proxy.register(&mut fds);

            sys::poll(&mut fds, timeout)?;

            if fds[0].revents != 0 {
                return Err(TunnelError::Interrupted);
            }
            let device = fds[1];
            if sys::has_event(&device, libc::POLLNVAL) {
                return Err(TunnelError::BadDescriptor(io::Error::from_raw_os_error(
                    libc::EBADF,
                )));
            }
            if sys::has_event(&device, libc::POLLERR) {
                return Err(TunnelError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "device reported an error",
                )));
            }

            if sys::has_event(&device, libc::POLLOUT) {
                self.to_device(proxy)?;
            }
            proxy.on_ready(&fds[2..])?;

            if sys::has_event(&device, libc::POLLIN | libc::POLLHUP) {
                match sys::read(self.device.as_fd(), &mut buffer) {
                    Ok(0) => return Ok(()),
                    Ok(n) => {
                        self.stats.inc_from_device();
                        proxy.from_device(&mut buffer[..n])?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(TunnelError::from_io(e)),
                }
            }

            if let Some(every) = tick_every {
                if last_tick.elapsed() >= every {
                    proxy.tick()?;
                    last_tick = Instant::now();
                }
            }

            self.iterations += 1;
            if self.iterations % CLEANUP_EVERY == 0 {
                proxy.cleanup();
            }
            self.cooldown_counter = 1;
        }
    }

    /// Writes queued packets until the queue is empty or the device would
    /// block.
    fn to_device<P: Proxy>(&self, proxy: &mut P) -> TunnelResult<()> {
        let loopback = proxy.loopback();
        while let Some(packet) = loopback.front() {
            match sys::write(self.device.as_fd(), packet) {
                Ok(_) => {
                    self.stats.inc_to_device();
                    loopback.pop();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(TunnelError::from_io(e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::buffer::Loopback;
    use std::os::unix::net::UnixDatagram;

    /// Echoes every device packet back through the loopback and can be told
    /// to fail.
    struct EchoProxy {
        loopback: Loopback,
        fail_with: Option<fn() -> TunnelError>,
        closed: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl EchoProxy {
        fn new(closed: Arc<std::sync::atomic::AtomicUsize>) -> Self {
            Self {
                loopback: Loopback::new(4, 64),
                fail_with: None,
                closed,
            }
        }
    }

    impl Proxy for EchoProxy {
        fn from_device(&mut self, packet: &mut [u8]) -> TunnelResult<()> {
            if let Some(fail) = self.fail_with {
                return Err(fail());
            }
            self.loopback.push(packet);
            Ok(())
        }

        fn register(&self, _fds: &mut Vec<libc::pollfd>) {}

        fn on_ready(&mut self, _fds: &[libc::pollfd]) -> TunnelResult<()> {
            Ok(())
        }

        fn loopback(&mut self) -> &mut Loopback {
            &mut self.loopback
        }

        fn cleanup(&mut self) {}

        fn close(&mut self) {
            self.closed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.loopback.clear();
        }
    }

    /// Moves every datagram waiting on its socket into the loopback, a few
    /// at a time, the way the gateway proxy reads.
    struct BurstProxy {
        loopback: Loopback,
        socket: std::net::UdpSocket,
    }

    impl Proxy for BurstProxy {
        fn from_device(&mut self, _packet: &mut [u8]) -> TunnelResult<()> {
            Ok(())
        }

        fn register(&self, fds: &mut Vec<libc::pollfd>) {
            fds.push(sys::pollfd(self.socket.as_raw_fd(), libc::POLLIN));
        }

        fn on_ready(&mut self, fds: &[libc::pollfd]) -> TunnelResult<()> {
            if !fds.first().is_some_and(|fd| sys::has_event(fd, libc::POLLIN)) {
                return Ok(());
            }
            let mut buf = [0u8; 64];
            for _ in 0..16 {
                match self.socket.recv(&mut buf) {
                    Ok(n) => {
                        self.loopback.push(&buf[..n]);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(TunnelError::from_io(e)),
                }
            }
            Ok(())
        }

        fn loopback(&mut self) -> &mut Loopback {
            &mut self.loopback
        }

        fn cleanup(&mut self) {}

        fn close(&mut self) {
            self.loopback.clear();
        }
    }

    fn device() -> (Arc<OwnedFd>, UnixDatagram) {
        let (ours, theirs) = UnixDatagram::pair().unwrap();
        (Arc::new(OwnedFd::from(ours)), theirs)
    }

    fn runner(device: Arc<OwnedFd>, stop: OwnedFd, events: EventBus, powersave: bool) -> TunnelRunner {
        TunnelRunner::new(
            device,
            Arc::new(stop),
            events,
            StatsCollector::new(),
            RunnerSettings { mtu: 64, powersave },
        )
    }

    #[test]
    fn test_echo_then_device_close() {
        let (device, peer) = device();
        let (stop_rx, _stop_tx) = sys::pipe().unwrap();
        let mut runner = runner(device, stop_rx, EventBus::new(), false);
        let closed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut proxy = EchoProxy::new(closed.clone());

        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let worker = std::thread::spawn(move || {
            peer.send(b"ping").unwrap();
            let mut buf = [0u8; 16];
            let n = peer.recv(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"ping");
            // A zero-length datagram reads as end of stream.
            peer.send(b"").unwrap();
        });

        assert!(runner.run(&mut proxy).is_ok());
        worker.join().unwrap();
        assert!(runner.iterations() >= 2);
        assert_eq!(closed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_loopback_drains_whole_bursts() {
        const PACKETS: u32 = 100;
        let (device, peer) = device();
        let (stop_rx, _stop_tx) = sys::pipe().unwrap();
        let mut runner = runner(device, stop_rx, EventBus::new(), false);

        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        for i in 0..PACKETS {
            sender.send_to(&i.to_be_bytes(), socket.local_addr().unwrap()).unwrap();
        }
        let mut proxy = BurstProxy {
            loopback: Loopback::new(64, 64),
            socket,
        };

        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let reader = std::thread::spawn(move || {
            let mut received = Vec::new();
            let mut buf = [0u8; 64];
            while received.len() < PACKETS as usize {
                match peer.recv(&mut buf) {
                    Ok(n) => received.push(buf[..n].to_vec()),
                    Err(_) => break,
                }
            }
            peer.send(b"").unwrap();
            received
        });

        assert!(runner.run(&mut proxy).is_ok());
        let received = reader.join().unwrap();
        assert_eq!(received.len(), PACKETS as usize);
        let expected: Vec<Vec<u8>> = (0..PACKETS).map(|i| i.to_be_bytes().to_vec()).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_closing_the_pipe_interrupts() {
        let (device, _peer) = device();
        let (stop_rx, stop_tx) = sys::pipe().unwrap();
        let mut runner = runner(device, stop_rx, EventBus::new(), false);
        let closed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        drop(stop_tx);

        let err = runner.run(&mut EchoProxy::new(closed.clone())).unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(closed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_repeated_eperm_signals_power_saving() {
        let (device, peer) = device();
        let (stop_rx, _stop_tx) = sys::pipe().unwrap();
        let events = EventBus::new();
        let rx = events.subscribe();
        let mut runner = runner(device, stop_rx, events, true);
        let closed = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        for _ in 0..EPERM_LIMIT {
            peer.send(b"x").unwrap();
            let mut proxy = EchoProxy::new(closed.clone());
            proxy.fail_with = Some(|| TunnelError::from_io(io::Error::from_raw_os_error(libc::EPERM)));
            assert!(runner.run(&mut proxy).unwrap_err().is_permission());
        }

        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![Event::TunnelPowerSaving]);
        assert_eq!(runner.eperm_counter, 0);
    }

    #[test]
    fn test_cooldown_doubles_and_caps() {
        let (device, _peer) = device();
        let (stop_rx, _stop_tx) = sys::pipe().unwrap();
        let mut runner = runner(device, stop_rx, EventBus::new(), false);

        let cooldowns: Vec<u128> = (0..6).map(|_| runner.next_cooldown().as_millis()).collect();
        assert_eq!(cooldowns, vec![300, 600, 1200, 2400, 3000, 3000]);
    }

    #[test]
    fn test_retry_restarts_until_stopped() {
        let (device, peer) = device();
        let (stop_rx, stop_tx) = sys::pipe().unwrap();
        let events = EventBus::new();
        let rx = events.subscribe();
        let mut runner = runner(device, stop_rx, events, false);
        let closed = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut attempts = 0;
        let counter = closed.clone();
        let mut stop_tx = Some(stop_tx);
        runner.run_with_retry(|| {
            attempts += 1;
            if attempts == 3 {
                // Third attempt: ask the loop to stop.
                stop_tx.take();
            } else {
                peer.send(b"x").unwrap();
            }
            let mut proxy = EchoProxy::new(counter.clone());
            proxy.fail_with = Some(|| TunnelError::Protocol("boom".into()));
            Ok(proxy)
        });

        assert_eq!(attempts, 3);
        let restarts = rx.try_iter().filter(|e| *e == Event::TunnelRestart).count();
        assert_eq!(restarts, 2);
        assert_eq!(closed.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
