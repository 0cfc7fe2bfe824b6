use super::packet::Envelope;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_TTL: Duration = Duration::from_secs(10);
pub const DEFAULT_CAPACITY: usize = 1024;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// A forwarded datagram waiting for its reply.
pub struct ForwardRule {
    pub socket: UdpSocket,
    pub envelope: Envelope,
    pub created: Instant,
}

/// In-flight forwarded sockets, oldest first. Dropping a rule closes its
/// socket.
pub struct Forwarder {
    rules: VecDeque<ForwardRule>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    capacity: usize,
}

impl Forwarder {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_limits(clock, DEFAULT_TTL, DEFAULT_CAPACITY)
    }

    pub fn with_limits(clock: Arc<dyn Clock>, ttl: Duration, capacity: usize) -> Self {
        Self {
            rules: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            clock,
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn add(&mut self, socket: UdpSocket, envelope: Envelope) {
        self.evict_expired();
        while self.rules.len() >= self.capacity {
            let Some(oldest) = self.rules.pop_front() else {
                break;
            };
            debug!("Forwarder full, dropping oldest rule for {:?}", oldest.envelope.dst);
        }
        self.rules.push_back(ForwardRule {
            socket,
            envelope,
            created: self.clock.now(),
        });
    }

    /// Drops every rule older than the TTL. Returns how many went.
    pub fn evict_expired(&mut self) -> usize {
        let now = self.clock.now();
        let before = self.rules.len();
        let ttl = self.ttl;
        self.rules
            .retain(|rule| now.saturating_duration_since(rule.created) < ttl);
        before - self.rules.len()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules in poll order.
    pub fn iter(&self) -> impl Iterator<Item = &ForwardRule> {
        self.rules.iter()
    }

    pub fn take(&mut self, index: usize) -> Option<ForwardRule> {
        self.rules.remove(index)
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }
}
