use super::{Request, RequestLogSink};
use crate::persistence::{Persistence, PersistenceExt, KEY_REQUESTS};
use anyhow::Result;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

/// Ring buffer of the most recent requests. Clones share the same buffer, so
/// the session keeps one handle while a logger thread feeds another.
#[derive(Clone)]
pub struct MemoryLogSink {
    buffer: Arc<RwLock<VecDeque<Request>>>,
    capacity: usize,
}

impl MemoryLogSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    /// Starts from the batch saved by [`MemoryLogSink::persist`], if any.
    pub fn restore(capacity: usize, persistence: &dyn Persistence) -> Self {
        let sink = Self::new(capacity);
        let saved: Vec<Request> = persistence.read_or_default(KEY_REQUESTS);
        for request in saved {
            sink.push(request);
        }
        sink
    }

    pub fn persist(&self, persistence: &dyn Persistence) -> Result<()> {
        persistence.write(KEY_REQUESTS, &self.recent())
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<Request> {
        self.buffer.read().iter().cloned().collect()
    }

    pub fn last_domain(&self) -> Option<String> {
        self.buffer.read().back().map(|r| r.domain.clone())
    }

    pub fn last_blocked(&self) -> Option<String> {
        self.buffer
            .read()
            .iter()
            .rev()
            .find(|r| r.blocked)
            .map(|r| r.domain.clone())
    }

    pub fn len(&self) -> usize {
        self.buffer.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.read().is_empty()
    }

    fn push(&self, request: Request) {
        let mut buffer = self.buffer.write();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(request);
    }
}

impl RequestLogSink for MemoryLogSink {
    fn log(&self, request: &Request) {
        self.push(request.clone());
    }
}
