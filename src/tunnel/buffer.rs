//! Fixed-size packet buffers reused across loop iterations.

use std::collections::VecDeque;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferId(usize);

/// Arena of equally sized buffers with a free list of indices.
pub struct BufferPool {
    buffers: Vec<Box<[u8]>>,
    in_use: Vec<bool>,
    free: Vec<usize>,
}

impl BufferPool {
    pub fn new(count: usize, size: usize) -> Self {
        Self {
            buffers: (0..count).map(|_| vec![0u8; size].into_boxed_slice()).collect(),
            in_use: vec![false; count],
            free: (0..count).rev().collect(),
        }
    }

    pub fn acquire(&mut self) -> Option<BufferId> {
        let index = self.free.pop()?;
        self.in_use[index] = true;
        Some(BufferId(index))
    }

    /// Returns false if the buffer was not taken.
    pub fn release(&mut self, id: BufferId) -> bool {
        match self.in_use.get_mut(id.0) {
            Some(used) if *used => {
                *used = false;
                self.free.push(id.0);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: BufferId) -> &[u8] {
        &self.buffers[id.0]
    }

    pub fn get_mut(&mut self, id: BufferId) -> &mut [u8] {
        &mut self.buffers[id.0]
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffers.first().map_or(0, |b| b.len())
    }
}

/// Packets waiting to be written back to the device, stored in pooled
/// buffers.
pub struct Loopback {
    pool: BufferPool,
    queue: VecDeque<(BufferId, usize)>,
}

impl Loopback {
    pub fn new(count: usize, size: usize) -> Self {
        Self {
            pool: BufferPool::new(count, size),
            queue: VecDeque::with_capacity(count),
        }
    }

    /// Copies `packet` into a free buffer. Drops it if the pool is exhausted
    /// or the packet does not fit.
    pub fn push(&mut self, packet: &[u8]) -> bool {
        if packet.len() > self.pool.buffer_size() {
            warn!("Dropping oversized loopback packet ({} bytes)", packet.len());
            return false;
        }
        let Some(id) = self.pool.acquire() else {
            warn!("Loopback queue full, dropping packet");
            return false;
        };
        self.pool.get_mut(id)[..packet.len()].copy_from_slice(packet);
        self.queue.push_back((id, packet.len()));
        true
    }

    pub fn front(&self) -> Option<&[u8]> {
        self.queue.front().map(|(id, len)| &self.pool.get(*id)[..*len])
    }

    /// Drops the front packet and returns its buffer to the pool.
    pub fn pop(&mut self) {
        if let Some((id, _)) = self.queue.pop_front() {
            self.pool.release(id);
        }
    }

    pub fn clear(&mut self) {
        while !self.queue.is_empty() {
            self.pop();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Largest packet the queue accepts.
    pub fn packet_size(&self) -> usize {
        self.pool.buffer_size()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Every buffer is either queued or free.
    pub fn is_consistent(&self) -> bool {
        self.pool.available() + self.queue.len() == self.pool.capacity()
    }
}
