//! Typed domain events.
//!
//! Delivery is hot: a subscriber only sees events emitted after it
//! subscribed. Each subscriber gets its own unbounded channel so events reach
//! it in emission order.

use crate::engine::Filter;
use crate::logger::Request;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    RulesetBuilding,
    RulesetBuilt { denied: usize, allowed: usize },
    /// A filter was left out of the build because the memory budget was spent.
    MemoryLimitReached { filter: String, limit: usize },
    MemoryCapacity(usize),
    FiltersChanging,
    FiltersChanged(Vec<Filter>),
    Request(Request),
    TunnelPowerSaving,
    TunnelRestart,
    TunnelStopped,
}

#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: Event) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
