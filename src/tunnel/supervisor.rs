//! Owns the poll thread of one tunnel session.

use super::proxy::Proxy;
use super::runner::{RunnerSettings, TunnelRunner};
use super::sys;
use crate::error::TunnelResult;
use crate::events::{Event, EventBus};
use crate::stats::StatsCollector;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

pub const THREAD_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TunnelHandle {
    stop: Option<OwnedFd>,
    thread: Option<JoinHandle<()>>,
    events: EventBus,
}

impl TunnelHandle {
    /// Spawns the `tunnel-poll` thread running `make_proxy`'s proxies over
    /// `device` until [`TunnelHandle::stop`].
    pub fn start<P, F>(
        device: Arc<OwnedFd>,
        events: EventBus,
        stats: Arc<StatsCollector>,
        settings: RunnerSettings,
        make_proxy: F,
    ) -> io::Result<Self>
    where
        P: Proxy + 'static,
        F: FnMut() -> TunnelResult<P> + Send + 'static,
    {
        let (stop_rx, stop_tx) = sys::pipe()?;
        let mut runner = TunnelRunner::new(device, Arc::new(stop_rx), events.clone(), stats, settings);
        let thread = thread::Builder::new()
            .name("tunnel-poll".to_string())
            .spawn(move || runner.run_with_retry(make_proxy))?;
        info!("Tunnel started");
        Ok(Self {
            stop: Some(stop_tx),
            thread: Some(thread),
            events,
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Closes the stop pipe and waits for the thread. Safe to call more than
    /// once. Returns false if the thread had to be detached.
    pub fn stop(&mut self) -> bool {
        let Some(stop) = self.stop.take() else {
            return true;
        };
        drop(stop);
        let joined = match self.thread.take() {
            Some(handle) => join_with_timeout(handle, "tunnel-poll"),
            None => true,
        };
        self.events.emit(Event::TunnelStopped);
        info!("Tunnel stopped");
        joined
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_with_timeout(handle: JoinHandle<()>, name: &str) -> bool {
    let start = Instant::now();
    let poll_interval = Duration::from_millis(20);

    while start.elapsed() < THREAD_JOIN_TIMEOUT {
        if handle.is_finished() {
            if handle.join().is_err() {
                error!("{} thread panicked", name);
            }
            debug!("{} thread joined", name);
            return true;
        }
        thread::sleep(poll_interval);
    }

    error!(
        "{} thread did not stop within {:?}, detaching it",
        name, THREAD_JOIN_TIMEOUT
    );
    false
}
