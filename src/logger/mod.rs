pub mod console_sink;
pub mod memory_sink;
pub mod types;

pub use self::console_sink::ConsoleLogSink;
pub use self::memory_sink::MemoryLogSink;
pub use self::types::{Request, RequestLogSink};

use crate::config::LoggingConfig;
use crate::events::{Event, EventBus};
use std::thread::{self, JoinHandle};
use tracing::{error, warn};

/// Feeds `Event::Request` records to the configured sinks. Every sink gets
/// its own event subscription and thread, so a slow sink never holds up the
/// packet loop or the other sinks.
pub struct RequestLogger {
    handles: Vec<JoinHandle<()>>,
}

impl RequestLogger {
    pub fn start(config: &LoggingConfig, events: &EventBus, memory: Option<MemoryLogSink>) -> Self {
        let mut handles = Vec::new();

        for sink_type in &config.request_sinks {
            let sink: Box<dyn RequestLogSink> = match sink_type.as_str() {
                "console" => Box::new(ConsoleLogSink::new(config)),
                "memory" => match &memory {
                    Some(sink) => Box::new(sink.clone()),
                    None => continue,
                },
                other => {
                    warn!("Unknown request log sink type: {}", other);
                    continue;
                }
            };

            let rx = events.subscribe();
            let spawned = thread::Builder::new()
                .name(format!("request-log-{}", sink_type))
                .spawn(move || {
                    for event in rx.iter() {
                        if let Event::Request(request) = event {
                            sink.log(&request);
                        }
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => error!("Failed to start {} request sink: {}", sink_type, e),
            }
        }

        Self { handles }
    }

    pub fn sink_count(&self) -> usize {
        self.handles.len()
    }

    /// Waits for the sink threads, which finish once every clone of the
    /// event bus is gone.
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                error!("Request sink thread panicked");
            }
        }
    }
}
