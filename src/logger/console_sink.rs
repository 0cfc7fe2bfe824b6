use crate::config::LoggingConfig;
use crate::logger::types::{Request, RequestLogSink};
use tracing::info;

pub struct ConsoleLogSink {
    log_blocked: bool,
    log_allowed: bool,
}

impl ConsoleLogSink {
    pub fn new(config: &LoggingConfig) -> Self {
        Self {
            log_blocked: config.log_blocked,
            log_allowed: config.log_allowed,
        }
    }
}

impl RequestLogSink for ConsoleLogSink {
    fn log(&self, request: &Request) {
        let should_log = if request.blocked {
            self.log_blocked
        } else {
            self.log_allowed
        };
        if !should_log {
            return;
        }

        info!(
            target: "dns_request",
            "{} {}",
            if request.blocked { "BLOCKED" } else { "ALLOWED" },
            request.domain
        );
    }
}
