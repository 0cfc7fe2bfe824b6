use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observed DNS query. Two requests are equal when they name the same
/// domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub domain: String,
    pub blocked: bool,
    pub timestamp: DateTime<Utc>,
}

impl Request {
    pub fn new(domain: impl Into<String>, blocked: bool) -> Self {
        Self {
            domain: domain.into(),
            blocked,
            timestamp: Utc::now(),
        }
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.domain == other.domain
    }
}

pub trait RequestLogSink: Send + Sync {
    fn log(&self, request: &Request);
}
