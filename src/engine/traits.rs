use super::filter::{Filter, FilterSourceDescriptor};
use super::ruleset::Ruleset;
use anyhow::Result;
use std::sync::Arc;

/// The "Hot Path" decision function, consulted for every DNS query.
pub trait DomainMatcher: Send + Sync {
    fn denied(&self, host: &str) -> bool;
    fn allowed(&self, host: &str) -> bool;

    /// Allow entries always win over deny entries.
    fn is_blocked(&self, host: &str) -> bool {
        !self.allowed(host) && self.denied(host)
    }
}

/// A place hostnames for one filter come from.
#[async_trait::async_trait]
pub trait RulesetSource: Send + Sync {
    /// Source kind, e.g. "link" or "app".
    fn id(&self) -> &str;

    /// Expected number of entries, checked against the memory limit before
    /// fetching.
    async fn size(&self) -> usize;

    async fn fetch(&self) -> Result<Ruleset>;
}

/// Turns a filter's source descriptor into something that can be fetched.
pub trait SourceResolver: Send + Sync {
    fn resolve(&self, descriptor: &FilterSourceDescriptor) -> Arc<dyn RulesetSource>;
}

/// Downloads and decodes the filter catalog.
#[async_trait::async_trait]
pub trait CatalogFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<Filter>>;
}
