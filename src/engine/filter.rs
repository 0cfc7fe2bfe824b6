use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

pub type FilterId = String;

/// Milliseconds since the Unix epoch.
pub type Time = i64;

pub const SOURCE_APP: &str = "app";
pub const SOURCE_LINK: &str = "link";
pub const SOURCE_FILE: &str = "file";
pub const SOURCE_SINGLE: &str = "single";

/// Where a filter gets its hostnames from: a kind (`link`, `file`, `app`,
/// `single`) and a kind-specific locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterSourceDescriptor {
    pub id: String,
    #[serde(alias = "url", default)]
    pub source: String,
}

impl FilterSourceDescriptor {
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
        }
    }
}

/// A configured source of hostnames.
///
/// Identity is the `id` alone, so replacing a filter inside a collection
/// behaves as an upsert no matter which content fields changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub id: FilterId,
    pub source: FilterSourceDescriptor,
    #[serde(default)]
    pub whitelist: bool,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub last_fetch: Time,
    #[serde(default)]
    pub credit: Option<String>,
    #[serde(default)]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub custom_comment: Option<String>,
}

impl Filter {
    pub fn new(id: impl Into<String>, source: FilterSourceDescriptor) -> Self {
        Self {
            id: id.into(),
            source,
            whitelist: false,
            active: false,
            hidden: false,
            priority: 0,
            last_fetch: 0,
            credit: None,
            custom_name: None,
            custom_comment: None,
        }
    }

    pub fn is_app(&self) -> bool {
        self.source.id == SOURCE_APP
    }
}

impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Filter {}

impl Hash for Filter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Sorts by priority and renumbers densely from zero.
pub fn prioritised(mut filters: Vec<Filter>) -> Vec<Filter> {
    filters.sort_by_key(|f| f.priority);
    for (i, filter) in filters.iter_mut().enumerate() {
        filter.priority = i as i32;
    }
    filters
}

/// The persisted filter catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterStore {
    #[serde(default)]
    pub cache: Vec<Filter>,
    #[serde(default)]
    pub last_fetch: Time,
    #[serde(default)]
    pub url: String,
}

impl FilterStore {
    pub fn get(&self, id: &str) -> Option<&Filter> {
        self.cache.iter().find(|f| f.id == id)
    }

    /// Inserts or replaces by id, keeping the position of a replaced entry.
    pub fn upsert(&mut self, filter: Filter) {
        match self.cache.iter_mut().find(|f| **f == filter) {
            Some(slot) => *slot = filter,
            None => self.cache.push(filter),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Filter> {
        let index = self.cache.iter().position(|f| f.id == id)?;
        Some(self.cache.remove(index))
    }

    pub fn max_priority(&self) -> Option<i32> {
        self.cache.iter().map(|f| f.priority).max()
    }
}
