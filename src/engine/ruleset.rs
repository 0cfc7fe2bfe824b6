use rustc_hash::FxHashSet;
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeSeq, Serializer};
use std::sync::Arc;

/// Insertion-ordered set of hostnames.
#[derive(Debug, Clone, Default)]
pub struct Ruleset {
    order: Vec<Arc<str>>,
    index: FxHashSet<Arc<str>>,
}

impl Ruleset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            order: Vec::with_capacity(capacity),
            index: FxHashSet::with_capacity_and_hasher(capacity, Default::default()),
        }
    }

    /// Returns false if the host was already present.
    pub fn insert(&mut self, host: &str) -> bool {
        if self.index.contains(host) {
            return false;
        }
        let host: Arc<str> = Arc::from(host);
        self.index.insert(host.clone());
        self.order.push(host);
        true
    }

    pub fn contains(&self, host: &str) -> bool {
        self.index.contains(host)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|h| h.as_ref())
    }

    /// Adds every host of `other` not yet present, keeping order.
    pub fn union(&mut self, other: &Ruleset) {
        self.order.reserve(other.len());
        for host in &other.order {
            if self.index.insert(host.clone()) {
                self.order.push(host.clone());
            }
        }
    }
}

impl PartialEq for Ruleset {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order
    }
}

impl<S: AsRef<str>> FromIterator<S> for Ruleset {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut ruleset = Ruleset::new();
        for host in iter {
            ruleset.insert(host.as_ref());
        }
        ruleset
    }
}

impl Serialize for Ruleset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.order.len()))?;
        for host in &self.order {
            seq.serialize_element(host.as_ref())?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Ruleset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hosts = Vec::<String>::deserialize(deserializer)?;
        Ok(hosts.into_iter().collect())
    }
}
