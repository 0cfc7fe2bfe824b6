use super::filter::FilterId;
use super::ruleset::Ruleset;
use crate::persistence::{ruleset_key, ruleset_size_key, Persistence, PersistenceExt};
use anyhow::{Context, Result};
use std::sync::Arc;

/// Per-filter ruleset blobs kept in persistence.
#[derive(Clone)]
pub struct RulesetStore {
    persistence: Arc<dyn Persistence>,
}

impl RulesetStore {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Missing rulesets load as empty.
    pub fn load(&self, id: &FilterId) -> Result<Ruleset> {
        self.persistence
            .read(&ruleset_key(id), Ruleset::new())
            .with_context(|| format!("Failed to load ruleset {}", id))
    }

    pub fn save(&self, id: &FilterId, ruleset: &Ruleset) -> Result<()> {
        self.persistence
            .write(&ruleset_key(id), ruleset)
            .with_context(|| format!("Failed to save ruleset {}", id))?;
        self.persistence.write(&ruleset_size_key(id), &ruleset.len())
    }

    pub fn size_of(&self, id: &FilterId) -> Result<usize> {
        self.persistence.read(&ruleset_size_key(id), 0usize)
    }

    pub fn remove(&self, id: &FilterId) -> Result<()> {
        self.persistence.remove(&ruleset_key(id))?;
        self.persistence.remove(&ruleset_size_key(id))
    }
}
