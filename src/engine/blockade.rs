use super::filter::FilterId;
use super::matcher::{HostTable, MatchStrategy};
use super::memory::MemoryLimit;
use super::ruleset::Ruleset;
use super::store::RulesetStore;
use super::traits::DomainMatcher;
use crate::events::{Event, EventBus};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// One fully built pair of deny/allow tables. Never mutated after creation.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub denied: HostTable,
    pub allowed: HostTable,
}

/// Answers allowed/denied for hostnames against the last built rulesets.
///
/// Builds compose a fresh [`Snapshot`] and swap it in atomically, so readers
/// on the packet path never see a half-built table and never take a lock.
pub struct Blockade {
    store: RulesetStore,
    strategy: MatchStrategy,
    memory_limit: MemoryLimit,
    events: EventBus,
    current: ArcSwap<Snapshot>,
}

impl Blockade {
    pub fn new(
        store: RulesetStore,
        strategy: MatchStrategy,
        memory_limit: MemoryLimit,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            strategy,
            memory_limit,
            events,
            current: ArcSwap::from_pointee(Snapshot::default()),
        }
    }

    pub fn build(&self, denied: &[FilterId], allowed: &[FilterId]) {
        self.events.emit(Event::RulesetBuilding);

        let denied_rules = self.merge(denied);
        let allowed_rules = self.merge(allowed);

        let snapshot = Snapshot {
            denied: HostTable::build(&denied_rules, self.strategy),
            allowed: HostTable::build(&allowed_rules, self.strategy),
        };
        let (denied_len, allowed_len) = (snapshot.denied.len(), snapshot.allowed.len());
        self.current.store(Arc::new(snapshot));

        info!(
            "Rulesets built: {} denied, {} allowed ({:?} matching)",
            denied_len, allowed_len, self.strategy
        );
        self.events.emit(Event::RulesetBuilt {
            denied: denied_len,
            allowed: allowed_len,
        });
    }

    /// Unions the rulesets of `ids` in order. The first one that loads is
    /// taken whole; later ones only while the merged size is below the
    /// memory limit.
    fn merge(&self, ids: &[FilterId]) -> Ruleset {
        let mut merged = Ruleset::new();
        for id in ids {
            if !merged.is_empty() {
                let limit = (self.memory_limit)();
                if merged.len() >= limit {
                    warn!(
                        "Memory limit reached, skipping ruleset {} (limit {}, loaded {})",
                        id,
                        limit,
                        merged.len()
                    );
                    self.events.emit(Event::MemoryLimitReached {
                        filter: id.clone(),
                        limit,
                    });
                    continue;
                }
            }

            match self.store.load(id) {
                Ok(ruleset) if merged.is_empty() => merged = ruleset,
                Ok(ruleset) => merged.union(&ruleset),
                Err(e) => error!("Could not load ruleset {}: {:#}", id, e),
            }
        }
        merged
    }

    /// Persists a freshly fetched ruleset for later builds.
    pub fn set(&self, id: &FilterId, ruleset: &Ruleset) -> Result<()> {
        self.store.save(id, ruleset)?;
        info!("Saved ruleset {} ({} entries)", id, ruleset.len());
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }
}

impl DomainMatcher for Blockade {
    fn denied(&self, host: &str) -> bool {
        self.current.load().denied.matches(host)
    }

    fn allowed(&self, host: &str) -> bool {
        self.current.load().allowed.matches(host)
    }

    fn is_blocked(&self, host: &str) -> bool {
        let snapshot = self.current.load();
        !snapshot.allowed.matches(host) && snapshot.denied.matches(host)
    }
}
