//! Key-value persistence contract.
//!
//! Only the load/save contract matters to the engine. Values are stored as
//! JSON strings so any backend that can keep strings under string keys works.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

pub const KEY_FILTERS: &str = "filters2";
pub const KEY_TUNNEL_CONFIG: &str = "tunnel:config";
pub const KEY_BLOCKA_CONFIG: &str = "blocka:config";
pub const KEY_REQUESTS: &str = "requests:0";

pub fn ruleset_key(filter_id: &str) -> String {
    format!("rules:set:{}", filter_id)
}

pub fn ruleset_size_key(filter_id: &str) -> String {
    format!("rules:size:{}", filter_id)
}

pub trait Persistence: Send + Sync {
    fn read_raw(&self, key: &str) -> Result<Option<String>>;
    fn write_raw(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Typed access on top of [`Persistence`].
pub trait PersistenceExt {
    /// Reads `key`, returning `default` when nothing is stored.
    fn read<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T>;
    fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()>;

    /// Like [`PersistenceExt::read`] but logs and falls back on any failure.
    fn read_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        match self.read(key, T::default()) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to load {}, using defaults: {:#}", key, e);
                T::default()
            }
        }
    }
}

impl<P: Persistence + ?Sized> PersistenceExt for P {
    fn read<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        match self.read_raw(key)? {
            Some(raw) => serde_json::from_str(&raw).with_context(|| format!("Corrupt value for {}", key)),
            None => Ok(default),
        }
    }

    fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value).with_context(|| format!("Failed to encode {}", key))?;
        self.write_raw(key, &raw)
    }
}

/// Process-local store for tests and ephemeral runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryPersistence {
    values: Arc<Mutex<FxHashMap<String, String>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

impl Persistence for MemoryPersistence {
    fn read_raw(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn write_raw(&self, key: &str, value: &str) -> Result<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}
