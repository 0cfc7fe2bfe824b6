//! Initialization helpers for the application startup.

use crate::config::Config;
use crate::db::SqlitePersistence;
use crate::persistence::{MemoryPersistence, Persistence};
use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::info;

/// Sets up the tracing subscriber with the configured filters.
pub fn setup_logging(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut filter = config.logging.level.clone();

        // Suppress DNS codec and TLS chatter unless explicitly enabled
        for noisy in ["hickory_proto", "rustls"] {
            if !filter.contains(noisy) {
                filter.push_str(&format!(",{}=off", noisy));
            }
        }

        tracing_subscriber::EnvFilter::new(filter)
    });

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

/// Opens the configured key-value store.
pub fn init_persistence(config: &Config) -> Result<Arc<dyn Persistence>> {
    match config.storage.backend.as_str() {
        "sqlite" => {
            let client = SqlitePersistence::new(config.storage.sqlite_path.clone())?;
            client.initialize()?;
            Ok(Arc::new(client))
        }
        "memory" => {
            info!("Using in-memory persistence, nothing survives a restart");
            Ok(Arc::new(MemoryPersistence::new()))
        }
        other => bail!("Unknown storage backend: {}", other),
    }
}
