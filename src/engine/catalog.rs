//! Remote filter catalog: a JSON array of filter descriptors, usually gzipped.

use super::filter::{Filter, FilterSourceDescriptor};
use super::traits::CatalogFetcher;
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use reqwest::Client;
use serde::Deserialize;
use std::io::Read;
use tracing::info;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    id: String,
    source: FilterSourceDescriptor,
    #[serde(default)]
    whitelist: bool,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    credit: Option<String>,
    #[serde(default, alias = "customName")]
    name: Option<String>,
    #[serde(default, alias = "customComment")]
    comment: Option<String>,
}

impl CatalogEntry {
    fn into_filter(self, priority: i32) -> Filter {
        let mut filter = Filter::new(self.id, self.source);
        filter.whitelist = self.whitelist;
        filter.active = self.active;
        filter.priority = priority;
        filter.credit = self.credit;
        filter.custom_name = self.name;
        filter.custom_comment = self.comment;
        filter
    }
}

/// Decodes catalog bytes. Catalog order becomes priority.
pub fn decode_catalog(bytes: &[u8]) -> Result<Vec<Filter>> {
    let json = if bytes.starts_with(&GZIP_MAGIC) {
        let mut text = String::new();
        GzDecoder::new(bytes)
            .read_to_string(&mut text)
            .context("Failed to decompress filter catalog")?;
        text
    } else {
        String::from_utf8(bytes.to_vec()).context("Filter catalog is not UTF-8")?
    };

    let entries: Vec<CatalogEntry> =
        serde_json::from_str(&json).context("Failed to parse filter catalog")?;
    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(i, entry)| entry.into_filter(i as i32))
        .collect())
}

pub async fn fetch_catalog(client: &Client, url: &str) -> Result<Vec<Filter>> {
    info!("Fetching filter catalog from {}", url);
    let bytes = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("Failed to fetch catalog {}", url))?
        .bytes()
        .await
        .context("Failed to read catalog body")?;

    let filters = decode_catalog(&bytes)?;
    info!("Catalog has {} filters", filters.len());
    Ok(filters)
}

pub struct HttpCatalog {
    client: Client,
}

impl HttpCatalog {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl CatalogFetcher for HttpCatalog {
    async fn fetch(&self, url: &str) -> Result<Vec<Filter>> {
        fetch_catalog(&self.client, url).await
    }
}
