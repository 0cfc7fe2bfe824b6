use super::filter::{FilterSourceDescriptor, SOURCE_APP, SOURCE_FILE, SOURCE_LINK, SOURCE_SINGLE};
use super::ruleset::Ruleset;
use super::traits::{RulesetSource, SourceResolver};
use anyhow::{bail, Context, Result};
use futures::StreamExt;
use reqwest::Client;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;
use tracing::{info, warn};

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Size a link source claims before it has been fetched.
const LINK_SIZE_ESTIMATE: usize = 100_000;

const SKIP_HOSTS: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "local",
    "broadcasthost",
    "ip6-localhost",
    "ip6-loopback",
    "ip6-localnet",
    "ip6-mcastprefix",
    "ip6-allnodes",
    "ip6-allrouters",
    "ip6-allhosts",
    "0.0.0.0",
];

pub fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent("AdTunnel/1.0")
        .timeout(FETCH_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")
}

/// Normalises one line of a hosts file or plain domain list.
pub fn parse_host_line(line: &str) -> Option<String> {
    let line = line.split('#').next().unwrap_or("").trim();
    // Skip comments and empty lines
    if line.is_empty() || line.starts_with('!') {
        return None;
    }

    let mut fields = line.split_whitespace();
    let first = fields.next()?;
    let host = if first.parse::<IpAddr>().is_ok() {
        fields.next()?
    } else {
        first
    };

    let host = host.trim_end_matches('.').to_lowercase();
    if host.len() > 253 || !host.contains('.') || SKIP_HOSTS.contains(&host.as_str()) {
        return None;
    }
    Some(host)
}

pub fn parse_hosts(text: &str) -> Ruleset {
    text.lines().filter_map(parse_host_line).collect()
}

pub struct LinkSource {
    client: Client,
    url: String,
    backup: Option<String>,
}

impl LinkSource {
    pub fn new(client: Client, url: impl Into<String>, backup: Option<String>) -> Self {
        Self {
            client,
            url: url.into(),
            backup,
        }
    }

    async fn fetch_and_parse(client: &Client, url: &str) -> Result<Ruleset> {
        info!("Fetching ruleset from {}", url);
        let resp = client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("Failed to fetch {}", url))?;

        let stream = resp
            .bytes_stream()
            .map(|result| result.map_err(std::io::Error::other));
        let reader = StreamReader::new(stream);
        let mut lines = BufReader::new(reader).lines();
        let mut ruleset = Ruleset::new();

        while let Some(line) = lines.next_line().await? {
            if let Some(host) = parse_host_line(&line) {
                ruleset.insert(&host);
            }
        }

        info!("Parsed {} entries from {}", ruleset.len(), url);
        Ok(ruleset)
    }
}

#[async_trait::async_trait]
impl RulesetSource for LinkSource {
    fn id(&self) -> &str {
        SOURCE_LINK
    }

    async fn size(&self) -> usize {
        LINK_SIZE_ESTIMATE
    }

    async fn fetch(&self) -> Result<Ruleset> {
        match Self::fetch_and_parse(&self.client, &self.url).await {
            Ok(ruleset) if !ruleset.is_empty() => Ok(ruleset),
            primary => {
                let Some(backup) = &self.backup else {
                    return primary;
                };
                if let Err(e) = &primary {
                    warn!("{:#}, trying backup {}", e, backup);
                }
                Self::fetch_and_parse(&self.client, backup).await
            }
        }
    }
}

pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl RulesetSource for FileSource {
    fn id(&self) -> &str {
        SOURCE_FILE
    }

    async fn size(&self) -> usize {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text.lines().count() + 1,
            Err(_) => 0,
        }
    }

    async fn fetch(&self) -> Result<Ruleset> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        Ok(parse_hosts(&text))
    }
}

/// Per-app allow entries; they carry no hostnames.
pub struct AppSource;

#[async_trait::async_trait]
impl RulesetSource for AppSource {
    fn id(&self) -> &str {
        SOURCE_APP
    }

    async fn size(&self) -> usize {
        0
    }

    async fn fetch(&self) -> Result<Ruleset> {
        Ok(Ruleset::new())
    }
}

pub struct SingleSource {
    host: String,
}

impl SingleSource {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

#[async_trait::async_trait]
impl RulesetSource for SingleSource {
    fn id(&self) -> &str {
        SOURCE_SINGLE
    }

    async fn size(&self) -> usize {
        1
    }

    async fn fetch(&self) -> Result<Ruleset> {
        let host = self.host.trim().to_lowercase();
        if host.is_empty() {
            bail!("Empty single host entry");
        }
        Ok(std::iter::once(host).collect())
    }
}

/// Maps descriptor kinds to sources. A link locator may carry a backup URL
/// after whitespace; unknown kinds are treated as a single host.
pub struct DefaultSourceResolver {
    client: Client,
}

impl DefaultSourceResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl SourceResolver for DefaultSourceResolver {
    fn resolve(&self, descriptor: &FilterSourceDescriptor) -> Arc<dyn RulesetSource> {
        match descriptor.id.as_str() {
            SOURCE_LINK => {
                let mut urls = descriptor.source.split_whitespace();
                let url = urls.next().unwrap_or_default().to_string();
                let backup = urls.next().map(str::to_string);
                Arc::new(LinkSource::new(self.client.clone(), url, backup))
            }
            SOURCE_FILE => Arc::new(FileSource::new(&descriptor.source)),
            SOURCE_APP => Arc::new(AppSource),
            _ => Arc::new(SingleSource::new(&descriptor.source)),
        }
    }
}
