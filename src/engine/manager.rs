use super::blockade::Blockade;
use super::filter::{prioritised, Filter, FilterId, FilterStore, Time, SOURCE_APP, SOURCE_LINK};
use super::memory::{system_memory_limit, MemoryLimit};
use super::ruleset::Ruleset;
use super::traits::{CatalogFetcher, RulesetSource, SourceResolver};
use crate::config::TunnelConfig;
use crate::events::{Event, EventBus};
use crate::persistence::{Persistence, PersistenceExt, KEY_FILTERS};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::task;
use tracing::{debug, error, info, warn};

pub type NowFn = Arc<dyn Fn() -> Time + Send + Sync>;
pub type OnWifiFn = Arc<dyn Fn() -> bool + Send + Sync>;
pub type PostProcessFn = Arc<dyn Fn(Vec<Filter>) -> Vec<Filter> + Send + Sync>;

/// Environment the manager consults during a sync. Replaced in tests to make
/// cache expiry and memory pressure deterministic.
#[derive(Clone)]
pub struct ManagerHooks {
    pub now: NowFn,
    pub on_wifi: OnWifiFn,
    pub memory_limit: MemoryLimit,
    /// Applied to a freshly fetched catalog before it is merged, e.g. to hide
    /// filters for apps that are not installed.
    pub post_process: PostProcessFn,
}

impl Default for ManagerHooks {
    fn default() -> Self {
        Self {
            now: Arc::new(|| chrono::Utc::now().timestamp_millis()),
            on_wifi: Arc::new(|| true),
            memory_limit: system_memory_limit(),
            post_process: Arc::new(|filters| filters),
        }
    }
}

/// Keeps the filter catalog, fetches rulesets and rebuilds the blockade.
///
/// Not synchronised: the session's command queue is its only caller.
pub struct FilterManager {
    persistence: Arc<dyn Persistence>,
    blockade: Arc<Blockade>,
    resolver: Arc<dyn SourceResolver>,
    catalog: Arc<dyn CatalogFetcher>,
    events: EventBus,
    hooks: ManagerHooks,
    config: TunnelConfig,
    store: FilterStore,
}

impl FilterManager {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        blockade: Arc<Blockade>,
        resolver: Arc<dyn SourceResolver>,
        catalog: Arc<dyn CatalogFetcher>,
        events: EventBus,
    ) -> Self {
        Self {
            persistence,
            blockade,
            resolver,
            catalog,
            events,
            hooks: ManagerHooks::default(),
            config: TunnelConfig::default(),
            store: FilterStore::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: ManagerHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn set_config(&mut self, config: TunnelConfig) {
        self.config = config;
    }

    pub fn blockade(&self) -> &Arc<Blockade> {
        &self.blockade
    }

    pub fn load(&mut self) {
        match self.persistence.read(KEY_FILTERS, FilterStore::default()) {
            Ok(store) => {
                debug!("Loaded filter store: url={:?}, {} filters", store.url, store.cache.len());
                self.store = store;
                self.events.emit(Event::FiltersChanged(self.store.cache.clone()));
            }
            Err(e) => error!("Failed loading filter store: {:#}", e),
        }
    }

    /// Writes the filter store on the blocking pool.
    pub async fn save(&self) {
        let persistence = self.persistence.clone();
        let store = self.store.clone();
        let count = store.cache.len();
        let saved = task::spawn_blocking(move || persistence.write(KEY_FILTERS, &store))
            .await
            .context("Filter store task failed");
        match saved {
            Ok(Ok(())) => debug!("Saved filter store ({} filters)", count),
            Ok(Err(e)) | Err(e) => error!("Failed saving filter store: {:#}", e),
        }
    }

    pub fn url(&self) -> &str {
        &self.store.url
    }

    pub fn has_url(&self) -> bool {
        !self.store.url.trim().is_empty()
    }

    pub fn set_url(&mut self, url: &str) {
        if self.store.url != url {
            self.store.url = url.to_string();
            self.store.last_fetch = 0;
            info!("Filter catalog url changed to {}", url);
        }
    }

    pub fn filters(&self) -> &[Filter] {
        &self.store.cache
    }

    /// Inserts a filter, or updates the content of an existing one while
    /// keeping its activation, polarity, priority and fetch time.
    pub fn put(&mut self, new: Filter) {
        let filter = match self.store.get(&new.id) {
            Some(old) => {
                debug!("Updating filter {}", new.id);
                Filter {
                    active: old.active,
                    whitelist: old.whitelist,
                    priority: old.priority,
                    last_fetch: old.last_fetch,
                    ..new
                }
            }
            None => {
                debug!("Adding filter {}", new.id);
                let priority = self.store.max_priority().map_or(1, |p| p + 1);
                Filter { priority, ..new }
            }
        };
        self.store.upsert(filter);
        self.emit_changed();
    }

    /// Switches a filter on or off. Returns false for unknown ids.
    pub fn set_active(&mut self, id: &str, active: bool) -> bool {
        let Some(filter) = self.store.cache.iter_mut().find(|f| f.id == id) else {
            return false;
        };
        filter.active = active;
        self.emit_changed();
        true
    }

    pub fn remove(&mut self, id: &str) {
        if self.store.remove(id).is_some() {
            debug!("Removed filter {}", id);
        }
        self.emit_changed();
    }

    pub fn remove_all(&mut self) {
        debug!("Removing all filters");
        self.store.cache.clear();
        self.emit_changed();
    }

    pub fn invalidate_cache(&mut self) {
        debug!("Invalidating filters cache");
        for filter in &mut self.store.cache {
            filter.last_fetch = 0;
        }
        self.store.last_fetch = 0;
    }

    /// Sources of active allow-list filters for installed apps.
    pub fn whitelisted_apps(&self) -> Vec<String> {
        self.store
            .cache
            .iter()
            .filter(|f| f.whitelist && f.active && f.source.id == SOURCE_APP)
            .map(|f| f.source.source.clone())
            .collect()
    }

    /// Refreshes the catalog and stale rulesets, then rebuilds the blockade.
    /// Returns true if at least one filter went into the build.
    pub async fn sync(&mut self) -> bool {
        if !self.sync_catalog().await {
            return false;
        }
        let built = self.sync_rules().await;
        self.events.emit(Event::MemoryCapacity((self.hooks.memory_limit)()));
        self.save().await;
        built
    }

    async fn sync_catalog(&mut self) -> bool {
        if !self.has_url() {
            warn!("Trying to sync without a catalog url, ignoring");
            return false;
        }
        if self.store_cache_valid() {
            return true;
        }

        info!("Syncing filters from {}", self.store.url);
        self.events.emit(Event::FiltersChanging);
        match self.catalog.fetch(&self.store.url).await {
            Ok(fetched) => {
                let merged = merge_catalog(&self.store.cache, fetched);
                self.store.cache = prioritised((self.hooks.post_process)(merged));
                self.store.last_fetch = (self.hooks.now)();
                info!("Synced {} filters", self.store.cache.len());
                self.emit_changed();
            }
            // Keep the stale catalog and carry on with what we have.
            Err(e) => error!("Failed syncing filters: {:#}", e),
        }
        true
    }

    async fn sync_rules(&mut self) -> bool {
        let stale: Vec<Filter> = self
            .store
            .cache
            .iter()
            .filter(|f| f.active && !self.ruleset_cache_valid(f))
            .cloned()
            .collect();

        for filter in stale {
            info!("Fetching ruleset {}", filter.id);
            self.events.emit(Event::FiltersChanging);

            let source = self.resolver.resolve(&filter.source);
            let result = match fetch_ruleset(source.as_ref(), (self.hooks.memory_limit)()).await {
                Ok(ruleset) => {
                    let blockade = self.blockade.clone();
                    let id = filter.id.clone();
                    task::spawn_blocking(move || blockade.set(&id, &ruleset))
                        .await
                        .context("Ruleset store task failed")
                        .and_then(|stored| stored)
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    let now = (self.hooks.now)();
                    if let Some(f) = self.store.cache.iter_mut().find(|f| f.id == filter.id) {
                        f.last_fetch = now;
                    }
                }
                Err(e) => error!("Failed fetching ruleset {}: {:#}", filter.id, e),
            }
        }

        let (allowed, denied): (Vec<&Filter>, Vec<&Filter>) =
            self.store.cache.iter().filter(|f| f.active).partition(|f| f.whitelist);
        let allowed: Vec<FilterId> = allowed.into_iter().map(|f| f.id.clone()).collect();
        let denied: Vec<FilterId> = denied.into_iter().map(|f| f.id.clone()).collect();

        debug!("Building rules: {} denied, {} allowed", denied.len(), allowed.len());
        let any = !allowed.is_empty() || !denied.is_empty();
        let blockade = self.blockade.clone();
        if let Err(e) = task::spawn_blocking(move || blockade.build(&denied, &allowed)).await {
            error!("Ruleset build task failed: {}", e);
        }
        any
    }

    fn ttl_millis(&self) -> Time {
        self.config.cache_ttl_secs as Time * 1000
    }

    fn ruleset_cache_valid(&self, filter: &Filter) -> bool {
        let now = (self.hooks.now)();
        filter.source.id == SOURCE_APP
            || filter.last_fetch + self.ttl_millis() > now
            || (self.config.wifi_only
                && !(self.hooks.on_wifi)()
                && !self.config.first_load
                && filter.source.id == SOURCE_LINK)
    }

    fn store_cache_valid(&self) -> bool {
        let now = (self.hooks.now)();
        !self.store.cache.is_empty()
            && (self.store.last_fetch + self.ttl_millis() > now
                || (self.config.wifi_only && !(self.hooks.on_wifi)()))
    }

    fn emit_changed(&self) {
        self.events.emit(Event::FiltersChanged(self.store.cache.clone()));
    }
}

async fn fetch_ruleset(source: &dyn RulesetSource, limit: usize) -> Result<Ruleset> {
    let size = source.size().await;
    if size > limit {
        bail!("Memory limit reached: source needs {} lines, {} available", size, limit);
    }
    let fetched = source.fetch().await?;
    if fetched.is_empty() && source.id() != SOURCE_APP {
        bail!("Fetched ruleset is empty");
    }
    Ok(fetched)
}

/// Combines a fetched catalog with the local filters. Local user state wins
/// for filters both know; catalog-only filters are appended.
fn merge_catalog(existing: &[Filter], fetched: Vec<Filter>) -> Vec<Filter> {
    if existing.is_empty() {
        debug!("No local filters, using catalog defaults");
        return fetched;
    }

    let mut merged: Vec<Filter> = existing
        .iter()
        .map(|local| match fetched.iter().find(|f| *f == local) {
            Some(remote) => Filter {
                active: local.active,
                hidden: local.hidden,
                priority: local.priority,
                last_fetch: local.last_fetch,
                ..remote.clone()
            },
            None => local.clone(),
        })
        .collect();

    let base = merged.iter().map(|f| f.priority).max().unwrap_or(0) + 1;
    merged.extend(
        fetched
            .into_iter()
            .filter(|f| !existing.contains(f))
            .map(|f| Filter {
                priority: base + f.priority,
                ..f
            }),
    );
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::filter::FilterSourceDescriptor;
    use crate::engine::matcher::MatchStrategy;
    use crate::engine::memory::fixed_memory_limit;
    use crate::engine::store::RulesetStore;
    use crate::engine::traits::DomainMatcher;
    use crate::persistence::MemoryPersistence;
    use parking_lot::Mutex;
    use rustc_hash::FxHashMap;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    const NOW: Time = 1_700_000_000_000;

    struct FakeSource {
        hosts: Vec<String>,
        size: usize,
    }

    #[async_trait::async_trait]
    impl RulesetSource for FakeSource {
        fn id(&self) -> &str {
            "link"
        }
        async fn size(&self) -> usize {
            self.size
        }
        async fn fetch(&self) -> Result<Ruleset> {
            Ok(self.hosts.iter().collect())
        }
    }

    /// Serves rulesets keyed by the descriptor's locator and counts fetches.
    #[derive(Default)]
    struct FakeResolver {
        rulesets: FxHashMap<String, Vec<String>>,
        resolved: Mutex<Vec<String>>,
    }

    impl SourceResolver for FakeResolver {
        fn resolve(&self, descriptor: &FilterSourceDescriptor) -> Arc<dyn RulesetSource> {
            self.resolved.lock().push(descriptor.source.clone());
            let hosts = self.rulesets.get(&descriptor.source).cloned().unwrap_or_default();
            Arc::new(FakeSource {
                size: hosts.len(),
                hosts,
            })
        }
    }

    struct FakeCatalog(Result<Vec<Filter>, String>);

    #[async_trait::async_trait]
    impl CatalogFetcher for FakeCatalog {
        async fn fetch(&self, _url: &str) -> Result<Vec<Filter>> {
            self.0.clone().map_err(anyhow::Error::msg)
        }
    }

    fn link_filter(id: &str, whitelist: bool, active: bool) -> Filter {
        let mut f = Filter::new(id, FilterSourceDescriptor::new("link", id));
        f.whitelist = whitelist;
        f.active = active;
        f
    }

    struct Fixture {
        manager: FilterManager,
        resolver: Arc<FakeResolver>,
        clock: Arc<AtomicI64>,
        events: EventBus,
    }

    fn fixture(catalog: Result<Vec<Filter>, String>, rulesets: &[(&str, &[&str])]) -> Fixture {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let events = EventBus::new();
        let blockade = Arc::new(Blockade::new(
            RulesetStore::new(persistence.clone()),
            MatchStrategy::Exact,
            fixed_memory_limit(usize::MAX),
            events.clone(),
        ));
        let resolver = Arc::new(FakeResolver {
            rulesets: rulesets
                .iter()
                .map(|(id, hosts)| (id.to_string(), hosts.iter().map(|h| h.to_string()).collect()))
                .collect(),
            ..Default::default()
        });
        let clock = Arc::new(AtomicI64::new(NOW));
        let now = clock.clone();
        let hooks = ManagerHooks {
            now: Arc::new(move || now.load(Ordering::SeqCst)),
            memory_limit: fixed_memory_limit(usize::MAX),
            ..Default::default()
        };
        let manager = FilterManager::new(
            persistence,
            blockade,
            resolver.clone(),
            Arc::new(FakeCatalog(catalog)),
            events.clone(),
        )
        .with_hooks(hooks);
        Fixture {
            manager,
            resolver,
            clock,
            events,
        }
    }

    #[test]
    fn test_put_twice_is_idempotent() {
        let mut fx = fixture(Ok(vec![]), &[]);
        fx.manager.put(link_filter("a", false, true));
        let once: Vec<(String, i32)> =
            fx.manager.filters().iter().map(|f| (f.id.clone(), f.priority)).collect();

        fx.manager.put(link_filter("a", false, true));
        let twice: Vec<(String, i32)> =
            fx.manager.filters().iter().map(|f| (f.id.clone(), f.priority)).collect();

        assert_eq!(once, twice);
        assert_eq!(once, vec![("a".to_string(), 1)]);
    }

    #[test]
    fn test_put_preserves_user_state_on_update() {
        let mut fx = fixture(Ok(vec![]), &[]);
        fx.manager.put(link_filter("x", false, false));
        let mut old = link_filter("a", false, true);
        old.custom_name = Some("old".into());
        fx.manager.put(old);
        assert!(fx.manager.set_active("a", true));
        let old_priority = fx.manager.filters()[1].priority;

        let mut new = link_filter("a", true, false);
        new.custom_name = Some("new".into());
        new.priority = 99;
        new.last_fetch = 42;
        fx.manager.put(new);

        let stored = &fx.manager.filters()[1];
        assert_eq!(stored.custom_name.as_deref(), Some("new"));
        assert!(stored.active);
        assert!(!stored.whitelist);
        assert_eq!(stored.priority, old_priority);
        assert_eq!(stored.last_fetch, 0);
    }

    #[test]
    fn test_new_filters_get_next_priority() {
        let mut fx = fixture(Ok(vec![]), &[]);
        fx.manager.put(link_filter("a", false, true));
        fx.manager.put(link_filter("b", false, true));
        let priorities: Vec<i32> = fx.manager.filters().iter().map(|f| f.priority).collect();
        assert_eq!(priorities, vec![1, 2]);
    }

    #[test]
    fn test_set_url_resets_fetch_time_only_on_change() {
        let mut fx = fixture(Ok(vec![]), &[]);
        fx.manager.set_url("http://repo");
        fx.manager.store.last_fetch = 5;
        fx.manager.set_url("http://repo");
        assert_eq!(fx.manager.store.last_fetch, 5);
        fx.manager.set_url("http://other");
        assert_eq!(fx.manager.store.last_fetch, 0);
    }

    #[test]
    fn test_whitelisted_apps() {
        let mut fx = fixture(Ok(vec![]), &[]);
        let mut app = Filter::new("bank", FilterSourceDescriptor::new("app", "com.bank"));
        app.whitelist = true;
        app.active = true;
        fx.manager.put(app);
        fx.manager.put(link_filter("ads", true, true));
        assert_eq!(fx.manager.whitelisted_apps(), vec!["com.bank".to_string()]);
    }

    #[tokio::test]
    async fn test_sync_without_url_returns_false() {
        let mut fx = fixture(Ok(vec![link_filter("a", false, true)]), &[("a", &["bad.com"])]);
        assert!(!fx.manager.sync().await);
        assert!(fx.manager.filters().is_empty());
    }

    #[tokio::test]
    async fn test_empty_catalog_builds_nothing() {
        let mut fx = fixture(Ok(vec![]), &[]);
        fx.manager.set_url("http://repo");
        assert!(!fx.manager.sync().await);
        assert!(!fx.manager.blockade().is_blocked("bad.com"));
    }

    #[tokio::test]
    async fn test_allow_overrides_deny_after_sync() {
        let mut fx = fixture(
            Ok(vec![link_filter("a", false, true), link_filter("b", true, true)]),
            &[("a", &["bad.com", "ads.com"]), ("b", &["bad.com"])],
        );
        fx.manager.set_url("http://repo");
        assert!(fx.manager.sync().await);

        let blockade = fx.manager.blockade();
        assert!(blockade.allowed("bad.com"));
        assert!(!blockade.is_blocked("bad.com"));
        assert!(blockade.is_blocked("ads.com"));
        assert!(fx.manager.filters().iter().all(|f| f.last_fetch == NOW));
    }

    #[tokio::test]
    async fn test_fresh_rulesets_are_not_refetched() {
        let mut fx = fixture(Ok(vec![link_filter("a", false, true)]), &[("a", &["bad.com"])]);
        fx.manager.set_url("http://repo");
        assert!(fx.manager.sync().await);
        assert!(fx.manager.sync().await);
        assert_eq!(fx.resolver.resolved.lock().len(), 1);

        fx.manager.invalidate_cache();
        assert!(fx.manager.sync().await);
        assert_eq!(fx.resolver.resolved.lock().len(), 2);

        fx.clock.fetch_add(86_400_000, Ordering::SeqCst);
        assert!(fx.manager.sync().await);
        assert_eq!(fx.resolver.resolved.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_wifi_only_skips_refetch_off_wifi() {
        let mut fx = fixture(Ok(vec![link_filter("a", false, true)]), &[("a", &["bad.com"])]);
        let wifi = Arc::new(AtomicBool::new(true));
        let on_wifi = wifi.clone();
        fx.manager.hooks.on_wifi = Arc::new(move || on_wifi.load(Ordering::SeqCst));
        fx.manager.set_config(TunnelConfig {
            wifi_only: true,
            first_load: false,
            ..Default::default()
        });
        fx.manager.set_url("http://repo");
        assert!(fx.manager.sync().await);
        assert_eq!(fx.resolver.resolved.lock().len(), 1);

        // Stale, but off wifi: the cached ruleset keeps serving
        wifi.store(false, Ordering::SeqCst);
        fx.clock.fetch_add(2 * 86_400_000, Ordering::SeqCst);
        assert!(fx.manager.sync().await);
        assert_eq!(fx.resolver.resolved.lock().len(), 1);
        assert_eq!(fx.manager.filters()[0].last_fetch, NOW);
        assert!(fx.manager.blockade().is_blocked("bad.com"));

        // The first load always fetches, wifi or not
        fx.manager.set_config(TunnelConfig {
            wifi_only: true,
            first_load: true,
            ..Default::default()
        });
        assert!(fx.manager.sync().await);
        assert_eq!(fx.resolver.resolved.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_limit_keeps_previous_ruleset() {
        let mut fx = fixture(
            Ok(vec![link_filter("a", false, true)]),
            &[("a", &["bad.com", "ads.com", "track.com"])],
        );
        fx.manager.set_url("http://repo");
        assert!(fx.manager.sync().await);
        assert!(fx.manager.blockade().is_blocked("ads.com"));

        fx.manager.hooks.memory_limit = fixed_memory_limit(1);
        fx.manager.invalidate_cache();
        let rx = fx.events.subscribe();
        assert!(fx.manager.sync().await);

        assert_eq!(fx.resolver.resolved.lock().len(), 2);
        assert_eq!(fx.manager.filters()[0].last_fetch, 0);
        assert!(fx.manager.blockade().is_blocked("bad.com"));
        assert!(fx.manager.blockade().is_blocked("ads.com"));
        assert!(rx.try_iter().any(|e| e == Event::MemoryCapacity(1)));
    }

    #[tokio::test]
    async fn test_catalog_failure_keeps_local_filters() {
        let mut fx = fixture(Err("offline".into()), &[("a", &["bad.com"])]);
        fx.manager.put(link_filter("a", false, true));
        fx.manager.set_url("http://repo");

        assert!(fx.manager.sync().await);
        assert!(fx.manager.blockade().is_blocked("bad.com"));
    }

    #[tokio::test]
    async fn test_empty_ruleset_is_a_failed_fetch() {
        let mut fx = fixture(Ok(vec![link_filter("a", false, true)]), &[]);
        fx.manager.set_url("http://repo");

        assert!(fx.manager.sync().await);
        assert_eq!(fx.manager.filters()[0].last_fetch, 0);
    }

    #[tokio::test]
    async fn test_catalog_merge_keeps_user_state() {
        let mut remote = link_filter("a", false, false);
        remote.custom_comment = Some("fresh".into());
        let mut fx = fixture(
            Ok(vec![remote, link_filter("new", false, false)]),
            &[("a", &["bad.com"])],
        );
        fx.manager.put(link_filter("a", false, true));
        fx.manager.set_url("http://repo");
        let rx = fx.events.subscribe();

        assert!(fx.manager.sync().await);

        let filters = fx.manager.filters();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].id, "a");
        assert!(filters[0].active);
        assert_eq!(filters[0].custom_comment.as_deref(), Some("fresh"));
        assert_eq!(filters[0].priority, 0);
        assert_eq!(filters[1].id, "new");
        assert_eq!(filters[1].priority, 1);

        let events: Vec<Event> = rx.try_iter().collect();
        assert_eq!(events.first(), Some(&Event::FiltersChanging));
        assert!(events.iter().any(|e| matches!(e, Event::MemoryCapacity(_))));
    }

    #[tokio::test]
    async fn test_store_is_persisted_after_sync() {
        let mut fx = fixture(Ok(vec![link_filter("a", false, true)]), &[("a", &["bad.com"])]);
        fx.manager.set_url("http://repo");
        fx.manager.sync().await;

        let stored: FilterStore = fx.manager.persistence.read_or_default(KEY_FILTERS);
        assert_eq!(stored.url, "http://repo");
        assert_eq!(stored.cache.len(), 1);
    }
}
