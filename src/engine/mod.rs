mod blockade;
mod catalog;
mod filter;
mod manager;
mod matcher;
mod memory;
mod ruleset;
mod sources;
mod store;
mod traits;

pub use blockade::{Blockade, Snapshot};
pub use catalog::{decode_catalog, fetch_catalog, HttpCatalog};
pub use filter::{
    prioritised, Filter, FilterId, FilterSourceDescriptor, FilterStore, Time, SOURCE_APP,
    SOURCE_FILE, SOURCE_LINK, SOURCE_SINGLE,
};
pub use manager::{FilterManager, ManagerHooks};
pub use matcher::{HostTable, MatchStrategy};
pub use memory::{fixed_memory_limit, lines_available, system_memory_limit, MemoryLimit};
pub use ruleset::Ruleset;
pub use sources::{
    http_client, parse_host_line, parse_hosts, AppSource, DefaultSourceResolver, FileSource,
    LinkSource, SingleSource,
};
pub use store::RulesetStore;
pub use traits::{CatalogFetcher, DomainMatcher, RulesetSource, SourceResolver};
