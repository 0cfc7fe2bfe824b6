use super::ruleset::Ruleset;
use rustc_hash::FxHashSet;

/// How ruleset entries are interpreted when a snapshot is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchStrategy {
    /// The host must be present verbatim.
    #[default]
    Exact,
    /// Entries of the form `*.domain` also match every subdomain of `domain`.
    Wildcard,
}

/// Immutable lookup table built from one ruleset.
#[derive(Debug, Default)]
pub struct HostTable {
    exact: FxHashSet<Box<str>>,
    // Stored with the leading '*' stripped, so ".ads.example.com".
    suffixes: FxHashSet<Box<str>>,
}

impl HostTable {
    pub fn build(ruleset: &Ruleset, strategy: MatchStrategy) -> Self {
        let mut exact = FxHashSet::with_capacity_and_hasher(ruleset.len(), Default::default());
        let mut suffixes = FxHashSet::default();

        for host in ruleset.iter() {
            match (strategy, host.strip_prefix('*')) {
                (MatchStrategy::Wildcard, Some(suffix)) if suffix.starts_with('.') => {
                    suffixes.insert(suffix.into());
                }
                _ => {
                    exact.insert(host.into());
                }
            }
        }

        Self { exact, suffixes }
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.suffixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn matches(&self, host: &str) -> bool {
        if self.exact.contains(host) {
            return true;
        }
        if self.suffixes.is_empty() {
            return false;
        }

        // Iterative suffix match, equivalent to host.ends_with(suffix) for
        // every suffix since each one starts at a label boundary.
        let mut part = host;
        while let Some(idx) = part.find('.') {
            let suffix = &part[idx..];
            if self.suffixes.contains(suffix) {
                return true;
            }
            part = &part[idx + 1..];
        }
        false
    }
}
