#![forbid(unsafe_code)]

use crate::error::Error;
use parking_lot::RwLock;
use regex::Regex;
use std::sync::Arc;

/// Predicate over a VM's main class.
pub trait VmFilter: Send + Sync {
    fn matches(&self, main_class: &str) -> bool;
}

impl<F> VmFilter for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn matches(&self, main_class: &str) -> bool {
        self(main_class)
    }
}

#[derive(Debug, Clone)]
pub enum MainClassFilter {
    Exact(String),
    Prefix(String),
    Pattern(Regex),
}

impl MainClassFilter {
    /// Parse a configured blacklist entry: `re:<regex>`, `<prefix>*` or an
    /// exact main class.
    pub fn parse(pattern: &str) -> Result<Self, Error> {
        if let Some(raw) = pattern.strip_prefix("re:") {
            let regex = Regex::new(raw).map_err(|source| Error::InvalidFilter {
                pattern: pattern.to_string(),
                source,
            })?;
            return Ok(Self::Pattern(regex));
        }
        match pattern.strip_suffix('*') {
            Some(prefix) => Ok(Self::Prefix(prefix.to_string())),
            None => Ok(Self::Exact(pattern.to_string())),
        }
    }
}

impl VmFilter for MainClassFilter {
    fn matches(&self, main_class: &str) -> bool {
        match self {
            Self::Exact(name) => main_class == name,
            Self::Prefix(prefix) => main_class.starts_with(prefix.as_str()),
            Self::Pattern(regex) => regex.is_match(main_class),
        }
    }
}

/// Runtime-mutable veto list. Readers take a snapshot of the filter list, so
/// evaluation never waits on a reconfiguration for longer than a pointer
/// swap.
#[derive(Default)]
pub struct VmBlacklist {
    filters: RwLock<Arc<Vec<Arc<dyn VmFilter>>>>,
}

impl VmBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a blacklist from configured patterns.
    pub fn from_patterns<T: AsRef<str>>(patterns: &[T]) -> Result<Self, Error> {
        let blacklist = Self::new();
        blacklist.replace_filters(Self::parse_patterns(patterns)?);
        Ok(blacklist)
    }

    pub fn parse_patterns<T: AsRef<str>>(patterns: &[T]) -> Result<Vec<Arc<dyn VmFilter>>, Error> {
        patterns
            .iter()
            .map(|pattern| {
                MainClassFilter::parse(pattern.as_ref())
                    .map(|filter| Arc::new(filter) as Arc<dyn VmFilter>)
            })
            .collect()
    }

    pub fn add_filter(&self, filter: Arc<dyn VmFilter>) {
        let mut filters = self.filters.write();
        let mut next = Vec::clone(&filters);
        next.push(filter);
        *filters = Arc::new(next);
    }

    /// Remove a previously added filter. Filters are compared by identity.
    pub fn remove_filter(&self, filter: &Arc<dyn VmFilter>) -> bool {
        let mut filters = self.filters.write();
        let before = filters.len();
        let next: Vec<_> = filters
            .iter()
            .filter(|candidate| !Arc::ptr_eq(candidate, filter))
            .cloned()
            .collect();
        let removed = next.len() != before;
        *filters = Arc::new(next);
        removed
    }

    pub fn replace_filters(&self, filters: Vec<Arc<dyn VmFilter>>) {
        *self.filters.write() = Arc::new(filters);
    }

    pub fn is_blacklisted(&self, main_class: &str) -> bool {
        let filters = Arc::clone(&self.filters.read());
        filters.iter().any(|filter| filter.matches(main_class))
    }

    pub fn len(&self) -> usize {
        self.filters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
