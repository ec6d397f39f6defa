//! Per-tab and per-resource trust states.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};

/// Browser tab identifier as handed out by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub i64);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrustState {
    Unknown,
    DohFailure,
    IgnoredDomain,
    IgnoredResource,
    Trusted,
    TrustedPartial,
    Untrusted,
}

impl TrustState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::DohFailure => "doh-failure",
            Self::IgnoredDomain => "ignored-domain",
            Self::IgnoredResource => "ignored-resource",
            Self::Trusted => "trusted",
            Self::TrustedPartial => "trusted-partial",
            Self::Untrusted => "untrusted",
        }
    }

    /// Fold a resource outcome into the tab's state for the current navigation.
    ///
    /// Only ever moves toward the worse outcome. `untrusted` absorbs
    /// everything. `doh-failure` absorbs everything but `untrusted` until some
    /// resource verifies; verified resources mixed with unverifiable ones
    /// settle on `trusted-partial`.
    pub fn merge(self, resource: TrustState) -> TrustState {
        use TrustState::*;

        match (self, resource) {
            (Untrusted, _) | (_, Untrusted) => Untrusted,
            (Trusted | TrustedPartial, DohFailure) | (DohFailure, Trusted | TrustedPartial) => TrustedPartial,
            (DohFailure, _) | (_, DohFailure) => DohFailure,
            (current, Unknown) => current,
            (Unknown, IgnoredResource) => IgnoredResource,
            (current, IgnoredResource) => current,
            (Unknown | IgnoredResource, next) => next,
            (Trusted, Trusted) => Trusted,
            (IgnoredDomain, IgnoredDomain) => IgnoredDomain,
            _ => TrustedPartial,
        }
    }
}

impl fmt::Display for TrustState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-resource entries kept per tab; the aggregate state keeps absorbing
/// outcomes past this point.
const MAX_RESOURCES_PER_TAB: usize = 512;

#[derive(Debug, Default)]
struct TabTrust {
    state: Option<TrustState>,
    resources: HashMap<String, TrustState>,
}

/// Capacity-bounded table of tab trust states; the least recently touched
/// tab is evicted when full.
#[derive(Debug)]
pub struct TrustTable {
    tabs: LruCache<TabId, TabTrust>,
}

impl TrustTable {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            tabs: LruCache::new(capacity),
        }
    }

    /// Record a resource outcome and return the tab's resulting state.
    pub fn record(&mut self, tab: TabId, url: &str, state: TrustState) -> TrustState {
        let entry = self.tabs.get_or_insert_mut(tab, TabTrust::default);

        if entry.resources.len() < MAX_RESOURCES_PER_TAB || entry.resources.contains_key(url) {
            entry.resources.insert(url.to_string(), state);
        }

        let merged = entry.state.unwrap_or(TrustState::Unknown).merge(state);
        entry.state = Some(merged);
        merged
    }

    /// Start a new navigation: forget everything recorded for the tab.
    pub fn reset_tab(&mut self, tab: TabId) {
        self.tabs.put(tab, TabTrust::default());
    }

    pub fn remove_tab(&mut self, tab: TabId) -> bool {
        self.tabs.pop(&tab).is_some()
    }

    pub fn tab_state(&mut self, tab: TabId) -> Option<TrustState> {
        self.tabs.get(&tab).and_then(|t| t.state)
    }

    pub fn resource_state(&self, tab: TabId, url: &str) -> Option<TrustState> {
        self.tabs
            .peek(&tab)
            .and_then(|t| t.resources.get(url).copied())
    }

    pub fn contains_tab(&self, tab: TabId) -> bool {
        self.tabs.contains(&tab)
    }

    pub fn clear(&mut self) {
        self.tabs.clear();
    }

    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }
}
