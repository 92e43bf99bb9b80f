//! Destination policy filter.
//!
//! The policy store is shared between the proxy and the external policy
//! editor. Every query re-reads the store; decisions are never cached, so
//! edits take effect on the next connection or chunk.
//!
//! Threshold semantics per domain key: `-1` no limit, `0` block as soon as
//! the domain is recognised, `n > 0` close the relay once cumulative
//! download bytes exceed `n`. Keys match by case-insensitive substring
//! against the queried host; the first matching key in iteration order wins.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Connect-time verdict for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    /// Open the connection.
    Allow,
    /// Refuse the connection.
    Block,
}

/// Block-all threshold value.
pub const THRESHOLD_BLOCK: i64 = 0;

/// No-limit threshold value.
pub const THRESHOLD_UNLIMITED: i64 = -1;

#[derive(Debug, Default)]
struct PolicyState {
    enabled: bool,
    thresholds: HashMap<String, i64>,
}

/// Shared domain policy: an enable gate plus a domain → threshold map.
///
/// Writers (the policy editor) and readers (the filter) may race; the lock
/// gives per-query consistency, which is all the filter needs.
#[derive(Debug)]
pub struct PolicyStore {
    state: RwLock<PolicyState>,
}

impl PolicyStore {
    /// Create an enabled store with no thresholds (everything allowed).
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PolicyState {
                enabled: true,
                thresholds: HashMap::new(),
            }),
        }
    }

    /// Gate the whole filter. When disabled every query allows.
    pub fn set_enabled(&self, enabled: bool) {
        self.state.write().enabled = enabled;
    }

    /// Whether filtering is currently enabled.
    pub fn is_enabled(&self) -> bool {
        self.state.read().enabled
    }

    /// Insert or update a domain threshold.
    pub fn set_threshold(&self, domain: impl Into<String>, threshold: i64) {
        self.state.write().thresholds.insert(domain.into(), threshold);
    }

    /// Remove a domain threshold.
    pub fn remove_threshold(&self, domain: &str) {
        self.state.write().thresholds.remove(domain);
    }

    /// Replace the whole threshold map.
    pub fn replace(&self, thresholds: HashMap<String, i64>) {
        self.state.write().thresholds = thresholds;
    }

    /// Number of configured thresholds.
    pub fn len(&self) -> usize {
        self.state.read().thresholds.len()
    }

    /// True when no thresholds are configured.
    pub fn is_empty(&self) -> bool {
        self.state.read().thresholds.is_empty()
    }

    /// Connect-time decision for a destination.
    ///
    /// Blocks only when some key substring-matches `host` and maps to `0`;
    /// byte-threshold enforcement happens later inside the relay.
    pub fn should_allow(&self, host: &str, _port: u16) -> FilterDecision {
        let state = self.state.read();
        if !state.enabled {
            return FilterDecision::Allow;
        }

        let host = host.to_ascii_lowercase();
        for (domain, threshold) in &state.thresholds {
            if *threshold == THRESHOLD_BLOCK && host.contains(&domain.to_ascii_lowercase()) {
                return FilterDecision::Block;
            }
        }

        FilterDecision::Allow
    }

    /// Download budget for a sniffed server name, if any.
    ///
    /// The first key that substring-matches decides: `-1` yields `None`
    /// (unlimited), `0` or `n` yields `Some`.
    pub fn stream_block_threshold(&self, sni: &str) -> Option<u64> {
        let state = self.state.read();
        if !state.enabled {
            return None;
        }

        let sni = sni.to_ascii_lowercase();
        for (domain, threshold) in &state.thresholds {
            if sni.contains(&domain.to_ascii_lowercase()) {
                return if *threshold < 0 {
                    None
                } else {
                    Some(*threshold as u64)
                };
            }
        }

        None
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_allows_everything() {
        let store = PolicyStore::new();
        store.set_threshold("evil.test", THRESHOLD_BLOCK);
        store.set_enabled(false);

        assert_eq!(store.should_allow("api.evil.test", 443), FilterDecision::Allow);
        assert_eq!(store.stream_block_threshold("api.evil.test"), None);
    }

    #[test]
    fn test_block_all_matches_substring_case_insensitive() {
        let store = PolicyStore::new();
        store.set_threshold("cdninstagram.com", THRESHOLD_BLOCK);

        assert_eq!(
            store.should_allow("scontent-sjc6-1.CDNINSTAGRAM.com", 443),
            FilterDecision::Block
        );
        assert_eq!(store.should_allow("example.com", 443), FilterDecision::Allow);
    }

    #[test]
    fn test_positive_threshold_allows_connect() {
        let store = PolicyStore::new();
        store.set_threshold("streamy.test", 1024);

        // Byte budgets only apply inside the relay, never at CONNECT time.
        assert_eq!(store.should_allow("www.streamy.test", 443), FilterDecision::Allow);
        assert_eq!(store.stream_block_threshold("www.streamy.test"), Some(1024));
    }

    #[test]
    fn test_unlimited_threshold() {
        let store = PolicyStore::new();
        store.set_threshold("free.test", THRESHOLD_UNLIMITED);

        assert_eq!(store.should_allow("cdn.free.test", 443), FilterDecision::Allow);
        assert_eq!(store.stream_block_threshold("cdn.free.test"), None);
    }

    #[test]
    fn test_zero_threshold_stream_block() {
        let store = PolicyStore::new();
        store.set_threshold("zero.test", THRESHOLD_BLOCK);

        assert_eq!(store.stream_block_threshold("www.zero.test"), Some(0));
    }

    #[test]
    fn test_no_match_means_no_budget() {
        let store = PolicyStore::new();
        store.set_threshold("metered.test", 4096);

        assert_eq!(store.stream_block_threshold("other.example"), None);
    }

    #[test]
    fn test_replace_and_remove() {
        let store = PolicyStore::new();
        store.set_threshold("a.test", THRESHOLD_BLOCK);
        store.remove_threshold("a.test");
        assert!(store.is_empty());

        let mut map = HashMap::new();
        map.insert("b.test".to_string(), 512);
        store.replace(map);
        assert_eq!(store.len(), 1);
        assert_eq!(store.stream_block_threshold("www.b.test"), Some(512));
    }
}
