//! Decision Cache
//!
//! Memoizes block/allow verdicts per exact request URL. The key ignores the
//! source page and resource type, so the cache is only valid for one rule set
//! and is cleared in full on every rule, list or whitelist change.

use std::collections::HashMap;

/// Cache statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Number of full invalidations so far
    pub generation: u64,
}

/// Verdict cache keyed by request URL
#[derive(Debug)]
pub struct DecisionCache {
    verdicts: HashMap<String, bool>,
    capacity: usize,
    hits: u64,
    misses: u64,
    generation: u64,
}

impl DecisionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            verdicts: HashMap::new(),
            capacity: capacity.max(1),
            hits: 0,
            misses: 0,
            generation: 0,
        }
    }

    /// Cached verdict for a URL
    #[inline]
    pub fn get(&mut self, url: &str) -> Option<bool> {
        match self.verdicts.get(url) {
            Some(&verdict) => {
                self.hits += 1;
                Some(verdict)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Store a verdict. A full cache is emptied first rather than evicting
    /// single entries.
    pub fn insert(&mut self, url: String, verdict: bool) {
        if self.verdicts.len() >= self.capacity && !self.verdicts.contains_key(&url) {
            self.verdicts.clear();
        }
        self.verdicts.insert(url, verdict);
    }

    /// Drop every cached verdict
    pub fn clear(&mut self) {
        self.verdicts.clear();
        self.generation += 1;
    }

    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.verdicts.len(),
            hits: self.hits,
            misses: self.misses,
            generation: self.generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_miss() {
        let mut cache = DecisionCache::new(16);
        assert_eq!(cache.get("https://a.test/"), None);

        cache.insert("https://a.test/".to_string(), true);
        assert_eq!(cache.get("https://a.test/"), Some(true));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_clear_bumps_generation() {
        let mut cache = DecisionCache::new(16);
        cache.insert("https://a.test/".to_string(), false);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().generation, 1);
        assert_eq!(cache.get("https://a.test/"), None);
    }

    #[test]
    fn test_full_cache_is_emptied() {
        let mut cache = DecisionCache::new(2);
        cache.insert("a".to_string(), true);
        cache.insert("b".to_string(), false);
        cache.insert("b".to_string(), true);
        assert_eq!(cache.len(), 2);

        cache.insert("c".to_string(), true);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("c"), Some(true));
        assert_eq!(cache.get("a"), None);
    }
}
