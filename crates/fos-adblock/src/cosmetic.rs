//! Cosmetic Index
//!
//! Per-domain element-hiding selectors and injected scripts, derived from the
//! enabled cosmetic rules of a [`FilterListStore`] snapshot. Entries are
//! computed lazily on first request for a domain and never patched: the
//! engine drops the whole index whenever the rule set changes.

use crate::domain::normalize_domain;
use crate::rule::{FilterRule, RuleKind};
use crate::store::FilterListStore;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

/// Cosmetic rules that apply to one domain
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CosmeticEntry {
    /// Selectors to hide, in rule order
    pub css_selectors: Vec<String>,
    /// Script tokens to inject, in rule order
    pub injected_scripts: Vec<String>,
}

impl CosmeticEntry {
    /// Stylesheet hiding every selector
    pub fn css_text(&self) -> String {
        let mut css = String::new();
        for selector in &self.css_selectors {
            css.push_str(selector);
            css.push_str(" { display: none !important; }\n");
        }
        css
    }

    /// Scripts joined with newlines
    pub fn script_text(&self) -> String {
        self.injected_scripts.join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.css_selectors.is_empty() && self.injected_scripts.is_empty()
    }
}

/// Lazily filled domain → cosmetic entry map
#[derive(Debug)]
pub struct CosmeticIndex {
    rules: Vec<Arc<FilterRule>>,
    entries: Mutex<HashMap<String, Arc<CosmeticEntry>>>,
}

impl CosmeticIndex {
    /// Capture the enabled cosmetic rules of a store
    pub fn build(store: &FilterListStore) -> Self {
        Self {
            rules: store.cosmetic_rules().cloned().collect(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of cosmetic rules captured
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Entry for a page domain
    pub fn entry(&self, domain: &str) -> Arc<CosmeticEntry> {
        let domain = normalize_domain(domain);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get(&domain) {
            return Arc::clone(entry);
        }

        let entry = Arc::new(self.compute(&domain));
        trace!(
            "Cosmetic entry for '{}': {} selectors, {} scripts",
            domain,
            entry.css_selectors.len(),
            entry.injected_scripts.len()
        );
        entries.insert(domain, Arc::clone(&entry));
        entry
    }

    fn compute(&self, domain: &str) -> CosmeticEntry {
        let applicable = || self.rules.iter().filter(|r| r.applies_to(domain));

        let suppressed: HashSet<&str> = applicable()
            .filter(|r| r.kind == RuleKind::ElementHideException)
            .map(|r| r.raw_pattern.as_str())
            .collect();

        let mut entry = CosmeticEntry::default();
        let mut seen_css = HashSet::new();
        let mut seen_scripts = HashSet::new();

        for rule in applicable() {
            let payload = rule.raw_pattern.as_str();
            match rule.kind {
                RuleKind::ElementHide => {
                    if !suppressed.contains(payload) && seen_css.insert(payload) {
                        entry.css_selectors.push(payload.to_string());
                    }
                }
                RuleKind::ScriptInject => {
                    if seen_scripts.insert(payload) {
                        entry.injected_scripts.push(payload.to_string());
                    }
                }
                RuleKind::ElementHideException | RuleKind::NetworkBlock => {}
            }
        }
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter_list::{FilterList, ListSource};
    use chrono::Utc;

    fn index(body: &str) -> CosmeticIndex {
        let mut store = FilterListStore::new();
        store.insert(FilterList::parse_str("test", ListSource::User, body, Utc::now()).unwrap());
        CosmeticIndex::build(&store)
    }

    #[test]
    fn test_domain_scoped_selector() {
        let index = index("example.com##.ad-banner\n||x.test^");
        assert_eq!(index.rule_count(), 1);
        assert_eq!(index.entry("example.com").css_selectors, vec![".ad-banner"]);
        assert_eq!(index.entry("www.example.com").css_selectors, vec![".ad-banner"]);
        assert_eq!(index.entry("shop.example.com").css_selectors, vec![".ad-banner"]);
        assert!(index.entry("other.com").is_empty());
    }

    #[test]
    fn test_exception_removes_selector() {
        let index = index("##.ad\n##.sponsor\nexample.com#@#.ad\nexample.com##.sponsor");
        assert_eq!(index.entry("example.com").css_selectors, vec![".sponsor"]);
        assert_eq!(index.entry("other.com").css_selectors, vec![".ad", ".sponsor"]);
    }

    #[test]
    fn test_scripts_and_text() {
        let index = index("example.com#?#abort-current-script.js\n~example.com##.promo");
        let entry = index.entry("example.com");
        assert!(entry.css_selectors.is_empty());
        assert_eq!(entry.script_text(), "abort-current-script.js");

        let other = index.entry("other.com");
        assert_eq!(other.css_text(), ".promo { display: none !important; }\n");
        assert_eq!(other.script_text(), "");
    }

    #[test]
    fn test_entries_are_memoized() {
        let index = index("##.ad");
        let first = index.entry("a.com");
        let second = index.entry("A.COM");
        assert!(Arc::ptr_eq(&first, &second));
    }
}
