//! Filter List Store
//!
//! Owns every installed [`FilterList`] plus the user's custom rule list.
//! Lists are held behind `Arc` and never patched in place: any change builds
//! a new list value (copy-on-write) and swaps the reference, so a reader
//! holding a previous snapshot keeps seeing a consistent list.

use crate::filter_list::{FilterList, ListSource};
use crate::rule::{FilterRule, RuleKind, parse_rule};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Id of the list holding user-authored rules
pub const CUSTOM_LIST_ID: &str = "custom";

/// Outcome of a network scan
#[derive(Debug, Clone)]
pub struct RuleMatch {
    /// Id of the list the rule came from
    pub list_id: String,
    pub rule: Arc<FilterRule>,
}

/// Collection of filter lists in evaluation order
#[derive(Debug, Clone)]
pub struct FilterListStore {
    custom: Arc<FilterList>,
    lists: Vec<Arc<FilterList>>,
}

impl Default for FilterListStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterListStore {
    pub fn new() -> Self {
        Self {
            custom: Arc::new(FilterList::new(CUSTOM_LIST_ID, "Custom rules", ListSource::User)),
            lists: Vec::new(),
        }
    }

    /// Installed lists, custom list excluded, in insertion order
    pub fn lists(&self) -> &[Arc<FilterList>] {
        &self.lists
    }

    pub fn get(&self, id: &str) -> Option<&Arc<FilterList>> {
        if id == CUSTOM_LIST_ID {
            return Some(&self.custom);
        }
        self.lists.iter().find(|l| l.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Install a new list at the end of the evaluation order
    ///
    /// Returns `false` when the id is already taken.
    pub fn insert(&mut self, list: FilterList) -> bool {
        if self.contains(&list.id) {
            return false;
        }
        self.lists.push(Arc::new(list));
        true
    }

    /// Swap a list for a new version, keeping its position
    pub fn replace(&mut self, list: FilterList) -> bool {
        match self.lists.iter_mut().find(|l| l.id == list.id) {
            Some(slot) => {
                *slot = Arc::new(list);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<FilterList>> {
        let index = self.lists.iter().position(|l| l.id == id)?;
        Some(self.lists.remove(index))
    }

    /// Returns `Some(changed)`, or `None` for an unknown id
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Option<bool> {
        let slot = self.lists.iter_mut().find(|l| l.id == id)?;
        if slot.enabled == enabled {
            return Some(false);
        }
        Arc::make_mut(slot).enabled = enabled;
        Some(true)
    }

    pub fn set_expiry(&mut self, id: &str, expires_at: Option<DateTime<Utc>>) -> bool {
        match self.lists.iter_mut().find(|l| l.id == id) {
            Some(slot) => {
                Arc::make_mut(slot).expires_at = expires_at;
                true
            }
            None => false,
        }
    }

    /// The custom rule list
    pub fn custom(&self) -> &Arc<FilterList> {
        &self.custom
    }

    /// Add a custom rule. Fails on unparsable input or a duplicate.
    pub fn add_custom_rule(&mut self, line: &str, now: DateTime<Utc>) -> Option<Arc<FilterRule>> {
        let line = line.trim();
        if self.custom.rules.iter().any(|r| r.raw == line) {
            return None;
        }
        let rule = Arc::new(parse_rule(line, now)?);
        Arc::make_mut(&mut self.custom).rules.push(Arc::clone(&rule));
        Some(rule)
    }

    pub fn remove_custom_rule(&mut self, line: &str) -> bool {
        let line = line.trim();
        let Some(index) = self.custom.rules.iter().position(|r| r.raw == line) else {
            return false;
        };
        Arc::make_mut(&mut self.custom).rules.remove(index);
        true
    }

    /// Returns `Some(changed)`, or `None` when no such custom rule exists
    pub fn set_custom_rule_enabled(&mut self, line: &str, enabled: bool) -> Option<bool> {
        let line = line.trim();
        let index = self.custom.rules.iter().position(|r| r.raw == line)?;
        if self.custom.rules[index].enabled == enabled {
            return Some(false);
        }
        let custom = Arc::make_mut(&mut self.custom);
        custom.rules[index] = Arc::new(custom.rules[index].with_enabled(enabled));
        Some(true)
    }

    /// Lists taking part in matching: custom rules first, then enabled lists
    pub fn active_lists(&self) -> impl Iterator<Item = &Arc<FilterList>> {
        std::iter::once(&self.custom)
            .chain(self.lists.iter())
            .filter(|l| l.enabled)
    }

    /// First enabled network rule matching the request.
    ///
    /// Lists are visited in order and the first list with a matching rule
    /// decides. Inside a list, its exception rules are checked before its
    /// block rules, each in file order.
    ///
    /// `url` must be lower-cased.
    pub fn first_network_match(&self, url: &str, source_domain: &str) -> Option<RuleMatch> {
        for list in self.active_lists() {
            let hit = list
                .rules
                .iter()
                .find(|r| r.is_exception && r.matches_request(url, source_domain))
                .or_else(|| {
                    list.rules
                        .iter()
                        .find(|r| !r.is_exception && r.matches_request(url, source_domain))
                });
            if let Some(rule) = hit {
                return Some(RuleMatch {
                    list_id: list.id.clone(),
                    rule: Arc::clone(rule),
                });
            }
        }
        None
    }

    /// Enabled cosmetic rules in evaluation order
    pub fn cosmetic_rules(&self) -> impl Iterator<Item = &Arc<FilterRule>> {
        self.active_lists()
            .flat_map(|l| l.rules.iter())
            .filter(|r| r.enabled && r.kind.is_cosmetic())
    }

    /// Enabled rules across active lists
    pub fn active_rule_count(&self) -> usize {
        self.active_lists()
            .map(|l| l.rules.iter().filter(|r| r.enabled).count())
            .sum()
    }

    /// Enabled network rules across active lists
    pub fn active_network_rule_count(&self) -> usize {
        self.active_lists()
            .map(|l| {
                l.rules
                    .iter()
                    .filter(|r| r.enabled && r.kind == RuleKind::NetworkBlock)
                    .count()
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(id: &str, body: &str) -> FilterList {
        FilterList::parse_str(id, ListSource::User, body, Utc::now()).unwrap()
    }

    #[test]
    fn test_insert_rejects_duplicate_ids() {
        let mut store = FilterListStore::new();
        assert!(store.insert(list("a", "||a.test^")));
        assert!(!store.insert(list("a", "||b.test^")));
        assert!(!store.insert(list(CUSTOM_LIST_ID, "||b.test^")));
        assert_eq!(store.lists().len(), 1);
    }

    #[test]
    fn test_first_match_follows_list_order() {
        let mut store = FilterListStore::new();
        store.insert(list("block", "||ads.test^"));
        store.insert(list("allow", "@@||ads.test^"));

        let hit = store.first_network_match("https://ads.test/x", "").unwrap();
        assert_eq!(hit.list_id, "block");
        assert!(!hit.rule.is_exception);

        let mut reversed = FilterListStore::new();
        reversed.insert(list("allow", "@@||ads.test^"));
        reversed.insert(list("block", "||ads.test^"));
        let hit = reversed.first_network_match("https://ads.test/x", "").unwrap();
        assert!(hit.rule.is_exception);
    }

    #[test]
    fn test_exception_wins_inside_one_list() {
        let mut store = FilterListStore::new();
        store.insert(list("a", "||doubleclick.net^\n@@||doubleclick.net/safe^"));

        let hit = store.first_network_match("https://doubleclick.net/safe", "").unwrap();
        assert!(hit.rule.is_exception);
        let hit = store.first_network_match("https://doubleclick.net/x", "").unwrap();
        assert!(!hit.rule.is_exception);
    }

    #[test]
    fn test_disabled_list_is_skipped() {
        let mut store = FilterListStore::new();
        store.insert(list("a", "||ads.test^"));
        assert_eq!(store.set_enabled("a", false), Some(true));
        assert_eq!(store.set_enabled("a", false), Some(false));
        assert_eq!(store.set_enabled("missing", true), None);

        assert!(store.first_network_match("https://ads.test/", "").is_none());
        assert_eq!(store.active_rule_count(), 0);
        assert_eq!(store.get("a").unwrap().rule_count(), 1);
    }

    #[test]
    fn test_custom_rules_scanned_first() {
        let mut store = FilterListStore::new();
        store.insert(list("a", "||ads.test^"));
        assert!(store.add_custom_rule("@@||ads.test/ok^", Utc::now()).is_some());

        let hit = store.first_network_match("https://ads.test/ok", "").unwrap();
        assert_eq!(hit.list_id, CUSTOM_LIST_ID);
    }

    #[test]
    fn test_custom_rule_lifecycle() {
        let mut store = FilterListStore::new();
        let now = Utc::now();

        assert!(store.add_custom_rule("||ads.test^", now).is_some());
        assert!(store.add_custom_rule(" ||ads.test^ ", now).is_none());
        assert!(store.add_custom_rule("! comment", now).is_none());

        assert_eq!(store.set_custom_rule_enabled("||ads.test^", false), Some(true));
        assert!(store.first_network_match("https://ads.test/", "").is_none());
        assert_eq!(store.set_custom_rule_enabled("||ads.test^", true), Some(true));
        assert!(store.first_network_match("https://ads.test/", "").is_some());

        assert!(store.remove_custom_rule("||ads.test^"));
        assert!(!store.remove_custom_rule("||ads.test^"));
        assert_eq!(store.set_custom_rule_enabled("||ads.test^", true), None);
    }

    #[test]
    fn test_replace_swaps_whole_list() {
        let mut store = FilterListStore::new();
        store.insert(list("a", "||old.test^"));
        store.insert(list("b", "||other.test^"));
        let snapshot = store.clone();

        assert!(store.replace(list("a", "||new.test^")));
        assert!(!store.replace(list("zzz", "||new.test^")));

        assert!(store.first_network_match("https://old.test/", "").is_none());
        assert!(store.first_network_match("https://new.test/", "").is_some());
        assert_eq!(store.lists()[0].id, "a");

        // Earlier snapshots are unaffected
        assert!(snapshot.first_network_match("https://old.test/", "").is_some());
    }

    #[test]
    fn test_cosmetic_rules_only_from_active_lists() {
        let mut store = FilterListStore::new();
        store.insert(list("a", "example.com##.ad\n||x.test^"));
        store.insert(list("b", "##.banner"));
        store.set_enabled("b", false);

        let selectors: Vec<_> = store.cosmetic_rules().map(|r| r.raw_pattern.as_str()).collect();
        assert_eq!(selectors, vec![".ad"]);
    }
}
