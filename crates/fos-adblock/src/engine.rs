//! Content-blocking engine facade
//!
//! [`AdBlockEngine`] owns the filter lists, whitelist, decision cache and
//! cosmetic index, answers block decisions on the hot path and exposes the
//! management API.
//!
//! Locking:
//! - `state` (RwLock) guards lists, whitelist and flags. `decide` holds the
//!   read side across its cache write, every mutation holds the write side
//!   while it clears the caches, so no verdict computed from an older rule
//!   set can land in the cache after an invalidation.
//! - Lock order is `persist_lock` → `state` → `cache` / `cosmetic`.
//! - `decide` never touches disk or network.

use crate::cache::{CacheStats, DecisionCache};
use crate::clock::{Clock, SystemClock};
use crate::cosmetic::{CosmeticEntry, CosmeticIndex};
use crate::domain::{domain_suffixes, normalize_domain, source_domain};
use crate::events::{EngineEvent, EventBus};
use crate::filter_list::{FilterList, ListSource};
use crate::interceptor::ResourceType;
use crate::settings::{
    BUILTIN_LIST_ID, DEFAULT_RULES, FilterCatalog, FilterListSettings, Settings, SettingsError,
    SettingsStore, write_json_atomic,
};
use crate::stats::{BlockStatistics, StatisticsSnapshot};
use crate::store::{CUSTOM_LIST_ID, FilterListStore};
use crate::updater::{ListUpdateOutcome, UpdateError};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Refresh interval of an engine started without settings. Lists that
    /// announce `! Expires:` use their own.
    pub default_update_interval: TimeDelta,
    /// How often the updater looks for due subscriptions
    pub update_check_period: Duration,
    /// How often expired lists are switched off
    pub expiry_sweep_period: Duration,
    /// Network timeout for one list download
    pub fetch_timeout: Duration,
    /// Cached verdicts before the cache is emptied
    pub cache_capacity: usize,
    /// Default size of the top blocked domains ranking
    pub top_domains_limit: usize,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_update_interval: TimeDelta::hours(24),
            update_check_period: Duration::from_secs(15 * 60),
            expiry_sweep_period: Duration::from_secs(60 * 60),
            fetch_timeout: Duration::from_secs(30),
            cache_capacity: 100_000,
            top_domains_limit: 10,
            event_capacity: crate::events::EVENT_CAPACITY,
        }
    }
}

/// Why a request was allowed or blocked
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DecisionReason {
    /// Engine switched off
    Disabled,
    /// Source page is whitelisted
    Whitelisted,
    /// Verdict came from the decision cache
    Cached,
    /// Block rule matched
    Rule { list_id: String, rule: String },
    /// Exception rule matched
    Exception { list_id: String, rule: String },
    /// Nothing matched
    NoMatch,
}

/// Block verdict with its cause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub blocked: bool,
    pub reason: DecisionReason,
}

/// Observable engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Switched off by the user; every request is allowed
    Disabled,
    /// Enabled but without a single active rule; every request is allowed
    Empty,
    Active { rules: usize },
}

/// Summary of one installed list
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListInfo {
    pub id: String,
    pub name: String,
    pub source: ListSource,
    pub url: Option<String>,
    pub enabled: bool,
    pub version: Option<String>,
    pub rules: usize,
    pub last_updated: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&FilterList> for ListInfo {
    fn from(list: &FilterList) -> Self {
        Self {
            id: list.id.clone(),
            name: list.display_name.clone(),
            source: list.source,
            url: list.source_url.clone(),
            enabled: list.enabled,
            version: list.version.clone(),
            rules: list.rule_count(),
            last_updated: list.last_updated,
            expires_at: list.expires_at,
        }
    }
}

/// One user-authored rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomRuleInfo {
    pub rule: String,
    pub enabled: bool,
    pub hit_count: u64,
}

/// Everything a mutation may touch
#[derive(Debug, Clone)]
struct EngineState {
    store: FilterListStore,
    whitelist: BTreeSet<String>,
    enabled: bool,
    aggressive_blocking: bool,
    auto_update_interval_hours: u32,
    builtin_removed: bool,
}

impl EngineState {
    fn empty(config: &EngineConfig) -> Self {
        let hours = u32::try_from(config.default_update_interval.num_hours())
            .unwrap_or(crate::settings::DEFAULT_UPDATE_INTERVAL_HOURS);
        Self {
            store: FilterListStore::new(),
            whitelist: BTreeSet::new(),
            enabled: true,
            aggressive_blocking: false,
            auto_update_interval_hours: hours.max(1),
            builtin_removed: false,
        }
    }

    /// Build state from persisted settings
    ///
    /// List bodies come from the body cache when a storage is given. Lists
    /// whose body is missing stay installed (subscriptions) or are dropped
    /// (user lists).
    fn from_settings(
        settings: &Settings,
        storage: Option<&SettingsStore>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut state = Self {
            store: FilterListStore::new(),
            whitelist: BTreeSet::new(),
            enabled: settings.enabled,
            aggressive_blocking: settings.aggressive_blocking,
            auto_update_interval_hours: settings.auto_update_interval.max(1),
            builtin_removed: settings.removed_builtin,
        };

        if !state.builtin_removed {
            let builtin_enabled = settings
                .filter_lists
                .iter()
                .find(|l| l.list_id() == BUILTIN_LIST_ID)
                .is_none_or(|l| l.enabled);
            match FilterList::parse_str(BUILTIN_LIST_ID, ListSource::Builtin, DEFAULT_RULES, now) {
                Ok(mut builtin) => {
                    builtin.enabled = builtin_enabled;
                    state.store.insert(builtin);
                }
                Err(e) => warn!("Built-in rules unusable: {}", e),
            }
        }

        for entry in &settings.filter_lists {
            let id = entry.list_id();
            if id.is_empty() || id == BUILTIN_LIST_ID || id == CUSTOM_LIST_ID {
                continue;
            }
            match restore_list(entry, storage, now) {
                Some(list) => {
                    state.store.insert(list);
                }
                None => warn!("Dropping list '{}': no cached body", id),
            }
        }

        for rule in &settings.custom_rules {
            if state.store.add_custom_rule(rule, now).is_none() {
                debug!("Ignoring stored custom rule '{}'", rule);
            }
        }
        for rule in &settings.disabled_custom_rules {
            state.store.set_custom_rule_enabled(rule, false);
        }

        state.whitelist = settings
            .whitelist
            .iter()
            .map(|d| normalize_domain(d))
            .filter(|d| !d.is_empty())
            .collect();

        state
    }

    fn to_settings(&self) -> Settings {
        let filter_lists = self
            .store
            .lists()
            .iter()
            .map(|list| FilterListSettings {
                id: Some(list.id.clone()),
                url: list.source_url.clone().unwrap_or_default(),
                name: list.display_name.clone(),
                enabled: list.enabled,
                version: list.version.clone().unwrap_or_default(),
                last_update: list.last_updated,
                expires_at: list.expires_at,
                source: Some(list.source),
            })
            .collect();

        let custom = self.store.custom();
        Settings {
            enabled: self.enabled,
            aggressive_blocking: self.aggressive_blocking,
            auto_update_interval: self.auto_update_interval_hours,
            whitelist: self.whitelist.iter().cloned().collect(),
            filter_lists,
            custom_rules: custom.rules.iter().map(|r| r.raw.clone()).collect(),
            disabled_custom_rules: custom
                .rules
                .iter()
                .filter(|r| !r.enabled)
                .map(|r| r.raw.clone())
                .collect(),
            removed_builtin: self.builtin_removed,
        }
    }

    /// Whitelist lookup over the domain and its parents
    fn is_whitelisted(&self, domain: &str) -> bool {
        !self.whitelist.is_empty() && domain_suffixes(domain).any(|d| self.whitelist.contains(d))
    }

    fn update_interval(&self) -> TimeDelta {
        TimeDelta::hours(i64::from(self.auto_update_interval_hours))
    }
}

/// Rebuild one persisted list
fn restore_list(
    entry: &FilterListSettings,
    storage: Option<&SettingsStore>,
    now: DateTime<Utc>,
) -> Option<FilterList> {
    let id = entry.list_id();
    let source = entry.list_source();

    let body = storage.and_then(|s| match s.load_list_body(id) {
        Ok(body) => body,
        Err(e) => {
            warn!("Cannot read cached body of '{}': {}", id, e);
            None
        }
    });

    let mut list = match body.map(|b| FilterList::parse_str(id, source, &b, now)) {
        Some(Ok(parsed)) => parsed,
        Some(Err(e)) => {
            warn!("Cached body of '{}' unusable: {}", id, e);
            return restore_placeholder(entry, source);
        }
        None => return restore_placeholder(entry, source),
    };

    if !entry.url.is_empty() {
        list.source_url = Some(entry.url.clone());
    }
    if !entry.name.is_empty() {
        list.display_name = entry.name.clone();
    }
    list.enabled = entry.enabled;
    list.last_updated = entry.last_update;
    list.expires_at = entry.expires_at;
    Some(list)
}

/// Subscription without a usable body: keep it so the updater fetches it
fn restore_placeholder(entry: &FilterListSettings, source: ListSource) -> Option<FilterList> {
    if source != ListSource::Subscription || entry.url.is_empty() {
        return None;
    }
    let mut list = FilterList::subscription(&entry.url, entry.enabled);
    list.id = entry.list_id().to_string();
    if !entry.name.is_empty() {
        list.display_name = entry.name.clone();
    }
    if !entry.version.is_empty() {
        list.version = Some(entry.version.clone());
    }
    list.expires_at = entry.expires_at;
    Some(list)
}

/// The content-blocking engine
pub struct AdBlockEngine {
    state: RwLock<EngineState>,
    cache: Mutex<DecisionCache>,
    cosmetic: Mutex<Option<Arc<CosmeticIndex>>>,
    stats: BlockStatistics,
    events: EventBus,
    clock: Arc<dyn Clock>,
    storage: Option<SettingsStore>,
    persist_lock: Mutex<()>,
    config: EngineConfig,
}

impl AdBlockEngine {
    /// In-memory engine without lists or persistence
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// In-memory engine driven by the given clock
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self::build(EngineState::empty(&config), None, config, clock)
    }

    /// Engine backed by a data directory
    ///
    /// Restores settings and cached list bodies. Unreadable settings fall
    /// back to defaults. On first run the catalog's default subscriptions
    /// are installed (they are fetched by the updater).
    pub fn open(
        storage: SettingsStore,
        catalog: &FilterCatalog,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        let (settings, first_run) = match storage.load() {
            Ok(Some(settings)) => (settings, false),
            Ok(None) => (Settings::default(), true),
            Err(e) => {
                warn!("Settings unreadable, using defaults: {}", e);
                (Settings::default(), false)
            }
        };

        let mut state = EngineState::from_settings(&settings, Some(&storage), now);
        if first_run {
            for entry in catalog.defaults() {
                let mut list = FilterList::subscription(&entry.url, true);
                list.display_name = entry.name.clone();
                state.store.insert(list);
            }
        }

        let engine = Self::build(state, Some(storage), config, clock);
        if first_run {
            let settings = engine.read_state().to_settings();
            engine.persist(&settings);
        }
        engine
    }

    fn build(
        state: EngineState,
        storage: Option<SettingsStore>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            "Ad-block engine initialized: {} lists, {} active rules, {} whitelisted domains",
            state.store.lists().len(),
            state.store.active_rule_count(),
            state.whitelist.len()
        );
        Self {
            stats: BlockStatistics::new(clock.now()),
            cache: Mutex::new(DecisionCache::new(config.cache_capacity)),
            cosmetic: Mutex::new(None),
            events: EventBus::new(config.event_capacity),
            state: RwLock::new(state),
            clock,
            storage,
            persist_lock: Mutex::new(()),
            config,
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, EngineState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, EngineState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cache(&self) -> MutexGuard<'_, DecisionCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        self.events.emit(event);
    }

    // ------------------------------------------------------------------
    // Decisions
    // ------------------------------------------------------------------

    /// Should this request be blocked
    #[inline]
    pub fn decide(&self, request_url: &str, source_url: &str, kind: ResourceType) -> bool {
        self.decide_detailed(request_url, source_url, kind).blocked
    }

    /// Block verdict with the reason behind it
    pub fn decide_detailed(
        &self,
        request_url: &str,
        source_url: &str,
        kind: ResourceType,
    ) -> Decision {
        self.stats.record_request();

        let state = self.read_state();
        if !state.enabled {
            return Decision {
                blocked: false,
                reason: DecisionReason::Disabled,
            };
        }

        let source_domain = source_domain(source_url);
        if state.is_whitelisted(&source_domain) {
            trace!("Whitelisted source {}: allowing {}", source_domain, request_url);
            return Decision {
                blocked: false,
                reason: DecisionReason::Whitelisted,
            };
        }

        let cached = self.lock_cache().get(request_url);
        if let Some(blocked) = cached {
            drop(state);
            if blocked {
                self.observe_block(request_url, source_url, kind);
            }
            return Decision {
                blocked,
                reason: DecisionReason::Cached,
            };
        }

        let url = request_url.to_lowercase();
        let decision = match state.store.first_network_match(&url, &source_domain) {
            Some(hit) => {
                hit.rule.record_hit(self.clock.now());
                if hit.rule.is_exception {
                    Decision {
                        blocked: false,
                        reason: DecisionReason::Exception {
                            list_id: hit.list_id,
                            rule: hit.rule.raw.clone(),
                        },
                    }
                } else {
                    Decision {
                        blocked: true,
                        reason: DecisionReason::Rule {
                            list_id: hit.list_id,
                            rule: hit.rule.raw.clone(),
                        },
                    }
                }
            }
            None => Decision {
                blocked: false,
                reason: DecisionReason::NoMatch,
            },
        };

        // Still under the read lock: no mutation can clear the cache between
        // the scan above and this insert.
        self.lock_cache().insert(request_url.to_string(), decision.blocked);
        drop(state);

        debug!("{} {} ({:?})", if decision.blocked { "Blocked" } else { "Allowed" }, request_url, decision.reason);
        if decision.blocked {
            self.observe_block(request_url, source_url, kind);
        }
        decision
    }

    fn observe_block(&self, request_url: &str, source_url: &str, kind: ResourceType) {
        let domain = source_domain(request_url);
        let total_blocked = self.stats.record_block(&domain, self.clock.now());
        self.events.emit(EngineEvent::BlockObserved {
            request_url: request_url.to_string(),
            source_url: source_url.to_string(),
            domain,
            kind,
            total_blocked,
        });
    }

    pub fn status(&self) -> EngineStatus {
        let state = self.read_state();
        if !state.enabled {
            return EngineStatus::Disabled;
        }
        match state.store.active_rule_count() {
            0 => EngineStatus::Empty,
            rules => EngineStatus::Active { rules },
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.lock_cache().stats()
    }

    // ------------------------------------------------------------------
    // Cosmetic rules
    // ------------------------------------------------------------------

    /// Cosmetic rules for a page, empty when disabled or whitelisted
    pub fn cosmetic_entry(&self, page_url: &str) -> Arc<CosmeticEntry> {
        let domain = source_domain(page_url);
        let state = self.read_state();
        if !state.enabled || state.is_whitelisted(&domain) {
            return Arc::new(CosmeticEntry::default());
        }

        let index = {
            let mut slot = self.cosmetic.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(index) => Arc::clone(index),
                None => {
                    let index = Arc::new(CosmeticIndex::build(&state.store));
                    debug!("Cosmetic index rebuilt with {} rules", index.rule_count());
                    *slot = Some(Arc::clone(&index));
                    index
                }
            }
        };
        drop(state);
        index.entry(&domain)
    }

    /// Element-hiding stylesheet for a page
    pub fn get_css_rules(&self, page_url: &str) -> String {
        self.cosmetic_entry(page_url).css_text()
    }

    /// Injected scripts for a page
    pub fn get_js_rules(&self, page_url: &str) -> String {
        self.cosmetic_entry(page_url).script_text()
    }

    /// Element-hiding selectors for a page
    pub fn get_element_hiding_selectors(&self, page_url: &str) -> Vec<String> {
        self.cosmetic_entry(page_url).css_selectors.clone()
    }

    // ------------------------------------------------------------------
    // Mutation plumbing
    // ------------------------------------------------------------------

    /// Apply a change to the rule set
    ///
    /// `apply` returns the value to hand back plus the events to publish, or
    /// an error to leave everything untouched. On success the caches are
    /// cleared before the write lock is released, then settings are saved
    /// and events published.
    fn mutate<T, E>(
        &self,
        apply: impl FnOnce(&mut EngineState, DateTime<Utc>) -> Result<(T, Vec<EngineEvent>), E>,
    ) -> Result<T, E> {
        let _persist = self.persist_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (value, events, settings) = {
            let mut state = self.write_state();
            let (value, events) = apply(&mut state, self.clock.now())?;
            self.invalidate_caches();
            if state.enabled && state.store.active_network_rule_count() == 0 {
                warn!("No active network rules: all requests are allowed");
            }
            (value, events, state.to_settings())
        };

        self.persist(&settings);
        for event in events {
            self.events.emit(event);
        }
        Ok(value)
    }

    /// `mutate` for management calls reporting success as a bool
    fn try_mutate(
        &self,
        apply: impl FnOnce(&mut EngineState, DateTime<Utc>) -> Option<Vec<EngineEvent>>,
    ) -> bool {
        self.mutate(|state, now| apply(state, now).map(|events| ((), events)).ok_or(()))
            .is_ok()
    }

    fn invalidate_caches(&self) {
        self.lock_cache().clear();
        *self.cosmetic.lock().unwrap_or_else(PoisonError::into_inner) = None;
        debug!("Decision cache and cosmetic index invalidated");
    }

    fn persist(&self, settings: &Settings) {
        let Some(storage) = &self.storage else {
            return;
        };
        if let Err(e) = storage.save(settings) {
            warn!("Failed to save settings: {}", e);
            self.events.emit(EngineEvent::SettingsWriteFailed {
                message: e.to_string(),
            });
        }
    }

    fn save_body(&self, id: &str, body: &str) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_list_body(id, body) {
                warn!("Failed to cache body of '{}': {}", id, e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Filter lists
    // ------------------------------------------------------------------

    /// Subscribe to a remote list. The rules arrive with the first update.
    pub fn add_filter_list(&self, url: &str, enabled: bool) -> bool {
        self.add_named_filter_list(url, "", enabled)
    }

    /// Subscribe with a display name, e.g. from the catalog
    pub fn add_named_filter_list(&self, url: &str, name: &str, enabled: bool) -> bool {
        let url = url.trim();
        if url.is_empty() || url::Url::parse(url).is_err() {
            return false;
        }
        self.try_mutate(|state, _| {
            let mut list = FilterList::subscription(url, enabled);
            if !name.is_empty() {
                list.display_name = name.to_string();
            }
            state.store.insert(list).then(|| {
                info!("Subscribed to {}", url);
                vec![EngineEvent::ListAdded { id: url.to_string() }]
            })
        })
    }

    /// Install a user list from text. Replaces an earlier user list of the
    /// same id, keeping its enabled flag and expiry.
    pub fn import_user_list(&self, id: &str, name: &str, text: &str) -> bool {
        let id = id.trim();
        if id.is_empty() || id == CUSTOM_LIST_ID || id == BUILTIN_LIST_ID {
            return false;
        }
        let mut parsed = match FilterList::parse_str(id, ListSource::User, text, self.clock.now()) {
            Ok(list) => list,
            Err(e) => {
                warn!("Rejected user list '{}': {}", id, e);
                return false;
            }
        };
        if !name.is_empty() {
            parsed.display_name = name.to_string();
        }

        let rules = parsed.rule_count();
        let installed = self.try_mutate(|state, _| match state.store.get(id) {
            Some(current) if current.source == ListSource::User => {
                parsed.enabled = current.enabled;
                parsed.expires_at = current.expires_at;
                state.store.replace(parsed);
                Some(vec![EngineEvent::ListUpdated {
                    id: id.to_string(),
                    rules,
                    changed: true,
                }])
            }
            Some(_) => None,
            None => {
                state.store.insert(parsed);
                Some(vec![EngineEvent::ListAdded { id: id.to_string() }])
            }
        });
        if installed {
            self.save_body(id, text);
        }
        installed
    }

    pub fn remove_filter_list(&self, id: &str) -> bool {
        let removed = self.try_mutate(|state, _| {
            state.store.remove(id)?;
            if id == BUILTIN_LIST_ID {
                state.builtin_removed = true;
            }
            Some(vec![EngineEvent::ListRemoved { id: id.to_string() }])
        });
        if removed {
            if let Some(storage) = &self.storage {
                if let Err(e) = storage.remove_list_body(id) {
                    warn!("Failed to delete cached body of '{}': {}", id, e);
                }
            }
        }
        removed
    }

    pub fn set_filter_list_enabled(&self, id: &str, enabled: bool) -> bool {
        self.try_mutate(|state, _| {
            let changed = state.store.set_enabled(id, enabled)?;
            Some(if changed {
                vec![EngineEvent::ListEnabled { id: id.to_string(), enabled }]
            } else {
                Vec::new()
            })
        })
    }

    /// Set or clear an explicit expiry date
    pub fn set_list_expiry(&self, id: &str, expires_at: Option<DateTime<Utc>>) -> bool {
        self.try_mutate(|state, _| state.store.set_expiry(id, expires_at).then(Vec::new))
    }

    /// Installed lists, evaluation order
    pub fn lists(&self) -> Vec<ListInfo> {
        let state = self.read_state();
        state.store.lists().iter().map(|l| ListInfo::from(l.as_ref())).collect()
    }

    pub fn list_info(&self, id: &str) -> Option<ListInfo> {
        self.read_state().store.get(id).map(|l| ListInfo::from(l.as_ref()))
    }

    // ------------------------------------------------------------------
    // Hooks for the updater
    // ------------------------------------------------------------------

    /// URL to fetch for a subscription
    pub fn subscription_url(&self, id: &str) -> Result<String, UpdateError> {
        let state = self.read_state();
        let list = state
            .store
            .get(id)
            .ok_or_else(|| UpdateError::UnknownList(id.to_string()))?;
        match (&list.source, &list.source_url) {
            (ListSource::Subscription, Some(url)) => Ok(url.clone()),
            _ => Err(UpdateError::NotSubscription(id.to_string())),
        }
    }

    /// Ids of every installed subscription
    pub fn subscription_ids(&self) -> Vec<String> {
        let state = self.read_state();
        state
            .store
            .lists()
            .iter()
            .filter(|l| l.source == ListSource::Subscription)
            .map(|l| l.id.clone())
            .collect()
    }

    /// Enabled subscriptions whose refresh time has come
    pub fn due_subscriptions(&self, now: DateTime<Utc>) -> Vec<String> {
        let state = self.read_state();
        let interval = state.update_interval();
        state
            .store
            .lists()
            .iter()
            .filter(|l| l.is_due(now, interval))
            .map(|l| l.id.clone())
            .collect()
    }

    /// Earliest next refresh among enabled subscriptions
    pub fn next_update_due(&self) -> Option<DateTime<Utc>> {
        let state = self.read_state();
        let interval = state.update_interval();
        state
            .store
            .lists()
            .iter()
            .filter(|l| l.enabled)
            .filter_map(|l| l.next_due(interval))
            .min()
    }

    /// Replace a list with a freshly downloaded body
    ///
    /// A byte-identical body only refreshes the timestamp and keeps the rule
    /// objects. Parsing happens before any lock is taken.
    pub fn apply_list_update(&self, id: &str, body: &str) -> Result<ListUpdateOutcome, UpdateError> {
        let checksum = xxh3_64(body.as_bytes());
        let source = {
            let state = self.read_state();
            let list = state
                .store
                .get(id)
                .ok_or_else(|| UpdateError::UnknownList(id.to_string()))?;
            if list.checksum == Some(checksum) {
                None
            } else {
                Some(list.source)
            }
        };

        let parsed = match source {
            Some(source) => Some(FilterList::parse_str(id, source, body, self.clock.now())?),
            None => None,
        };

        let outcome = self.mutate(|state, now| -> Result<_, UpdateError> {
            let current = state
                .store
                .get(id)
                .ok_or_else(|| UpdateError::UnknownList(id.to_string()))?;

            let (list, changed) = match parsed {
                Some(parsed) => (current.refreshed(parsed), true),
                None => {
                    let mut same = (**current).clone();
                    same.last_updated = Some(now);
                    (same, false)
                }
            };
            let rules = list.rule_count();
            state.store.replace(list);

            let outcome = if changed {
                ListUpdateOutcome::Updated { rules }
            } else {
                ListUpdateOutcome::Unchanged { rules }
            };
            Ok((
                outcome,
                vec![EngineEvent::ListUpdated {
                    id: id.to_string(),
                    rules,
                    changed,
                }],
            ))
        })?;

        if matches!(outcome, ListUpdateOutcome::Updated { .. }) {
            self.save_body(id, body);
        }
        info!("List '{}' refreshed: {:?}", id, outcome);
        Ok(outcome)
    }

    /// Publish a failed refresh. The installed rules stay active.
    pub fn report_update_failure(&self, id: &str, message: &str) {
        warn!("Update of '{}' failed: {}", id, message);
        self.events.emit(EngineEvent::ListUpdateFailed {
            id: id.to_string(),
            message: message.to_string(),
        });
    }

    /// Switch off enabled lists whose expiry date has passed
    pub fn expire_lists(&self, now: DateTime<Utc>) -> Vec<String> {
        let due: Vec<String> = {
            let state = self.read_state();
            state
                .store
                .lists()
                .iter()
                .filter(|l| l.enabled && l.is_expired(now))
                .map(|l| l.id.clone())
                .collect()
        };
        if due.is_empty() {
            return due;
        }

        let expired: Result<Vec<String>, ()> = self.mutate(|state, _| {
            let mut expired = Vec::new();
            let mut events = Vec::new();
            for id in &due {
                if state.store.set_enabled(id, false) == Some(true) {
                    info!("List '{}' expired", id);
                    expired.push(id.clone());
                    events.push(EngineEvent::ListExpired { id: id.clone() });
                }
            }
            Ok((expired, events))
        });
        expired.unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Custom rules
    // ------------------------------------------------------------------

    pub fn add_custom_rule(&self, rule: &str) -> bool {
        self.try_mutate(|state, now| {
            let added = state.store.add_custom_rule(rule, now)?;
            Some(vec![EngineEvent::RuleAdded { rule: added.raw.clone() }])
        })
    }

    pub fn remove_custom_rule(&self, rule: &str) -> bool {
        self.try_mutate(|state, _| {
            state
                .store
                .remove_custom_rule(rule)
                .then(|| vec![EngineEvent::RuleRemoved { rule: rule.trim().to_string() }])
        })
    }

    pub fn set_custom_rule_enabled(&self, rule: &str, enabled: bool) -> bool {
        self.try_mutate(|state, _| {
            let changed = state.store.set_custom_rule_enabled(rule, enabled)?;
            Some(if changed {
                vec![EngineEvent::RuleToggled { rule: rule.trim().to_string(), enabled }]
            } else {
                Vec::new()
            })
        })
    }

    pub fn custom_rules(&self) -> Vec<CustomRuleInfo> {
        let state = self.read_state();
        state
            .store
            .custom()
            .rules
            .iter()
            .map(|r| CustomRuleInfo {
                rule: r.raw.clone(),
                enabled: r.enabled,
                hit_count: r.hit_count(),
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Whitelist
    // ------------------------------------------------------------------

    pub fn add_whitelist_domain(&self, domain: &str) -> bool {
        let domain = normalize_domain(domain);
        if domain.is_empty() {
            return false;
        }
        self.try_mutate(|state, _| {
            state
                .whitelist
                .insert(domain.clone())
                .then(|| vec![EngineEvent::WhitelistChanged { domain: domain.clone(), added: true }])
        })
    }

    pub fn remove_whitelist_domain(&self, domain: &str) -> bool {
        let domain = normalize_domain(domain);
        self.try_mutate(|state, _| {
            state
                .whitelist
                .remove(&domain)
                .then(|| vec![EngineEvent::WhitelistChanged { domain: domain.clone(), added: false }])
        })
    }

    pub fn whitelist(&self) -> Vec<String> {
        self.read_state().whitelist.iter().cloned().collect()
    }

    /// Is this domain (or one of its parents) whitelisted
    pub fn is_domain_whitelisted(&self, domain: &str) -> bool {
        self.read_state().is_whitelisted(&normalize_domain(domain))
    }

    // ------------------------------------------------------------------
    // Flags
    // ------------------------------------------------------------------

    pub fn is_enabled(&self) -> bool {
        self.read_state().enabled
    }

    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.try_mutate(|state, _| {
            state.enabled = enabled;
            info!("Ad blocking {}", if enabled { "enabled" } else { "disabled" });
            Some(vec![EngineEvent::SettingsChanged])
        })
    }

    pub fn aggressive_blocking(&self) -> bool {
        self.read_state().aggressive_blocking
    }

    pub fn set_aggressive_blocking(&self, aggressive: bool) -> bool {
        self.try_mutate(|state, _| {
            state.aggressive_blocking = aggressive;
            Some(vec![EngineEvent::SettingsChanged])
        })
    }

    /// Hours between subscription refreshes
    pub fn auto_update_interval(&self) -> u32 {
        self.read_state().auto_update_interval_hours
    }

    pub fn set_auto_update_interval(&self, hours: u32) -> bool {
        if hours == 0 {
            return false;
        }
        self.try_mutate(|state, _| {
            state.auto_update_interval_hours = hours;
            Some(vec![EngineEvent::SettingsChanged])
        })
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    pub fn top_blocked_domains(&self, limit: Option<usize>) -> Vec<(String, u64)> {
        self.stats
            .top_blocked_domains(limit.unwrap_or(self.config.top_domains_limit))
    }

    pub fn reset_statistics(&self) {
        self.stats.reset(self.clock.now());
        self.events.emit(EngineEvent::StatisticsReset);
    }

    pub fn export_statistics(&self, path: &Path) -> Result<(), SettingsError> {
        write_json_atomic(path, &self.stats.snapshot())
    }

    // ------------------------------------------------------------------
    // Settings import / export
    // ------------------------------------------------------------------

    /// Current settings as they would be persisted
    pub fn settings(&self) -> Settings {
        self.read_state().to_settings()
    }

    pub fn export_settings(&self, path: &Path) -> Result<(), SettingsError> {
        self.settings().to_json_file(path)
    }

    /// Replace the whole configuration with a settings file
    ///
    /// Lists are rebuilt from cached bodies where available; the rest wait
    /// for the updater.
    pub fn import_settings(&self, path: &Path) -> Result<(), SettingsError> {
        let settings = Settings::from_json_file(path)?;
        let fresh = EngineState::from_settings(&settings, self.storage.as_ref(), self.clock.now());
        let lists = fresh.store.lists().len();

        self.mutate(|state, _| -> Result<((), Vec<EngineEvent>), SettingsError> {
            *state = fresh;
            Ok(((), vec![EngineEvent::SettingsChanged]))
        })?;
        info!("Imported settings from {} ({} lists)", path.display(), lists);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn engine() -> AdBlockEngine {
        AdBlockEngine::new(EngineConfig::default())
    }

    fn engine_with_lists(lists: &[(&str, &str)]) -> AdBlockEngine {
        let engine = engine();
        for (id, body) in lists {
            assert!(engine.import_user_list(id, id, body));
        }
        engine
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fos-adblock-engine-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_host_anchor_blocks_subdomains_only_on_boundary() {
        let engine = engine_with_lists(&[("a", "||example.com^")]);
        let page = "https://news.example";
        assert!(engine.decide("https://example.com/x", page, ResourceType::Script));
        assert!(engine.decide("https://sub.example.com/x", page, ResourceType::Script));
        assert!(!engine.decide("https://notexample.com/x", page, ResourceType::Script));
    }

    #[test]
    fn test_end_to_end_exception() {
        let engine = engine_with_lists(&[("a", "||doubleclick.net^\n@@||doubleclick.net/safe^")]);
        let page = "https://news.example";
        assert!(engine.decide("https://doubleclick.net/x", page, ResourceType::Script));
        assert!(!engine.decide("https://doubleclick.net/safe", page, ResourceType::Script));

        let decision = engine.decide_detailed("https://doubleclick.net/safe?v=2", page, ResourceType::Script);
        assert!(matches!(decision.reason, DecisionReason::Exception { .. }));
    }

    #[test]
    fn test_exception_order_across_lists() {
        let url = "https://ads.test/banner.png";
        let page = "https://site.example";

        let block_first = engine_with_lists(&[("block", "||ads.test^"), ("allow", "@@||ads.test^")]);
        assert!(block_first.decide(url, page, ResourceType::Image));

        let allow_first = engine_with_lists(&[("allow", "@@||ads.test^"), ("block", "||ads.test^")]);
        assert!(!allow_first.decide(url, page, ResourceType::Image));
    }

    #[test]
    fn test_whitelist_overrides_everything() {
        let engine = engine_with_lists(&[("a", "||ads.test^")]);
        assert!(engine.add_whitelist_domain("www.Example.com"));
        assert!(!engine.add_whitelist_domain("example.com"));
        assert!(engine.add_custom_rule("||tracker.test^"));

        for page in ["https://example.com/", "https://www.example.com/a", "https://shop.example.com/"] {
            assert!(!engine.decide("https://ads.test/x", page, ResourceType::Script));
            assert!(!engine.decide("https://tracker.test/x", page, ResourceType::Script));
        }
        assert!(engine.decide("https://tracker.test/x", "https://other.org/", ResourceType::Script));
        assert!(engine.is_domain_whitelisted("shop.example.com"));
        assert!(!engine.is_domain_whitelisted("badexample.com"));

        assert!(engine.remove_whitelist_domain("example.com"));
        assert!(!engine.remove_whitelist_domain("example.com"));
        assert!(engine.decide("https://ads.test/x", "https://example.com/", ResourceType::Script));
    }

    #[test]
    fn test_domain_scoped_rule_uses_source_page() {
        let engine = engine_with_lists(&[("a", "||cdn.test/ads/$domain=a.com|~sub.a.com")]);
        let url = "https://cdn.test/ads/1.js";
        assert!(engine.decide(url, "https://a.com/", ResourceType::Script));
        // Cache is keyed by URL alone
        assert!(engine.decide(url, "https://sub.a.com/", ResourceType::Script));

        let fresh = engine_with_lists(&[("a", "||cdn.test/ads/$domain=a.com|~sub.a.com")]);
        assert!(!fresh.decide(url, "https://sub.a.com/", ResourceType::Script));
        assert!(!fresh.decide("https://cdn.test/ads/2.js", "https://b.com/", ResourceType::Script));
    }

    #[test]
    fn test_domain_option_is_plain_suffix() {
        let engine = engine_with_lists(&[("a", "||cdn.test/ads/$domain=a.com")]);
        assert!(engine.decide("https://cdn.test/ads/1.js", "https://xa.com/", ResourceType::Script));
        assert!(!engine.decide("https://cdn.test/ads/2.js", "https://a.com.evil/", ResourceType::Script));
    }

    #[test]
    fn test_anchor_only_rules_rejected() {
        let engine = engine();
        assert!(!engine.add_custom_rule("|"));
        assert!(!engine.add_custom_rule("||"));
        assert!(!engine.add_custom_rule("@@||"));
        assert!(engine.custom_rules().is_empty());
        assert!(!engine.decide("https://anything.test/", "", ResourceType::Other));
    }

    #[test]
    fn test_cache_invalidated_by_custom_rule() {
        let engine = engine();
        let url = "https://ads.test/x";
        let page = "https://site.example";

        assert!(!engine.decide(url, page, ResourceType::Other));
        assert_eq!(
            engine.decide_detailed(url, page, ResourceType::Other).reason,
            DecisionReason::Cached
        );

        assert!(engine.add_custom_rule("||ads.test^"));
        assert!(engine.decide(url, page, ResourceType::Other));
        assert!(!engine.add_custom_rule("||ads.test^"));

        assert!(engine.set_custom_rule_enabled("||ads.test^", false));
        assert!(!engine.decide(url, page, ResourceType::Other));
        assert!(engine.remove_custom_rule("||ads.test^"));
        assert!(!engine.remove_custom_rule("||ads.test^"));
    }

    #[test]
    fn test_list_toggle_and_removal() {
        let engine = engine_with_lists(&[("a", "||ads.test^")]);
        let url = "https://ads.test/x";
        assert!(engine.decide(url, "", ResourceType::Other));

        assert!(engine.set_filter_list_enabled("a", false));
        assert!(!engine.decide(url, "", ResourceType::Other));
        assert_eq!(engine.status(), EngineStatus::Empty);

        assert!(engine.set_filter_list_enabled("a", true));
        assert!(engine.decide(url, "", ResourceType::Other));

        assert!(engine.remove_filter_list("a"));
        assert!(!engine.remove_filter_list("a"));
        assert!(!engine.set_filter_list_enabled("a", true));
        assert!(!engine.decide(url, "", ResourceType::Other));
    }

    #[test]
    fn test_reimport_keeps_list_state() {
        let engine = engine_with_lists(&[("a", "||ads.test^")]);
        let expiry = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        assert!(engine.set_filter_list_enabled("a", false));
        assert!(engine.set_list_expiry("a", Some(expiry)));

        assert!(engine.import_user_list("a", "A", "||ads.test^\n||more.test^"));
        let info = engine.list_info("a").unwrap();
        assert!(!info.enabled);
        assert_eq!(info.expires_at, Some(expiry));
        assert_eq!(info.rules, 2);
        assert!(!engine.decide("https://more.test/", "", ResourceType::Other));
    }

    #[test]
    fn test_disabled_engine_fails_open() {
        let engine = engine_with_lists(&[("a", "||ads.test^\n##.ad")]);
        assert_eq!(engine.status(), EngineStatus::Active { rules: 2 });

        assert!(engine.set_enabled(false));
        assert_eq!(engine.status(), EngineStatus::Disabled);
        let decision = engine.decide_detailed("https://ads.test/", "", ResourceType::Other);
        assert_eq!(decision.reason, DecisionReason::Disabled);
        assert!(!decision.blocked);
        assert!(engine.get_element_hiding_selectors("https://x.org/").is_empty());
    }

    #[test]
    fn test_statistics_count_blocks_and_cache_hits() {
        let engine = engine_with_lists(&[("a", "||ads.test^")]);
        let mut events = engine.subscribe();

        engine.decide("https://ads.test/a", "https://site.example/", ResourceType::Script);
        engine.decide("https://ads.test/a", "https://site.example/", ResourceType::Script);
        engine.decide("https://ok.test/", "https://site.example/", ResourceType::Script);

        let stats = engine.statistics();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.total_blocked, 2);
        assert_eq!(stats.blocked_domains.get("ads.test"), Some(&2));
        assert_eq!(engine.top_blocked_domains(None), vec![("ads.test".to_string(), 2)]);

        match events.try_recv().unwrap() {
            EngineEvent::BlockObserved { domain, kind, total_blocked, .. } => {
                assert_eq!(domain, "ads.test");
                assert_eq!(kind, ResourceType::Script);
                assert_eq!(total_blocked, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }

        engine.reset_statistics();
        assert_eq!(engine.statistics().total_blocked, 0);
    }

    #[test]
    fn test_cosmetic_queries() {
        let engine = engine_with_lists(&[(
            "a",
            "example.com##.ad-banner\nexample.com#?#abort-on-property-read.js\n##.sponsored\nexample.com#@#.sponsored",
        )]);

        let selectors = engine.get_element_hiding_selectors("https://example.com/page");
        assert_eq!(selectors, vec![".ad-banner"]);
        assert_eq!(
            engine.get_css_rules("https://example.com/page"),
            ".ad-banner { display: none !important; }\n"
        );
        assert_eq!(engine.get_js_rules("https://example.com/page"), "abort-on-property-read.js");

        let other = engine.get_element_hiding_selectors("https://other.com");
        assert!(!other.contains(&".ad-banner".to_string()));
        assert_eq!(other, vec![".sponsored"]);

        assert!(engine.add_custom_rule("other.com##.late"));
        assert_eq!(engine.get_element_hiding_selectors("https://other.com"), vec![".late", ".sponsored"]);

        assert!(engine.add_whitelist_domain("other.com"));
        assert!(engine.get_css_rules("https://other.com").is_empty());
    }

    #[test]
    fn test_apply_update_replaces_and_detects_unchanged() {
        let engine = engine();
        let url = "https://lists.example/easy.txt";
        assert!(engine.add_filter_list(url, true));
        assert!(!engine.add_filter_list(url, true));
        assert!(!engine.add_filter_list("not a url", true));
        assert_eq!(engine.due_subscriptions(Utc::now()), vec![url.to_string()]);

        let outcome = engine.apply_list_update(url, "! Title: Easy\n||ads.test^").unwrap();
        assert_eq!(outcome, ListUpdateOutcome::Updated { rules: 1 });
        assert!(engine.decide("https://ads.test/", "", ResourceType::Other));
        assert_eq!(engine.list_info(url).unwrap().name, "Easy");

        let outcome = engine.apply_list_update(url, "! Title: Easy\n||ads.test^").unwrap();
        assert_eq!(outcome, ListUpdateOutcome::Unchanged { rules: 1 });

        let failed = engine.apply_list_update(url, "! nothing here");
        assert!(matches!(failed, Err(UpdateError::Parse(_))));
        assert!(engine.decide("https://ads.test/", "", ResourceType::Other));

        assert!(matches!(
            engine.apply_list_update("missing", "||x^"),
            Err(UpdateError::UnknownList(_))
        ));
    }

    #[test]
    fn test_expiry_sweep() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let engine = AdBlockEngine::with_clock(EngineConfig::default(), clock.clone());
        assert!(engine.import_user_list("a", "A", "||ads.test^"));
        assert!(engine.set_list_expiry("a", Some(start + TimeDelta::hours(2))));
        assert!(!engine.set_list_expiry("missing", None));
        let mut events = engine.subscribe();

        assert!(engine.expire_lists(clock.now()).is_empty());
        clock.advance(TimeDelta::hours(3));
        assert_eq!(engine.expire_lists(clock.now()), vec!["a".to_string()]);
        assert!(!engine.list_info("a").unwrap().enabled);
        assert!(!engine.decide("https://ads.test/", "", ResourceType::Other));
        assert_eq!(events.try_recv().unwrap(), EngineEvent::ListExpired { id: "a".to_string() });

        assert!(engine.expire_lists(clock.now()).is_empty());
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = temp_dir("persist");
        let catalog = FilterCatalog::from_toml(
            "[[list]]\nname = \"Local\"\nurl = \"http://127.0.0.1:9/list.txt\"\nenabled_by_default = true\n",
        )
        .unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        {
            let engine = AdBlockEngine::open(SettingsStore::new(&dir), &catalog, EngineConfig::default(), clock.clone());
            let lists = engine.lists();
            assert_eq!(lists.len(), 2);
            assert_eq!(lists[0].id, BUILTIN_LIST_ID);
            assert_eq!(lists[1].name, "Local");
            assert!(engine.decide("https://doubleclick.net/x", "", ResourceType::Script));

            engine.apply_list_update("http://127.0.0.1:9/list.txt", "||ads.test^").unwrap();
            assert!(engine.add_custom_rule("||custom.test^"));
            assert!(engine.add_custom_rule("||off.test^"));
            assert!(engine.set_custom_rule_enabled("||off.test^", false));
            assert!(engine.add_whitelist_domain("example.com"));
            assert!(engine.set_auto_update_interval(6));
        }

        let engine = AdBlockEngine::open(SettingsStore::new(&dir), &catalog, EngineConfig::default(), clock);
        assert_eq!(engine.lists().len(), 2);
        assert!(engine.decide("https://ads.test/", "", ResourceType::Other));
        assert!(engine.decide("https://custom.test/", "", ResourceType::Other));
        assert!(!engine.decide("https://off.test/", "", ResourceType::Other));
        assert_eq!(engine.whitelist(), vec!["example.com".to_string()]);
        assert_eq!(engine.auto_update_interval(), 6);
        assert_eq!(engine.custom_rules().len(), 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_builtin_removal_survives_restart() {
        let dir = temp_dir("builtin");
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let catalog = FilterCatalog::default();

        {
            let engine = AdBlockEngine::open(SettingsStore::new(&dir), &catalog, EngineConfig::default(), clock.clone());
            assert!(engine.list_info(BUILTIN_LIST_ID).is_some());
            assert!(engine.remove_filter_list(BUILTIN_LIST_ID));
            assert!(engine.settings().removed_builtin);
        }

        let engine = AdBlockEngine::open(SettingsStore::new(&dir), &catalog, EngineConfig::default(), clock);
        assert!(engine.list_info(BUILTIN_LIST_ID).is_none());
        assert!(!engine.decide("https://doubleclick.net/x", "", ResourceType::Script));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_settings_fall_back_to_defaults() {
        let dir = temp_dir("corrupt");
        let storage = SettingsStore::new(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(storage.settings_path(), "{not json").unwrap();

        let catalog = FilterCatalog::from_toml(
            "[[list]]\nname = \"Local\"\nurl = \"http://127.0.0.1:9/list.txt\"\nenabled_by_default = true\n",
        )
        .unwrap();
        let engine = AdBlockEngine::open(storage, &catalog, EngineConfig::default(), Arc::new(SystemClock));
        assert!(engine.is_enabled());
        assert!(engine.whitelist().is_empty());
        let ids: Vec<_> = engine.lists().into_iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![BUILTIN_LIST_ID.to_string()]);
        assert!(engine.decide("https://doubleclick.net/x", "", ResourceType::Script));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_failed_save_keeps_memory_state() {
        let dir = temp_dir("unwritable");
        let storage = SettingsStore::new(&dir);
        // A directory where the settings file belongs makes every save fail
        std::fs::create_dir_all(storage.settings_path()).unwrap();

        let engine = AdBlockEngine::open(storage, &FilterCatalog::default(), EngineConfig::default(), Arc::new(SystemClock));
        let mut events = engine.subscribe();
        assert!(engine.add_whitelist_domain("example.com"));
        assert_eq!(engine.whitelist(), vec!["example.com".to_string()]);
        assert!(!engine.decide("https://doubleclick.net/x", "https://example.com/", ResourceType::Script));

        let mut write_failed = false;
        while let Ok(event) = events.try_recv() {
            write_failed |= matches!(event, EngineEvent::SettingsWriteFailed { .. });
        }
        assert!(write_failed);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_settings_export_import() {
        let dir = temp_dir("export");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("export.json");

        let source = engine();
        assert!(source.add_custom_rule("||ads.test^"));
        assert!(source.add_whitelist_domain("example.com"));
        assert!(source.add_filter_list("https://lists.example/a.txt", false));
        source.export_settings(&path).unwrap();

        let target = engine();
        target.import_settings(&path).unwrap();
        assert!(target.decide("https://ads.test/", "", ResourceType::Other));
        assert!(target.is_domain_whitelisted("example.com"));
        let urls: Vec<_> = target.lists().into_iter().filter_map(|l| l.url).collect();
        assert_eq!(urls, vec!["https://lists.example/a.txt".to_string()]);

        assert!(target.import_settings(&dir.join("missing.json")).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_statistics_export() {
        let dir = temp_dir("stats");
        let path = dir.join("stats.json");
        let engine = engine_with_lists(&[("a", "||ads.test^")]);
        engine.decide("https://ads.test/", "", ResourceType::Other);

        engine.export_statistics(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["totalBlocked"], 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
