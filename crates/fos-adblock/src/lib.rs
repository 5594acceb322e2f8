//! fOS Content Blocking
//!
//! Adblock Plus style request blocking and element hiding.
//!
//! Architecture:
//! 1. Filter lists (bundled, user, subscriptions) are parsed into rules
//! 2. Request comes in → decision cache, then first-match rule scan
//! 3. If blocked → drop before DNS lookup
//! 4. Page loads → per-domain element-hiding CSS and injected scripts
//! 5. Background updater refreshes subscriptions and swaps whole lists

mod cache;
mod client;
mod clock;
mod cosmetic;
mod domain;
mod engine;
mod events;
mod filter_list;
mod interceptor;
mod matcher;
mod rule;
mod settings;
mod stats;
mod store;
mod updater;

pub use cache::{CacheStats, DecisionCache};
pub use client::{FetchError, HttpClient, HttpClientConfig, ListFetcher, Response};
pub use clock::{Clock, ManualClock, SystemClock};
pub use cosmetic::{CosmeticEntry, CosmeticIndex};
pub use domain::{domain_matches, normalize_domain, source_domain};
pub use engine::{
    AdBlockEngine, CustomRuleInfo, Decision, DecisionReason, EngineConfig, EngineStatus, ListInfo,
};
pub use events::{EngineEvent, EventBus};
pub use filter_list::{FilterList, FilterListError, ListMetadata, ListSource};
pub use interceptor::{InterceptResult, RequestInterceptor, ResourceType};
pub use matcher::Matcher;
pub use rule::{FilterRule, RuleKind, parse_rule};
pub use settings::{
    BUILTIN_LIST_ID, CatalogEntry, FilterCatalog, FilterListSettings, Settings, SettingsError,
    SettingsStore,
};
pub use stats::{BlockStatistics, StatisticsSnapshot};
pub use store::{CUSTOM_LIST_ID, FilterListStore, RuleMatch};
pub use updater::{ListUpdateOutcome, ListUpdater, UpdateError, UpdateReport};
