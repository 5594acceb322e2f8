//! Filter List Parser (EasyList Format)
//!
//! Parses filter lists in EasyList/AdBlock Plus format into a [`FilterList`].
//! Supports:
//! - Metadata headers: `! Title:`, `! Version:`, `! Homepage:`, `! Author:`,
//!   `! License:`, `! Description:`, `! Expires:`
//! - Network, exception and cosmetic rules (see [`crate::rule`])
//! - Comments: `!` or `[Adblock Plus ...]`
//!
//! A list is immutable once parsed. Updates build a brand-new list which then
//! replaces the old one as a whole.

use crate::rule::{FilterRule, RuleKind, parse_rule};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::io::{BufReader, Read};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

/// Errors during filter list parsing
#[derive(Debug, Error)]
pub enum FilterListError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Empty filter list")]
    EmptyList,
}

/// Where a list came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListSource {
    /// Bundled with the engine
    Builtin,
    /// Imported or authored by the user
    User,
    /// Fetched from a remote URL
    Subscription,
}

/// Informational list headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListMetadata {
    pub title: Option<String>,
    pub homepage: Option<String>,
    pub author: Option<String>,
    pub license: Option<String>,
    pub description: Option<String>,
}

/// A complete filter list
#[derive(Debug, Clone)]
pub struct FilterList {
    /// Stable key: built-in name, subscription URL or user list name
    pub id: String,
    pub display_name: String,
    pub version: Option<String>,
    pub source: ListSource,
    pub source_url: Option<String>,
    pub enabled: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Refresh interval announced by the list (`! Expires:`)
    pub update_interval: Option<TimeDelta>,
    pub metadata: ListMetadata,
    /// xxh3 of the body the rules were parsed from
    pub checksum: Option<u64>,
    /// Rules in file order
    pub rules: Vec<Arc<FilterRule>>,
}

impl FilterList {
    /// Create an empty filter list
    pub fn new(id: &str, display_name: &str, source: ListSource) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            version: None,
            source,
            source_url: None,
            enabled: true,
            last_updated: None,
            expires_at: None,
            update_interval: None,
            metadata: ListMetadata::default(),
            checksum: None,
            rules: Vec::new(),
        }
    }

    /// Placeholder for a subscription that was never fetched
    pub fn subscription(url: &str, enabled: bool) -> Self {
        let mut list = Self::new(url, url, ListSource::Subscription);
        list.source_url = Some(url.to_string());
        list.enabled = enabled;
        list
    }

    /// Parse a filter list from a reader
    pub fn parse<R: Read>(
        id: &str,
        source: ListSource,
        reader: R,
        now: DateTime<Utc>,
    ) -> Result<Self, FilterListError> {
        let mut text = String::new();
        BufReader::new(reader).read_to_string(&mut text)?;
        Self::parse_str(id, source, &text, now)
    }

    /// Parse a filter list body
    ///
    /// Malformed lines are skipped. A body without a single usable rule is
    /// rejected so that a broken download never replaces a working list.
    pub fn parse_str(
        id: &str,
        source: ListSource,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, FilterListError> {
        let mut list = Self::new(id, id, source);
        let mut line_count = 0;
        let mut skipped = 0;

        for line in text.lines() {
            line_count += 1;
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('[') {
                continue;
            }
            if let Some(comment) = trimmed.strip_prefix('!') {
                list.apply_header(comment);
                continue;
            }

            match parse_rule(trimmed, now) {
                Some(rule) => list.rules.push(Arc::new(rule)),
                None => {
                    skipped += 1;
                    debug!("Skipping unsupported rule in '{}': {}", id, trimmed);
                }
            }
        }

        if list.rules.is_empty() {
            return Err(FilterListError::EmptyList);
        }

        if let Some(title) = &list.metadata.title {
            list.display_name = title.clone();
        }
        list.checksum = Some(xxh3_64(text.as_bytes()));
        list.last_updated = Some(now);

        info!(
            "Parsed filter list '{}': {} lines, {} rules ({} network, {} exception, {} cosmetic), {} skipped",
            id,
            line_count,
            list.rules.len(),
            list.network_rule_count(),
            list.rules.iter().filter(|r| r.is_exception).count(),
            list.cosmetic_rule_count(),
            skipped
        );

        Ok(list)
    }

    /// Read a `! Key: value` header
    fn apply_header(&mut self, comment: &str) {
        let Some((key, value)) = comment.split_once(':') else {
            return;
        };
        let value = value.trim();
        if value.is_empty() {
            return;
        }

        match key.trim().to_ascii_lowercase().as_str() {
            "title" => self.metadata.title = Some(value.to_string()),
            "version" => self.version = Some(value.to_string()),
            "homepage" => self.metadata.homepage = Some(value.to_string()),
            "author" => self.metadata.author = Some(value.to_string()),
            "license" | "licence" => self.metadata.license = Some(value.to_string()),
            "description" => self.metadata.description = Some(value.to_string()),
            "expires" => self.update_interval = parse_expires(value),
            _ => {}
        }
    }

    /// Adopt a freshly parsed body while keeping this list's identity
    ///
    /// Identity, subscription URL, enablement and expiry carry over; headers,
    /// rules and the checksum come from `parsed`.
    pub fn refreshed(&self, parsed: FilterList) -> FilterList {
        FilterList {
            id: self.id.clone(),
            display_name: if parsed.metadata.title.is_some() {
                parsed.display_name
            } else {
                self.display_name.clone()
            },
            source: self.source,
            source_url: self.source_url.clone(),
            enabled: self.enabled,
            expires_at: self.expires_at,
            ..parsed
        }
    }

    /// When this subscription should next be fetched
    ///
    /// `None` for lists that are never fetched. A subscription that was never
    /// fetched is due immediately.
    pub fn next_due(&self, default_interval: TimeDelta) -> Option<DateTime<Utc>> {
        if self.source != ListSource::Subscription {
            return None;
        }
        let interval = self.update_interval.unwrap_or(default_interval);
        Some(match self.last_updated {
            Some(at) => at + interval,
            None => DateTime::<Utc>::MIN_UTC,
        })
    }

    /// Enabled subscription whose refresh time has come
    pub fn is_due(&self, now: DateTime<Utc>, default_interval: TimeDelta) -> bool {
        self.enabled
            && self
                .next_due(default_interval)
                .is_some_and(|due| due <= now)
    }

    /// Explicit expiry date has passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Number of rules
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn network_rule_count(&self) -> usize {
        self.rules
            .iter()
            .filter(|r| r.kind == RuleKind::NetworkBlock)
            .count()
    }

    pub fn cosmetic_rule_count(&self) -> usize {
        self.rules.iter().filter(|r| r.kind.is_cosmetic()).count()
    }
}

/// Parse an `Expires` header such as `4 days` or `12 hours (update frequency)`
fn parse_expires(value: &str) -> Option<TimeDelta> {
    let mut parts = value.split_whitespace();
    let amount: i64 = parts.next()?.parse().ok()?;
    if amount <= 0 {
        return None;
    }
    match parts.next() {
        Some(unit) if unit.starts_with("hour") => TimeDelta::try_hours(amount),
        Some(unit) if unit.starts_with("day") => TimeDelta::try_days(amount),
        None => TimeDelta::try_days(amount),
        Some(_) => None,
    }
}
