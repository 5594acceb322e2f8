//! Filter Rule Compiler
//!
//! Parses one line of Adblock Plus syntax into a [`FilterRule`].
//! Supports:
//! - Network rules: `||ads.example^`, `/banner/*.gif`, `|https://x.`, `.swf|`
//! - Exceptions: `@@||example.com/safe^`
//! - Domain option: `$domain=a.com|~b.a.com`
//! - Element hiding: `a.com##.ad`, `a.com#@#.ad`
//! - Script injection: `a.com#?#script-token`
//!
//! Lines that cannot be parsed are skipped by returning `None`; they are never
//! an error for the list as a whole.

use crate::domain::{domain_matches, normalize_domain};
use crate::matcher::Matcher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Marker stored in `last_hit` while a rule never matched
const NEVER_HIT: i64 = i64::MIN;

/// What a rule does once it applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleKind {
    /// Block (or, as exception, allow) matching requests
    NetworkBlock,
    /// `##` hide elements matching a selector
    ElementHide,
    /// `#@#` cancel an element-hiding selector
    ElementHideException,
    /// `#?#` inject a script / procedural filter
    ScriptInject,
}

impl RuleKind {
    /// True for rules that act on rendered pages instead of requests
    #[inline]
    pub fn is_cosmetic(self) -> bool {
        !matches!(self, RuleKind::NetworkBlock)
    }
}

/// A single parsed filter rule
pub struct FilterRule {
    /// Full original line
    pub raw: String,
    /// URL pattern or cosmetic payload, without prefix, domains and options
    pub raw_pattern: String,
    /// `@@` rule or `#@#` rule
    pub is_exception: bool,
    pub kind: RuleKind,
    /// Domains the rule is limited to (empty = everywhere)
    pub included_domains: HashSet<String>,
    /// Domains the rule never applies to
    pub excluded_domains: HashSet<String>,
    /// URL matcher, present for network rules only
    pub matcher: Option<Matcher>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    hit_count: AtomicU64,
    last_hit: AtomicI64,
}

impl Clone for FilterRule {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            raw_pattern: self.raw_pattern.clone(),
            is_exception: self.is_exception,
            kind: self.kind,
            included_domains: self.included_domains.clone(),
            excluded_domains: self.excluded_domains.clone(),
            matcher: self.matcher.clone(),
            enabled: self.enabled,
            created_at: self.created_at,
            hit_count: AtomicU64::new(self.hit_count.load(Ordering::Relaxed)),
            last_hit: AtomicI64::new(self.last_hit.load(Ordering::Relaxed)),
        }
    }
}

impl fmt::Debug for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterRule")
            .field("raw", &self.raw)
            .field("kind", &self.kind)
            .field("is_exception", &self.is_exception)
            .field("enabled", &self.enabled)
            .field("hit_count", &self.hit_count())
            .finish()
    }
}

/// Parse one filter line
///
/// Returns `None` for blank lines, comments, list headers and anything this
/// engine does not understand.
pub fn parse_rule(line: &str, created_at: DateTime<Utc>) -> Option<FilterRule> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('!') || trimmed.starts_with('[') {
        return None;
    }

    let (body, is_exception) = match trimmed.strip_prefix("@@") {
        Some(rest) => (rest, true),
        None => (trimmed, false),
    };

    if let Some((index, separator, kind)) = find_cosmetic_separator(body) {
        // `@@` only applies to network rules
        if is_exception {
            return None;
        }
        return parse_cosmetic(trimmed, &body[..index], &body[index + separator.len()..], kind, created_at);
    }

    parse_network(trimmed, body, is_exception, created_at)
}

/// Earliest cosmetic separator in a line
fn find_cosmetic_separator(body: &str) -> Option<(usize, &'static str, RuleKind)> {
    [
        ("#@#", RuleKind::ElementHideException),
        ("#?#", RuleKind::ScriptInject),
        ("##", RuleKind::ElementHide),
    ]
    .into_iter()
    .filter_map(|(sep, kind)| body.find(sep).map(|idx| (idx, sep, kind)))
    .min_by_key(|(idx, _, _)| *idx)
}

fn parse_cosmetic(
    raw: &str,
    domains: &str,
    payload: &str,
    kind: RuleKind,
    created_at: DateTime<Utc>,
) -> Option<FilterRule> {
    let payload = payload.trim();
    if payload.is_empty() {
        return None;
    }

    let mut rule = FilterRule::new(raw, payload, kind, created_at);
    rule.is_exception = kind == RuleKind::ElementHideException;
    rule.add_domains(domains.split(','));
    Some(rule)
}

fn parse_network(
    raw: &str,
    body: &str,
    is_exception: bool,
    created_at: DateTime<Utc>,
) -> Option<FilterRule> {
    let (pattern, options) = match body.rfind('$') {
        Some(idx) => (&body[..idx], Some(&body[idx + 1..])),
        None => (body, None),
    };

    let mut domain_option = None;
    if let Some(options) = options {
        for option in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            match option.strip_prefix("domain=") {
                Some(domains) => domain_option = Some(domains),
                // Type, party and redirect options are not interpreted; the
                // rule would block more than its author intended without them.
                None => return None,
            }
        }
    }

    let matcher = Matcher::compile(pattern)?;
    let mut rule = FilterRule::new(raw, pattern, RuleKind::NetworkBlock, created_at);
    rule.is_exception = is_exception;
    rule.matcher = Some(matcher);
    if let Some(domains) = domain_option {
        rule.add_domains(domains.split('|'));
    }
    Some(rule)
}

impl FilterRule {
    fn new(raw: &str, raw_pattern: &str, kind: RuleKind, created_at: DateTime<Utc>) -> Self {
        Self {
            raw: raw.to_string(),
            raw_pattern: raw_pattern.to_string(),
            is_exception: false,
            kind,
            included_domains: HashSet::new(),
            excluded_domains: HashSet::new(),
            matcher: None,
            enabled: true,
            created_at,
            hit_count: AtomicU64::new(0),
            last_hit: AtomicI64::new(NEVER_HIT),
        }
    }

    fn add_domains<'a>(&mut self, tokens: impl Iterator<Item = &'a str>) {
        for token in tokens.map(str::trim).filter(|t| !t.is_empty()) {
            match token.strip_prefix('~') {
                Some(excluded) => {
                    let domain = normalize_domain(excluded);
                    if !domain.is_empty() {
                        self.excluded_domains.insert(domain);
                    }
                }
                None => {
                    let domain = normalize_domain(token);
                    if !domain.is_empty() {
                        self.included_domains.insert(domain);
                    }
                }
            }
        }
    }

    /// Does the rule carry any domain restriction
    #[inline]
    pub fn is_domain_scoped(&self) -> bool {
        !self.included_domains.is_empty() || !self.excluded_domains.is_empty()
    }

    /// Domain scoping against a page/source domain
    #[inline]
    pub fn applies_to(&self, domain: &str) -> bool {
        !self.is_domain_scoped()
            || domain_matches(domain, &self.included_domains, &self.excluded_domains)
    }

    /// Check a request against an enabled network rule
    ///
    /// `url` must be lower-cased; `source_domain` is the normalized domain of
    /// the page that issued the request.
    #[inline]
    pub fn matches_request(&self, url: &str, source_domain: &str) -> bool {
        if !self.enabled || self.kind != RuleKind::NetworkBlock {
            return false;
        }
        if !self.applies_to(source_domain) {
            return false;
        }
        self.matcher.as_ref().is_some_and(|m| m.matches(url))
    }

    /// Record a successful match
    pub fn record_hit(&self, at: DateTime<Utc>) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
        self.last_hit.store(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    pub fn last_hit(&self) -> Option<DateTime<Utc>> {
        match self.last_hit.load(Ordering::Relaxed) {
            NEVER_HIT => None,
            millis => DateTime::from_timestamp_millis(millis),
        }
    }

    /// Copy of this rule with a different enabled flag
    pub fn with_enabled(&self, enabled: bool) -> Self {
        let mut rule = self.clone();
        rule.enabled = enabled;
        rule
    }
}
