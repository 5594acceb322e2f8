//! Network Pattern Compiler
//!
//! Turns the URL part of a network rule into a matcher.
//! Supports:
//! - Host anchor: `||example.com`
//! - Start/end anchors: `|https://`, `.js|`
//! - Wildcard: `*`
//! - Separator placeholder: `^`
//!
//! Patterns without any of the above stay plain substring matchers; everything
//! else becomes a case-insensitive regex.

use regex::{Regex, RegexBuilder};
use std::fmt;
use tracing::warn;

/// Regex fragment for a host anchor (`||`): any scheme, then optional
/// subdomain labels.
const HOST_ANCHOR: &str = r"^[a-z][a-z0-9+.\-]*://([^/]+\.)?";

/// Regex fragment for `^`: one separator character or the end of the URL.
const SEPARATOR: &str = r"(?:[^\w\d_.%-]|$)";

/// Compiled URL matcher
#[derive(Clone)]
pub enum Matcher {
    /// Lower-cased substring
    Plain(String),
    /// Anchored or wildcard pattern
    Regex(Regex),
}

impl Matcher {
    /// Compile a network pattern with `$options` already removed.
    ///
    /// Returns `None` for patterns with nothing left besides anchors, and for
    /// those the regex engine rejects.
    pub fn compile(pattern: &str) -> Option<Self> {
        let (body, host_anchor, left_anchor) = if let Some(rest) = pattern.strip_prefix("||") {
            (rest, true, false)
        } else if let Some(rest) = pattern.strip_prefix('|') {
            (rest, false, true)
        } else {
            (pattern, false, false)
        };
        let (body, right_anchor) = match body.strip_suffix('|') {
            Some(rest) => (rest, true),
            None => (body, false),
        };

        if body.is_empty() {
            return None;
        }

        let anchored = host_anchor || left_anchor || right_anchor;

        if !anchored && !body.contains(['*', '^']) {
            return Some(Matcher::Plain(body.to_lowercase()));
        }

        let mut source = String::with_capacity(body.len() * 2 + HOST_ANCHOR.len());
        if host_anchor {
            source.push_str(HOST_ANCHOR);
        } else if left_anchor {
            source.push('^');
        }

        let mut literal = [0u8; 4];
        for ch in body.chars() {
            match ch {
                '*' => source.push_str(".*"),
                '^' => source.push_str(SEPARATOR),
                other => source.push_str(&regex::escape(other.encode_utf8(&mut literal))),
            }
        }

        if right_anchor {
            source.push('$');
        }

        match RegexBuilder::new(&source).case_insensitive(true).build() {
            Ok(regex) => Some(Matcher::Regex(regex)),
            Err(e) => {
                warn!("Dropping pattern '{}': {}", pattern, e);
                None
            }
        }
    }

    /// Test a URL. Plain matchers expect the URL already lower-cased.
    #[inline]
    pub fn matches(&self, url: &str) -> bool {
        match self {
            Matcher::Plain(needle) => url.contains(needle.as_str()),
            Matcher::Regex(regex) => regex.is_match(url),
        }
    }

}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Plain(needle) => write!(f, "Plain({:?})", needle),
            Matcher::Regex(regex) => write!(f, "Regex({:?})", regex.as_str()),
        }
    }
}
