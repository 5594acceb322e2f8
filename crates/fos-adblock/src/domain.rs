//! Domain extraction and domain scoping.
//!
//! Rules carrying `$domain=` (or a cosmetic domain prefix) only apply when the
//! page domain matches. Matching is a plain right-anchored suffix comparison:
//! `example.com` covers `example.com`, `ads.example.com` and `badexample.com`.
//! The whitelist walks parent domains instead (see [`domain_suffixes`]).

use std::collections::HashSet;
use url::Url;

/// Normalize a domain for consistent matching
///
/// Lower-cases, trims a trailing root dot and strips one leading `www.` label.
/// Other subdomains are kept.
#[inline]
pub fn normalize_domain(domain: &str) -> String {
    let lowered = domain.trim().trim_end_matches('.').to_lowercase();
    match lowered.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => lowered,
    }
}

/// Domain of a page or request URL, `www.` stripped.
///
/// Falls back to a plain host split for strings the URL parser rejects
/// (bare hosts, schemeless input). Returns an empty string when there is no
/// host at all.
pub fn source_domain(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => parsed.host_str().map(normalize_domain).unwrap_or_default(),
        Err(_) => normalize_domain(extract_host(url)),
    }
}

/// Extract the host part from a URL-ish string
#[inline]
fn extract_host(url: &str) -> &str {
    let rest = match url.find("://") {
        Some(pos) => &url[pos + 3..],
        None => url,
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let host = authority.rsplit('@').next().unwrap_or(authority);
    host.split(':').next().unwrap_or(host)
}

/// Right-anchored suffix test used for domain scoping
///
/// Plain `ends_with`: `a.com` covers `a.com`, `x.a.com` and also `xa.com`.
#[inline]
pub fn ends_with_domain(domain: &str, entry: &str) -> bool {
    !entry.is_empty() && domain.ends_with(entry)
}

/// Domain scoping check
///
/// Excludes win over includes. An empty include set means the rule applies
/// everywhere it is not excluded.
pub fn domain_matches(
    domain: &str,
    included: &HashSet<String>,
    excluded: &HashSet<String>,
) -> bool {
    if excluded.iter().any(|ex| ends_with_domain(domain, ex)) {
        return false;
    }
    if included.is_empty() {
        return true;
    }
    included.iter().any(|inc| ends_with_domain(domain, inc))
}

/// Iterate a domain and each of its parent suffixes, most specific first
pub fn domain_suffixes(domain: &str) -> impl Iterator<Item = &str> {
    let mut next = (!domain.is_empty()).then_some(domain);
    std::iter::from_fn(move || {
        let current = next?;
        next = current.find('.').map(|idx| &current[idx + 1..]).filter(|s| !s.is_empty());
        Some(current)
    })
}
