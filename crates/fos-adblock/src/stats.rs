//! Block statistics
//!
//! Global counters plus a per-domain blocked count. Counters are atomics so
//! the decision path never waits on a lock for them; the per-domain map has
//! its own small mutex.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

const NEVER: i64 = i64::MIN;

/// Running block statistics
#[derive(Debug)]
pub struct BlockStatistics {
    total_requests: AtomicU64,
    total_blocked: AtomicU64,
    last_blocked: AtomicI64,
    since: AtomicI64,
    blocked_domains: Mutex<HashMap<String, u64>>,
}

/// Point-in-time copy of [`BlockStatistics`], the export format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsSnapshot {
    pub total_requests: u64,
    pub total_blocked: u64,
    pub blocked_domains: BTreeMap<String, u64>,
    #[serde(default)]
    pub last_blocked: Option<DateTime<Utc>>,
    pub since: DateTime<Utc>,
}

impl BlockStatistics {
    pub fn new(since: DateTime<Utc>) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            total_blocked: AtomicU64::new(0),
            last_blocked: AtomicI64::new(NEVER),
            since: AtomicI64::new(since.timestamp_millis()),
            blocked_domains: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a block against the request's domain. Returns the new total.
    pub fn record_block(&self, domain: &str, at: DateTime<Utc>) -> u64 {
        let total = self.total_blocked.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_blocked.store(at.timestamp_millis(), Ordering::Relaxed);
        let mut domains = self.blocked_domains.lock().unwrap_or_else(PoisonError::into_inner);
        *domains.entry(domain.to_string()).or_insert(0) += 1;
        total
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_blocked(&self) -> u64 {
        self.total_blocked.load(Ordering::Relaxed)
    }

    /// Blocked count for one domain
    pub fn blocked_for(&self, domain: &str) -> u64 {
        let domains = self.blocked_domains.lock().unwrap_or_else(PoisonError::into_inner);
        domains.get(domain).copied().unwrap_or(0)
    }

    /// Most blocked domains, highest count first, ties by name
    pub fn top_blocked_domains(&self, limit: usize) -> Vec<(String, u64)> {
        let domains = self.blocked_domains.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ranked: Vec<(String, u64)> =
            domains.iter().map(|(d, c)| (d.clone(), *c)).collect();
        drop(domains);
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked
    }

    /// Zero every counter and restart the collection period
    pub fn reset(&self, now: DateTime<Utc>) {
        let mut domains = self.blocked_domains.lock().unwrap_or_else(PoisonError::into_inner);
        domains.clear();
        self.total_requests.store(0, Ordering::Relaxed);
        self.total_blocked.store(0, Ordering::Relaxed);
        self.last_blocked.store(NEVER, Ordering::Relaxed);
        self.since.store(now.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let domains = self.blocked_domains.lock().unwrap_or_else(PoisonError::into_inner);
        let blocked_domains = domains.iter().map(|(d, c)| (d.clone(), *c)).collect();
        drop(domains);

        StatisticsSnapshot {
            total_requests: self.total_requests(),
            total_blocked: self.total_blocked(),
            blocked_domains,
            last_blocked: millis_to_time(self.last_blocked.load(Ordering::Relaxed)),
            since: millis_to_time(self.since.load(Ordering::Relaxed)).unwrap_or_default(),
        }
    }
}

fn millis_to_time(millis: i64) -> Option<DateTime<Utc>> {
    if millis == NEVER {
        return None;
    }
    DateTime::from_timestamp_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_counts_and_top_domains() {
        let now = Utc::now();
        let stats = BlockStatistics::new(now);
        stats.record_request();
        stats.record_request();
        stats.record_request();
        assert_eq!(stats.record_block("ads.test", now), 1);
        assert_eq!(stats.record_block("ads.test", now), 2);
        assert_eq!(stats.record_block("b.test", now), 3);
        stats.record_block("a.test", now);

        assert_eq!(stats.total_requests(), 3);
        assert_eq!(stats.total_blocked(), 4);
        assert_eq!(stats.blocked_for("ads.test"), 2);
        assert_eq!(
            stats.top_blocked_domains(2),
            vec![("ads.test".to_string(), 2), ("a.test".to_string(), 1)]
        );
    }

    #[test]
    fn test_reset() {
        let start = Utc::now();
        let stats = BlockStatistics::new(start);
        stats.record_request();
        stats.record_block("ads.test", start);

        let later = start + TimeDelta::hours(1);
        stats.reset(later);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.total_blocked, 0);
        assert!(snapshot.blocked_domains.is_empty());
        assert!(snapshot.last_blocked.is_none());
        assert_eq!(snapshot.since.timestamp_millis(), later.timestamp_millis());
    }

    #[test]
    fn test_snapshot_json_shape() {
        let now = Utc::now();
        let stats = BlockStatistics::new(now);
        stats.record_block("ads.test", now);

        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["totalBlocked"], 1);
        assert_eq!(json["blockedDomains"]["ads.test"], 1);
        assert!(json.get("lastBlocked").is_some());
    }
}
