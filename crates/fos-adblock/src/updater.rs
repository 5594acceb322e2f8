//! Filter list updater
//!
//! Fetches subscribed lists and hands the bodies to the engine, which swaps
//! the whole list on success. Failures leave the installed rules alone.
//!
//! Every `update(id)` call takes a generation number for that list. A fetch
//! that completes after a newer update for the same list started is dropped,
//! so a slow response can never overwrite a newer one.
//!
//! [`ListUpdater::run`] drives two timers: a frequent "anything due?" check
//! against each list's next-due timestamp and a coarser expiry sweep.

use crate::client::{FetchError, ListFetcher};
use crate::engine::AdBlockEngine;
use crate::filter_list::FilterListError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Errors from a single list update
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Unknown filter list: {0}")]
    UnknownList(String),

    #[error("Not a subscription: {0}")]
    NotSubscription(String),

    #[error("Subscription rejected: {0}")]
    Rejected(String),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Parse failed: {0}")]
    Parse(#[from] FilterListError),
}

/// What an update did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListUpdateOutcome {
    /// New rules installed
    Updated { rules: usize },
    /// Body identical to the installed one
    Unchanged { rules: usize },
    /// A newer update for the same list took over; result discarded
    Superseded,
    /// List is disabled and was not fetched
    Skipped,
}

/// Result of updating several lists
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub superseded: Vec<String>,
    /// List id and error message
    pub failed: Vec<(String, String)>,
}

impl UpdateReport {
    fn record(&mut self, id: String, result: Result<ListUpdateOutcome, UpdateError>) {
        match result {
            Ok(ListUpdateOutcome::Updated { .. }) => self.updated.push(id),
            Ok(ListUpdateOutcome::Unchanged { .. }) => self.unchanged.push(id),
            Ok(ListUpdateOutcome::Superseded) => self.superseded.push(id),
            Ok(ListUpdateOutcome::Skipped) => {}
            Err(e) => self.failed.push((id, e.to_string())),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.updated.is_empty()
            && self.unchanged.is_empty()
            && self.superseded.is_empty()
            && self.failed.is_empty()
    }
}

/// Background fetch-and-replace of subscriptions
pub struct ListUpdater {
    engine: Arc<AdBlockEngine>,
    fetcher: Arc<dyn ListFetcher>,
    /// Latest generation started per list id
    generations: Mutex<HashMap<String, u64>>,
}

impl ListUpdater {
    pub fn new(engine: Arc<AdBlockEngine>, fetcher: Arc<dyn ListFetcher>) -> Self {
        Self {
            engine,
            fetcher,
            generations: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<AdBlockEngine> {
        &self.engine
    }

    fn lock_generations(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.generations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, id: &str) -> u64 {
        let mut generations = self.lock_generations();
        let generation = generations.entry(id.to_string()).or_insert(0);
        *generation += 1;
        *generation
    }

    /// Drop counters of lists that are no longer installed
    fn prune_generations(&self) {
        let installed: HashSet<String> = self.engine.subscription_ids().into_iter().collect();
        self.lock_generations().retain(|id, _| installed.contains(id));
    }

    #[cfg(test)]
    fn tracked_lists(&self) -> usize {
        self.lock_generations().len()
    }

    /// Fetch one subscription and install the result
    pub async fn update(&self, id: &str) -> Result<ListUpdateOutcome, UpdateError> {
        let url = self.engine.subscription_url(id)?;
        let generation = self.begin(id);
        debug!("Fetching '{}' (generation {})", id, generation);

        let fetched = match tokio::time::timeout(
            self.engine.config().fetch_timeout,
            self.fetcher.fetch(&url),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        };

        // Held while installing so that the generation check and the swap
        // happen as one step.
        let mut generations = self.lock_generations();
        if generations.get(id) != Some(&generation) {
            debug!("Discarding superseded fetch of '{}'", id);
            return Ok(ListUpdateOutcome::Superseded);
        }

        let result = match fetched {
            Ok(body) => self.engine.apply_list_update(id, &body),
            Err(e) => Err(UpdateError::Fetch(e)),
        };
        if matches!(result, Err(UpdateError::UnknownList(_))) {
            // Removed while the fetch was running
            generations.remove(id);
        }
        drop(generations);

        if let Err(e) = &result {
            self.engine.report_update_failure(id, &e.to_string());
        }
        result
    }

    /// Update every enabled subscription
    pub async fn update_all(&self) -> UpdateReport {
        self.prune_generations();
        let mut report = UpdateReport::default();
        for id in self.engine.subscription_ids() {
            if !self.engine.list_info(&id).is_some_and(|l| l.enabled) {
                continue;
            }
            let result = self.update(&id).await;
            report.record(id, result);
        }
        report
    }

    /// Add a subscription and fetch it right away when enabled
    pub async fn subscribe(&self, url: &str, enabled: bool) -> Result<ListUpdateOutcome, UpdateError> {
        if !self.engine.add_filter_list(url, enabled) {
            return Err(UpdateError::Rejected(url.to_string()));
        }
        if !enabled {
            return Ok(ListUpdateOutcome::Skipped);
        }
        self.update(url.trim()).await
    }

    /// Update subscriptions whose refresh time has come
    pub async fn check_for_updates(&self) -> UpdateReport {
        let mut report = UpdateReport::default();
        if !self.engine.is_enabled() {
            return report;
        }
        self.prune_generations();
        let now = self.engine.clock().now();
        for id in self.engine.due_subscriptions(now) {
            let result = self.update(&id).await;
            report.record(id, result);
        }
        if !report.is_empty() {
            info!(
                "Update check: {} updated, {} unchanged, {} failed",
                report.updated.len(),
                report.unchanged.len(),
                report.failed.len()
            );
        }
        report
    }

    /// Disable lists whose expiry date has passed
    pub fn sweep_expired(&self) -> Vec<String> {
        self.engine.expire_lists(self.engine.clock().now())
    }

    /// One scheduler step: due updates, then expiry
    pub async fn tick(&self) -> UpdateReport {
        let report = self.check_for_updates().await;
        self.sweep_expired();
        report
    }

    /// Run the scheduler until `shutdown` becomes `true` or its sender drops
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let config = self.engine.config().clone();
        let mut check = tokio::time::interval(config.update_check_period);
        let mut sweep = tokio::time::interval(config.expiry_sweep_period);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "List updater started (check every {:?}, expiry sweep every {:?})",
            config.update_check_period, config.expiry_sweep_period
        );

        loop {
            tokio::select! {
                _ = check.tick() => {
                    let report = self.check_for_updates().await;
                    for (id, message) in &report.failed {
                        warn!("Scheduled update of '{}' failed: {}", id, message);
                    }
                }
                _ = sweep.tick() => {
                    let expired = self.sweep_expired();
                    if !expired.is_empty() {
                        info!("Expired lists: {:?}", expired);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("List updater stopped");
    }
}
