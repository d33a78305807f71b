//! Per-tenant sliding-window rate limiter.
//!
//! Each key keeps the timestamps of its admitted calls inside the trailing
//! window. Checks for the same key serialize on the map entry, so concurrent
//! admissions can never overshoot the limit.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug)]
pub struct RateLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
    limit: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            limit,
            window,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admit one call for `key` if it is under budget, recording it.
    pub fn is_allowed(&self, key: &str) -> bool {
        self.is_allowed_at(key, Instant::now())
    }

    pub(crate) fn is_allowed_at(&self, key: &str, now: Instant) -> bool {
        let mut entry = self.windows.entry(key.to_string()).or_default();
        purge(&mut entry, now, self.window);
        if entry.len() >= self.limit {
            return false;
        }
        entry.push_back(now);
        true
    }

    /// Calls for `key` still inside the window.
    pub fn count(&self, key: &str) -> usize {
        self.count_at(key, Instant::now())
    }

    pub(crate) fn count_at(&self, key: &str, now: Instant) -> usize {
        match self.windows.get(key) {
            Some(entry) => entry.iter().filter(|ts| live(**ts, now, self.window)).count(),
            None => 0,
        }
    }

    /// Purge expired timestamps everywhere and forget idle tenants.
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now())
    }

    pub(crate) fn cleanup_at(&self, now: Instant) {
        self.windows.retain(|_, timestamps| {
            purge(timestamps, now, self.window);
            !timestamps.is_empty()
        });
    }

    /// Number of tenants currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

fn live(ts: Instant, now: Instant, window: Duration) -> bool {
    now.saturating_duration_since(ts) < window
}

fn purge(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = timestamps.front() {
        if live(oldest, now, window) {
            break;
        }
        timestamps.pop_front();
    }
}
