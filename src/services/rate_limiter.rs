use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{RateDecision, RateLimitInfo};

/// Timestamps of admitted calls for a single user, oldest first
#[derive(Debug, Default)]
struct CallWindow {
    calls: VecDeque<DateTime<Utc>>,
}

impl CallWindow {
    /// Drop calls that are at least `window` old
    fn purge(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        while let Some(&oldest) = self.calls.front() {
            if now - oldest >= window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Sliding-window rate limiter keyed by user.
///
/// State lives in process memory for the lifetime of the instance and is not shared
/// between deployments. Each user has their own mutex, so users never contend.
pub struct RateLimiter {
    max_calls: u32,
    window: Duration,
    span: chrono::Duration,
    users: DashMap<String, Arc<Mutex<CallWindow>>>,
}

impl RateLimiter {
    pub fn new(max_calls: u32, window: Duration) -> Self {
        let span = chrono::Duration::from_std(window)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        Self {
            max_calls,
            window,
            span,
            users: DashMap::new(),
        }
    }

    /// Admit or deny a call for `user`. A request id is minted either way.
    pub fn try_admit(&self, user: &str) -> (String, RateDecision) {
        self.try_admit_at(user, Utc::now())
    }

    pub fn try_admit_at(&self, user: &str, now: DateTime<Utc>) -> (String, RateDecision) {
        let request_id = Uuid::new_v4().to_string();
        let slot = self.slot(user);
        let mut window = lock(&slot);
        window.purge(now, self.span);

        if window.calls.len() >= self.max_calls as usize {
            return (request_id, RateDecision::Denied);
        }

        window.calls.push_back(now);
        (request_id, RateDecision::Allowed)
    }

    /// Admit a call or fail with `RateLimited`; returns the request id
    pub fn check(&self, user: &str) -> Result<String> {
        let now = Utc::now();
        match self.try_admit_at(user, now) {
            (request_id, RateDecision::Allowed) => Ok(request_id),
            (request_id, RateDecision::Denied) => {
                tracing::debug!("Rate limit hit for {} ({})", user, request_id);
                Err(AppError::RateLimited {
                    request_id,
                    info: self.info_at(user, now),
                })
            }
        }
    }

    /// Live calls for `user`. Expired entries are dropped as a side effect.
    pub fn current_count(&self, user: &str) -> usize {
        self.current_count_at(user, Utc::now())
    }

    pub fn current_count_at(&self, user: &str, now: DateTime<Utc>) -> usize {
        let Some(slot) = self.existing_slot(user) else {
            return 0;
        };
        let mut window = lock(&slot);
        window.purge(now, self.span);
        window.calls.len()
    }

    pub fn info(&self, user: &str) -> RateLimitInfo {
        self.info_at(user, Utc::now())
    }

    pub fn info_at(&self, user: &str, now: DateTime<Utc>) -> RateLimitInfo {
        let (count, oldest) = match self.existing_slot(user) {
            Some(slot) => {
                let mut window = lock(&slot);
                window.purge(now, self.span);
                (window.calls.len(), window.calls.front().copied())
            }
            None => (0, None),
        };

        RateLimitInfo {
            remaining_calls: self.max_calls.saturating_sub(count as u32),
            limit: self.max_calls,
            window: self.window.as_secs(),
            reset_time: oldest.map(|ts| (ts + self.span).timestamp()).unwrap_or(0),
        }
    }

    /// Forget every call recorded for `user`
    pub fn clear(&self, user: &str) {
        if let Some(slot) = self.existing_slot(user) {
            lock(&slot).calls.clear();
        }
    }

    fn existing_slot(&self, user: &str) -> Option<Arc<Mutex<CallWindow>>> {
        self.users.get(user).map(|s| Arc::clone(s.value()))
    }

    /// The shard lock is released before the caller takes the user's mutex
    fn slot(&self, user: &str) -> Arc<Mutex<CallWindow>> {
        if let Some(slot) = self.existing_slot(user) {
            return slot;
        }
        Arc::clone(self.users.entry(user.to_string()).or_default().value())
    }
}

fn lock(slot: &Mutex<CallWindow>) -> MutexGuard<'_, CallWindow> {
    // A panic mid-update leaves at worst one unpurged entry
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
