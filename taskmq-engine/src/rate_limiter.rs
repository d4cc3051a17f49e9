// Copyright 2024 The taskmq Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Thin facade over `StorageAdapter::increment_rate_limit`. Holds no state
//! of its own; every call round-trips to the adapter.

use std::sync::Arc;
use std::time::SystemTime;

use taskmq_error::Error;
use taskmq_store::StorageAdapter;
use taskmq_util::metrics::{CollectorState, CounterWithTime, MetricsComponent};

/// Parameters for a single rate-limit check.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitOptions {
    pub max_requests: i64,
    pub window_ms: u64,
}

/// Result of a `RateLimiter::check` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub count: i64,
    pub limit: i64,
    pub reset_time: SystemTime,
    pub remaining: i64,
}

pub struct RateLimiter {
    store: Arc<dyn StorageAdapter>,
    checks_total: CounterWithTime,
    denied_total: CounterWithTime,
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn StorageAdapter>) -> Self {
        RateLimiter {
            store,
            checks_total: CounterWithTime::default(),
            denied_total: CounterWithTime::default(),
        }
    }

    /// `max_requests <= 0` denies unconditionally without touching
    /// storage, per the fixed-window contract.
    pub async fn check(
        &self,
        key: &str,
        opts: RateLimitOptions,
    ) -> Result<RateLimitOutcome, Error> {
        self.checks_total.inc();
        if opts.max_requests <= 0 {
            self.denied_total.inc();
            return Ok(RateLimitOutcome {
                allowed: false,
                count: 0,
                limit: opts.max_requests,
                reset_time: SystemTime::now(),
                remaining: 0,
            });
        }
        let outcome = self
            .store
            .increment_rate_limit(key, opts.window_ms, opts.max_requests)
            .await?;
        if !outcome.allowed {
            self.denied_total.inc();
        }
        Ok(RateLimitOutcome {
            allowed: outcome.allowed,
            count: outcome.count,
            limit: opts.max_requests,
            reset_time: outcome.reset_time,
            remaining: (opts.max_requests - outcome.count).max(0),
        })
    }

    /// Releases a rate-limit window. Exposed for the producer's "release
    /// the uniqueness lock, not the counter" step — the counter itself is
    /// never rolled back on denial, only the uniqueness lock is.
    pub async fn delete(&self, key: &str) -> Result<(), Error> {
        self.store.delete_rate_limit(key).await
    }

    /// Reads the current window without incrementing it. Returns `None` if
    /// no live window exists for `key`.
    pub async fn get_status(
        &self,
        key: &str,
        opts: RateLimitOptions,
    ) -> Result<Option<RateLimitOutcome>, Error> {
        let Some(outcome) = self.store.get_rate_limit_status(key).await? else {
            return Ok(None);
        };
        Ok(Some(RateLimitOutcome {
            allowed: outcome.count <= opts.max_requests,
            count: outcome.count,
            limit: opts.max_requests,
            reset_time: outcome.reset_time,
            remaining: (opts.max_requests - outcome.count).max(0),
        }))
    }
}

impl MetricsComponent for RateLimiter {
    fn gather_metrics(&self, c: &mut CollectorState) {
        c.publish(
            "rate_limit_checks_total",
            &self.checks_total,
            "total rate limit checks performed",
        );
        c.publish(
            "rate_limit_denied_total",
            &self.denied_total,
            "total rate limit checks that denied the request",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmq_store::MemoryStore;

    fn rate_limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn zero_max_requests_denies_without_creating_window() {
        let limiter = rate_limiter();
        let outcome = limiter
            .check(
                "queue:q",
                RateLimitOptions {
                    max_requests: 0,
                    window_ms: 60_000,
                },
            )
            .await
            .unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.count, 0);
    }

    #[tokio::test]
    async fn get_status_is_absent_until_first_check() {
        let limiter = rate_limiter();
        let opts = RateLimitOptions {
            max_requests: 2,
            window_ms: 60_000,
        };
        assert!(limiter.get_status("queue:s", opts).await.unwrap().is_none());
        limiter.check("queue:s", opts).await.unwrap();
        let status = limiter.get_status("queue:s", opts).await.unwrap().unwrap();
        assert_eq!(status.count, 1);
        assert!(status.allowed);
    }

    #[tokio::test]
    async fn allows_up_to_max_then_denies() {
        let limiter = rate_limiter();
        let opts = RateLimitOptions {
            max_requests: 2,
            window_ms: 60_000,
        };
        assert!(limiter.check("queue:q", opts).await.unwrap().allowed);
        assert!(limiter.check("queue:q", opts).await.unwrap().allowed);
        let third = limiter.check("queue:q", opts).await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
    }

    #[tokio::test]
    async fn gather_metrics_counts_checks_and_denials() {
        let limiter = rate_limiter();
        let opts = RateLimitOptions {
            max_requests: 1,
            window_ms: 60_000,
        };
        limiter.check("queue:q", opts).await.unwrap();
        limiter.check("queue:q", opts).await.unwrap();
        let mut state = CollectorState::default();
        limiter.gather_metrics(&mut state);
        let checks = state
            .metrics
            .iter()
            .find(|m| m.name == "rate_limit_checks_total")
            .unwrap();
        assert_eq!(checks.value, "2");
        let denied = state
            .metrics
            .iter()
            .find(|m| m.name == "rate_limit_denied_total")
            .unwrap();
        assert_eq!(denied.value, "1");
    }
}
