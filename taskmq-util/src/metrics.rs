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

//! Minimal in-process metrics primitives, ported from
//! `nativelink_util::metrics_utils`. These back `MetricsComponent`
//! implementations on `Producer`/`Consumer`/`RateLimiter`; wiring them up to
//! a real exporter (eg. `prometheus-client`) is left to the embedding
//! application.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A single published metric sample.
#[derive(Debug, Clone)]
pub struct PublishedMetric {
    pub name: String,
    pub help: String,
    pub value: String,
    pub labels: Vec<(String, String)>,
}

/// Accumulates metrics gathered from one or more `MetricsComponent`s during
/// a single collection pass.
#[derive(Debug, Default)]
pub struct CollectorState {
    pub metrics: Vec<PublishedMetric>,
}

impl CollectorState {
    pub fn publish(&mut self, name: impl Into<String>, value: &dyn fmt::Display, help: impl Into<String>) {
        self.metrics.push(PublishedMetric {
            name: name.into(),
            help: help.into(),
            value: value.to_string(),
            labels: Vec::new(),
        });
    }

    pub fn publish_with_labels(
        &mut self,
        name: impl Into<String>,
        value: &dyn fmt::Display,
        help: impl Into<String>,
        labels: Vec<(String, String)>,
    ) {
        self.metrics.push(PublishedMetric {
            name: name.into(),
            help: help.into(),
            value: value.to_string(),
            labels,
        });
    }
}

/// Implemented by anything that can contribute samples to a collection
/// pass. `Producer`, `Consumer`, and `RateLimiter` all implement this.
pub trait MetricsComponent {
    fn gather_metrics(&self, c: &mut CollectorState);
}

/// Wraps a `MetricsComponent` so it can be registered into a `Registry`
/// as a trait object.
pub struct Collector(Arc<dyn MetricsComponent + Send + Sync>);

impl Collector {
    pub fn new<T: MetricsComponent + Send + Sync + 'static>(component: &Arc<T>) -> Self {
        Collector(component.clone())
    }
}

impl MetricsComponent for Collector {
    fn gather_metrics(&self, c: &mut CollectorState) {
        self.0.gather_metrics(c);
    }
}

/// Holds every `Collector` registered by the embedding application and
/// gathers them all in one pass.
#[derive(Default)]
pub struct Registry {
    collectors: Vec<Box<dyn MetricsComponent + Send + Sync>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_collector(&mut self, collector: Box<dyn MetricsComponent + Send + Sync>) {
        self.collectors.push(collector);
    }

    #[must_use]
    pub fn gather(&self) -> CollectorState {
        let mut state = CollectorState::default();
        for collector in &self.collectors {
            collector.gather_metrics(&mut state);
        }
        state
    }
}

/// A monotonic counter. `Display`s as the raw count.
#[derive(Debug, Default)]
pub struct CounterWithTime {
    count: AtomicU64,
}

impl CounterWithTime {
    pub fn inc(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl fmt::Display for CounterWithTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// Counts invocations of an async operation as it is awaited.
#[derive(Debug, Default)]
pub struct AsyncCounterWrapper {
    count: AtomicU64,
}

impl AsyncCounterWrapper {
    pub async fn wrap<T, F: Future<Output = T>>(&self, fut: F) -> T {
        let result = fut.await;
        self.count.fetch_add(1, Ordering::Relaxed);
        result
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl fmt::Display for AsyncCounterWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// Counts invocations of a synchronous operation.
#[derive(Debug, Default)]
pub struct FuncCounterWrapper {
    count: AtomicU64,
}

impl FuncCounterWrapper {
    pub fn wrap<T, F: FnOnce() -> T>(&self, f: F) -> T {
        let result = f();
        self.count.fetch_add(1, Ordering::Relaxed);
        result
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl fmt::Display for FuncCounterWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        calls: CounterWithTime,
    }

    impl MetricsComponent for Dummy {
        fn gather_metrics(&self, c: &mut CollectorState) {
            c.publish("dummy_calls", &self.calls, "calls to dummy");
        }
    }

    #[test]
    fn registry_gathers_registered_components() {
        let mut registry = Registry::new();
        let dummy = Arc::new(Dummy {
            calls: CounterWithTime::default(),
        });
        dummy.calls.inc();
        dummy.calls.inc();
        registry.register_collector(Box::new(Collector::new(&dummy)));
        let state = registry.gather();
        assert_eq!(state.metrics.len(), 1);
        assert_eq!(state.metrics[0].value, "2");
    }

    #[tokio::test]
    async fn async_counter_wrapper_counts_after_await() {
        let counter = AsyncCounterWrapper::default();
        counter.wrap(async { 1 + 1 }).await;
        counter.wrap(async { 2 + 2 }).await;
        assert_eq!(counter.get(), 2);
    }
}
