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

//! Explicit subscription API for lifecycle events, replacing an
//! inherited event-emitter with `subscribe(kind, handler) -> Unsubscribe`.
//! Listeners run synchronously on the emitting task; one panicking
//! listener is isolated and does not prevent the others from running.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use taskmq_util::events::{EventKind, TaskEvent};
use tracing::{event, Level};

type Listener = Box<dyn Fn(&TaskEvent) + Send + Sync>;

struct Subscription {
    id: u64,
    kind: EventKind,
    listener: Listener,
}

/// Revokes a subscription when dropped or when `unsubscribe()` is called
/// explicitly. Dropping without calling `unsubscribe()` leaves the
/// listener registered — callers that want cleanup must call it.
pub struct Unsubscribe<'a> {
    bus: &'a EventBus,
    id: u64,
}

impl Unsubscribe<'_> {
    pub fn unsubscribe(self) {
        self.bus.remove(self.id);
    }
}

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        EventBus::default()
    }

    /// Registers `listener` for events of `kind`. The returned handle can
    /// be used to remove the listener later.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> Unsubscribe<'_>
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Subscription {
                id,
                kind,
                listener: Box::new(listener),
            });
        Unsubscribe { bus: self, id }
    }

    fn remove(&self, id: u64) {
        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|s| s.id != id);
    }

    /// Invokes every listener subscribed to `event`'s kind. A panicking
    /// listener is caught and logged; remaining listeners still run.
    pub fn emit(&self, task_event: &TaskEvent) {
        let kind = task_event.kind();
        let subscriptions = self.subscriptions.lock().unwrap_or_else(|p| p.into_inner());
        for subscription in subscriptions.iter().filter(|s| s.kind == kind) {
            let result = catch_unwind(AssertUnwindSafe(|| (subscription.listener)(task_event)));
            if result.is_err() {
                event!(Level::ERROR, ?kind, "event listener panicked, skipping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use taskmq_util::task::TaskId;

    #[test]
    fn listener_receives_matching_events_only() {
        let bus = EventBus::new();
        let added = Arc::new(AtomicUsize::new(0));
        let added_clone = added.clone();
        let _sub = bus.subscribe(EventKind::TaskAdded, move |_| {
            added_clone.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(&TaskEvent::TaskAdded {
            task_id: TaskId::new(),
            queue_name: "q".to_string(),
            data: serde_json::json!({}),
        });
        bus.emit(&TaskEvent::TaskFailed {
            task_id: TaskId::new(),
            queue_name: "q".to_string(),
            attempts: 1,
            max_attempts: 3,
            is_final_attempt: false,
        });
        assert_eq!(added.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let sub = bus.subscribe(EventKind::TaskAdded, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();
        bus.emit(&TaskEvent::TaskAdded {
            task_id: TaskId::new(),
            queue_name: "q".to_string(),
            data: serde_json::json!({}),
        });
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let _panicker = bus.subscribe(EventKind::TaskAdded, |_| panic!("boom"));
        let _ok = bus.subscribe(EventKind::TaskAdded, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(&TaskEvent::TaskAdded {
            task_id: TaskId::new(),
            queue_name: "q".to_string(),
            data: serde_json::json!({}),
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
