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

//! `(queue_name) -> handlers` registry plus per-queue lifecycle callbacks.
//! Built at startup via explicit `register()` calls; read-only once
//! delivery handling starts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use taskmq_error::{error_if, Error};
use taskmq_util::task::{Task, TaskProgress};

/// Reports progress for the task currently being handled. Writes go
/// through the consumer, which persists them and fires `on_progress`.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn update_progress(&self, progress: TaskProgress) -> Result<(), Error>;
}

/// The value passed to a registered handler. `task` is immutable from the
/// handler's perspective; progress is reported through `progress`, not by
/// mutating the task in place.
pub struct HandlerContext {
    pub task: Task,
    pub progress: Arc<dyn ProgressReporter>,
}

/// A unit of work registered against a queue. Returns the task's `result`
/// value on success.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext) -> Result<serde_json::Value, Error>;
}

struct QueueHandlerEntry {
    task_name: Option<String>,
    handler: Arc<dyn Handler>,
}

type ActiveCallback = Arc<dyn Fn(&Task) + Send + Sync>;
type CompletedCallback = Arc<dyn Fn(&Task, &serde_json::Value) + Send + Sync>;
type FailedCallback = Arc<dyn Fn(&Task) + Send + Sync>;
type ProgressCallback = Arc<dyn Fn(&Task, &TaskProgress) + Send + Sync>;

#[derive(Default, Clone)]
pub struct LifecycleCallbacks {
    pub on_active: Option<ActiveCallback>,
    pub on_completed: Option<CompletedCallback>,
    pub on_failed: Option<FailedCallback>,
    pub on_progress: Option<ProgressCallback>,
}

#[derive(Default)]
struct QueueEntry {
    handlers: Vec<QueueHandlerEntry>,
    callbacks: LifecycleCallbacks,
}

/// Registry of handlers and lifecycle callbacks, keyed by queue name.
#[derive(Default)]
pub struct HandlerRegistry {
    queues: HashMap<String, QueueEntry>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    /// Registers `handler` for `queue_name`, optionally scoped to
    /// `task_name`. Multiple registrations per queue are allowed; dispatch
    /// order follows registration order.
    pub fn register(
        &mut self,
        queue_name: impl Into<String>,
        task_name: Option<String>,
        handler: Arc<dyn Handler>,
    ) {
        self.queues
            .entry(queue_name.into())
            .or_default()
            .handlers
            .push(QueueHandlerEntry { task_name, handler });
    }

    pub fn set_callbacks(&mut self, queue_name: impl Into<String>, callbacks: LifecycleCallbacks) {
        self.queues.entry(queue_name.into()).or_default().callbacks = callbacks;
    }

    pub fn callbacks(&self, queue_name: &str) -> LifecycleCallbacks {
        self.queues
            .get(queue_name)
            .map(|entry| entry.callbacks.clone())
            .unwrap_or_default()
    }

    /// Validates that every registered queue defines at least one handler.
    /// Called once at startup, after all `register()` calls.
    pub fn validate(&self) -> Result<(), Error> {
        for (queue_name, entry) in &self.queues {
            error_if!(
                entry.handlers.is_empty(),
                "queue {queue_name} is registered but defines no handler"
            );
        }
        Ok(())
    }

    /// Selects the handler whose `task_name` matches; falls back to the
    /// first unnamed handler, then the first registered handler.
    #[must_use]
    pub fn resolve(&self, queue_name: &str, task_name: Option<&str>) -> Option<Arc<dyn Handler>> {
        let entry = self.queues.get(queue_name)?;
        if let Some(task_name) = task_name {
            if let Some(found) = entry
                .handlers
                .iter()
                .find(|h| h.task_name.as_deref() == Some(task_name))
            {
                return Some(found.handler.clone());
            }
        }
        if let Some(found) = entry.handlers.iter().find(|h| h.task_name.is_none()) {
            return Some(found.handler.clone());
        }
        entry.handlers.first().map(|h| h.handler.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn handle(&self, ctx: HandlerContext) -> Result<serde_json::Value, Error> {
            Ok(ctx.task.data.clone())
        }
    }

    #[test]
    fn resolve_matches_named_handler_first() {
        let mut registry = HandlerRegistry::new();
        registry.register("q", Some("email".to_string()), Arc::new(EchoHandler));
        registry.register("q", None, Arc::new(EchoHandler));
        let resolved = registry.resolve("q", Some("email"));
        assert!(resolved.is_some());
    }

    #[test]
    fn resolve_falls_back_to_unnamed_then_first() {
        let mut registry = HandlerRegistry::new();
        registry.register("q", Some("email".to_string()), Arc::new(EchoHandler));
        registry.register("q", None, Arc::new(EchoHandler));
        assert!(registry.resolve("q", Some("sms")).is_some());
        assert!(registry.resolve("unknown", None).is_none());
    }

    #[test]
    fn validate_fails_when_queue_has_no_handlers() {
        let mut registry = HandlerRegistry::new();
        registry.set_callbacks("q", LifecycleCallbacks::default());
        assert!(registry.validate().is_err());
    }
}
