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

//! Executes one delivery: atomic state transition, handler dispatch,
//! retry/attempt accounting, lifecycle events.

use std::collections::HashSet;
use std::sync::Arc;

use taskmq_error::{Code, Error};
use taskmq_store::{StorageAdapter, TaskPatch};
use taskmq_util::metrics::{CollectorState, CounterWithTime, MetricsComponent};
use taskmq_util::task::{DeliveryPayload, Task, TaskError, TaskId, TaskProgress, TaskStatus};
use taskmq_util::TaskEvent;
use tokio::sync::Mutex;
use tracing::{event, Level};

use crate::event_bus::EventBus;
use crate::handler_registry::{HandlerContext, HandlerRegistry, LifecycleCallbacks, ProgressReporter};

struct TaskProgressReporter {
    task_id: TaskId,
    queue_name: String,
    store: Arc<dyn StorageAdapter>,
    events: Arc<EventBus>,
}

#[async_trait::async_trait]
impl ProgressReporter for TaskProgressReporter {
    async fn update_progress(&self, progress: TaskProgress) -> Result<(), Error> {
        // A handler is always mid-delivery while reporting progress, so
        // the task's status is known to be `Active` without a fetch.
        let clamped = TaskProgress::new(progress.percentage.min(100), progress.data);
        self.store
            .update_task_status(
                self.task_id,
                TaskStatus::Active,
                TaskPatch {
                    progress: Some(clamped.clone()),
                    ..Default::default()
                },
            )
            .await?;
        self.events.emit(&TaskEvent::TaskProgress {
            task_id: self.task_id,
            queue_name: self.queue_name.clone(),
            progress: clamped,
        });
        Ok(())
    }
}

pub struct Consumer {
    store: Arc<dyn StorageAdapter>,
    registry: Arc<HandlerRegistry>,
    events: Arc<EventBus>,
    active_tasks: Mutex<HashSet<(String, TaskId)>>,
    deliveries_total: CounterWithTime,
    completed_total: CounterWithTime,
    failed_total: CounterWithTime,
    retried_total: CounterWithTime,
}

impl Consumer {
    #[must_use]
    pub fn new(
        store: Arc<dyn StorageAdapter>,
        registry: Arc<HandlerRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        Consumer {
            store,
            registry,
            events,
            active_tasks: Mutex::new(HashSet::new()),
            deliveries_total: CounterWithTime::default(),
            completed_total: CounterWithTime::default(),
            failed_total: CounterWithTime::default(),
            retried_total: CounterWithTime::default(),
        }
    }

    /// Reports progress for `task_id` without going through a running
    /// delivery. Used both by `HandlerContext::progress` and any external
    /// caller that already knows the task id.
    pub async fn update_progress(
        &self,
        task_id: TaskId,
        queue_name: &str,
        progress: TaskProgress,
    ) -> Result<(), Error> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::new(Code::NotFound, format!("no task with id {task_id}")))?;
        let clamped = TaskProgress::new(progress.percentage.min(100), progress.data);
        self.store
            .update_task_status(
                task_id,
                task.status,
                TaskPatch {
                    progress: Some(clamped.clone()),
                    ..Default::default()
                },
            )
            .await?;
        self.events.emit(&TaskEvent::TaskProgress {
            task_id,
            queue_name: queue_name.to_string(),
            progress: clamped,
        });
        Ok(())
    }

    /// Executes one delivery end to end. Returns `Ok(())` on handler
    /// success or a recoverable (non-terminal) failure that the dispatcher
    /// should retry; returns `Err` when the delivery itself cannot be
    /// processed (task missing, concurrent delivery, no handler) or when
    /// the task has just reached its terminal `Failed` state.
    pub async fn process_delivery(&self, payload: &DeliveryPayload) -> Result<(), Error> {
        let task = self
            .store
            .get_task(payload.task_id)
            .await?
            .ok_or_else(|| {
                Error::new(
                    Code::NotFound,
                    format!("no task with id {} (stale delivery)", payload.task_id),
                )
            })?;

        let guard_key = (task.queue_name.clone(), task.id);
        {
            let mut active = self.active_tasks.lock().await;
            if !active.insert(guard_key.clone()) {
                return Err(Error::new(
                    Code::Conflict,
                    format!("task {} is already being processed", task.id),
                ));
            }
        }
        self.deliveries_total.inc();

        let store = self.store.clone();
        let registry = self.registry.clone();
        let events = self.events.clone();
        let task_id = task.id;
        let handle = taskmq_util::spawn!(
            format!("process_delivery:{task_id}"),
            Consumer::process_delivery_inner(store, registry, events, task)
        );
        let result = handle.await.unwrap_or_else(|join_err| {
            Err(Error::new(
                Code::Internal,
                format!("delivery task panicked: {join_err}"),
            ))
        });

        self.active_tasks.lock().await.remove(&guard_key);
        match &result {
            Ok(()) => self.completed_total.inc(),
            Err(err) if err.code != Code::HandlerFailure => self.failed_total.inc(),
            Err(_) => self.retried_total.inc(),
        }
        result
    }

    async fn process_delivery_inner(
        store: Arc<dyn StorageAdapter>,
        registry: Arc<HandlerRegistry>,
        events: Arc<EventBus>,
        mut task: Task,
    ) -> Result<(), Error> {
        task.mark_active();
        store
            .update_task_status(
                task.id,
                TaskStatus::Active,
                TaskPatch {
                    active_at: task.active_at,
                    ..Default::default()
                },
            )
            .await?;
        let callbacks = registry.callbacks(&task.queue_name);
        if let Some(on_active) = &callbacks.on_active {
            on_active(&task);
        }

        let Some(handler) = registry.resolve(&task.queue_name, task.task_name.as_deref()) else {
            let err = Error::new(
                Code::InvalidArgument,
                format!(
                    "no handler registered for queue {} (task_name={:?})",
                    task.queue_name, task.task_name
                ),
            );
            // No retry is possible without a handler, so this attempt is
            // terminal immediately rather than counted towards a future one.
            task.attempts = task.max_attempts;
            return Self::terminal_failure(&store, &events, &mut task, err, &callbacks).await;
        };

        let reporter: Arc<dyn ProgressReporter> = Arc::new(TaskProgressReporter {
            task_id: task.id,
            queue_name: task.queue_name.clone(),
            store: store.clone(),
            events: events.clone(),
        });
        let ctx = HandlerContext {
            task: task.clone(),
            progress: reporter,
        };

        match handler.handle(ctx).await {
            Ok(result) => {
                task.mark_completed(result.clone());
                store
                    .update_task_status(
                        task.id,
                        TaskStatus::Completed,
                        TaskPatch {
                            result: Some(result.clone()),
                            completed_at: task.completed_at,
                            ..Default::default()
                        },
                    )
                    .await?;
                if let Some(on_completed) = &callbacks.on_completed {
                    on_completed(&task, &result);
                }
                if let Some(duration) = task.duration() {
                    events.emit(&TaskEvent::TaskCompleted {
                        task_id: task.id,
                        queue_name: task.queue_name.clone(),
                        duration,
                    });
                }
                if task.is_in_chain() && !task.is_last_in_chain() {
                    event!(
                        Level::DEBUG,
                        task_id = %task.id,
                        chain_id = ?task.chain.as_ref().map(|c| &c.id),
                        "chain step completed; next step delivery is the dispatcher's responsibility"
                    );
                }
                if task.should_remove_on_complete() {
                    store.delete_task(task.id).await?;
                    if let Some(key) = &task.uniqueness_key {
                        store.remove_uniqueness_key(key).await?;
                    }
                }
                Ok(())
            }
            Err(handler_err) => {
                task.increment_attempts();
                if task.attempts < task.max_attempts {
                    store
                        .update_task_status(
                            task.id,
                            TaskStatus::Idle,
                            TaskPatch {
                                attempts: Some(task.attempts),
                                ..Default::default()
                            },
                        )
                        .await?;
                    event!(
                        Level::WARN,
                        task_id = %task.id,
                        attempts = task.attempts,
                        max_attempts = task.max_attempts,
                        ?handler_err,
                        "handler failed; retry scheduled by dispatcher"
                    );
                    Err(Error::new(Code::HandlerFailure, handler_err.to_string()))
                } else {
                    Self::terminal_failure(&store, &events, &mut task, handler_err, &callbacks).await
                }
            }
        }
    }

    async fn terminal_failure(
        store: &Arc<dyn StorageAdapter>,
        events: &Arc<EventBus>,
        task: &mut Task,
        err: Error,
        callbacks: &LifecycleCallbacks,
    ) -> Result<(), Error> {
        let task_error = TaskError::new(err.to_string());
        task.mark_failed(task_error.clone());
        store
            .update_task_status(
                task.id,
                TaskStatus::Failed,
                TaskPatch {
                    attempts: Some(task.attempts),
                    error: Some(task_error),
                    failed_at: task.failed_at,
                    ..Default::default()
                },
            )
            .await?;
        if let Some(on_failed) = &callbacks.on_failed {
            on_failed(task);
        }
        events.emit(&TaskEvent::TaskFailed {
            task_id: task.id,
            queue_name: task.queue_name.clone(),
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            is_final_attempt: true,
        });
        if task.should_remove_on_fail() {
            store.delete_task(task.id).await?;
            if let Some(key) = &task.uniqueness_key {
                store.remove_uniqueness_key(key).await?;
            }
        }
        Err(err)
    }
}

impl MetricsComponent for Consumer {
    fn gather_metrics(&self, c: &mut CollectorState) {
        c.publish(
            "deliveries_total",
            &self.deliveries_total,
            "total deliveries accepted for processing",
        );
        c.publish(
            "deliveries_completed_total",
            &self.completed_total,
            "total deliveries that completed their handler successfully",
        );
        c.publish(
            "deliveries_failed_total",
            &self.failed_total,
            "total deliveries that reached a terminal failure",
        );
        c.publish(
            "deliveries_retried_total",
            &self.retried_total,
            "total deliveries that failed but remain retryable",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler_registry::Handler;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use taskmq_store::MemoryStore;
    use taskmq_util::task::{AddTaskOptions, Task};

    struct AlwaysSucceeds;

    #[async_trait]
    impl Handler for AlwaysSucceeds {
        async fn handle(&self, ctx: HandlerContext) -> Result<serde_json::Value, Error> {
            Ok(ctx.task.data.clone())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Handler for AlwaysFails {
        async fn handle(&self, _ctx: HandlerContext) -> Result<serde_json::Value, Error> {
            Err(Error::new(Code::HandlerFailure, "boom".to_string()))
        }
    }

    async fn setup(handler: Arc<dyn Handler>) -> (Consumer, Arc<dyn StorageAdapter>, Task) {
        let store: Arc<dyn StorageAdapter> = Arc::new(MemoryStore::new());
        let mut registry = HandlerRegistry::new();
        registry.register("q", None, handler);
        let consumer = Consumer::new(store.clone(), Arc::new(registry), Arc::new(EventBus::new()));
        let task = Task::new(
            "q".to_string(),
            serde_json::json!({"msg": "hi"}),
            3,
            &AddTaskOptions::default(),
        );
        store.save_task(&task).await.unwrap();
        (consumer, store, task)
    }

    #[tokio::test]
    async fn single_success_completes_task() {
        let (consumer, store, task) = setup(Arc::new(AlwaysSucceeds)).await;
        let payload = DeliveryPayload::from(&task);
        consumer.process_delivery(&payload).await.unwrap();
        let fetched = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Completed);
        assert_eq!(fetched.attempts, 1);
        assert!(fetched.result.is_some());
    }

    #[tokio::test]
    async fn retry_then_fail_after_max_attempts() {
        let (consumer, store, task) = setup(Arc::new(AlwaysFails)).await;
        let payload = DeliveryPayload::from(&task);

        consumer.process_delivery(&payload).await.unwrap_err();
        let after_first = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(after_first.status, TaskStatus::Idle);
        assert_eq!(after_first.attempts, 1);

        consumer.process_delivery(&payload).await.unwrap_err();
        let after_second = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(after_second.status, TaskStatus::Idle);
        assert_eq!(after_second.attempts, 2);

        consumer.process_delivery(&payload).await.unwrap_err();
        let after_third = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(after_third.status, TaskStatus::Failed);
        assert_eq!(after_third.attempts, 3);
        assert!(after_third.error.is_some());
    }

    #[tokio::test]
    async fn missing_task_returns_not_found() {
        let (consumer, _store, task) = setup(Arc::new(AlwaysSucceeds)).await;
        let mut payload = DeliveryPayload::from(&task);
        payload.task_id = TaskId::new();
        let err = consumer.process_delivery(&payload).await.unwrap_err();
        assert_eq!(err.code, Code::NotFound);
    }

    #[tokio::test]
    async fn concurrent_delivery_for_same_task_is_rejected() {
        let counter = Arc::new(AtomicUsize::new(0));
        struct SlowHandler(Arc<AtomicUsize>);
        #[async_trait]
        impl Handler for SlowHandler {
            async fn handle(&self, ctx: HandlerContext) -> Result<serde_json::Value, Error> {
                self.0.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                Ok(ctx.task.data.clone())
            }
        }
        let (consumer, store, task) = setup(Arc::new(SlowHandler(counter))).await;
        let consumer = Arc::new(consumer);
        let payload = DeliveryPayload::from(&task);

        let c1 = consumer.clone();
        let p1 = payload.clone();
        let first = tokio::spawn(async move { c1.process_delivery(&p1).await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let second = consumer.process_delivery(&payload).await;

        assert!(second.is_err());
        assert_eq!(second.unwrap_err().code, Code::Conflict);
        first.await.unwrap().unwrap();
        let fetched = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn gather_metrics_counts_completed_delivery() {
        let (consumer, _store, task) = setup(Arc::new(AlwaysSucceeds)).await;
        let payload = DeliveryPayload::from(&task);
        consumer.process_delivery(&payload).await.unwrap();
        let mut state = CollectorState::default();
        consumer.gather_metrics(&mut state);
        let completed = state
            .metrics
            .iter()
            .find(|m| m.name == "deliveries_completed_total")
            .unwrap();
        assert_eq!(completed.value, "1");
    }
}
