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

//! Validates, deduplicates, rate-limits, persists, and registers a task
//! with the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use taskmq_config::QueueConfig;
use taskmq_error::{Code, Error};
use taskmq_store::StorageAdapter;
use taskmq_util::metrics::{CollectorState, CounterWithTime, MetricsComponent};
use taskmq_util::task::{AddTaskOptions, AddTaskResult, ChainLocation, DeliveryPayload, Task};
use taskmq_util::TaskEvent;
use tracing::{event, Level};
use uuid::Uuid;

use crate::dispatcher::DispatcherClient;
use crate::event_bus::EventBus;
use crate::rate_limiter::{RateLimitOptions, RateLimiter};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_UNIQUENESS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct Producer {
    store: Arc<dyn StorageAdapter>,
    rate_limiter: RateLimiter,
    dispatcher: Arc<dyn DispatcherClient>,
    events: Arc<EventBus>,
    add_task_total: CounterWithTime,
    tasks_queued_total: CounterWithTime,
    skipped_total: CounterWithTime,
    rate_limited_total: CounterWithTime,
}

impl Producer {
    #[must_use]
    pub fn new(
        store: Arc<dyn StorageAdapter>,
        dispatcher: Arc<dyn DispatcherClient>,
        events: Arc<EventBus>,
    ) -> Self {
        Producer {
            rate_limiter: RateLimiter::new(store.clone()),
            store,
            dispatcher,
            events,
            add_task_total: CounterWithTime::default(),
            tasks_queued_total: CounterWithTime::default(),
            skipped_total: CounterWithTime::default(),
            rate_limited_total: CounterWithTime::default(),
        }
    }

    /// Adds a single task to `queue`. Never returns an `Err` for
    /// anticipated conditions (uniqueness collision, rate limiting) — see
    /// `AddTaskResult`.
    pub async fn add_task(
        &self,
        queue: &QueueConfig,
        data: serde_json::Value,
        options: AddTaskOptions,
    ) -> Result<AddTaskResult, Error> {
        let max_attempts = options
            .max_attempts
            .or(queue.max_retries.map(|v| v as u32))
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let task = Task::new(queue.name.clone(), data, max_attempts, &options);
        let task_id = task.id;
        self.add_task_total.inc();

        let mut uniqueness_acquired = false;

        if let Some(key) = &options.uniqueness_key {
            let acquired = self
                .store
                .set_uniqueness_key_active(key, task_id, DEFAULT_UNIQUENESS_TTL)
                .await?;
            if !acquired {
                self.skipped_total.inc();
                return Ok(AddTaskResult::skipped());
            }
            uniqueness_acquired = true;
        }

        if let Some(limiter_cfg) = queue.rate_limiter {
            let outcome = self
                .rate_limiter
                .check(
                    &format!("queue:{}", queue.name),
                    RateLimitOptions {
                        max_requests: limiter_cfg.max_requests,
                        window_ms: limiter_cfg.window_ms,
                    },
                )
                .await?;
            if !outcome.allowed {
                self.rate_limited_total.inc();
                if uniqueness_acquired {
                    if let Some(key) = &options.uniqueness_key {
                        self.store.remove_uniqueness_key(key).await?;
                    }
                }
                return Ok(AddTaskResult::failed(None, "rate limit exceeded"));
            }
        }

        self.store.save_task(&task).await?;

        let payload = DeliveryPayload::from(&task);
        let body = serde_json::to_vec(&payload)
            .map_err(|e| Error::new(Code::Internal, format!("failed to encode payload: {e}")))?;
        let url = queue
            .processor_url
            .clone()
            .ok_or_else(|| Error::new(Code::InvalidArgument, format!("queue {} has no processor_url", queue.name)))?;

        if let Err(err) = self
            .dispatcher
            .enqueue_http(
                &queue.path,
                &url,
                &body,
                options.delay,
                queue.service_account_email.as_deref(),
            )
            .await
        {
            event!(
                Level::WARN,
                ?task_id,
                queue_name = %queue.name,
                ?err,
                "dispatcher enqueue failed; task remains persisted for later processing"
            );
        }

        self.events.emit(&TaskEvent::TaskAdded {
            task_id,
            queue_name: queue.name.clone(),
            data: task.data.clone(),
        });
        self.tasks_queued_total.inc();

        Ok(AddTaskResult::success(task_id))
    }

    /// Adds `n` tasks as a linear chain sharing one `chain_id`. Stops and
    /// returns partial results on the first failure; previously enqueued
    /// tasks are not rolled back.
    pub async fn add_chain(
        &self,
        queue: &QueueConfig,
        entries: Vec<(serde_json::Value, AddTaskOptions)>,
        chain_id: Option<String>,
        wait_for_previous: bool,
    ) -> Result<Vec<AddTaskResult>, Error> {
        let chain_id = chain_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let total = entries.len() as u32;
        let mut results = Vec::with_capacity(entries.len());

        for (index, (data, mut options)) in entries.into_iter().enumerate() {
            options.chain = Some(ChainLocation {
                id: chain_id.clone(),
                index: index as u32,
                total,
                wait_for_previous,
            });
            let result = self.add_task(queue, data, options).await?;
            let stop = !result.success && !result.skipped;
            results.push(result);
            if stop {
                break;
            }
        }
        Ok(results)
    }
}

impl MetricsComponent for Producer {
    fn gather_metrics(&self, c: &mut CollectorState) {
        c.publish("add_task_total", &self.add_task_total, "total tasks submitted");
        c.publish(
            "tasks_queued_total",
            &self.tasks_queued_total,
            "total tasks persisted and handed to the dispatcher",
        );
        c.publish(
            "add_task_skipped_total",
            &self.skipped_total,
            "total tasks skipped due to a held uniqueness key",
        );
        c.publish(
            "add_task_rate_limited_total",
            &self.rate_limited_total,
            "total tasks rejected by the queue's rate limiter",
        );
        self.rate_limiter.gather_metrics(c);
    }
}
