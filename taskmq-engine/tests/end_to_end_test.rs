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

//! End-to-end scenarios driving `Engine` through `Producer` and
//! `Consumer` together, the same shape as spec scenarios 4-6.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use taskmq_config::{QueueConfig, RateLimiterConfig, StorageAdapterConfig, TaskMqConfig};
use taskmq_engine::dispatcher::NoopDispatcherClient;
use taskmq_engine::handler_registry::{Handler, HandlerContext};
use taskmq_engine::{Engine, EngineBuilder};
use taskmq_error::Error;
use taskmq_store::{StorageAdapter, TaskFilter};
use taskmq_util::task::{AddTaskOptions, DeliveryPayload, TaskStatus};

struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<serde_json::Value, Error> {
        Ok(ctx.task.data.clone())
    }
}

fn queue(name: &str, rate_limiter: Option<RateLimiterConfig>) -> QueueConfig {
    QueueConfig {
        name: name.to_string(),
        path: format!("projects/p/queues/{name}"),
        processor_url: Some("https://example.com/process".to_string()),
        service_account_email: None,
        rate_limiter,
        max_retries: None,
        retry_delay: None,
    }
}

fn build_engine(queues: Vec<QueueConfig>) -> Engine {
    EngineBuilder::new(
        TaskMqConfig {
            project_id: "p".to_string(),
            location: "us".to_string(),
            queues,
            storage_adapter: StorageAdapterConfig::memory,
            auto_create_queues: false,
            global_rate_limiter: None,
            auth: None,
            default_processor_url: None,
        },
        Arc::new(NoopDispatcherClient),
    )
    .register("q", None, Arc::new(EchoHandler))
    .build()
    .unwrap()
}

#[tokio::test]
async fn scenario_rate_limit_denies_then_resets_after_window() {
    let engine = build_engine(vec![queue(
        "q",
        Some(RateLimiterConfig {
            max_requests: 3,
            window_ms: 150,
        }),
    )]);

    for _ in 0..3 {
        let result = engine
            .add_task("q", serde_json::json!({}), AddTaskOptions::default())
            .await
            .unwrap();
        assert!(result.success);
    }
    for _ in 0..2 {
        let result = engine
            .add_task("q", serde_json::json!({}), AddTaskOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("rate limit"));
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    let result = engine
        .add_task("q", serde_json::json!({}), AddTaskOptions::default())
        .await
        .unwrap();
    assert!(result.success);
}

#[tokio::test]
async fn scenario_chain_completes_all_steps() {
    let engine = build_engine(vec![queue("q", None)]);

    let entries = vec![
        (serde_json::json!({"step": 0}), AddTaskOptions::default()),
        (serde_json::json!({"step": 1}), AddTaskOptions::default()),
        (serde_json::json!({"step": 2}), AddTaskOptions::default()),
    ];
    let results = engine
        .add_chain("q", entries, None, false)
        .await
        .unwrap();
    assert_eq!(results.len(), 3);

    let chain_id = {
        let task = engine
            .store()
            .get_task(results[0].task_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        task.chain.unwrap().id
    };

    for result in &results {
        let task = engine
            .store()
            .get_task(result.task_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        let payload = DeliveryPayload::from(&task);
        engine.process_delivery(&payload).await.unwrap();
    }

    let completed = engine
        .store()
        .count_tasks(&TaskFilter {
            chain_id: Some(chain_id),
            statuses: vec![TaskStatus::Completed],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(completed, 3);
}

#[tokio::test]
async fn scenario_uniqueness_allows_new_task_after_remove_on_complete() {
    let engine = build_engine(vec![queue("q", None)]);

    let mut options = AddTaskOptions::default();
    options.uniqueness_key = Some("k".to_string());
    options.remove_on_complete = true;

    let first = engine
        .add_task("q", serde_json::json!({}), options.clone())
        .await
        .unwrap();
    assert!(first.success);

    let second = engine
        .add_task("q", serde_json::json!({}), options.clone())
        .await
        .unwrap();
    assert!(second.skipped);

    let task = engine
        .store()
        .get_task(first.task_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    let payload = DeliveryPayload::from(&task);
    engine.process_delivery(&payload).await.unwrap();
    assert!(engine.store().get_task(task.id).await.unwrap().is_none());

    let third = engine
        .add_task("q", serde_json::json!({}), options)
        .await
        .unwrap();
    assert!(third.success);
    assert_ne!(third.task_id, first.task_id);
}
