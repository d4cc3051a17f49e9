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

use std::time::{Duration, SystemTime};

use taskmq_error::Code;
use taskmq_store::{CleanupPolicy, MemoryStore, StorageAdapter, TaskFilter, TaskPatch};
use taskmq_util::task::{AddTaskOptions, ChainLocation, Task, TaskId, TaskStatus};

fn new_task(queue: &str) -> Task {
    Task::new(
        queue.to_string(),
        serde_json::json!({}),
        3,
        &AddTaskOptions::default(),
    )
}

#[tokio::test]
async fn save_and_get_round_trip() {
    let store = MemoryStore::new();
    let task = new_task("q");
    store.save_task(&task).await.unwrap();
    let fetched = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(fetched.id, task.id);
}

#[tokio::test]
async fn get_missing_task_returns_none() {
    let store = MemoryStore::new();
    assert!(store.get_task(TaskId::new()).await.unwrap().is_none());
}

#[tokio::test]
async fn update_task_status_merges_patch() {
    let store = MemoryStore::new();
    let task = new_task("q");
    store.save_task(&task).await.unwrap();
    store
        .update_task_status(
            task.id,
            TaskStatus::Completed,
            TaskPatch {
                result: Some(serde_json::json!({"ok": true})),
                completed_at: Some(SystemTime::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let fetched = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Completed);
    assert!(fetched.result.is_some());
}

#[tokio::test]
async fn update_missing_task_returns_not_found() {
    let store = MemoryStore::new();
    let err = store
        .update_task_status(TaskId::new(), TaskStatus::Completed, TaskPatch::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::NotFound);
}

#[tokio::test]
async fn uniqueness_lock_denies_second_holder_until_expiry() {
    let store = MemoryStore::new();
    let task_id = TaskId::new();
    assert!(store
        .set_uniqueness_key_active("email:a@b.com", task_id, Duration::from_secs(60))
        .await
        .unwrap());
    assert!(!store
        .set_uniqueness_key_active("email:a@b.com", TaskId::new(), Duration::from_secs(60))
        .await
        .unwrap());
    store.remove_uniqueness_key("email:a@b.com").await.unwrap();
    assert!(store
        .set_uniqueness_key_active("email:a@b.com", TaskId::new(), Duration::from_secs(60))
        .await
        .unwrap());
}

#[tokio::test]
async fn rate_limit_allows_up_to_max_then_denies() {
    let store = MemoryStore::new();
    for _ in 0..3 {
        let outcome = store.increment_rate_limit("queue:a", 60_000, 3).await.unwrap();
        assert!(outcome.allowed);
    }
    let outcome = store.increment_rate_limit("queue:a", 60_000, 3).await.unwrap();
    assert!(!outcome.allowed);
    assert_eq!(outcome.count, 4);
}

#[tokio::test]
async fn rate_limit_reset_time_fixed_across_window() {
    let store = MemoryStore::new();
    let first = store.increment_rate_limit("queue:b", 60_000, 5).await.unwrap();
    let second = store.increment_rate_limit("queue:b", 60_000, 5).await.unwrap();
    assert_eq!(first.reset_time, second.reset_time);
}

#[tokio::test]
async fn rate_limit_status_is_absent_until_first_increment() {
    let store = MemoryStore::new();
    assert!(store.get_rate_limit_status("queue:c").await.unwrap().is_none());
    store.increment_rate_limit("queue:c", 60_000, 5).await.unwrap();
    let status = store.get_rate_limit_status("queue:c").await.unwrap().unwrap();
    assert_eq!(status.count, 1);
}

#[tokio::test]
async fn chain_queries_sort_by_index() {
    let store = MemoryStore::new();
    for idx in [2u32, 0, 1] {
        let mut options = AddTaskOptions::default();
        options.chain = Some(ChainLocation {
            id: "c1".to_string(),
            index: idx,
            total: 3,
            wait_for_previous: false,
        });
        let task = Task::new("q".to_string(), serde_json::json!({}), 3, &options);
        store.save_task(&task).await.unwrap();
    }
    let chain = store.get_chain_tasks("c1").await.unwrap();
    let indices: Vec<u32> = chain
        .iter()
        .map(|t| t.chain.as_ref().unwrap().index)
        .collect();
    assert_eq!(indices, vec![0, 1, 2]);
}

#[tokio::test]
async fn has_active_task_in_chain_reflects_status() {
    let store = MemoryStore::new();
    let mut options = AddTaskOptions::default();
    options.chain = Some(ChainLocation {
        id: "c2".to_string(),
        index: 0,
        total: 1,
        wait_for_previous: false,
    });
    let mut task = Task::new("q".to_string(), serde_json::json!({}), 3, &options);
    store.save_task(&task).await.unwrap();
    assert!(!store.has_active_task_in_chain("c2").await.unwrap());
    task.mark_active();
    store.save_task(&task).await.unwrap();
    assert!(store.has_active_task_in_chain("c2").await.unwrap());
}

#[tokio::test]
async fn cleanup_removes_only_matching_tasks() {
    let store = MemoryStore::new();
    let mut completed = new_task("q");
    completed.mark_active();
    completed.mark_completed(serde_json::json!({}));
    store.save_task(&completed).await.unwrap();
    let idle = new_task("q");
    store.save_task(&idle).await.unwrap();

    let removed = store
        .cleanup(&CleanupPolicy {
            older_than: None,
            statuses: vec![],
            remove_completed: true,
            remove_failed: false,
        })
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(store.get_task(idle.id).await.unwrap().is_some());
    assert!(store.get_task(completed.id).await.unwrap().is_none());
}

#[tokio::test]
async fn query_respects_limit_and_offset() {
    let store = MemoryStore::new();
    for _ in 0..5 {
        store.save_task(&new_task("q")).await.unwrap();
    }
    let page = store
        .query_tasks(&TaskFilter {
            limit: Some(2),
            offset: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.len(), 2);
}
