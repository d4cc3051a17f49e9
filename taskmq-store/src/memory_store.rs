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

//! The in-process reference `StorageAdapter`. Does not survive restarts
//! and does not coordinate across OS processes; every guarantee it
//! provides comes from a single `Mutex` per map, the same shape as
//! `cas/store/memory_store.rs`'s guarded-`HashMap` store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use taskmq_error::{Code, Error};
use taskmq_util::task::{Task, TaskId, TaskStatus};

use crate::adapter::{CleanupPolicy, RateLimitOutcome, StorageAdapter, TaskFilter, TaskPatch};

struct UniquenessLock {
    task_id: TaskId,
    expires_at: SystemTime,
}

struct RateWindow {
    count: i64,
    reset_time: SystemTime,
}

/// In-memory `StorageAdapter`. Cheap to construct; one instance per test or
/// per single-process deployment.
#[derive(Default)]
pub struct MemoryStore {
    tasks: Mutex<HashMap<TaskId, Task>>,
    uniqueness: Mutex<HashMap<String, UniquenessLock>>,
    rate_limits: Mutex<HashMap<String, RateWindow>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn tasks_lock(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, Task>> {
        self.tasks.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

fn sort_tasks(tasks: &mut [Task], filter: &TaskFilter) {
    let Some(sort) = filter.sort else { return };
    tasks.sort_by(|a, b| {
        use crate::adapter::SortField;
        let ordering = match sort.field {
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            SortField::Priority => a
                .options
                .priority
                .unwrap_or(0)
                .cmp(&b.options.priority.unwrap_or(0)),
        };
        if sort.desc {
            ordering.reverse()
        } else {
            ordering
        }
    });
}

#[async_trait]
impl StorageAdapter for MemoryStore {
    async fn save_task(&self, task: &Task) -> Result<(), Error> {
        self.tasks_lock().insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, Error> {
        Ok(self.tasks_lock().get(&id).cloned())
    }

    async fn update_task_status(
        &self,
        id: TaskId,
        new_status: TaskStatus,
        patch: TaskPatch,
    ) -> Result<(), Error> {
        let mut tasks = self.tasks_lock();
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| Error::new(Code::NotFound, format!("no task with id {id}")))?;
        patch.apply(task, new_status);
        Ok(())
    }

    async fn delete_task(&self, id: TaskId) -> Result<bool, Error> {
        Ok(self.tasks_lock().remove(&id).is_some())
    }

    async fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, Error> {
        let mut matching: Vec<Task> = self
            .tasks_lock()
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        sort_tasks(&mut matching, filter);
        let offset = filter.offset.unwrap_or(0);
        let matching = if offset >= matching.len() {
            Vec::new()
        } else {
            matching.split_off(offset)
        };
        Ok(match filter.limit {
            Some(limit) => matching.into_iter().take(limit).collect(),
            None => matching,
        })
    }

    async fn count_tasks(&self, filter: &TaskFilter) -> Result<u64, Error> {
        Ok(self
            .tasks_lock()
            .values()
            .filter(|task| filter.matches(task))
            .count() as u64)
    }

    async fn is_uniqueness_key_active(&self, key: &str) -> Result<bool, Error> {
        let mut locks = self.uniqueness.lock().unwrap_or_else(|p| p.into_inner());
        let now = SystemTime::now();
        if let Some(lock) = locks.get(key) {
            if lock.expires_at <= now {
                locks.remove(key);
                return Ok(false);
            }
            return Ok(true);
        }
        Ok(false)
    }

    async fn set_uniqueness_key_active(
        &self,
        key: &str,
        task_id: TaskId,
        ttl: Duration,
    ) -> Result<bool, Error> {
        let mut locks = self.uniqueness.lock().unwrap_or_else(|p| p.into_inner());
        let now = SystemTime::now();
        if let Some(existing) = locks.get(key) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }
        locks.insert(
            key.to_string(),
            UniquenessLock {
                task_id,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn remove_uniqueness_key(&self, key: &str) -> Result<(), Error> {
        self.uniqueness
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
        Ok(())
    }

    async fn increment_rate_limit(
        &self,
        key: &str,
        window_ms: u64,
        max_requests: i64,
    ) -> Result<RateLimitOutcome, Error> {
        let mut windows = self.rate_limits.lock().unwrap_or_else(|p| p.into_inner());
        let now = SystemTime::now();
        let window_len = Duration::from_millis(window_ms);

        let needs_reset = windows
            .get(key)
            .map(|w| w.reset_time <= now)
            .unwrap_or(true);
        if needs_reset {
            windows.insert(
                key.to_string(),
                RateWindow {
                    count: 0,
                    reset_time: now + window_len,
                },
            );
        }

        let window = windows.get_mut(key).expect("just inserted or present");
        window.count += 1;
        Ok(RateLimitOutcome {
            allowed: window.count <= max_requests,
            count: window.count,
            reset_time: window.reset_time,
        })
    }

    async fn delete_rate_limit(&self, key: &str) -> Result<(), Error> {
        self.rate_limits
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
        Ok(())
    }

    async fn get_rate_limit_status(&self, key: &str) -> Result<Option<RateLimitOutcome>, Error> {
        let mut windows = self.rate_limits.lock().unwrap_or_else(|p| p.into_inner());
        let now = SystemTime::now();
        match windows.get(key) {
            Some(window) if window.reset_time > now => Ok(Some(RateLimitOutcome {
                allowed: true,
                count: window.count,
                reset_time: window.reset_time,
            })),
            Some(_) => {
                windows.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn has_active_task_in_chain(&self, chain_id: &str) -> Result<bool, Error> {
        Ok(self.tasks_lock().values().any(|task| {
            task.chain.as_ref().is_some_and(|c| c.id == chain_id) && task.status == TaskStatus::Active
        }))
    }

    async fn get_chain_tasks(&self, chain_id: &str) -> Result<Vec<Task>, Error> {
        let mut tasks: Vec<Task> = self
            .tasks_lock()
            .values()
            .filter(|task| task.chain.as_ref().is_some_and(|c| c.id == chain_id))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.chain.as_ref().map(|c| c.index).unwrap_or(0));
        Ok(tasks)
    }

    async fn get_next_task_in_chain(
        &self,
        chain_id: &str,
        idx: u32,
    ) -> Result<Option<Task>, Error> {
        Ok(self
            .tasks_lock()
            .values()
            .find(|task| {
                task.chain
                    .as_ref()
                    .is_some_and(|c| c.id == chain_id && c.index == idx)
            })
            .cloned())
    }

    async fn cleanup(&self, policy: &CleanupPolicy) -> Result<u64, Error> {
        let now = SystemTime::now();
        let mut tasks = self.tasks_lock();
        let before = tasks.len();
        tasks.retain(|_, task| !policy.matches(task, now));
        Ok((before - tasks.len()) as u64)
    }
}
