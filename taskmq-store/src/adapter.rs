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

//! The `StorageAdapter` contract. Every adapter (`memory_store`,
//! `redis_store`, `mongo_store`) is a synchronization boundary: operations
//! must behave atomically with respect to concurrent callers across
//! multiple processes sharing the same backing store.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use taskmq_error::Error;
use taskmq_util::task::{Task, TaskError, TaskId, TaskProgress, TaskStatus};

/// Selects which field a `QueryTasks` sort orders by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    CreatedAt,
    UpdatedAt,
    Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortSpec {
    pub field: SortField,
    pub desc: bool,
}

/// Filter used by `query_tasks`/`count_tasks`. Fields left `None`/empty are
/// unconstrained.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub statuses: Vec<TaskStatus>,
    pub queue_name: Option<String>,
    pub chain_id: Option<String>,
    pub uniqueness_key: Option<String>,
    pub date_range: Option<(SystemTime, SystemTime)>,
    pub sort: Option<SortSpec>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl TaskFilter {
    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        if let Some(queue_name) = &self.queue_name {
            if &task.queue_name != queue_name {
                return false;
            }
        }
        if let Some(chain_id) = &self.chain_id {
            match &task.chain {
                Some(chain) if &chain.id == chain_id => {}
                _ => return false,
            }
        }
        if let Some(key) = &self.uniqueness_key {
            if task.uniqueness_key.as_deref() != Some(key.as_str()) {
                return false;
            }
        }
        if let Some((start, end)) = self.date_range {
            if task.created_at < start || task.created_at > end {
                return false;
            }
        }
        true
    }
}

/// Fields that may be merged onto an existing `Task` by
/// `update_task_status`. `updated_at` is always stamped by the adapter and
/// is not part of the patch.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub attempts: Option<u32>,
    pub active_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    pub failed_at: Option<SystemTime>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub progress: Option<TaskProgress>,
}

impl TaskPatch {
    /// Applies this patch over `task`, always stamping `updated_at`.
    pub fn apply(&self, task: &mut Task, new_status: TaskStatus) {
        task.status = new_status;
        if let Some(attempts) = self.attempts {
            task.attempts = attempts;
        }
        if self.active_at.is_some() {
            task.active_at = self.active_at;
        }
        if self.completed_at.is_some() {
            task.completed_at = self.completed_at;
        }
        if self.failed_at.is_some() {
            task.failed_at = self.failed_at;
        }
        if let Some(result) = self.result.clone() {
            task.result = Some(result);
        }
        if let Some(error) = self.error.clone() {
            task.error = Some(error);
        }
        if let Some(progress) = self.progress.clone() {
            task.progress = progress;
        }
        task.updated_at = SystemTime::now();
    }
}

/// Bulk-delete criteria for `cleanup`. A task is deleted iff any enabled
/// clause matches AND the age gate (if set) is satisfied. If no clause is
/// enabled but `older_than` is set, any task older than `older_than` is
/// deleted.
#[derive(Debug, Clone, Default)]
pub struct CleanupPolicy {
    pub older_than: Option<Duration>,
    pub statuses: Vec<TaskStatus>,
    pub remove_completed: bool,
    pub remove_failed: bool,
}

impl CleanupPolicy {
    #[must_use]
    pub fn matches(&self, task: &Task, now: SystemTime) -> bool {
        let age_ok = match self.older_than {
            Some(age) => now
                .duration_since(task.created_at)
                .map(|elapsed| elapsed >= age)
                .unwrap_or(false),
            None => true,
        };
        if !age_ok {
            return false;
        }
        let has_clause =
            !self.statuses.is_empty() || self.remove_completed || self.remove_failed;
        if !has_clause {
            return self.older_than.is_some();
        }
        (!self.statuses.is_empty() && self.statuses.contains(&task.status))
            || (self.remove_completed && task.status == TaskStatus::Completed)
            || (self.remove_failed && task.status == TaskStatus::Failed)
    }
}

/// The outcome of an atomic `increment_rate_limit` call. `count` reflects
/// the counter value AFTER the increment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub count: i64,
    pub reset_time: SystemTime,
}

/// The synchronization boundary every `taskmq` backend implements.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn save_task(&self, task: &Task) -> Result<(), Error>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, Error>;

    async fn update_task_status(
        &self,
        id: TaskId,
        new_status: TaskStatus,
        patch: TaskPatch,
    ) -> Result<(), Error>;

    async fn delete_task(&self, id: TaskId) -> Result<bool, Error>;

    async fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, Error>;

    async fn count_tasks(&self, filter: &TaskFilter) -> Result<u64, Error>;

    async fn is_uniqueness_key_active(&self, key: &str) -> Result<bool, Error>;

    /// Atomic test-and-set. Returns `false` if another live lock exists.
    async fn set_uniqueness_key_active(
        &self,
        key: &str,
        task_id: TaskId,
        ttl: Duration,
    ) -> Result<bool, Error>;

    async fn remove_uniqueness_key(&self, key: &str) -> Result<(), Error>;

    /// Atomic fixed-window increment. `reset_time` must not move once the
    /// window has been opened by the first increment in that window.
    async fn increment_rate_limit(
        &self,
        key: &str,
        window_ms: u64,
        max_requests: i64,
    ) -> Result<RateLimitOutcome, Error>;

    async fn delete_rate_limit(&self, key: &str) -> Result<(), Error>;

    /// Reads the current window without incrementing it. Returns `None` if
    /// no live window exists for `key`.
    async fn get_rate_limit_status(&self, key: &str) -> Result<Option<RateLimitOutcome>, Error>;

    async fn has_active_task_in_chain(&self, chain_id: &str) -> Result<bool, Error>;

    async fn get_chain_tasks(&self, chain_id: &str) -> Result<Vec<Task>, Error>;

    async fn get_next_task_in_chain(
        &self,
        chain_id: &str,
        idx: u32,
    ) -> Result<Option<Task>, Error>;

    async fn cleanup(&self, policy: &CleanupPolicy) -> Result<u64, Error>;
}
