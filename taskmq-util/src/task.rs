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

//! The `Task` value object and its pure, in-memory helpers. None of these
//! methods perform I/O — persistence is always a separate `StorageAdapter`
//! call made by the caller.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique task identifier, a random 128-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    #[must_use]
    pub fn new() -> Self {
        TaskId(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The lifecycle stage of a `Task`. See the type-level invariants on `Task`
/// for which transitions are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Active,
    Completed,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Error recorded on a `Task` when it reaches `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    pub timestamp: SystemTime,
}

impl TaskError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        TaskError {
            message: message.into(),
            stack: None,
            timestamp: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Progress reported by a handler while a task is in flight. Overwritten
/// wholesale by each `UpdateProgress` call; never merged field-by-field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub percentage: u8,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl Default for TaskProgress {
    fn default() -> Self {
        TaskProgress {
            percentage: 0,
            data: None,
        }
    }
}

impl TaskProgress {
    #[must_use]
    pub fn new(percentage: u8, data: Option<serde_json::Value>) -> Self {
        TaskProgress {
            percentage: percentage.min(100),
            data,
        }
    }
}

/// Locates a task within a linear, ordered chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainLocation {
    pub id: String,
    pub index: u32,
    pub total: u32,
    /// Whether this step should wait for the previous one to complete
    /// before it runs. The engine records this but does not enforce it;
    /// sequencing a chain's steps is the dispatcher's responsibility.
    #[serde(default)]
    pub wait_for_previous: bool,
}

/// The subset of `AddTaskOptions` that is persisted on the `Task` itself
/// (as opposed to options that are only consumed once, at creation time,
/// such as `delay` or `uniqueness_key`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOptions {
    /// Selector used by `HandlerRegistry` to pick a named handler within a
    /// queue. Corresponds to the wire payload's implicit `taskName`.
    #[serde(default)]
    pub task_name: Option<String>,

    #[serde(default)]
    pub remove_on_complete: bool,

    #[serde(default)]
    pub remove_on_fail: bool,

    #[serde(default)]
    pub priority: Option<i32>,
}

/// Options accepted by `Producer::add_task`.
#[derive(Debug, Clone, Default)]
pub struct AddTaskOptions {
    pub task_name: Option<String>,
    pub uniqueness_key: Option<String>,
    pub delay: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub priority: Option<i32>,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
    /// Set internally by `Producer::add_chain`; callers adding a single
    /// task normally leave this `None`.
    pub chain: Option<ChainLocation>,
}

/// The central entity tracked by a queue, from submission through a
/// terminal `Completed`/`Failed` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub queue_name: String,
    pub task_name: Option<String>,
    pub data: serde_json::Value,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    pub active_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    pub failed_at: Option<SystemTime>,
    pub scheduled_for: Option<SystemTime>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub progress: TaskProgress,
    pub chain: Option<ChainLocation>,
    pub uniqueness_key: Option<String>,
    pub options: TaskOptions,
}

impl Task {
    /// Builds a new `Task` in `Idle` state. This is the only place an
    /// `Idle` task with `attempts == 0` is constructed; everything else
    /// goes through the mutation helpers below.
    #[must_use]
    pub fn new(
        queue_name: String,
        data: serde_json::Value,
        max_attempts: u32,
        options: &AddTaskOptions,
    ) -> Self {
        let now = SystemTime::now();
        Task {
            id: TaskId::new(),
            queue_name,
            task_name: options.task_name.clone(),
            data,
            status: TaskStatus::Idle,
            attempts: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
            active_at: None,
            completed_at: None,
            failed_at: None,
            scheduled_for: options.delay.map(|d| now + d),
            result: None,
            error: None,
            progress: TaskProgress::default(),
            chain: options.chain.clone(),
            uniqueness_key: options.uniqueness_key.clone(),
            options: TaskOptions {
                task_name: options.task_name.clone(),
                remove_on_complete: options.remove_on_complete,
                remove_on_fail: options.remove_on_fail,
                priority: options.priority,
            },
        }
    }

    fn touch(&mut self) {
        self.updated_at = SystemTime::now();
    }

    /// IDLE -> ACTIVE.
    pub fn mark_active(&mut self) {
        let now = SystemTime::now();
        self.status = TaskStatus::Active;
        if self.active_at.is_none() {
            self.active_at = Some(now);
        }
        self.updated_at = now;
    }

    /// ACTIVE -> COMPLETED.
    pub fn mark_completed(&mut self, result: serde_json::Value) {
        let now = SystemTime::now();
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// ACTIVE -> FAILED. Caller is responsible for only calling this once
    /// `attempts == max_attempts`.
    pub fn mark_failed(&mut self, err: TaskError) {
        let now = SystemTime::now();
        self.status = TaskStatus::Failed;
        self.error = Some(err);
        self.failed_at = Some(now);
        self.updated_at = now;
    }

    /// Consumes one delivery attempt. Never exceeds `max_attempts`.
    pub fn increment_attempts(&mut self) {
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.touch();
    }

    pub fn update_progress(&mut self, progress: TaskProgress) {
        self.progress = progress;
        self.touch();
    }

    #[must_use]
    pub fn is_in_chain(&self) -> bool {
        self.chain.is_some()
    }

    #[must_use]
    pub fn is_last_in_chain(&self) -> bool {
        self.chain
            .as_ref()
            .is_some_and(|c| c.index + 1 == c.total)
    }

    /// The index of the next step in this task's chain, or `None` if this
    /// task is not in a chain or is already the last step.
    #[must_use]
    pub fn next_chain_index(&self) -> Option<u32> {
        self.chain.as_ref().and_then(|c| {
            if c.index + 1 < c.total {
                Some(c.index + 1)
            } else {
                None
            }
        })
    }

    #[must_use]
    pub fn should_remove_on_complete(&self) -> bool {
        self.options.remove_on_complete
    }

    #[must_use]
    pub fn should_remove_on_fail(&self) -> bool {
        self.options.remove_on_fail
    }

    /// Wall-clock time between creation and the task reaching a terminal
    /// state, or `None` if it hasn't terminated yet.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        let end = self.completed_at.or(self.failed_at)?;
        end.duration_since(self.created_at).ok()
    }
}

/// The wire payload delivered by the dispatcher to a queue's
/// `processor_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainPayload {
    pub id: String,
    pub index: u32,
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPayload {
    pub task_id: TaskId,
    pub queue_name: String,
    pub data: serde_json::Value,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub chain: Option<ChainPayload>,
    #[serde(default)]
    pub uniqueness_key: Option<String>,
}

impl From<&Task> for DeliveryPayload {
    fn from(task: &Task) -> Self {
        DeliveryPayload {
            task_id: task.id,
            queue_name: task.queue_name.clone(),
            data: task.data.clone(),
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            chain: task.chain.as_ref().map(|c| ChainPayload {
                id: c.id.clone(),
                index: c.index,
                total: c.total,
            }),
            uniqueness_key: task.uniqueness_key.clone(),
        }
    }
}

/// Result handed back to the caller of `Producer::add_task`. Always
/// carries `task_id`, even on failure, so the caller can still reference a
/// locally-persisted task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddTaskResult {
    pub task_id: Option<TaskId>,
    pub success: bool,
    pub skipped: bool,
    pub error: Option<String>,
}

impl AddTaskResult {
    #[must_use]
    pub fn success(task_id: TaskId) -> Self {
        AddTaskResult {
            task_id: Some(task_id),
            success: true,
            skipped: false,
            error: None,
        }
    }

    #[must_use]
    pub fn skipped() -> Self {
        AddTaskResult {
            task_id: None,
            success: false,
            skipped: true,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(task_id: Option<TaskId>, error: impl Into<String>) -> Self {
        AddTaskResult {
            task_id,
            success: false,
            skipped: false,
            error: Some(error.into()),
        }
    }
}
