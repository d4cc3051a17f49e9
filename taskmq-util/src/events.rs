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

//! Lifecycle events emitted by the engine. Re-expresses the source's
//! inherited event-emitter as a plain enum delivered through an explicit
//! `Subscribe` API (`taskmq-engine::engine`) instead of a global emitter.

use std::time::Duration;

use crate::task::{TaskId, TaskProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TaskAdded,
    TaskCompleted,
    TaskFailed,
    TaskProgress,
}

#[derive(Debug, Clone)]
pub enum TaskEvent {
    TaskAdded {
        task_id: TaskId,
        queue_name: String,
        data: serde_json::Value,
    },
    TaskCompleted {
        task_id: TaskId,
        queue_name: String,
        duration: Duration,
    },
    TaskFailed {
        task_id: TaskId,
        queue_name: String,
        attempts: u32,
        max_attempts: u32,
        is_final_attempt: bool,
    },
    TaskProgress {
        task_id: TaskId,
        queue_name: String,
        progress: TaskProgress,
    },
}

impl TaskEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            TaskEvent::TaskAdded { .. } => EventKind::TaskAdded,
            TaskEvent::TaskCompleted { .. } => EventKind::TaskCompleted,
            TaskEvent::TaskFailed { .. } => EventKind::TaskFailed,
            TaskEvent::TaskProgress { .. } => EventKind::TaskProgress,
        }
    }

    #[must_use]
    pub fn queue_name(&self) -> &str {
        match self {
            TaskEvent::TaskAdded { queue_name, .. }
            | TaskEvent::TaskCompleted { queue_name, .. }
            | TaskEvent::TaskFailed { queue_name, .. }
            | TaskEvent::TaskProgress { queue_name, .. } => queue_name,
        }
    }
}
