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

//! Shared value types and runtime glue used by every other `taskmq` crate:
//! the `Task` model, lifecycle events, metrics primitives, and a couple of
//! small runtime helpers (`spawn!`, tracing bootstrap).

pub mod events;
pub mod metrics;
pub mod spawn;
pub mod task;
pub mod tracing_init;

pub use events::{EventKind, TaskEvent};
pub use task::{
    AddTaskOptions, AddTaskResult, ChainLocation, ChainPayload, DeliveryPayload, Task, TaskError,
    TaskId, TaskOptions, TaskProgress, TaskStatus,
};
pub use tracing_init::init_tracing;
