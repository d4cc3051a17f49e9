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

//! The orchestration engine: `RateLimiter`, `HandlerRegistry`, `Producer`,
//! `Consumer`, and the `Engine` that wires them together behind a single
//! public API.

pub mod consumer;
pub mod dispatcher;
pub mod engine;
pub mod event_bus;
pub mod handler_registry;
pub mod producer;
pub mod rate_limiter;

pub use consumer::Consumer;
pub use dispatcher::{DispatcherClient, NoopDispatcherClient};
pub use engine::{Engine, EngineBuilder};
pub use event_bus::{EventBus, Unsubscribe};
pub use handler_registry::{Handler, HandlerContext, HandlerRegistry, LifecycleCallbacks, ProgressReporter};
pub use producer::Producer;
pub use rate_limiter::{RateLimitOptions, RateLimitOutcome, RateLimiter};
