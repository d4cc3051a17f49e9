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

//! The `StorageAdapter` contract and its three implementations: an
//! in-process reference adapter, a Redis-backed key-value adapter, and a
//! MongoDB-backed document adapter.

pub mod adapter;
pub mod memory_store;
pub mod mongo_store;
pub mod redis_store;

pub use adapter::{
    CleanupPolicy, RateLimitOutcome, SortField, SortSpec, StorageAdapter, TaskFilter, TaskPatch,
};
pub use memory_store::MemoryStore;
pub use mongo_store::MongoStore;
pub use redis_store::RedisStore;
