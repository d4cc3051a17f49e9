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

//! Configuration types for a `taskmq` deployment. Deserialized with
//! `serde_json5` so operators can author config with comments and trailing
//! commas, the same as `nativelink-config`.

use serde::{Deserialize, Serialize};

/// Top level configuration for a `taskmq` engine instance.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TaskMqConfig {
    /// Dispatcher project identifier used when addressing the external
    /// dispatch service.
    #[serde(default)]
    pub project_id: String,

    /// Dispatcher region/location used when addressing the external
    /// dispatch service.
    #[serde(default)]
    pub location: String,

    /// The queues this engine instance produces to and/or consumes from.
    #[serde(default)]
    pub queues: Vec<QueueConfig>,

    /// Selects which `StorageAdapter` implementation backs this engine.
    pub storage_adapter: StorageAdapterConfig,

    /// If set, the producer will attempt to create any queue in `queues`
    /// that does not already exist on the dispatcher at startup.
    #[serde(default)]
    pub auto_create_queues: bool,

    /// Engine-wide rate limit, checked in addition to any per-queue limit.
    #[serde(default)]
    pub global_rate_limiter: Option<RateLimiterConfig>,

    /// Credentials used to authenticate with the dispatcher.
    #[serde(default)]
    pub auth: Option<AuthConfig>,

    /// Fallback delivery callback URL used by queues that don't specify
    /// their own `processor_url`.
    #[serde(default)]
    pub default_processor_url: Option<String>,
}

/// Configuration for a single logical queue.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QueueConfig {
    /// Logical queue identifier; must be unique within a `TaskMqConfig`.
    pub name: String,

    /// Dispatcher queue path (eg. the fully qualified resource name the
    /// dispatcher uses to address this queue).
    pub path: String,

    /// HTTP endpoint the dispatcher delivers tasks to. Falls back to
    /// `default_processor_url` when unset.
    #[serde(default)]
    pub processor_url: Option<String>,

    /// OIDC subject the dispatcher signs delivery requests as.
    #[serde(default)]
    pub service_account_email: Option<String>,

    /// Per-queue ingress limit enforced by the producer.
    #[serde(default)]
    pub rate_limiter: Option<RateLimiterConfig>,

    /// Default `max_attempts` for tasks added to this queue that don't
    /// specify their own.
    ///
    /// Default: 3.
    #[serde(default)]
    pub max_retries: Option<usize>,

    /// Default retry delay, in seconds, passed through to the dispatcher
    /// at queue-creation time.
    #[serde(default)]
    pub retry_delay: Option<f32>,
}

/// A fixed-window rate limit specification.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    /// Maximum number of allowed calls within `window_ms`. A value `<= 0`
    /// denies every call without touching storage.
    pub max_requests: i64,

    /// Width of the fixed window, in milliseconds.
    pub window_ms: u64,
}

/// Dispatcher authentication configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AuthConfig {
    /// Path to a service account key file.
    #[serde(default)]
    pub key_filename: Option<String>,

    /// Inline credentials, mutually exclusive with `key_filename`.
    #[serde(default)]
    pub credentials: Option<String>,
}

/// Selects and configures the `StorageAdapter` implementation.
#[allow(non_camel_case_types)]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum StorageAdapterConfig {
    /// Stores everything in an in-process hashmap. Does not survive
    /// restarts and does not coordinate across processes; suitable for
    /// tests and single-process deployments only.
    memory,

    /// Uses a Redis-compatible server as the key-value backend. Shares
    /// state across every process pointed at the same Redis instance.
    key_value(KeyValueConfig),

    /// Uses a MongoDB-compatible server as the document-store backend.
    document(DocumentConfig),
}

/// Connection parameters for the Redis-backed key-value adapter.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KeyValueConfig {
    /// Redis connection URL, eg. `redis://127.0.0.1:6379/0`.
    pub url: String,

    /// Key prefix applied to every key this adapter writes, so multiple
    /// engines can safely share one Redis instance.
    ///
    /// Default: "" (no prefix).
    #[serde(default)]
    pub key_prefix: String,
}

/// Connection parameters for the MongoDB-backed document adapter.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DocumentConfig {
    /// MongoDB connection URI.
    pub uri: String,

    /// Database name to use for the tasks/uniqueness/rate-limit
    /// collections.
    pub database: String,
}
