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

//! A Redis-backed `StorageAdapter`. Shares state across every process
//! pointed at the same instance, at the cost of the query flexibility a
//! document store gets for free: `query_tasks`/`count_tasks`/`cleanup`
//! linearly scan the task keyspace since a key-value store has no
//! secondary index to lean on.

use std::marker::Unpin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionLike;
use redis::{AsyncCommands, ExistenceCheck, SetExpiry, SetOptions};
use taskmq_error::{Code, Error, ResultExt};
use taskmq_util::task::{Task, TaskId, TaskStatus};
use tokio::sync::Mutex;

use crate::adapter::{CleanupPolicy, RateLimitOutcome, StorageAdapter, TaskFilter, TaskPatch};

/// Atomically opens a new fixed window (resetting `count`) iff the stored
/// `reset_time` has elapsed, then increments `count` and re-arms the key's
/// TTL to the window boundary. Returning `{count, reset_time}` lets the
/// caller compute `allowed` without a second round trip.
const RATE_LIMIT_SCRIPT: &str = r"
local key = KEYS[1]
local window_ms = tonumber(ARGV[1])
local now_ms = tonumber(ARGV[2])
local reset_time = redis.call('HGET', key, 'reset_time')
if (not reset_time) or tonumber(reset_time) <= now_ms then
  reset_time = now_ms + window_ms
  redis.call('HSET', key, 'reset_time', reset_time)
  redis.call('HSET', key, 'count', 0)
end
local count = redis.call('HINCRBY', key, 'count', 1)
redis.call('PEXPIREAT', key, math.floor(tonumber(reset_time)))
return {count, reset_time}
";

fn millis_since_epoch(t: SystemTime) -> Result<u64, Error> {
    Ok(t.duration_since(UNIX_EPOCH)
        .map_err(|e| Error::new(Code::Internal, e.to_string()))?
        .as_millis() as u64)
}

fn from_millis_since_epoch(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

/// A Redis-backed `StorageAdapter`. `C` is generic so tests can swap in
/// `redis_test::MockRedisConnection`; production callers use
/// `redis::aio::ConnectionManager`.
pub struct RedisStore<C: ConnectionLike + Clone + Send + Sync + Unpin + 'static> {
    conn: Arc<Mutex<C>>,
    key_prefix: String,
}

impl<C: ConnectionLike + Clone + Send + Sync + Unpin + 'static> RedisStore<C> {
    #[must_use]
    pub fn new(conn: C, key_prefix: impl Into<String>) -> Self {
        RedisStore {
            conn: Arc::new(Mutex::new(conn)),
            key_prefix: key_prefix.into(),
        }
    }

    fn task_key(&self, id: TaskId) -> String {
        format!("{}task:{}", self.key_prefix, id)
    }

    fn uniq_key(&self, key: &str) -> String {
        format!("{}uniq:{}", self.key_prefix, key)
    }

    fn rate_key(&self, key: &str) -> String {
        format!("{}rate:{}", self.key_prefix, key)
    }

    fn chain_key(&self, chain_id: &str) -> String {
        format!("{}chain:{}", self.key_prefix, chain_id)
    }

    fn task_index_pattern(&self) -> String {
        format!("{}task:*", self.key_prefix)
    }

    async fn write_task(&self, task: &Task) -> Result<(), Error> {
        let encoded = serde_json::to_string(task)
            .map_err(|e| Error::new(Code::Internal, format!("failed to encode task: {e}")))?;
        let mut conn = self.conn.lock().await;
        let mut pipe = redis::pipe();
        pipe.atomic().set(self.task_key(task.id), &encoded);
        if let Some(chain) = &task.chain {
            pipe.hset(self.chain_key(&chain.id), chain.index, task.id.to_string());
        }
        pipe.query_async::<_, ()>(&mut *conn)
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))
            .err_tip(|| "while writing task to redis")
    }

    async fn read_task(&self, id: TaskId) -> Result<Option<Task>, Error> {
        let mut conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .get(self.task_key(id))
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        let Some(raw) = raw else { return Ok(None) };
        let task = serde_json::from_str(&raw)
            .map_err(|e| Error::new(Code::Internal, format!("failed to decode task: {e}")))?;
        Ok(Some(task))
    }

    async fn scan_all_tasks(&self) -> Result<Vec<Task>, Error> {
        let pattern = self.task_index_pattern();
        let mut conn = self.conn.lock().await;
        let mut keys: Vec<String> = Vec::new();
        let mut iter = conn
            .scan_match::<_, String>(pattern)
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        while let Some(key) = iter.next().await {
            keys.push(key);
        }
        drop(iter);
        let mut tasks = Vec::with_capacity(keys.len());
        for key in keys {
            let raw: Option<String> = conn
                .get(&key)
                .await
                .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
            if let Some(raw) = raw {
                if let Ok(task) = serde_json::from_str::<Task>(&raw) {
                    tasks.push(task);
                }
            }
        }
        Ok(tasks)
    }
}

#[async_trait]
impl<C: ConnectionLike + Clone + Send + Sync + Unpin + 'static> StorageAdapter for RedisStore<C> {
    async fn save_task(&self, task: &Task) -> Result<(), Error> {
        self.write_task(task).await
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, Error> {
        self.read_task(id).await
    }

    async fn update_task_status(
        &self,
        id: TaskId,
        new_status: TaskStatus,
        patch: TaskPatch,
    ) -> Result<(), Error> {
        let mut task = self
            .read_task(id)
            .await?
            .ok_or_else(|| Error::new(Code::NotFound, format!("no task with id {id}")))?;
        patch.apply(&mut task, new_status);
        self.write_task(&task).await
    }

    async fn delete_task(&self, id: TaskId) -> Result<bool, Error> {
        let mut conn = self.conn.lock().await;
        let removed: i64 = conn
            .del(self.task_key(id))
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        Ok(removed > 0)
    }

    async fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, Error> {
        let mut tasks: Vec<Task> = self
            .scan_all_tasks()
            .await?
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect();
        if let Some(sort) = filter.sort {
            use crate::adapter::SortField;
            tasks.sort_by(|a, b| {
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
        let offset = filter.offset.unwrap_or(0);
        let tasks = if offset >= tasks.len() {
            Vec::new()
        } else {
            tasks.split_off(offset)
        };
        Ok(match filter.limit {
            Some(limit) => tasks.into_iter().take(limit).collect(),
            None => tasks,
        })
    }

    async fn count_tasks(&self, filter: &TaskFilter) -> Result<u64, Error> {
        Ok(self
            .scan_all_tasks()
            .await?
            .iter()
            .filter(|t| filter.matches(t))
            .count() as u64)
    }

    async fn is_uniqueness_key_active(&self, key: &str) -> Result<bool, Error> {
        let mut conn = self.conn.lock().await;
        let exists: bool = conn
            .exists(self.uniq_key(key))
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        Ok(exists)
    }

    async fn set_uniqueness_key_active(
        &self,
        key: &str,
        task_id: TaskId,
        ttl: Duration,
    ) -> Result<bool, Error> {
        let mut conn = self.conn.lock().await;
        let options = SetOptions::default()
            .conditional_set(ExistenceCheck::NX)
            .with_expiration(SetExpiry::PX(ttl.as_millis() as usize));
        let result: Option<String> = conn
            .set_options(self.uniq_key(key), task_id.to_string(), options)
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        Ok(result.is_some())
    }

    async fn remove_uniqueness_key(&self, key: &str) -> Result<(), Error> {
        let mut conn = self.conn.lock().await;
        let _: i64 = conn
            .del(self.uniq_key(key))
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        Ok(())
    }

    async fn increment_rate_limit(
        &self,
        key: &str,
        window_ms: u64,
        max_requests: i64,
    ) -> Result<RateLimitOutcome, Error> {
        let now_ms = millis_since_epoch(SystemTime::now())?;
        let mut conn = self.conn.lock().await;
        let script = redis::Script::new(RATE_LIMIT_SCRIPT);
        let (count, reset_time_ms): (i64, u64) = script
            .key(self.rate_key(key))
            .arg(window_ms)
            .arg(now_ms)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))
            .err_tip(|| "while evaluating rate limit script")?;
        Ok(RateLimitOutcome {
            allowed: count <= max_requests,
            count,
            reset_time: from_millis_since_epoch(reset_time_ms),
        })
    }

    async fn delete_rate_limit(&self, key: &str) -> Result<(), Error> {
        let mut conn = self.conn.lock().await;
        let _: i64 = conn
            .del(self.rate_key(key))
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        Ok(())
    }

    async fn get_rate_limit_status(&self, key: &str) -> Result<Option<RateLimitOutcome>, Error> {
        let mut conn = self.conn.lock().await;
        let count: Option<i64> = conn
            .hget(self.rate_key(key), "count")
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        let reset_time_ms: Option<u64> = conn
            .hget(self.rate_key(key), "reset_time")
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        let (Some(count), Some(reset_time_ms)) = (count, reset_time_ms) else {
            return Ok(None);
        };
        let reset_time = from_millis_since_epoch(reset_time_ms);
        if reset_time <= SystemTime::now() {
            return Ok(None);
        }
        Ok(Some(RateLimitOutcome {
            allowed: true,
            count,
            reset_time,
        }))
    }

    async fn has_active_task_in_chain(&self, chain_id: &str) -> Result<bool, Error> {
        let tasks = self.get_chain_tasks(chain_id).await?;
        Ok(tasks.iter().any(|t| t.status == TaskStatus::Active))
    }

    async fn get_chain_tasks(&self, chain_id: &str) -> Result<Vec<Task>, Error> {
        let ids: std::collections::HashMap<u32, String> = {
            let mut conn = self.conn.lock().await;
            conn.hgetall(self.chain_key(chain_id))
                .await
                .map_err(|e| Error::new(Code::Backend, e.to_string()))?
        };
        let mut indices: Vec<u32> = ids.keys().copied().collect();
        indices.sort_unstable();
        let mut tasks = Vec::with_capacity(indices.len());
        for index in indices {
            let raw_id = &ids[&index];
            if let Ok(uuid) = uuid::Uuid::parse_str(raw_id) {
                if let Some(task) = self.read_task(TaskId(uuid)).await? {
                    tasks.push(task);
                }
            }
        }
        Ok(tasks)
    }

    async fn get_next_task_in_chain(
        &self,
        chain_id: &str,
        idx: u32,
    ) -> Result<Option<Task>, Error> {
        let raw_id: Option<String> = {
            let mut conn = self.conn.lock().await;
            conn.hget(self.chain_key(chain_id), idx)
                .await
                .map_err(|e| Error::new(Code::Backend, e.to_string()))?
        };
        let Some(raw_id) = raw_id else { return Ok(None) };
        let uuid = uuid::Uuid::parse_str(&raw_id)
            .map_err(|e| Error::new(Code::Internal, format!("corrupt chain index entry: {e}")))?;
        self.read_task(TaskId(uuid)).await
    }

    async fn cleanup(&self, policy: &CleanupPolicy) -> Result<u64, Error> {
        let now = SystemTime::now();
        let tasks = self.scan_all_tasks().await?;
        let mut removed = 0u64;
        let mut conn = self.conn.lock().await;
        for task in tasks {
            if policy.matches(&task, now) {
                let _: i64 = conn
                    .del(format!("{}task:{}", self.key_prefix, task.id))
                    .await
                    .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
