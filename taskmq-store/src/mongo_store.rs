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

//! A MongoDB-backed `StorageAdapter`. Unlike the key-value adapter, this
//! one gets real server-side filtering and atomic upserts for rate limits
//! and uniqueness keys, at the cost of a heavier driver dependency.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bson::{doc, Bson, DateTime as BsonDateTime};
use futures::TryStreamExt;
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, ReturnDocument};
use mongodb::{Client, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use taskmq_error::{Code, Error, ResultExt};
use taskmq_util::task::{Task, TaskId, TaskStatus};

use crate::adapter::{CleanupPolicy, RateLimitOutcome, SortField, StorageAdapter, TaskFilter, TaskPatch};

fn to_bson_time(t: SystemTime) -> BsonDateTime {
    BsonDateTime::from(t)
}

pub fn status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Idle => "idle",
        TaskStatus::Active => "active",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UniquenessDoc {
    #[serde(rename = "_id")]
    key: String,
    task_id: String,
    expires_at: BsonDateTime,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitDoc {
    #[serde(rename = "_id")]
    key: String,
    count: i64,
    reset_time: BsonDateTime,
}

/// A MongoDB-backed `StorageAdapter`. One `Collection` per concern, all
/// sharing a single logical `Database`.
pub struct MongoStore {
    tasks: Collection<Task>,
    uniqueness: Collection<UniquenessDoc>,
    rate_limits: Collection<RateLimitDoc>,
}

impl MongoStore {
    /// Connects to `uri` and selects `database`. Does not create indexes;
    /// call `ensure_indexes` once at startup.
    pub async fn connect(uri: &str, database: &str) -> Result<Self, Error> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))
            .err_tip(|| "while connecting to mongodb")?;
        Ok(Self::from_database(client.database(database)))
    }

    #[must_use]
    pub fn from_database(db: Database) -> Self {
        MongoStore {
            tasks: db.collection("tasks"),
            uniqueness: db.collection("uniqueness_locks"),
            rate_limits: db.collection("rate_limits"),
        }
    }

    /// Creates the indexes this adapter relies on for fast lookups and TTL
    /// expiry of locks/rate windows. Safe to call repeatedly.
    pub async fn ensure_indexes(&self) -> Result<(), Error> {
        self.tasks
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "queueName": 1, "status": 1 })
                    .build(),
            )
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        self.tasks
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "chain.id": 1, "chain.index": 1 })
                    .build(),
            )
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        self.uniqueness
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "expiresAt": 1 })
                    .options(
                        mongodb::options::IndexOptions::builder()
                            .expire_after(Duration::from_secs(0))
                            .build(),
                    )
                    .build(),
            )
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        Ok(())
    }

    pub fn filter_to_bson(filter: &TaskFilter) -> bson::Document {
        let mut query = doc! {};
        if !filter.statuses.is_empty() {
            let statuses: Vec<Bson> = filter
                .statuses
                .iter()
                .map(|s| Bson::String(status_str(*s).to_string()))
                .collect();
            query.insert("status", doc! { "$in": statuses });
        }
        if let Some(queue_name) = &filter.queue_name {
            query.insert("queueName", queue_name);
        }
        if let Some(chain_id) = &filter.chain_id {
            query.insert("chain.id", chain_id);
        }
        if let Some(key) = &filter.uniqueness_key {
            query.insert("uniquenessKey", key);
        }
        if let Some((start, end)) = filter.date_range {
            query.insert(
                "createdAt",
                doc! { "$gte": to_bson_time(start), "$lte": to_bson_time(end) },
            );
        }
        query
    }

    fn sort_field_name(field: SortField) -> &'static str {
        match field {
            SortField::CreatedAt => "createdAt",
            SortField::UpdatedAt => "updatedAt",
            SortField::Priority => "options.priority",
        }
    }
}

#[async_trait]
impl StorageAdapter for MongoStore {
    async fn save_task(&self, task: &Task) -> Result<(), Error> {
        self.tasks
            .replace_one(doc! { "id": task.id.0.to_string() }, task)
            .upsert(true)
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))
            .err_tip(|| "while upserting task")?;
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, Error> {
        self.tasks
            .find_one(doc! { "id": id.0.to_string() })
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))
    }

    async fn update_task_status(
        &self,
        id: TaskId,
        new_status: TaskStatus,
        patch: TaskPatch,
    ) -> Result<(), Error> {
        let mut task = self
            .get_task(id)
            .await?
            .ok_or_else(|| Error::new(Code::NotFound, format!("no task with id {id}")))?;
        patch.apply(&mut task, new_status);
        self.save_task(&task).await
    }

    async fn delete_task(&self, id: TaskId) -> Result<bool, Error> {
        let result = self
            .tasks
            .delete_one(doc! { "id": id.0.to_string() })
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        Ok(result.deleted_count > 0)
    }

    async fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, Error> {
        let query = Self::filter_to_bson(filter);
        let mut opts = FindOptions::default();
        if let Some(sort) = filter.sort {
            let direction = if sort.desc { -1 } else { 1 };
            opts.sort = Some(doc! { Self::sort_field_name(sort.field): direction });
        }
        if let Some(limit) = filter.limit {
            opts.limit = Some(limit as i64);
        }
        if let Some(offset) = filter.offset {
            opts.skip = Some(offset as u64);
        }
        let cursor = self
            .tasks
            .find(query)
            .with_options(opts)
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        cursor
            .try_collect()
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))
    }

    async fn count_tasks(&self, filter: &TaskFilter) -> Result<u64, Error> {
        let query = Self::filter_to_bson(filter);
        self.tasks
            .count_documents(query)
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))
    }

    async fn is_uniqueness_key_active(&self, key: &str) -> Result<bool, Error> {
        let now = to_bson_time(SystemTime::now());
        let found = self
            .uniqueness
            .find_one(doc! { "_id": key, "expiresAt": { "$gt": now } })
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        Ok(found.is_some())
    }

    async fn set_uniqueness_key_active(
        &self,
        key: &str,
        task_id: TaskId,
        ttl: Duration,
    ) -> Result<bool, Error> {
        let now = SystemTime::now();
        let expires_at = to_bson_time(now + ttl);
        // Only succeeds if no document exists or the existing lock has
        // already expired; `findOneAndUpdate` with `$setOnInsert` can't
        // express "replace if expired", so this does a conditional delete
        // first.
        self.uniqueness
            .delete_one(doc! { "_id": key, "expiresAt": { "$lte": to_bson_time(now) } })
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        let result = self
            .uniqueness
            .update_one(
                doc! { "_id": key },
                doc! { "$setOnInsert": { "taskId": task_id.0.to_string(), "expiresAt": expires_at } },
            )
            .upsert(true)
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        Ok(result.upserted_id.is_some())
    }

    async fn remove_uniqueness_key(&self, key: &str) -> Result<(), Error> {
        self.uniqueness
            .delete_one(doc! { "_id": key })
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
        let now = SystemTime::now();
        let now_bson = to_bson_time(now);
        let new_reset = to_bson_time(now + Duration::from_millis(window_ms));

        // Reset the window first if it has elapsed; a separate, cheap
        // conditional update avoids a Lua-equivalent in a driver that has
        // no server-side scripting story for this document shape.
        self.rate_limits
            .update_one(
                doc! { "_id": key, "resetTime": { "$lte": now_bson } },
                doc! { "$set": { "count": 0, "resetTime": new_reset } },
            )
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;

        let doc = self
            .rate_limits
            .find_one_and_update(
                doc! { "_id": key },
                doc! {
                    "$inc": { "count": 1 },
                    "$setOnInsert": { "resetTime": new_reset },
                },
            )
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))
            .err_tip(|| "while incrementing rate limit")?
            .ok_or_else(|| Error::new(Code::Internal, "rate limit upsert returned no document"))?;

        Ok(RateLimitOutcome {
            allowed: doc.count <= max_requests,
            count: doc.count,
            reset_time: doc.reset_time.into(),
        })
    }

    async fn delete_rate_limit(&self, key: &str) -> Result<(), Error> {
        self.rate_limits
            .delete_one(doc! { "_id": key })
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        Ok(())
    }

    async fn get_rate_limit_status(&self, key: &str) -> Result<Option<RateLimitOutcome>, Error> {
        let now = to_bson_time(SystemTime::now());
        let doc = self
            .rate_limits
            .find_one(doc! { "_id": key, "resetTime": { "$gt": now } })
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        Ok(doc.map(|doc| RateLimitOutcome {
            allowed: true,
            count: doc.count,
            reset_time: doc.reset_time.into(),
        }))
    }

    async fn has_active_task_in_chain(&self, chain_id: &str) -> Result<bool, Error> {
        let found = self
            .tasks
            .find_one(doc! { "chain.id": chain_id, "status": "active" })
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        Ok(found.is_some())
    }

    async fn get_chain_tasks(&self, chain_id: &str) -> Result<Vec<Task>, Error> {
        let opts = FindOptions::builder()
            .sort(doc! { "chain.index": 1 })
            .build();
        let cursor = self
            .tasks
            .find(doc! { "chain.id": chain_id })
            .with_options(opts)
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        cursor
            .try_collect()
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))
    }

    async fn get_next_task_in_chain(
        &self,
        chain_id: &str,
        idx: u32,
    ) -> Result<Option<Task>, Error> {
        self.tasks
            .find_one(doc! { "chain.id": chain_id, "chain.index": idx })
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))
    }

    /// Scans every task and deletes those `CleanupPolicy::matches` selects,
    /// the same shared predicate `memory_store`/`redis_store` use — an
    /// empty policy must delete nothing, which a hand-built `doc!{}` query
    /// cannot guarantee.
    async fn cleanup(&self, policy: &CleanupPolicy) -> Result<u64, Error> {
        let now = SystemTime::now();
        let cursor = self
            .tasks
            .find(doc! {})
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        let all: Vec<Task> = cursor
            .try_collect()
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        let ids: Vec<String> = all
            .iter()
            .filter(|task| policy.matches(task, now))
            .map(|task| task.id.0.to_string())
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let result = self
            .tasks
            .delete_many(doc! { "id": { "$in": ids } })
            .await
            .map_err(|e| Error::new(Code::Backend, e.to_string()))?;
        Ok(result.deleted_count)
    }
}
