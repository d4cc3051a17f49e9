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

use redis::Pipeline;
use redis_test::{MockCmd, MockRedisConnection};
use taskmq_store::{RedisStore, StorageAdapter};
use taskmq_util::task::{AddTaskOptions, Task};

fn build_conn(cmds: Vec<MockCmd>) -> MockRedisConnection {
    MockRedisConnection::new(cmds)
}

#[tokio::test]
async fn save_task_issues_set_pipeline() {
    let task = Task::new(
        "q".to_string(),
        serde_json::json!({}),
        3,
        &AddTaskOptions::default(),
    );
    let encoded = serde_json::to_string(&task).unwrap();
    let mut pipe = Pipeline::new();
    pipe.atomic();
    pipe.add_command({
        let mut cmd = redis::cmd("SET");
        cmd.arg(format!("tq:task:{}", task.id)).arg(&encoded);
        cmd
    });
    let conn = build_conn(vec![MockCmd::with_values(
        pipe,
        Ok(vec![redis::Value::Okay]),
    )]);
    let store = RedisStore::new(conn, "tq:");
    store.save_task(&task).await.unwrap();
}

#[tokio::test]
async fn rate_limit_status_absent_when_key_missing() {
    let conn = build_conn(vec![
        MockCmd::new(
            redis::cmd("HGET").arg("tq:rate:queue:a").arg("count").clone(),
            Ok(redis::Value::Nil),
        ),
        MockCmd::new(
            redis::cmd("HGET").arg("tq:rate:queue:a").arg("reset_time").clone(),
            Ok(redis::Value::Nil),
        ),
    ]);
    let store = RedisStore::new(conn, "tq:");
    assert!(store
        .get_rate_limit_status("queue:a")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn remove_uniqueness_key_issues_del() {
    let conn = build_conn(vec![MockCmd::new(
        redis::cmd("DEL").arg("tq:uniq:email:a@b.com").clone(),
        Ok(1),
    )]);
    let store = RedisStore::new(conn, "tq:");
    store
        .remove_uniqueness_key("email:a@b.com")
        .await
        .unwrap();
}
