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

use std::time::SystemTime;

use taskmq_store::adapter::{CleanupPolicy, TaskFilter};
use taskmq_store::mongo_store::{status_str, MongoStore};
use taskmq_util::task::{AddTaskOptions, Task, TaskStatus};

#[test]
fn task_document_uses_camel_case_field_and_status_names() {
    let mut task = Task::new(
        "emails".to_string(),
        serde_json::json!({}),
        3,
        &AddTaskOptions::default(),
    );
    task.mark_active();
    let document = bson::to_document(&task).unwrap();
    assert_eq!(document.get_str("queueName").unwrap(), "emails");
    assert!(document.get("queue_name").is_none());
    assert_eq!(document.get_str("status").unwrap(), status_str(task.status));
    assert!(document.get("createdAt").is_some());
    assert!(document.get("created_at").is_none());
}

#[test]
fn filter_to_bson_maps_statuses_and_queue() {
    let filter = TaskFilter {
        statuses: vec![TaskStatus::Active, TaskStatus::Idle],
        queue_name: Some("emails".to_string()),
        ..Default::default()
    };
    let query = MongoStore::filter_to_bson(&filter);
    assert_eq!(query.get_str("queueName").unwrap(), "emails");
    let statuses = query.get_document("status").unwrap().get_array("$in").unwrap();
    assert_eq!(statuses.len(), 2);
}

#[test]
fn cleanup_policy_query_uses_statuses_when_set() {
    let policy = CleanupPolicy {
        older_than: None,
        statuses: vec![],
        remove_completed: true,
        remove_failed: true,
    };
    assert!(policy.matches(
        &{
            let mut t = Task::new(
                "q".to_string(),
                serde_json::json!({}),
                1,
                &AddTaskOptions::default(),
            );
            t.mark_active();
            t.mark_completed(serde_json::json!({}));
            t
        },
        SystemTime::now()
    ));
}
