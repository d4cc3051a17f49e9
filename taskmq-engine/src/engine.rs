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

//! The thin orchestrator applications construct once at startup and
//! thread explicitly through their HTTP layer — no global singleton.

use std::sync::Arc;

use taskmq_config::{QueueConfig, TaskMqConfig};
use taskmq_error::{Code, Error};
use taskmq_store::{MemoryStore, StorageAdapter};
use taskmq_util::events::EventKind;
use taskmq_util::metrics::{CollectorState, MetricsComponent};
use taskmq_util::task::{AddTaskOptions, AddTaskResult, DeliveryPayload, TaskId, TaskProgress};
use taskmq_util::TaskEvent;

use crate::consumer::Consumer;
use crate::dispatcher::DispatcherClient;
use crate::event_bus::{EventBus, Unsubscribe};
use crate::handler_registry::{Handler, HandlerRegistry, LifecycleCallbacks};
use crate::producer::Producer;

/// Owns `HandlerRegistry`, `Producer`, `Consumer`, and the shared
/// `StorageAdapter`; exposes the library's public API.
pub struct Engine {
    config: TaskMqConfig,
    store: Arc<dyn StorageAdapter>,
    producer: Producer,
    consumer: Consumer,
    registry: Arc<HandlerRegistry>,
    events: Arc<EventBus>,
}

/// Builds an `Engine` from config plus the two external collaborators the
/// core does not implement: the storage adapter and the dispatcher.
pub struct EngineBuilder {
    config: TaskMqConfig,
    store: Option<Arc<dyn StorageAdapter>>,
    dispatcher: Arc<dyn DispatcherClient>,
    registry: HandlerRegistry,
}

impl EngineBuilder {
    #[must_use]
    pub fn new(config: TaskMqConfig, dispatcher: Arc<dyn DispatcherClient>) -> Self {
        EngineBuilder {
            config,
            store: None,
            dispatcher,
            registry: HandlerRegistry::new(),
        }
    }

    /// Overrides the storage adapter built from `config.storage_adapter`.
    /// Mainly useful for tests that want a shared `MemoryStore` instance.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn StorageAdapter>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn register(
        mut self,
        queue_name: impl Into<String>,
        task_name: Option<String>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        self.registry.register(queue_name, task_name, handler);
        self
    }

    #[must_use]
    pub fn set_callbacks(mut self, queue_name: impl Into<String>, callbacks: LifecycleCallbacks) -> Self {
        self.registry.set_callbacks(queue_name, callbacks);
        self
    }

    pub fn build(self) -> Result<Engine, Error> {
        self.registry.validate()?;
        let store = match self.store {
            Some(store) => store,
            None => match &self.config.storage_adapter {
                taskmq_config::StorageAdapterConfig::memory => {
                    Arc::new(MemoryStore::new()) as Arc<dyn StorageAdapter>
                }
                _ => {
                    return Err(Error::new(
                        Code::InvalidArgument,
                        "non-memory storage adapters must be constructed and passed via with_store \
                         (redis/mongo adapters need an async connection step)"
                            .to_string(),
                    ))
                }
            },
        };
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(self.registry);
        let producer = Producer::new(store.clone(), self.dispatcher.clone(), events.clone());
        let consumer = Consumer::new(store.clone(), registry.clone(), events.clone());
        Ok(Engine {
            config: self.config,
            store,
            producer,
            consumer,
            registry,
            events,
        })
    }
}

impl Engine {
    fn queue_config(&self, queue_name: &str) -> Result<&QueueConfig, Error> {
        self.config
            .queues
            .iter()
            .find(|q| q.name == queue_name)
            .ok_or_else(|| Error::new(Code::InvalidArgument, format!("unknown queue {queue_name}")))
    }

    pub async fn add_task(
        &self,
        queue_name: &str,
        data: serde_json::Value,
        options: AddTaskOptions,
    ) -> Result<AddTaskResult, Error> {
        let queue = self.queue_config(queue_name)?;
        self.producer.add_task(queue, data, options).await
    }

    pub async fn add_chain(
        &self,
        queue_name: &str,
        entries: Vec<(serde_json::Value, AddTaskOptions)>,
        chain_id: Option<String>,
        wait_for_previous: bool,
    ) -> Result<Vec<AddTaskResult>, Error> {
        let queue = self.queue_config(queue_name)?;
        self.producer
            .add_chain(queue, entries, chain_id, wait_for_previous)
            .await
    }

    pub async fn process_delivery(&self, payload: &DeliveryPayload) -> Result<(), Error> {
        self.consumer.process_delivery(payload).await
    }

    pub async fn update_progress(
        &self,
        task_id: TaskId,
        queue_name: &str,
        progress: TaskProgress,
    ) -> Result<(), Error> {
        self.consumer.update_progress(task_id, queue_name, progress).await
    }

    /// Subscribes `listener` to lifecycle events of `kind`. Listeners run
    /// synchronously on the emitting task.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> Unsubscribe<'_>
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(kind, listener)
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn StorageAdapter> {
        &self.store
    }

    /// Gathers every counter published by the producer, consumer, and
    /// rate limiter into one pass. Wiring the result into a real exporter
    /// is left to the embedding application.
    #[must_use]
    pub fn gather_metrics(&self) -> CollectorState {
        let mut state = CollectorState::default();
        self.producer.gather_metrics(&mut state);
        self.consumer.gather_metrics(&mut state);
        state
    }

    /// Drains pending in-process operations and returns once any
    /// in-flight work has persisted its final state. Deliveries are
    /// awaited by their callers directly (`process_delivery`'s future),
    /// so there is nothing further to wait on here beyond making the
    /// intent explicit at shutdown.
    pub async fn close(&self) {
        tracing::event!(tracing::Level::INFO, "engine closing");
    }
}
