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

//! `spawn!` + `JoinHandleDropGuard`, ported from `nativelink_util::task` /
//! `nativelink_util::spawn`. A dropped guard aborts its task instead of
//! leaking it, so background loops (eg. the consumer's concurrency guard
//! cleanup, the engine's delivery workers) die with the struct that owns
//! them.

use tokio::task::JoinHandle;

pub struct JoinHandleDropGuard<T> {
    handle: Option<JoinHandle<T>>,
}

impl<T> JoinHandleDropGuard<T> {
    #[must_use]
    pub fn new(handle: JoinHandle<T>) -> Self {
        JoinHandleDropGuard {
            handle: Some(handle),
        }
    }
}

impl<T> Drop for JoinHandleDropGuard<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl<T> std::future::Future for JoinHandleDropGuard<T> {
    type Output = Result<T, tokio::task::JoinError>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let handle = self
            .handle
            .as_mut()
            .expect("JoinHandleDropGuard polled after completion");
        std::pin::Pin::new(handle).poll(cx)
    }
}

/// Spawns `$fut` onto the runtime under a named span, returning a guard
/// that aborts the task if dropped. `$name` identifies the task in traces;
/// it is not otherwise validated.
#[macro_export]
macro_rules! spawn {
    ($name:expr, $fut:expr) => {{
        let span = tracing::info_span!("spawn", task = $name);
        $crate::spawn::JoinHandleDropGuard::new(tokio::spawn(
            tracing::Instrument::instrument(async move { $fut.await }, span),
        ))
    }};
}
