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

//! The seam between `Producer` and the external dispatch service. The
//! dispatcher itself (queue creation, OIDC signing, HTTP delivery) lives
//! outside this crate; callers provide their own `DispatcherClient`.

use std::time::Duration;

use async_trait::async_trait;
use taskmq_error::Error;
use tracing::{event, Level};

#[async_trait]
pub trait DispatcherClient: Send + Sync {
    /// Enqueues an HTTP task on `queue_path`, to be delivered to `url`
    /// carrying `body`, optionally delayed by `schedule_delay` and signed
    /// as `service_account_email`.
    async fn enqueue_http(
        &self,
        queue_path: &str,
        url: &str,
        body: &[u8],
        schedule_delay: Option<Duration>,
        service_account_email: Option<&str>,
    ) -> Result<(), Error>;
}

/// A `DispatcherClient` that logs every call and always succeeds. Used in
/// tests and dry-run deployments where no real dispatcher is wired up.
pub struct NoopDispatcherClient;

#[async_trait]
impl DispatcherClient for NoopDispatcherClient {
    async fn enqueue_http(
        &self,
        queue_path: &str,
        url: &str,
        body: &[u8],
        schedule_delay: Option<Duration>,
        service_account_email: Option<&str>,
    ) -> Result<(), Error> {
        event!(
            Level::DEBUG,
            ?queue_path,
            ?url,
            body_len = body.len(),
            ?schedule_delay,
            ?service_account_email,
            "noop dispatcher enqueue"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_dispatcher_always_succeeds() {
        let client = NoopDispatcherClient;
        client
            .enqueue_http("projects/p/queues/q", "https://example.com", b"{}", None, None)
            .await
            .unwrap();
    }
}
