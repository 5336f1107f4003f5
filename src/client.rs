// Copyright 2025 LDLM Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::types::LockDescription;

/// Notified when the RPC layer retransmits an outstanding callback; the
/// dispatch pool uses this to refresh (not re-arm) the timeout tracker.
pub trait ResendObserver: Send + Sync {
    fn on_resend(&self);
}

/// The three callback RPC kinds issued server-to-client.
///
/// Implementations own the transport; the manager only sees the
/// interpreted outcome. Errors are classified by
/// [`crate::LockError::requires_eviction`].
#[async_trait]
pub trait CallbackClient: Send + Sync + fmt::Debug {
    /// "Another lock conflicts; please release or downgrade."
    async fn blocking_ast(&self, export_id: &str, desc: &LockDescription, resend: Arc<dyn ResendObserver>) -> Result<()>;

    /// "Your requested lock is now granted", with the resource's value
    /// block when it carries one.
    async fn completion_ast(&self, export_id: &str, desc: &LockDescription, value_block: Option<Vec<u8>>) -> Result<()>;

    /// "Report current attributes without releasing the lock." Synchronous
    /// request/response; the returned bytes refresh the value block.
    async fn glimpse_ast(&self, export_id: &str, desc: &LockDescription) -> Result<Vec<u8>>;
}

/// In-process client that acknowledges every callback immediately.
/// Useful for embedding the manager in a single-node server and in tests.
#[derive(Debug, Default)]
pub struct LoopbackClient {
    blocking: AtomicU64,
    completion: AtomicU64,
    glimpse: AtomicU64,
}

impl LoopbackClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocking_count(&self) -> u64 {
        self.blocking.load(Ordering::Relaxed)
    }

    pub fn completion_count(&self) -> u64 {
        self.completion.load(Ordering::Relaxed)
    }

    pub fn glimpse_count(&self) -> u64 {
        self.glimpse.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CallbackClient for LoopbackClient {
    async fn blocking_ast(&self, export_id: &str, desc: &LockDescription, _resend: Arc<dyn ResendObserver>) -> Result<()> {
        self.blocking.fetch_add(1, Ordering::Relaxed);
        debug!("loopback blocking AST to {export_id} for {}", desc.handle);
        Ok(())
    }

    async fn completion_ast(&self, export_id: &str, desc: &LockDescription, _value_block: Option<Vec<u8>>) -> Result<()> {
        self.completion.fetch_add(1, Ordering::Relaxed);
        debug!("loopback completion AST to {export_id} for {}", desc.handle);
        Ok(())
    }

    async fn glimpse_ast(&self, export_id: &str, desc: &LockDescription) -> Result<Vec<u8>> {
        self.glimpse.fetch_add(1, Ordering::Relaxed);
        debug!("loopback glimpse AST to {export_id} for {}", desc.handle);
        Ok(Vec::new())
    }
}
