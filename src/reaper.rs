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
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::export::Export;
use crate::resource::Lock;

/// Tears down one export after a lock expiry. Installed by the manager,
/// which revokes every lock the export holds and regrants their waiters.
#[async_trait]
pub trait ExportEvictor: Send + Sync + fmt::Debug {
    async fn evict(&self, export: &Arc<Export>, trigger: &Arc<Lock>);
}

/// Consumes expired locks from the timeout tracker and evicts their
/// exports, at most once each. A lock whose export is already gone or
/// already being evicted is skipped; batches of expiries from one sick
/// client collapse into a single eviction.
pub struct Reaper {
    evictor: OnceCell<Arc<dyn ExportEvictor>>,
    shutdown: Notify,
    stopping: AtomicBool,
    evicted_total: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Reaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reaper")
            .field("evicted_total", &self.evicted_total.load(Ordering::Relaxed))
            .finish()
    }
}

impl Reaper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            evictor: OnceCell::new(),
            shutdown: Notify::new(),
            stopping: AtomicBool::new(false),
            evicted_total: AtomicU64::new(0),
            handle: Mutex::new(None),
        })
    }

    /// Install the eviction callback; must happen before `start`
    pub fn set_evictor(&self, evictor: Arc<dyn ExportEvictor>) {
        if self.evictor.set(evictor).is_err() {
            warn!("reaper evictor installed twice; keeping the first");
        }
    }

    pub fn start(self: &Arc<Self>, expired_rx: mpsc::UnboundedReceiver<Arc<Lock>>) {
        let reaper = self.clone();
        let handle = tokio::spawn(reaper.run(expired_rx));
        *self.handle.lock() = Some(handle);
    }

    /// Stop the worker, abandoning any queued expiries
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
        self.shutdown.notify_one();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted_total.load(Ordering::Relaxed)
    }

    async fn run(self: Arc<Self>, mut expired_rx: mpsc::UnboundedReceiver<Arc<Lock>>) {
        loop {
            let lock = tokio::select! {
                received = expired_rx.recv() => match received {
                    Some(lock) => lock,
                    None => {
                        debug!("expiry channel closed, reaper exiting");
                        return;
                    }
                },
                _ = self.shutdown.notified() => return,
            };
            if self.stopping.load(Ordering::Acquire) {
                return;
            }
            self.process(lock).await;
        }
    }

    async fn process(&self, lock: Arc<Lock>) {
        let Some(export) = lock.export() else {
            debug!("expired {lock} has no live export, already handled");
            return;
        };
        // First expiry wins; later ones from the same export are no-ops
        if !export.begin_eviction() {
            debug!("export {} already being evicted, dropping expiry of {lock}", export.id());
            return;
        }

        warn!(
            "client {} failed to answer a blocking callback for {lock}, evicting",
            export.id()
        );
        if let Some(evictor) = self.evictor.get() {
            evictor.evict(&export, &lock).await;
        }
        self.evicted_total.fetch_add(1, Ordering::Relaxed);
    }
}
