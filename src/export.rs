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

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::resource::Lock;
use crate::types::LockHandle;

/// Server-side state for one connected client.
///
/// An export outlives the locks it holds; locks keep only a weak
/// back-reference to it.
#[derive(Debug)]
pub struct Export {
    id: String,
    /// Fresh per connection; a reconnect of the same client id gets a new
    /// export with a new uuid, so a stale one is never mistaken for it
    connection: Uuid,
    /// Locks this client holds or waits for, by server handle
    locks: Mutex<HashMap<LockHandle, Arc<Lock>>>,
    /// Locks of this export that currently block someone else; bounded,
    /// oldest entries are shed first
    blocked: Mutex<VecDeque<LockHandle>>,
    blocked_limit: usize,
    /// Set once when eviction starts; throttles duplicate eviction work
    stale: AtomicBool,
    connected: AtomicBool,
}

impl Export {
    pub fn new(id: impl Into<String>, blocked_limit: usize) -> Self {
        Self {
            id: id.into(),
            connection: Uuid::new_v4(),
            locks: Mutex::new(HashMap::new()),
            blocked: Mutex::new(VecDeque::new()),
            blocked_limit,
            stale: AtomicBool::new(false),
            connected: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection(&self) -> Uuid {
        self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Claim eviction of this export. Returns true exactly once; later
    /// callers see the export as already handled.
    pub fn begin_eviction(&self) -> bool {
        self.stale
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn add_lock(&self, lock: Arc<Lock>) {
        self.locks.lock().insert(lock.handle(), lock);
    }

    pub fn remove_lock(&self, handle: LockHandle) -> Option<Arc<Lock>> {
        self.locks.lock().remove(&handle)
    }

    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Snapshot of every lock held; used by eviction to revoke them all
    pub fn take_all_locks(&self) -> Vec<Arc<Lock>> {
        self.locks.lock().drain().map(|(_, l)| l).collect()
    }

    /// Record that one of this export's locks blocks another request.
    /// The list is bounded; beyond the limit the oldest entry is dropped,
    /// eviction ordering degrades gracefully.
    pub fn note_blocked(&self, handle: LockHandle) {
        let mut blocked = self.blocked.lock();
        if blocked.len() >= self.blocked_limit {
            blocked.pop_front();
        }
        blocked.push_back(handle);
    }

    pub fn forget_blocked(&self, handle: LockHandle) {
        self.blocked.lock().retain(|h| *h != handle);
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.lock().len()
    }
}

/// Registry of connected exports
#[derive(Debug, Default)]
pub struct ExportRegistry {
    exports: RwLock<HashMap<String, Arc<Export>>>,
}

impl ExportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, export: Arc<Export>) {
        self.exports.write().insert(export.id().to_string(), export);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Export>> {
        self.exports.read().get(id).cloned()
    }

    /// Resolve an export that must be connected and not mid-eviction
    pub fn get_connected(&self, id: &str) -> Option<Arc<Export>> {
        self.exports
            .read()
            .get(id)
            .filter(|e| e.is_connected() && !e.is_stale())
            .cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Export>> {
        self.exports.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.exports.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.read().is_empty()
    }
}
