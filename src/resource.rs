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

use parking_lot::{Mutex, MutexGuard, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::export::Export;
use crate::types::{LockDescription, LockHandle, LockMode, LockPolicy, LockState, RemoteHandle, ResourceKey, ResourceType};

/// A lockable entity: key, type, and the ordered grant/wait lists.
///
/// Every mutation of the lists goes through this resource's own mutex;
/// unrelated resources never contend.
#[derive(Debug)]
pub struct Resource {
    key: ResourceKey,
    rtype: ResourceType,
    inner: Mutex<ResourceInner>,
}

/// List state guarded by the resource mutex
#[derive(Debug, Default)]
pub struct ResourceInner {
    /// Granted locks, in grant order
    pub granted: Vec<Arc<Lock>>,
    /// Waiting locks, in request order
    pub waiting: Vec<Arc<Lock>>,
    /// Lock value block: attribute bytes piggybacked on completion ASTs
    pub lvb: Option<Vec<u8>>,
}

impl Resource {
    pub fn new(key: ResourceKey, rtype: ResourceType) -> Self {
        Self {
            key,
            rtype,
            inner: Mutex::new(ResourceInner::default()),
        }
    }

    pub fn key(&self) -> ResourceKey {
        self.key
    }

    pub fn rtype(&self) -> ResourceType {
        self.rtype
    }

    pub fn lock_lists(&self) -> MutexGuard<'_, ResourceInner> {
        self.inner.lock()
    }

    /// Current value block, if the resource carries one
    pub fn value_block(&self) -> Option<Vec<u8>> {
        self.inner.lock().lvb.clone()
    }

    pub fn set_value_block(&self, lvb: Vec<u8>) {
        self.inner.lock().lvb = Some(lvb);
    }

    /// Both lists empty; the registry may drop this resource
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.granted.is_empty() && inner.waiting.is_empty()
    }
}

impl ResourceInner {
    /// Granted locks of *other* exports that conflict with `mode`.
    ///
    /// Same-export conflicts are the client's own ordering problem and
    /// never block a grant here.
    pub fn conflicting_granted(&self, mode: LockMode, export_id: &str) -> Vec<Arc<Lock>> {
        self.granted
            .iter()
            .filter(|held| held.export_id() != export_id && held.granted_mode().conflicts_with(mode))
            .cloned()
            .collect()
    }

    /// Whether `mode` from `export_id` can be granted right now
    pub fn grantable(&self, mode: LockMode, export_id: &str) -> bool {
        self.granted
            .iter()
            .all(|held| held.export_id() == export_id || held.granted_mode().compatible_with(mode))
    }

    pub fn unlink(&mut self, handle: LockHandle) -> bool {
        let before = self.granted.len() + self.waiting.len();
        self.granted.retain(|l| l.handle() != handle);
        self.waiting.retain(|l| l.handle() != handle);
        before != self.granted.len() + self.waiting.len()
    }
}

/// Mutable lock fields guarded by the lock's own small mutex.
///
/// The resource mutex is always taken before this one when both are held.
#[derive(Debug)]
pub struct LockBody {
    pub requested_mode: LockMode,
    pub granted_mode: LockMode,
    pub state: LockState,
    pub policy: LockPolicy,
    pub last_activity: Instant,
}

/// The central lock record.
///
/// A lock is multiply owned: the registry, the timeout tracker (while
/// armed), the dispatch pool (while a work item references it) and any
/// caller each hold an `Arc` clone. The record is freed when the last
/// clone drops.
pub struct Lock {
    handle: LockHandle,
    remote_handle: RemoteHandle,
    export: Weak<Export>,
    export_id: String,
    flags: AtomicU32,
    resource: RwLock<Arc<Resource>>,
    body: Mutex<LockBody>,
}

impl Lock {
    pub fn new(
        handle: LockHandle,
        remote_handle: RemoteHandle,
        resource: Arc<Resource>,
        export: &Arc<Export>,
        mode: LockMode,
        policy: LockPolicy,
    ) -> Self {
        Self {
            handle,
            remote_handle,
            export: Arc::downgrade(export),
            export_id: export.id().to_string(),
            flags: AtomicU32::new(0),
            resource: RwLock::new(resource),
            body: Mutex::new(LockBody {
                requested_mode: mode,
                granted_mode: LockMode::Null,
                state: LockState::Waiting,
                policy,
                last_activity: Instant::now(),
            }),
        }
    }

    pub fn handle(&self) -> LockHandle {
        self.handle
    }

    pub fn remote_handle(&self) -> RemoteHandle {
        self.remote_handle
    }

    pub fn export_id(&self) -> &str {
        &self.export_id
    }

    /// Owning export, unless the client has already been torn down
    pub fn export(&self) -> Option<Arc<Export>> {
        self.export.upgrade()
    }

    pub fn resource(&self) -> Arc<Resource> {
        self.resource.read().clone()
    }

    /// Swap the resource backing this lock (intent substitution).
    /// The registry relinks the list membership around this call.
    pub(crate) fn set_resource(&self, resource: Arc<Resource>) {
        *self.resource.write() = resource;
    }

    pub fn body(&self) -> MutexGuard<'_, LockBody> {
        self.body.lock()
    }

    pub fn requested_mode(&self) -> LockMode {
        self.body.lock().requested_mode
    }

    pub fn granted_mode(&self) -> LockMode {
        self.body.lock().granted_mode
    }

    pub fn state(&self) -> LockState {
        self.body.lock().state
    }

    pub fn policy(&self) -> LockPolicy {
        self.body.lock().policy
    }

    pub fn touch(&self) {
        self.body.lock().last_activity = Instant::now();
    }

    pub fn set_flags(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn clear_flags(&self, bits: u32) {
        self.flags.fetch_and(!bits, Ordering::AcqRel);
    }

    pub fn has_flags(&self, bits: u32) -> bool {
        self.flags.load(Ordering::Acquire) & bits == bits
    }

    /// Atomically set `bits`, returning whether they were already all set
    pub fn test_and_set_flags(&self, bits: u32) -> bool {
        self.flags.fetch_or(bits, Ordering::AcqRel) & bits == bits
    }

    pub fn raw_flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.has_flags(crate::types::flags::DESTROYED)
    }

    /// Whether the owner is already letting go, either by its own cancel
    /// request or because a server-side teardown is in progress
    pub fn is_cancelling(&self) -> bool {
        use crate::types::flags;
        self.flags.load(Ordering::Acquire) & (flags::CANCEL | flags::CANCELING) != 0
    }

    pub fn is_granted(&self) -> bool {
        self.state() == LockState::Granted
    }

    /// Snapshot for callback RPC payloads
    pub fn description(&self) -> LockDescription {
        let resource = self.resource();
        let body = self.body.lock();
        LockDescription {
            handle: self.handle,
            remote_handle: self.remote_handle,
            resource: resource.key(),
            rtype: resource.rtype(),
            requested_mode: body.requested_mode,
            granted_mode: body.granted_mode,
            policy: body.policy,
        }
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = self.body.lock();
        f.debug_struct("Lock")
            .field("handle", &self.handle)
            .field("export", &self.export_id)
            .field("resource", &self.resource.read().key())
            .field("requested_mode", &body.requested_mode)
            .field("granted_mode", &body.granted_mode)
            .field("state", &body.state)
            .field("flags", &format_args!("{:#b}", self.flags.load(Ordering::Relaxed)))
            .finish()
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock {} ({} on {})", self.handle, self.requested_mode(), self.resource.read().key())
    }
}
