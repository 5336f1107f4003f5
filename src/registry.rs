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
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{LockError, Result};
use crate::export::Export;
use crate::resource::{Lock, Resource};
use crate::types::{flags, LockHandle, LockMode, LockPolicy, LockState, RemoteHandle, ResourceKey, ResourceType};

/// Outcome of a grant attempt against a resource
#[derive(Debug)]
pub enum GrantOutcome {
    /// The lock moved to the granted list
    Granted,
    /// Conflicting granted locks of other exports stand in the way
    Blocked(Vec<Arc<Lock>>),
}

/// Canonical owner of resources and locks.
///
/// Lock ordering: the resource map write lock is always taken before any
/// per-resource mutex, and for two resources their mutexes nest in key
/// order.
#[derive(Debug)]
pub struct LockRegistry {
    resources: RwLock<HashMap<ResourceKey, Arc<Resource>>>,
    handles: RwLock<HashMap<LockHandle, Arc<Lock>>>,
    /// (export id, client cookie) -> server handle, for resend/replay lookup
    remote_index: RwLock<HashMap<(String, RemoteHandle), LockHandle>>,
    next_cookie: AtomicU64,
    cancel_stats: Mutex<HashMap<ResourceKey, u64>>,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            resources: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            remote_index: RwLock::new(HashMap::new()),
            next_cookie: AtomicU64::new(1),
            cancel_stats: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotent lookup-or-create. An existing resource must agree on the
    /// type; a mismatch is a protocol error from a confused client.
    pub fn find_or_create_resource(&self, key: ResourceKey, rtype: ResourceType) -> Result<Arc<Resource>> {
        {
            let resources = self.resources.read();
            if let Some(resource) = resources.get(&key) {
                if resource.rtype() != rtype {
                    return Err(LockError::protocol(format!(
                        "resource {key} is {} but request says {rtype}",
                        resource.rtype()
                    )));
                }
                return Ok(resource.clone());
            }
        }

        let mut resources = self.resources.write();
        match resources.get(&key) {
            Some(resource) => {
                if resource.rtype() != rtype {
                    return Err(LockError::protocol(format!(
                        "resource {key} is {} but request says {rtype}",
                        resource.rtype()
                    )));
                }
                Ok(resource.clone())
            }
            None => {
                let resource = Arc::new(Resource::new(key, rtype));
                resources.insert(key, resource.clone());
                debug!("created resource {key} ({rtype})");
                Ok(resource)
            }
        }
    }

    /// Create a lock in WAITING state, queue it on the resource's wait list
    /// and index it for handle and resend lookups.
    pub fn create_lock(
        &self,
        resource: &Arc<Resource>,
        export: &Arc<Export>,
        mode: LockMode,
        policy: LockPolicy,
        remote_handle: RemoteHandle,
    ) -> Arc<Lock> {
        let handle = LockHandle::new(self.next_cookie.fetch_add(1, Ordering::Relaxed));
        let lock = Arc::new(Lock::new(handle, remote_handle, resource.clone(), export, mode, policy));

        resource.lock_lists().waiting.push(lock.clone());
        self.handles.write().insert(handle, lock.clone());
        self.remote_index
            .write()
            .insert((export.id().to_string(), remote_handle), handle);
        export.add_lock(lock.clone());

        debug!("created {lock}");
        lock
    }

    pub fn lookup(&self, handle: LockHandle) -> Option<Arc<Lock>> {
        self.handles.read().get(&handle).cloned()
    }

    pub fn get_resource(&self, key: ResourceKey) -> Option<Arc<Resource>> {
        self.resources.read().get(&key).cloned()
    }

    /// Resend/replay path: locate a pre-existing lock by the client's cookie
    pub fn lookup_remote(&self, export_id: &str, remote_handle: RemoteHandle) -> Option<Arc<Lock>> {
        let handle = *self.remote_index.read().get(&(export_id.to_string(), remote_handle))?;
        self.lookup(handle)
    }

    /// Try to grant a waiting lock right now. Grants move it to the granted
    /// list; a refusal reports the conflicting holders.
    pub fn try_grant(&self, lock: &Arc<Lock>) -> GrantOutcome {
        let resource = lock.resource();
        let mut inner = resource.lock_lists();
        let mode = lock.requested_mode();

        let blockers = inner.conflicting_granted(mode, lock.export_id());
        if !blockers.is_empty() {
            return GrantOutcome::Blocked(blockers);
        }

        inner.waiting.retain(|l| l.handle() != lock.handle());
        inner.granted.push(lock.clone());

        // Publish the granted mode before releasing the resource mutex, or a
        // concurrent conflict scan would read this holder as Null and let an
        // incompatible lock through.
        {
            let mut body = lock.body();
            body.granted_mode = body.requested_mode;
            body.state = LockState::Granted;
        }
        drop(inner);

        debug!("granted {lock}");
        GrantOutcome::Granted
    }

    /// Remove the lock from every list and index. Idempotent: a second
    /// cancel of the same lock is a no-op and reports `false`.
    pub fn cancel_lock(&self, lock: &Arc<Lock>) -> bool {
        if lock.test_and_set_flags(flags::DESTROYED) {
            debug!("cancel of already-destroyed {lock}");
            return false;
        }
        lock.set_flags(flags::CANCELING);

        let resource = lock.resource();
        resource.lock_lists().unlink(lock.handle());

        {
            let mut body = lock.body();
            body.state = LockState::Destroyed;
            body.granted_mode = LockMode::Null;
        }

        self.handles.write().remove(&lock.handle());
        self.remote_index
            .write()
            .remove(&(lock.export_id().to_string(), lock.remote_handle()));

        if let Some(export) = lock.export() {
            export.remove_lock(lock.handle());
            export.forget_blocked(lock.handle());
        }

        *self.cancel_stats.lock().entry(resource.key()).or_insert(0) += 1;
        self.maybe_drop_resource(&resource);

        debug!("cancelled {lock}");
        true
    }

    /// Re-scan the wait list in request order and grant every lock that no
    /// longer conflicts. Returns the newly granted locks so the caller can
    /// dispatch their completion callbacks.
    pub fn reprocess(&self, resource: &Arc<Resource>) -> Vec<Arc<Lock>> {
        let mut granted = Vec::new();
        {
            let mut inner = resource.lock_lists();
            let mut index = 0;
            while index < inner.waiting.len() {
                let candidate = inner.waiting[index].clone();
                if candidate.is_destroyed() {
                    inner.waiting.remove(index);
                    continue;
                }
                if inner.grantable(candidate.requested_mode(), candidate.export_id()) {
                    inner.waiting.remove(index);
                    inner.granted.push(candidate.clone());
                    // Same as try_grant: the mode goes live under the
                    // resource mutex, never after it.
                    {
                        let mut body = candidate.body();
                        body.granted_mode = body.requested_mode;
                        body.state = LockState::Granted;
                    }
                    granted.push(candidate);
                } else {
                    index += 1;
                }
            }
        }

        for lock in &granted {
            debug!("reprocess granted {lock}");
        }

        self.maybe_drop_resource(resource);
        granted
    }

    /// Intent substitution: atomically move a still-waiting lock from its
    /// current resource onto `new_key`.
    pub fn relink(&self, lock: &Arc<Lock>, new_key: ResourceKey, rtype: ResourceType) -> Result<Arc<Resource>> {
        let old = lock.resource();
        if old.key() == new_key {
            return Ok(old);
        }
        let new = self.find_or_create_resource(new_key, rtype)?;

        // Nest the two resource mutexes in key order
        let (first, second) = if old.key() < new.key() { (&old, &new) } else { (&new, &old) };
        let mut first_inner = first.lock_lists();
        let mut second_inner = second.lock_lists();
        let (old_inner, new_inner) = if old.key() < new.key() {
            (&mut first_inner, &mut second_inner)
        } else {
            (&mut second_inner, &mut first_inner)
        };

        old_inner.unlink(lock.handle());
        new_inner.waiting.push(lock.clone());
        lock.set_resource(new.clone());
        drop(second_inner);
        drop(first_inner);

        self.maybe_drop_resource(&old);
        debug!("relinked {} from {} to {}", lock.handle(), old.key(), new_key);
        Ok(new)
    }

    /// Drop an idle resource from the map. Resources are shared-owned by
    /// their locks; outstanding Arcs stay valid, only the lookup goes away.
    fn maybe_drop_resource(&self, resource: &Arc<Resource>) {
        if !resource.is_idle() {
            return;
        }
        let mut resources = self.resources.write();
        if resource.is_idle() {
            if resources.remove(&resource.key()).is_some() {
                debug!("dropped idle resource {}", resource.key());
            }
        }
    }

    pub fn resource_count(&self) -> usize {
        self.resources.read().len()
    }

    pub fn lock_count(&self) -> usize {
        self.handles.read().len()
    }

    /// (granted, waiting) totals across all resources
    pub fn list_counts(&self) -> (usize, usize) {
        let resources: Vec<_> = self.resources.read().values().cloned().collect();
        let mut granted = 0;
        let mut waiting = 0;
        for resource in resources {
            let inner = resource.lock_lists();
            granted += inner.granted.len();
            waiting += inner.waiting.len();
        }
        (granted, waiting)
    }

    pub fn cancels_for(&self, key: ResourceKey) -> u64 {
        self.cancel_stats.lock().get(&key).copied().unwrap_or(0)
    }
}
