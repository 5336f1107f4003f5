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
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::CallbackClient;
use crate::config::LdlmConfig;
use crate::dispatch::{AstDispatcher, AstHooks, QueueClass, WorkKind};
use crate::error::{LockError, Result};
use crate::export::{Export, ExportRegistry};
use crate::reaper::{ExportEvictor, Reaper};
use crate::registry::{GrantOutcome, LockRegistry};
use crate::resource::{Lock, Resource};
use crate::tracker::{BusyPolicy, NeverBusy, WaitingTracker};
use crate::types::{
    flags, CancelReply, ConvertReply, EnqueueReply, EnqueueRequest, LockHandle, LockMode, LockState, LockStats,
    ResourceKey, ResourceType,
};

/// Resolves the resource an intent enqueue should actually cover. An
/// intent carries the operation the client is about to perform; the
/// server may substitute the resource the result lives on.
pub trait IntentPolicy: Send + Sync + fmt::Debug {
    fn resolve(&self, request: &EnqueueRequest) -> Option<(ResourceKey, ResourceType)>;
}

/// Default intent handling: follow the child resource named by the
/// intent, keep the requested resource type.
#[derive(Debug, Default)]
pub struct ChildIntent;

impl IntentPolicy for ChildIntent {
    fn resolve(&self, request: &EnqueueRequest) -> Option<(ResourceKey, ResourceType)> {
        let child = request.intent.as_ref()?.child?;
        Some((child, request.rtype))
    }
}

#[derive(Debug, Default)]
struct Counters {
    granted: AtomicU64,
    cancelled: AtomicU64,
}

/// Shared grant machinery behind the dispatch pool and the reaper:
/// cancels locks, regrants their waiters and pushes the resulting
/// completion callbacks back onto the pool.
struct CoreHooks {
    registry: Arc<LockRegistry>,
    exports: Arc<ExportRegistry>,
    tracker: Arc<WaitingTracker>,
    dispatcher: Weak<AstDispatcher>,
    expired_tx: mpsc::UnboundedSender<Arc<Lock>>,
    counters: Arc<Counters>,
}

impl fmt::Debug for CoreHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreHooks").finish()
    }
}

impl CoreHooks {
    /// Cancel a set of locks and regrant the waiters of every touched
    /// resource, reprocessing each resource once.
    async fn revoke(&self, locks: &[Arc<Lock>]) {
        let mut resources: BTreeMap<ResourceKey, Arc<Resource>> = BTreeMap::new();
        for lock in locks {
            self.tracker.disarm(lock);
            let resource = lock.resource();
            resources.entry(resource.key()).or_insert(resource);
            if self.registry.cancel_lock(lock) {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            }
        }
        for resource in resources.values() {
            self.grant_waiters(resource).await;
        }
    }

    /// Grant whatever the resource can now accommodate and notify the new
    /// holders.
    async fn grant_waiters(&self, resource: &Arc<Resource>) {
        let newly_granted = self.registry.reprocess(resource);
        if newly_granted.is_empty() {
            return;
        }
        self.counters.granted.fetch_add(newly_granted.len() as u64, Ordering::Relaxed);

        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return;
        };
        let submissions = newly_granted
            .into_iter()
            .map(|lock| dispatcher.submit(WorkKind::Completion(lock), QueueClass::Normal, false));
        for outcome in join_all(submissions).await {
            if let Err(err) = outcome {
                warn!("could not queue a completion callback: {err}");
            }
        }
    }
}

#[async_trait]
impl AstHooks for CoreHooks {
    async fn cancel_after_failure(&self, lock: &Arc<Lock>) {
        self.revoke(std::slice::from_ref(lock)).await;
    }

    async fn cancel_batch(&self, locks: &[Arc<Lock>]) {
        self.revoke(locks).await;
    }

    fn schedule_eviction(&self, lock: &Arc<Lock>) {
        // Funnel through the reaper so the export is torn down at most once
        if self.expired_tx.send(lock.clone()).is_err() {
            warn!("eviction channel closed; dropping eviction of {}", lock.export_id());
        }
    }
}

#[async_trait]
impl ExportEvictor for CoreHooks {
    async fn evict(&self, export: &Arc<Export>, trigger: &Arc<Lock>) {
        self.exports.remove(export.id());
        export.mark_disconnected();

        let held = export.take_all_locks();
        info!(
            "evicting export {} ({} locks, triggered by {})",
            export.id(),
            held.len(),
            trigger.handle()
        );
        self.revoke(&held).await;
    }
}

/// Builder for a [`LockManager`]; the busy and intent policies are fixed
/// at construction because the timer task captures them.
pub struct LockManagerBuilder {
    config: LdlmConfig,
    client: Arc<dyn CallbackClient>,
    busy_policy: Arc<dyn BusyPolicy>,
    intent_policy: Arc<dyn IntentPolicy>,
}

impl LockManagerBuilder {
    pub fn new(config: LdlmConfig, client: Arc<dyn CallbackClient>) -> Self {
        Self {
            config,
            client,
            busy_policy: Arc::new(NeverBusy),
            intent_policy: Arc::new(ChildIntent),
        }
    }

    /// Replace the policy deciding whether an unanswered lock is merely
    /// busy and deserves a deadline extension.
    pub fn with_busy_policy(mut self, policy: Arc<dyn BusyPolicy>) -> Self {
        self.busy_policy = policy;
        self
    }

    pub fn with_intent_policy(mut self, policy: Arc<dyn IntentPolicy>) -> Self {
        self.intent_policy = policy;
        self
    }

    pub fn build(self) -> Result<Arc<LockManager>> {
        self.config.validate()?;

        let registry = Arc::new(LockRegistry::new());
        let exports = Arc::new(ExportRegistry::new());
        let counters = Arc::new(Counters::default());

        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(WaitingTracker::new(
            expired_tx.clone(),
            self.busy_policy,
            self.config.busy_extension,
        ));
        let dispatcher = AstDispatcher::new(&self.config, self.client, tracker.clone());
        let reaper = Reaper::new();

        let hooks = Arc::new(CoreHooks {
            registry: registry.clone(),
            exports: exports.clone(),
            tracker: tracker.clone(),
            dispatcher: Arc::downgrade(&dispatcher),
            expired_tx,
            counters: counters.clone(),
        });
        dispatcher.set_hooks(hooks.clone());
        reaper.set_evictor(hooks.clone());

        Ok(Arc::new(LockManager {
            config: self.config,
            registry,
            exports,
            tracker,
            dispatcher,
            reaper,
            hooks,
            intent_policy: self.intent_policy,
            counters,
            started: AtomicBool::new(false),
            tracker_handle: Mutex::new(None),
            expired_rx: Mutex::new(Some(expired_rx)),
        }))
    }
}

/// The lock server: owns the resource/lock registry, the callback
/// dispatch pool, the waiting-lock timer and the eviction reaper, and
/// exposes the enqueue/convert/cancel/glimpse operations clients drive.
pub struct LockManager {
    config: LdlmConfig,
    registry: Arc<LockRegistry>,
    exports: Arc<ExportRegistry>,
    tracker: Arc<WaitingTracker>,
    dispatcher: Arc<AstDispatcher>,
    reaper: Arc<Reaper>,
    hooks: Arc<CoreHooks>,
    intent_policy: Arc<dyn IntentPolicy>,
    counters: Arc<Counters>,
    started: AtomicBool,
    tracker_handle: Mutex<Option<JoinHandle<()>>>,
    expired_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<Lock>>>>,
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("resources", &self.registry.resource_count())
            .field("locks", &self.registry.lock_count())
            .field("exports", &self.exports.len())
            .finish()
    }
}

impl LockManager {
    pub fn builder(config: LdlmConfig, client: Arc<dyn CallbackClient>) -> LockManagerBuilder {
        LockManagerBuilder::new(config, client)
    }

    pub fn new(config: LdlmConfig, client: Arc<dyn CallbackClient>) -> Result<Arc<Self>> {
        LockManagerBuilder::new(config, client).build()
    }

    /// Start the timer, reaper and dispatch pool. Idempotent.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let expired_rx = self
            .expired_rx
            .lock()
            .take()
            .ok_or_else(|| LockError::internal("lock manager restarted after stop"))?;

        self.reaper.start(expired_rx);
        self.dispatcher.start();
        let tracker = self.tracker.clone();
        *self.tracker_handle.lock() = Some(tokio::spawn(tracker.run()));

        info!("lock manager started ({} dispatch workers)", self.dispatcher.worker_count());
        Ok(())
    }

    /// Drain callbacks and stop every background task. Fails with
    /// `ResourcesBusy` if locks are still outstanding afterwards.
    pub async fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        self.dispatcher.stop().await;
        self.tracker.shutdown();
        let handle = self.tracker_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.reaper.stop().await;

        let remaining = self.registry.resource_count();
        if remaining != 0 {
            error!("{remaining} resources still hold locks at shutdown");
            return Err(LockError::ResourcesBusy { count: remaining });
        }
        info!("lock manager stopped");
        Ok(())
    }

    /// Register a client connection. Reconnection replaces a stale export
    /// left behind by an eviction.
    pub fn register_export(&self, id: &str) -> Arc<Export> {
        if let Some(existing) = self.exports.get_connected(id) {
            return existing;
        }
        let export = Arc::new(Export::new(id, self.config.max_blocked_per_export));
        self.exports.register(export.clone());
        info!("export {id} connected (conn {})", export.connection());
        export
    }

    /// Orderly teardown of one client: every lock it holds is released and
    /// the freed resources are regranted.
    pub async fn disconnect_export(&self, id: &str) -> Result<()> {
        let export = self.exports.remove(id).ok_or_else(|| LockError::not_connected(id))?;
        export.mark_disconnected();

        let held = export.take_all_locks();
        let count = held.len();
        self.hooks.revoke(&held).await;
        info!("export {id} disconnected, released {count} locks");
        Ok(())
    }

    pub fn export(&self, id: &str) -> Option<Arc<Export>> {
        self.exports.get(id)
    }

    /// Request a lock. Returns immediately in both cases: a granted reply,
    /// or a blocked one after blocking callbacks went out to every
    /// conflicting holder.
    pub async fn enqueue(&self, export_id: &str, request: EnqueueRequest) -> Result<EnqueueReply> {
        let export = self
            .exports
            .get_connected(export_id)
            .ok_or_else(|| LockError::not_connected(export_id))?;

        if !request.mode.is_requestable() {
            return Err(LockError::protocol(format!("{} is not a requestable mode", request.mode)));
        }
        if !request.policy.matches(request.rtype) {
            return Err(LockError::protocol(format!(
                "policy does not match resource type {}",
                request.rtype
            )));
        }

        // A retransmitted enqueue must find the lock the first transmission
        // created instead of making a second one.
        if request.flags.resent || request.flags.replay {
            if let Some(existing) = self.registry.lookup_remote(export_id, request.remote_handle) {
                debug!("resent enqueue matched existing {existing}");
                existing.set_flags(if request.flags.replay { flags::REPLAY } else { flags::RESENT });
                return Ok(EnqueueReply {
                    handle: existing.handle(),
                    mode: existing.granted_mode(),
                    granted: existing.is_granted(),
                    description: existing.description(),
                });
            }
        }

        let resource = self.registry.find_or_create_resource(request.resource, request.rtype)?;
        let lock = self
            .registry
            .create_lock(&resource, &export, request.mode, request.policy, request.remote_handle);
        if request.flags.cancel_on_block {
            lock.set_flags(flags::CANCEL_ON_BLOCK);
        }

        // Intent execution may substitute the resource the result lives on
        if let Some((child_key, child_type)) = self.intent_policy.resolve(&request) {
            if child_key != resource.key() {
                let child = self.registry.relink(&lock, child_key, child_type)?;
                debug!("intent moved {} onto {}", lock.handle(), child.key());
            }
        }

        let granted = self.try_grant_or_block(&lock).await?;

        Ok(EnqueueReply {
            handle: lock.handle(),
            mode: lock.granted_mode(),
            granted,
            description: lock.description(),
        })
    }

    /// Grant now if possible. Holders flagged cancel-on-block are revoked
    /// on the spot instead of being sent a blocking callback; everyone else
    /// gets one, and the lock waits.
    async fn try_grant_or_block(&self, lock: &Arc<Lock>) -> Result<bool> {
        let mut outcome = self.registry.try_grant(lock);

        if let GrantOutcome::Blocked(blockers) = &outcome {
            let revocable: Vec<Arc<Lock>> = blockers
                .iter()
                .filter(|b| b.has_flags(flags::CANCEL_ON_BLOCK))
                .cloned()
                .collect();
            if !revocable.is_empty() {
                self.hooks.revoke(&revocable).await;
                if lock.is_granted() {
                    // Regranting the freed resource already promoted us, and
                    // grant_waiters counted it
                    return Ok(true);
                }
                outcome = self.registry.try_grant(lock);
            }
        }

        match outcome {
            GrantOutcome::Granted => {
                self.counters.granted.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            GrantOutcome::Blocked(blockers) => {
                for blocker in blockers {
                    blocker.touch();
                    // A holder with a callback already in flight is not asked twice
                    if blocker.test_and_set_flags(flags::CB_PENDING | flags::BL_AST) {
                        continue;
                    }
                    let class = Self::revocation_class(&blocker);
                    self.dispatcher.submit(WorkKind::Blocking(blocker), class, false).await?;
                }
                Ok(false)
            }
        }
    }

    /// Writers must flush dirty data before releasing; revoking them ahead
    /// of readers keeps that flush off the critical path of later grants.
    fn revocation_class(blocker: &Arc<Lock>) -> QueueClass {
        match blocker.granted_mode() {
            LockMode::ProtectedWrite | LockMode::Exclusive | LockMode::ConcurrentWrite | LockMode::Group => {
                QueueClass::Priority
            }
            _ => QueueClass::Normal,
        }
    }

    /// Change the mode of a granted lock in place. A compatible change is
    /// applied and may regrant waiters (down-conversion answers a blocking
    /// callback); an incompatible one is refused, never queued.
    pub async fn convert(&self, export_id: &str, handle: LockHandle, new_mode: LockMode) -> Result<ConvertReply> {
        let lock = self.registry.lookup(handle).ok_or(LockError::StaleHandle { handle })?;
        if lock.export_id() != export_id {
            return Err(LockError::protocol(format!("{handle} does not belong to {export_id}")));
        }
        if !new_mode.is_requestable() {
            return Err(LockError::protocol(format!("cannot convert to {new_mode}")));
        }
        if lock.state() != LockState::Granted {
            return Err(LockError::protocol(format!("convert of non-granted {handle}")));
        }

        let resource = lock.resource();
        let accepted = {
            let inner = resource.lock_lists();
            let compatible = inner
                .granted
                .iter()
                .filter(|held| held.handle() != handle && held.export_id() != export_id)
                .all(|held| !held.granted_mode().conflicts_with(new_mode));
            if compatible {
                let mut body = lock.body();
                body.requested_mode = new_mode;
                body.granted_mode = new_mode;
                true
            } else {
                false
            }
        };

        if !accepted {
            debug!("refused convert of {handle} to {new_mode}");
            return Ok(ConvertReply {
                handle,
                mode: lock.granted_mode(),
                granted: false,
            });
        }

        // A down-conversion is the owner's answer to a blocking callback
        self.tracker.disarm(&lock);
        lock.clear_flags(flags::CB_PENDING | flags::BL_AST | flags::AST_SENT);
        lock.touch();
        self.hooks.grant_waiters(&resource).await;

        debug!("converted {handle} to {new_mode}");
        Ok(ConvertReply {
            handle,
            mode: new_mode,
            granted: true,
        })
    }

    /// Release a batch of locks. Stale handles are counted, not failed: a
    /// cancel crossing an eviction or a duplicate cancel is normal traffic.
    pub async fn cancel(&self, export_id: &str, handles: &[LockHandle]) -> Result<CancelReply> {
        let mut cancelled = 0;
        let mut stale = 0;
        let mut resources: BTreeMap<ResourceKey, Arc<Resource>> = BTreeMap::new();

        for &handle in handles {
            let Some(lock) = self.registry.lookup(handle) else {
                stale += 1;
                continue;
            };
            if lock.export_id() != export_id {
                warn!("cancel of {handle} from wrong export {export_id}");
                stale += 1;
                continue;
            }

            lock.set_flags(flags::CANCEL);
            self.tracker.disarm(&lock);
            let resource = lock.resource();
            resources.entry(resource.key()).or_insert(resource);
            if self.registry.cancel_lock(&lock) {
                cancelled += 1;
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            } else {
                stale += 1;
            }
        }

        // One reprocess per distinct resource, after the whole batch
        for resource in resources.values() {
            self.hooks.grant_waiters(resource).await;
        }

        debug!("cancel batch from {export_id}: {cancelled} cancelled, {stale} stale");
        Ok(CancelReply { cancelled, stale })
    }

    /// Ask the most authoritative holder of `key` for fresh attributes.
    /// With no holder to ask, or on callback failure, the cached value
    /// block stands in.
    pub async fn glimpse(&self, key: ResourceKey) -> Result<Vec<u8>> {
        let Some(resource) = self.registry.get_resource(key) else {
            return Ok(Vec::new());
        };

        let Some(holder) = Self::glimpse_target(&resource) else {
            return Ok(resource.value_block().unwrap_or_default());
        };

        let (tx, rx) = oneshot::channel();
        self.dispatcher
            .submit(
                WorkKind::Glimpse {
                    lock: holder,
                    reply: tx,
                },
                QueueClass::Normal,
                false,
            )
            .await?;
        rx.await.map_err(|_| LockError::internal("glimpse worker dropped its reply"))
    }

    /// Highest-mode writer on the granted list; readers hold no newer
    /// attributes than the server already has.
    fn glimpse_target(resource: &Arc<Resource>) -> Option<Arc<Lock>> {
        let inner = resource.lock_lists();
        inner
            .granted
            .iter()
            .filter(|l| {
                matches!(
                    l.granted_mode(),
                    LockMode::ProtectedWrite | LockMode::Exclusive | LockMode::ConcurrentWrite | LockMode::Group
                )
            })
            .max_by_key(|l| l.granted_mode() as u32)
            .cloned()
    }

    /// Queue a server-side cancel of a batch of locks onto the dispatch
    /// pool, e.g. to shed idle locks under memory pressure.
    pub async fn revoke_locks(&self, locks: Vec<Arc<Lock>>, sync: bool) -> Result<()> {
        self.dispatcher
            .submit(WorkKind::CancelBatch(locks), QueueClass::Normal, sync)
            .await
    }

    pub fn set_memory_pressure(&self, pressed: bool) {
        self.dispatcher.set_memory_pressure(pressed);
    }

    pub fn lookup(&self, handle: LockHandle) -> Option<Arc<Lock>> {
        self.registry.lookup(handle)
    }

    pub fn registry(&self) -> &LockRegistry {
        &self.registry
    }

    pub fn stats(&self) -> LockStats {
        let (granted_count, waiting_count) = self.registry.list_counts();
        LockStats {
            granted_total: self.counters.granted.load(Ordering::Relaxed),
            cancelled_total: self.counters.cancelled.load(Ordering::Relaxed),
            timed_out_total: self.tracker.expired_total(),
            evicted_exports: self.reaper.evicted_total(),
            blocking_asts_sent: self.dispatcher.blocking_sent(),
            completion_asts_sent: self.dispatcher.completion_sent(),
            glimpse_asts_sent: self.dispatcher.glimpse_sent(),
            granted_count,
            waiting_count,
            resource_count: self.registry.resource_count(),
            last_updated: SystemTime::now(),
        }
    }
}
