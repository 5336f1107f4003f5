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
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::client::{CallbackClient, ResendObserver};
use crate::config::{DispatchConfig, LdlmConfig};
use crate::error::{LockError, Result};
use crate::resource::Lock;
use crate::tracker::WaitingTracker;
use crate::types::flags;

/// Which queue a work item lands on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueClass {
    /// Must preempt ordinary traffic (e.g. data must be discarded before a
    /// destructive operation proceeds)
    Priority,
    Normal,
}

/// One unit of callback work
#[derive(Debug)]
pub enum WorkKind {
    /// Send a blocking AST to the lock's export and start its wait timeout
    Blocking(Arc<Lock>),
    /// Notify the export that its lock is granted
    Completion(Arc<Lock>),
    /// Synchronously fetch fresh attributes for the lock's resource
    Glimpse {
        lock: Arc<Lock>,
        reply: oneshot::Sender<Vec<u8>>,
    },
    /// Cancel a batch of locks together
    CancelBatch(Vec<Arc<Lock>>),
    /// Sentinel: the worker picking this up exits
    Deactivate,
}

struct WorkItem {
    kind: WorkKind,
    done: Option<oneshot::Sender<()>>,
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("kind", &self.kind)
            .field("sync", &self.done.is_some())
            .finish()
    }
}

/// Back-calls from the dispatch pool into the grant machinery. The manager
/// installs these; they cancel failed locks, regrant their waiters and
/// schedule evictions without the pool knowing the registry.
#[async_trait]
pub trait AstHooks: Send + Sync + fmt::Debug {
    /// Cancel one lock whose callback failed and regrant its waiters
    async fn cancel_after_failure(&self, lock: &Arc<Lock>);

    /// Cancel a batch together, reprocessing each resource once
    async fn cancel_batch(&self, locks: &[Arc<Lock>]);

    /// The lock's client is unreachable; queue its export for eviction
    fn schedule_eviction(&self, lock: &Arc<Lock>);
}

#[derive(Default)]
struct Queues {
    priority: VecDeque<WorkItem>,
    normal: VecDeque<WorkItem>,
}

/// Bounded worker pool executing callback RPCs off the RPC-handling
/// threads. Grows with queue depth up to a cap, shrinks via `Deactivate`
/// sentinels, and never starves the normal queue behind priority work.
pub struct AstDispatcher {
    queues: Mutex<Queues>,
    available: Notify,
    workers: AtomicUsize,
    cfg: DispatchConfig,
    blocking_timeout: Duration,
    completion_timeout: Duration,
    glimpse_timeout: Duration,
    memory_pressure: AtomicBool,
    shutdown: AtomicBool,
    client: Arc<dyn CallbackClient>,
    tracker: Arc<WaitingTracker>,
    hooks: OnceCell<Arc<dyn AstHooks>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    blocking_sent: AtomicU64,
    completion_sent: AtomicU64,
    glimpse_sent: AtomicU64,
}

impl fmt::Debug for AstDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AstDispatcher")
            .field("workers", &self.workers.load(Ordering::Relaxed))
            .field("queue_depth", &self.queue_depth())
            .finish()
    }
}

/// Refreshes the tracker entry when the RPC layer retransmits, instead of
/// re-arming it from zero.
struct TrackerRefresh {
    tracker: Arc<WaitingTracker>,
    lock: Arc<Lock>,
    timeout: Duration,
}

impl ResendObserver for TrackerRefresh {
    fn on_resend(&self) {
        self.tracker.refresh(&self.lock, self.timeout);
    }
}

impl AstDispatcher {
    pub fn new(config: &LdlmConfig, client: Arc<dyn CallbackClient>, tracker: Arc<WaitingTracker>) -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(Queues::default()),
            available: Notify::new(),
            workers: AtomicUsize::new(0),
            cfg: config.dispatch.clone(),
            blocking_timeout: config.blocking_timeout,
            completion_timeout: config.completion_timeout,
            glimpse_timeout: config.glimpse_timeout,
            memory_pressure: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            client,
            tracker,
            hooks: OnceCell::new(),
            handles: Mutex::new(Vec::new()),
            blocking_sent: AtomicU64::new(0),
            completion_sent: AtomicU64::new(0),
            glimpse_sent: AtomicU64::new(0),
        })
    }

    /// Install the grant-machinery hooks; must happen before `start`
    pub fn set_hooks(&self, hooks: Arc<dyn AstHooks>) {
        if self.hooks.set(hooks).is_err() {
            warn!("dispatch hooks installed twice; keeping the first");
        }
    }

    pub fn start(self: &Arc<Self>) {
        for _ in 0..self.cfg.min_workers {
            self.spawn_worker();
        }
    }

    /// Drain outstanding work and stop every worker
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        let worker_count = self.workers.load(Ordering::Acquire);
        {
            let mut queues = self.queues.lock();
            for _ in 0..worker_count {
                queues.normal.push_back(WorkItem {
                    kind: WorkKind::Deactivate,
                    done: None,
                });
            }
        }
        self.available.notify_waiters();
        for _ in 0..worker_count {
            self.available.notify_one();
        }

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Enqueue a unit of callback work. With `sync` the caller blocks until
    /// the worker finished it; otherwise the item self-frees on completion.
    pub async fn submit(self: &Arc<Self>, kind: WorkKind, class: QueueClass, sync: bool) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(LockError::ShutDown);
        }

        let (done, wait) = if sync {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        {
            let mut queues = self.queues.lock();
            let item = WorkItem { kind, done };
            match class {
                QueueClass::Priority => queues.priority.push_back(item),
                QueueClass::Normal => queues.normal.push_back(item),
            }
        }
        self.available.notify_one();
        self.maybe_grow();

        if let Some(rx) = wait {
            rx.await.map_err(|_| LockError::internal("dispatch worker dropped a sync work item"))?;
        }
        Ok(())
    }

    pub fn queue_depth(&self) -> usize {
        let queues = self.queues.lock();
        queues.priority.len() + queues.normal.len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.load(Ordering::Acquire)
    }

    /// Suppresses pool growth while set
    pub fn set_memory_pressure(&self, pressed: bool) {
        self.memory_pressure.store(pressed, Ordering::Release);
    }

    pub fn blocking_sent(&self) -> u64 {
        self.blocking_sent.load(Ordering::Relaxed)
    }

    pub fn completion_sent(&self) -> u64 {
        self.completion_sent.load(Ordering::Relaxed)
    }

    pub fn glimpse_sent(&self) -> u64 {
        self.glimpse_sent.load(Ordering::Relaxed)
    }

    /// Ask one worker to exit once it reaches the sentinel
    pub fn shrink_one(&self) {
        self.queues.lock().normal.push_back(WorkItem {
            kind: WorkKind::Deactivate,
            done: None,
        });
        self.available.notify_one();
    }

    fn maybe_grow(self: &Arc<Self>) {
        if self.shutdown.load(Ordering::Acquire) || self.memory_pressure.load(Ordering::Acquire) {
            return;
        }
        if self.queue_depth() > self.cfg.grow_threshold && self.workers.load(Ordering::Acquire) < self.cfg.max_workers {
            debug!("dispatch queue deep, growing pool to {}", self.workers.load(Ordering::Acquire) + 1);
            self.spawn_worker();
        }
    }

    fn spawn_worker(self: &Arc<Self>) {
        self.workers.fetch_add(1, Ordering::AcqRel);
        let pool = self.clone();
        let handle = tokio::spawn(pool.worker_loop());
        self.handles.lock().push(handle);
    }

    /// Pop the next item, draining priority first but serving at least one
    /// normal item per `pool size` priority items so the normal queue's
    /// latency stays bounded.
    fn try_pop(&self, priority_streak: &mut usize) -> Option<WorkItem> {
        let mut queues = self.queues.lock();
        let pool_size = self.workers.load(Ordering::Acquire).max(1);

        if *priority_streak >= pool_size {
            if let Some(item) = queues.normal.pop_front() {
                *priority_streak = 0;
                return Some(item);
            }
        }
        if let Some(item) = queues.priority.pop_front() {
            *priority_streak += 1;
            return Some(item);
        }
        if let Some(item) = queues.normal.pop_front() {
            *priority_streak = 0;
            return Some(item);
        }
        None
    }

    async fn worker_loop(self: Arc<Self>) {
        let mut priority_streak = 0usize;
        loop {
            let item = loop {
                if let Some(item) = self.try_pop(&mut priority_streak) {
                    break item;
                }
                self.available.notified().await;
            };

            match item.kind {
                WorkKind::Deactivate => {
                    self.workers.fetch_sub(1, Ordering::AcqRel);
                    debug!("dispatch worker deactivating");
                    if let Some(done) = item.done {
                        let _ = done.send(());
                    }
                    return;
                }
                kind => {
                    self.execute(kind).await;
                    if let Some(done) = item.done {
                        let _ = done.send(());
                    }
                }
            }
        }
    }

    async fn execute(&self, kind: WorkKind) {
        match kind {
            WorkKind::Blocking(lock) => self.run_blocking(lock).await,
            WorkKind::Completion(lock) => self.run_completion(lock).await,
            WorkKind::Glimpse { lock, reply } => self.run_glimpse(lock, reply).await,
            WorkKind::CancelBatch(locks) => {
                if let Some(hooks) = self.hooks.get() {
                    hooks.cancel_batch(&locks).await;
                }
            }
            WorkKind::Deactivate => unreachable!("handled by the worker loop"),
        }
    }

    async fn run_blocking(&self, lock: Arc<Lock>) {
        if lock.is_destroyed() {
            debug!("skipping blocking AST for destroyed {lock}");
            return;
        }
        // A holder already giving the lock up needs no reminder
        if lock.is_cancelling() {
            debug!("skipping blocking AST for cancelling {lock}");
            return;
        }
        lock.set_flags(flags::AST_SENT);
        if let Some(export) = lock.export() {
            export.note_blocked(lock.handle());
        }

        // Armed on send: the client's answer is a later cancel or convert,
        // not this RPC's ack.
        self.tracker.arm(&lock, self.blocking_timeout);
        self.blocking_sent.fetch_add(1, Ordering::Relaxed);

        let resend: Arc<dyn ResendObserver> = Arc::new(TrackerRefresh {
            tracker: self.tracker.clone(),
            lock: lock.clone(),
            timeout: self.blocking_timeout,
        });
        let desc = lock.description();
        let sent = timeout(self.blocking_timeout, self.client.blocking_ast(lock.export_id(), &desc, resend)).await;

        match sent {
            Ok(Ok(())) => debug!("blocking AST acknowledged for {}", lock.handle()),
            Ok(Err(err)) => self.handle_failure(&lock, err).await,
            Err(_) => {
                let err = LockError::callback_timeout(lock.handle(), self.blocking_timeout);
                self.handle_failure(&lock, err).await;
            }
        }
    }

    async fn run_completion(&self, lock: Arc<Lock>) {
        if lock.is_destroyed() {
            debug!("skipping completion AST for destroyed {lock}");
            return;
        }

        self.tracker.arm(&lock, self.completion_timeout);
        self.completion_sent.fetch_add(1, Ordering::Relaxed);

        let desc = lock.description();
        let value_block = lock.resource().value_block();
        let sent = timeout(
            self.completion_timeout,
            self.client.completion_ast(lock.export_id(), &desc, value_block),
        )
        .await;

        match sent {
            Ok(Ok(())) => {
                // The grant notification was acknowledged; nothing left to wait for
                self.tracker.disarm(&lock);
                debug!("completion AST acknowledged for {}", lock.handle());
            }
            Ok(Err(err)) => self.handle_failure(&lock, err).await,
            Err(_) => {
                let err = LockError::callback_timeout(lock.handle(), self.completion_timeout);
                self.handle_failure(&lock, err).await;
            }
        }
    }

    /// Glimpse is awaited by the submitter with its own short deadline and
    /// never enters the timeout tracker. On failure the cached value block
    /// stands in; a stale attribute beats a failed enqueue.
    async fn run_glimpse(&self, lock: Arc<Lock>, reply: oneshot::Sender<Vec<u8>>) {
        self.glimpse_sent.fetch_add(1, Ordering::Relaxed);
        let desc = lock.description();
        let resource = lock.resource();

        let fetched = timeout(self.glimpse_timeout, self.client.glimpse_ast(lock.export_id(), &desc)).await;
        let bytes = match fetched {
            Ok(Ok(bytes)) => {
                resource.set_value_block(bytes.clone());
                bytes
            }
            Ok(Err(err)) => {
                warn!("glimpse AST for {} failed: {err}; using cached attributes", lock.handle());
                resource.value_block().unwrap_or_default()
            }
            Err(_) => {
                warn!("glimpse AST for {} timed out; using cached attributes", lock.handle());
                resource.value_block().unwrap_or_default()
            }
        };
        let _ = reply.send(bytes);
    }

    async fn handle_failure(&self, lock: &Arc<Lock>, err: LockError) {
        warn!("callback for {} failed: {err}", lock.handle());
        let evict = err.requires_eviction();

        if let Some(hooks) = self.hooks.get() {
            hooks.cancel_after_failure(lock).await;
            if evict {
                hooks.schedule_eviction(lock);
            }
        }
    }
}
