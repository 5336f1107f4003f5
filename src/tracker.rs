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

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::resource::Lock;
use crate::types::LockHandle;

/// Pluggable "busy export" predicate: a lock whose owner is actively
/// servicing related traffic gets its deadline extended instead of
/// expiring. What counts as busy is policy, not mechanism.
pub trait BusyPolicy: Send + Sync + fmt::Debug {
    fn is_busy(&self, lock: &Lock) -> bool;
}

/// Default policy: no lock is ever considered busy
#[derive(Debug, Default)]
pub struct NeverBusy;

impl BusyPolicy for NeverBusy {
    fn is_busy(&self, _lock: &Lock) -> bool {
        false
    }
}

#[derive(Debug)]
struct Tracked {
    lock: Arc<Lock>,
    timeout: Duration,
}

#[derive(Debug, Default)]
struct TrackerInner {
    /// Ordered by (whole-second deadline bucket, lock cookie). Bucketing
    /// coalesces timer re-arms under load.
    entries: BTreeMap<(u64, u64), Tracked>,
    index: HashMap<LockHandle, (u64, u64)>,
}

/// Ordered set of locks awaiting a client's callback reply, with a single
/// timer that fires at the earliest deadline.
///
/// A lock appears at most once; arming stores an extra `Arc` clone so the
/// record cannot be freed while the timer may still reference it.
#[derive(Debug)]
pub struct WaitingTracker {
    base: Instant,
    inner: Mutex<TrackerInner>,
    rearm: Notify,
    shutdown: AtomicBool,
    expired_tx: mpsc::UnboundedSender<Arc<Lock>>,
    busy_policy: Arc<dyn BusyPolicy>,
    busy_extension: Duration,
    expired_total: AtomicU64,
}

impl WaitingTracker {
    pub fn new(expired_tx: mpsc::UnboundedSender<Arc<Lock>>, busy_policy: Arc<dyn BusyPolicy>, busy_extension: Duration) -> Self {
        Self {
            base: Instant::now(),
            inner: Mutex::new(TrackerInner::default()),
            rearm: Notify::new(),
            shutdown: AtomicBool::new(false),
            expired_tx,
            busy_policy,
            busy_extension,
            expired_total: AtomicU64::new(0),
        }
    }

    /// Whole-second bucket for "now + timeout", rounded up
    fn bucket_after(&self, timeout: Duration) -> u64 {
        let offset = self.base.elapsed() + timeout;
        (offset.as_millis() as u64).div_ceil(1000)
    }

    fn current_bucket(&self) -> u64 {
        (self.base.elapsed().as_millis() as u64) / 1000
    }

    /// Track `lock` with a fresh deadline. Returns false without side
    /// effects if the lock is already tracked, or if it is GROUP mode
    /// (group locks are only ever released by owner action).
    pub fn arm(&self, lock: &Arc<Lock>, timeout: Duration) -> bool {
        if lock.requested_mode().is_group() {
            return false;
        }

        let mut inner = self.inner.lock();
        if inner.index.contains_key(&lock.handle()) {
            return false;
        }

        let key = (self.bucket_after(timeout), lock.handle().cookie());
        inner.index.insert(lock.handle(), key);
        inner.entries.insert(
            key,
            Tracked {
                lock: lock.clone(),
                timeout,
            },
        );
        drop(inner);

        debug!("armed {} for {:?}", lock.handle(), timeout);
        self.rearm.notify_one();
        true
    }

    /// Stop tracking `lock`, releasing the tracker's reference. Disarming
    /// an untracked lock is a no-op, not an error.
    pub fn disarm(&self, lock: &Lock) -> bool {
        let mut inner = self.inner.lock();
        let Some(key) = inner.index.remove(&lock.handle()) else {
            return false;
        };
        inner.entries.remove(&key);
        drop(inner);

        debug!("disarmed {}", lock.handle());
        self.rearm.notify_one();
        true
    }

    /// Push the deadline out without dropping and re-taking the tracked
    /// reference; used when a callback RPC is retransmitted.
    pub fn refresh(&self, lock: &Lock, new_timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        let Some(old_key) = inner.index.remove(&lock.handle()) else {
            return false;
        };
        let tracked = inner.entries.remove(&old_key).expect("index and entries agree");

        let key = (self.bucket_after(new_timeout), lock.handle().cookie());
        inner.index.insert(lock.handle(), key);
        inner.entries.insert(
            key,
            Tracked {
                lock: tracked.lock,
                timeout: new_timeout,
            },
        );
        drop(inner);

        debug!("refreshed {} to {:?}", lock.handle(), new_timeout);
        self.rearm.notify_one();
        true
    }

    pub fn is_armed(&self, handle: LockHandle) -> bool {
        self.inner.lock().index.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Earliest deadline bucket, if any lock is tracked
    fn earliest(&self) -> Option<u64> {
        self.inner.lock().entries.keys().next().map(|(bucket, _)| *bucket)
    }

    pub fn expired_total(&self) -> u64 {
        self.expired_total.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.rearm.notify_one();
    }

    /// Timer loop: sleeps until the earliest deadline, processes every lock
    /// whose bucket has passed, re-arms to the new earliest. Never blocks
    /// on anything but time; expired locks are handed off over a channel.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                debug!("waiting-lock timer shutting down");
                break;
            }

            match self.earliest() {
                None => self.rearm.notified().await,
                Some(bucket) => {
                    let wake_at = self.base + Duration::from_secs(bucket);
                    tokio::select! {
                        _ = sleep_until(wake_at) => self.fire(),
                        _ = self.rearm.notified() => {}
                    }
                }
            }
        }
    }

    /// Process every entry whose deadline has passed, in deadline order.
    fn fire(&self) {
        let now_bucket = self.current_bucket();
        let mut expired = Vec::new();
        let mut extended = Vec::new();

        {
            let mut inner = self.inner.lock();
            while let Some((&key, _)) = inner.entries.iter().next() {
                if key.0 > now_bucket {
                    break;
                }
                let tracked = inner.entries.remove(&key).expect("key just observed");
                inner.index.remove(&tracked.lock.handle());

                if self.busy_policy.is_busy(&tracked.lock) {
                    extended.push(tracked);
                } else {
                    expired.push(tracked.lock);
                }
            }

            // Busy owners get more time rather than an eviction
            for tracked in extended {
                let key = (self.bucket_after(self.busy_extension), tracked.lock.handle().cookie());
                debug!("extending busy {}", tracked.lock.handle());
                inner.index.insert(tracked.lock.handle(), key);
                inner.entries.insert(key, tracked);
            }
        }

        for lock in expired {
            warn!("{lock} timed out waiting for its callback reply");
            self.expired_total.fetch_add(1, Ordering::Relaxed);
            if self.expired_tx.send(lock).is_err() {
                warn!("expired-lock channel closed; reaper is gone");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::Export;
    use crate::resource::Resource;
    use crate::types::{LockMode, LockPolicy, RemoteHandle, ResourceKey, ResourceType};
    use tokio::time::{advance, timeout};

    fn make_lock(cookie: u64, mode: LockMode) -> Arc<Lock> {
        let export = Arc::new(Export::new(format!("client-{cookie}"), 64));
        let resource = Arc::new(Resource::new(ResourceKey::new(cookie, 1), ResourceType::Plain));
        Arc::new(Lock::new(
            LockHandle::new(cookie),
            RemoteHandle(cookie),
            resource,
            &export,
            mode,
            LockPolicy::Plain,
        ))
    }

    fn make_tracker(policy: Arc<dyn BusyPolicy>) -> (Arc<WaitingTracker>, mpsc::UnboundedReceiver<Arc<Lock>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(WaitingTracker::new(tx, policy, Duration::from_secs(2))), rx)
    }

    #[tokio::test]
    async fn test_arm_is_idempotent() {
        let (tracker, _rx) = make_tracker(Arc::new(NeverBusy));
        let lock = make_lock(1, LockMode::Exclusive);

        assert!(tracker.arm(&lock, Duration::from_secs(5)));
        assert!(!tracker.arm(&lock, Duration::from_secs(5)), "double arm must be refused");
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_group_locks_are_never_armed() {
        let (tracker, _rx) = make_tracker(Arc::new(NeverBusy));
        let lock = make_lock(1, LockMode::Group);

        assert!(!tracker.arm(&lock, Duration::from_secs(5)));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_arm_disarm_round_trip() {
        let (tracker, _rx) = make_tracker(Arc::new(NeverBusy));
        let lock = make_lock(1, LockMode::Exclusive);

        assert!(tracker.is_empty());
        assert!(tracker.arm(&lock, Duration::from_secs(5)));
        assert!(tracker.is_armed(lock.handle()));
        assert!(tracker.disarm(&lock));
        assert!(tracker.is_empty());
        assert!(!tracker.disarm(&lock), "disarming an untracked lock is a no-op");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_in_deadline_order() {
        let (tracker, mut rx) = make_tracker(Arc::new(NeverBusy));
        let timer = tokio::spawn(tracker.clone().run());

        let late = make_lock(2, LockMode::Exclusive);
        let early = make_lock(1, LockMode::Exclusive);
        // Armed out of order on purpose
        tracker.arm(&late, Duration::from_secs(10));
        tracker.arm(&early, Duration::from_secs(3));

        advance(Duration::from_secs(11)).await;

        let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.handle(), early.handle());
        assert_eq!(second.handle(), late.handle());
        assert!(tracker.is_empty());
        assert_eq!(tracker.expired_total(), 2);

        tracker.shutdown();
        timer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_lock_does_not_expire() {
        let (tracker, mut rx) = make_tracker(Arc::new(NeverBusy));
        let timer = tokio::spawn(tracker.clone().run());

        let lock = make_lock(1, LockMode::Exclusive);
        tracker.arm(&lock, Duration::from_secs(3));
        tracker.disarm(&lock);

        advance(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());

        tracker.shutdown();
        timer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_postpones_expiry() {
        let (tracker, mut rx) = make_tracker(Arc::new(NeverBusy));
        let timer = tokio::spawn(tracker.clone().run());

        let lock = make_lock(1, LockMode::Exclusive);
        tracker.arm(&lock, Duration::from_secs(3));
        assert!(tracker.refresh(&lock, Duration::from_secs(30)));

        advance(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err(), "refreshed lock must not expire at the old deadline");
        assert!(tracker.is_armed(lock.handle()));

        advance(Duration::from_secs(25)).await;
        let expired = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(expired.handle(), lock.handle());

        tracker.shutdown();
        timer.await.unwrap();
    }

    #[derive(Debug)]
    struct BusyOnce {
        fired: AtomicBool,
    }

    impl BusyPolicy for BusyOnce {
        fn is_busy(&self, _lock: &Lock) -> bool {
            !self.fired.swap(true, Ordering::AcqRel)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_lock_is_extended_then_expires() {
        let policy = Arc::new(BusyOnce {
            fired: AtomicBool::new(false),
        });
        let (tracker, mut rx) = make_tracker(policy);
        let timer = tokio::spawn(tracker.clone().run());
        tokio::task::yield_now().await;

        let lock = make_lock(1, LockMode::Exclusive);
        tracker.arm(&lock, Duration::from_secs(3));
        // Let the timer task register its sleep before the clock moves
        tokio::task::yield_now().await;

        // First deadline: busy, extended instead of expired
        advance(Duration::from_secs(4)).await;
        // Let the timer task process the first deadline before advancing again
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert!(tracker.is_armed(lock.handle()));

        // Extension elapses with the export now idle
        advance(Duration::from_secs(3)).await;
        let expired = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(expired.handle(), lock.handle());

        tracker.shutdown();
        timer.await.unwrap();
    }
}
