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

//! End-to-end lock lifecycle scenarios, driven through a scripted
//! callback client standing in for the real connections.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use ldlm::{
    CallbackClient, EnqueueFlags, EnqueueRequest, LdlmConfig, LockDescription, LockHandle, LockManager, LockMode,
    LockPolicy, RemoteHandle, ResendObserver, ResourceKey, ResourceType, Result,
};

/// Forwards every callback to the test over channels, so the test can play
/// the client's part (answer, dawdle, or never reply at all).
#[derive(Debug)]
struct ScriptedClient {
    blocking_tx: mpsc::UnboundedSender<LockDescription>,
    completion_tx: mpsc::UnboundedSender<LockDescription>,
    glimpse_payload: Vec<u8>,
}

#[async_trait]
impl CallbackClient for ScriptedClient {
    async fn blocking_ast(&self, _export_id: &str, desc: &LockDescription, _resend: Arc<dyn ResendObserver>) -> Result<()> {
        let _ = self.blocking_tx.send(desc.clone());
        Ok(())
    }

    async fn completion_ast(&self, _export_id: &str, desc: &LockDescription, _value_block: Option<Vec<u8>>) -> Result<()> {
        let _ = self.completion_tx.send(desc.clone());
        Ok(())
    }

    async fn glimpse_ast(&self, _export_id: &str, _desc: &LockDescription) -> Result<Vec<u8>> {
        Ok(self.glimpse_payload.clone())
    }
}

struct Harness {
    manager: Arc<LockManager>,
    blocking_rx: mpsc::UnboundedReceiver<LockDescription>,
    completion_rx: mpsc::UnboundedReceiver<LockDescription>,
}

fn harness() -> Harness {
    harness_with_payload(Vec::new())
}

fn harness_with_payload(glimpse_payload: Vec<u8>) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (blocking_tx, blocking_rx) = mpsc::unbounded_channel();
    let (completion_tx, completion_rx) = mpsc::unbounded_channel();
    let client = Arc::new(ScriptedClient {
        blocking_tx,
        completion_tx,
        glimpse_payload,
    });
    let manager = LockManager::new(LdlmConfig::minimal(), client).unwrap();
    manager.start().unwrap();
    Harness {
        manager,
        blocking_rx,
        completion_rx,
    }
}

fn request(resource: u64, mode: LockMode, remote: u64) -> EnqueueRequest {
    EnqueueRequest {
        resource: ResourceKey::new(resource, 1),
        rtype: ResourceType::Plain,
        mode,
        flags: EnqueueFlags::default(),
        policy: LockPolicy::Plain,
        remote_handle: RemoteHandle(remote),
        intent: None,
    }
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<LockDescription>) -> LockDescription {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("callback within the deadline")
        .expect("callback channel open")
}

/// Wait for a stats counter to reach `want`; under paused time the sleeps
/// drive the clock forward.
async fn wait_for(manager: &LockManager, want: u64, read: impl Fn(&LockManager) -> u64) {
    for _ in 0..600 {
        if read(manager) >= want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("counter never reached {want}");
}

#[tokio::test]
async fn scenario_uncontended_enqueue_grants_immediately() {
    let mut h = harness();
    h.manager.register_export("client-a");

    let reply = h.manager.enqueue("client-a", request(1, LockMode::ProtectedWrite, 1)).await.unwrap();
    assert!(reply.granted);
    assert_eq!(reply.mode, LockMode::ProtectedWrite);

    // No callbacks of any kind were needed
    assert!(h.blocking_rx.try_recv().is_err());
    assert!(h.completion_rx.try_recv().is_err());

    h.manager.cancel("client-a", &[reply.handle]).await.unwrap();
    h.manager.stop().await.unwrap();
}

#[tokio::test]
async fn scenario_conflict_revocation_and_handoff() {
    let mut h = harness();
    h.manager.register_export("client-a");
    h.manager.register_export("client-b");

    let held = h.manager.enqueue("client-a", request(1, LockMode::Exclusive, 1)).await.unwrap();
    assert!(held.granted);

    let waiter = h.manager.enqueue("client-b", request(1, LockMode::ProtectedRead, 2)).await.unwrap();
    assert!(!waiter.granted);

    // The server asked the holder to let go
    let asked = recv(&mut h.blocking_rx).await;
    assert_eq!(asked.handle, held.handle);

    // Playing the cooperative holder: cancel, like the real client would
    let reply = h.manager.cancel("client-a", &[held.handle]).await.unwrap();
    assert_eq!(reply.cancelled, 1);

    // The waiter is promoted and told so
    let promoted = recv(&mut h.completion_rx).await;
    assert_eq!(promoted.handle, waiter.handle);
    assert_eq!(promoted.granted_mode, LockMode::ProtectedRead);
    assert!(h.manager.lookup(waiter.handle).unwrap().is_granted());

    h.manager.cancel("client-b", &[waiter.handle]).await.unwrap();
    h.manager.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn scenario_unanswered_callback_evicts_the_holder() {
    let mut h = harness();
    h.manager.register_export("client-a");
    h.manager.register_export("client-b");

    let held = h.manager.enqueue("client-a", request(1, LockMode::Exclusive, 1)).await.unwrap();
    let waiter = h.manager.enqueue("client-b", request(1, LockMode::Exclusive, 2)).await.unwrap();
    assert!(held.granted && !waiter.granted);

    // The holder hears the revocation and ignores it
    let asked = recv(&mut h.blocking_rx).await;
    assert_eq!(asked.handle, held.handle);

    wait_for(&h.manager, 1, |m| m.stats().evicted_exports).await;

    let stats = h.manager.stats();
    assert!(stats.timed_out_total >= 1);
    assert_eq!(stats.evicted_exports, 1);
    assert!(h.manager.lookup(held.handle).is_none(), "the deaf holder's lock is gone");
    assert!(h.manager.export("client-a").is_none(), "its export is gone too");
    assert!(h.manager.lookup(waiter.handle).unwrap().is_granted());

    h.manager.cancel("client-b", &[waiter.handle]).await.unwrap();
    h.manager.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn scenario_many_expiries_one_eviction() {
    let mut h = harness();
    h.manager.register_export("client-a");
    h.manager.register_export("client-b");

    // The same deaf client holds three contended resources
    let mut held = Vec::new();
    for id in 1..=3u64 {
        let reply = h.manager.enqueue("client-a", request(id, LockMode::Exclusive, id)).await.unwrap();
        assert!(reply.granted);
        held.push(reply.handle);
        let blocked = h
            .manager
            .enqueue("client-b", request(id, LockMode::Exclusive, 100 + id))
            .await
            .unwrap();
        assert!(!blocked.granted);
        recv(&mut h.blocking_rx).await;
    }

    wait_for(&h.manager, 1, |m| m.stats().evicted_exports).await;
    // Let any straggling expiries drain through the reaper
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(h.manager.stats().timed_out_total >= 1);
    assert_eq!(h.manager.stats().evicted_exports, 1, "one sick client, one eviction");
    for handle in held {
        assert!(h.manager.lookup(handle).is_none());
    }

    // Every waiter got the resource
    let waiting = h.manager.stats().waiting_count;
    assert_eq!(waiting, 0);

    h.manager.disconnect_export("client-b").await.unwrap();
    h.manager.stop().await.unwrap();
}

#[derive(Debug)]
struct BusyOnce {
    consulted: AtomicU64,
}

impl ldlm::BusyPolicy for BusyOnce {
    fn is_busy(&self, _lock: &ldlm::Lock) -> bool {
        self.consulted.fetch_add(1, Ordering::Relaxed) == 0
    }
}

#[tokio::test(start_paused = true)]
async fn scenario_busy_holder_gets_one_extension_then_expires() {
    let (blocking_tx, mut blocking_rx) = mpsc::unbounded_channel();
    let (completion_tx, _completion_rx) = mpsc::unbounded_channel();
    let client = Arc::new(ScriptedClient {
        blocking_tx,
        completion_tx,
        glimpse_payload: Vec::new(),
    });
    let busy = Arc::new(BusyOnce {
        consulted: AtomicU64::new(0),
    });
    let manager = LockManager::builder(LdlmConfig::minimal(), client)
        .with_busy_policy(busy.clone())
        .build()
        .unwrap();
    manager.start().unwrap();

    manager.register_export("client-a");
    manager.register_export("client-b");
    let held = manager.enqueue("client-a", request(1, LockMode::Exclusive, 1)).await.unwrap();
    let waiter = manager.enqueue("client-b", request(1, LockMode::Exclusive, 2)).await.unwrap();
    assert!(held.granted && !waiter.granted);
    recv(&mut blocking_rx).await;

    wait_for(&manager, 1, |m| m.stats().evicted_exports).await;

    // First deadline was deferred, the second was final
    assert!(busy.consulted.load(Ordering::Relaxed) >= 2);
    assert!(manager.lookup(waiter.handle).unwrap().is_granted());

    manager.cancel("client-b", &[waiter.handle]).await.unwrap();
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn scenario_resent_enqueue_is_idempotent() {
    let h = harness();
    h.manager.register_export("client-a");

    let first = h.manager.enqueue("client-a", request(1, LockMode::ProtectedWrite, 7)).await.unwrap();

    let mut resent = request(1, LockMode::ProtectedWrite, 7);
    resent.flags.resent = true;
    let second = h.manager.enqueue("client-a", resent).await.unwrap();

    assert_eq!(second.handle, first.handle);
    assert!(second.granted);
    assert_eq!(h.manager.stats().granted_count, 1, "the retransmission made no second lock");

    h.manager.cancel("client-a", &[first.handle]).await.unwrap();
    h.manager.stop().await.unwrap();
}

#[tokio::test]
async fn scenario_glimpse_fetches_and_caches_attributes() {
    let h = harness_with_payload(vec![0xab, 0xcd]);
    h.manager.register_export("client-a");

    let key = ResourceKey::new(1, 1);
    let held = h.manager.enqueue("client-a", request(1, LockMode::ProtectedWrite, 1)).await.unwrap();
    assert!(held.granted);

    let bytes = h.manager.glimpse(key).await.unwrap();
    assert_eq!(bytes, vec![0xab, 0xcd]);
    assert_eq!(h.manager.stats().glimpse_asts_sent, 1);

    h.manager.cancel("client-a", &[held.handle]).await.unwrap();
    h.manager.stop().await.unwrap();
}

#[tokio::test]
async fn scenario_readers_share_while_writer_waits() {
    let mut h = harness();
    h.manager.register_export("client-a");
    h.manager.register_export("client-b");
    h.manager.register_export("client-c");

    let r1 = h.manager.enqueue("client-a", request(1, LockMode::ProtectedRead, 1)).await.unwrap();
    let r2 = h.manager.enqueue("client-b", request(1, LockMode::ProtectedRead, 2)).await.unwrap();
    assert!(r1.granted && r2.granted, "readers are compatible");

    let writer = h.manager.enqueue("client-c", request(1, LockMode::ProtectedWrite, 3)).await.unwrap();
    assert!(!writer.granted);

    // Both readers were asked to step aside
    let mut asked = vec![recv(&mut h.blocking_rx).await.handle, recv(&mut h.blocking_rx).await.handle];
    asked.sort();
    let mut expected = vec![r1.handle, r2.handle];
    expected.sort();
    assert_eq!(asked, expected);

    h.manager.cancel("client-a", &[r1.handle]).await.unwrap();
    assert!(!h.manager.lookup(writer.handle).unwrap().is_granted(), "one reader remains");
    h.manager.cancel("client-b", &[r2.handle]).await.unwrap();
    assert!(h.manager.lookup(writer.handle).unwrap().is_granted());

    h.manager.cancel("client-c", &[writer.handle]).await.unwrap();
    h.manager.stop().await.unwrap();
}

#[tokio::test]
async fn scenario_concurrent_read_waits_behind_exclusive() {
    let mut h = harness();
    h.manager.register_export("client-a");
    h.manager.register_export("client-b");

    let held = h.manager.enqueue("client-a", request(1, LockMode::Exclusive, 1)).await.unwrap();
    assert!(held.granted);

    // CR is the weakest real mode, but EX shares with nothing
    let reader = h.manager.enqueue("client-b", request(1, LockMode::ConcurrentRead, 2)).await.unwrap();
    assert!(!reader.granted, "CONCURRENT-READ must wait behind EXCLUSIVE");
    assert_eq!(recv(&mut h.blocking_rx).await.handle, held.handle);

    h.manager.cancel("client-a", &[held.handle]).await.unwrap();
    assert!(h.manager.lookup(reader.handle).unwrap().is_granted());

    h.manager.cancel("client-b", &[reader.handle]).await.unwrap();
    h.manager.stop().await.unwrap();
}

#[tokio::test]
async fn scenario_grant_order_respects_older_waiters() {
    let h = harness();
    h.manager.register_export("client-a");
    h.manager.register_export("client-b");
    h.manager.register_export("client-c");

    let held = h.manager.enqueue("client-a", request(1, LockMode::Exclusive, 1)).await.unwrap();
    let older = h.manager.enqueue("client-b", request(1, LockMode::Exclusive, 2)).await.unwrap();
    let newer = h.manager.enqueue("client-c", request(1, LockMode::ProtectedRead, 3)).await.unwrap();
    assert!(!older.granted && !newer.granted);

    h.manager.cancel("client-a", &[held.handle]).await.unwrap();

    // The exclusive waiter came first; the reader must not jump it
    assert!(h.manager.lookup(older.handle).unwrap().is_granted());
    assert!(!h.manager.lookup(newer.handle).unwrap().is_granted());

    h.manager.cancel("client-b", &[older.handle]).await.unwrap();
    assert!(h.manager.lookup(newer.handle).unwrap().is_granted());

    h.manager.cancel("client-c", &[newer.handle]).await.unwrap();
    h.manager.stop().await.unwrap();
}

#[tokio::test]
async fn scenario_group_locks_share_with_each_other_only() {
    let mut h = harness();
    h.manager.register_export("client-a");
    h.manager.register_export("client-b");
    h.manager.register_export("client-c");

    let g1 = h.manager.enqueue("client-a", request(1, LockMode::Group, 1)).await.unwrap();
    let g2 = h.manager.enqueue("client-b", request(1, LockMode::Group, 2)).await.unwrap();
    assert!(g1.granted && g2.granted);

    let reader = h.manager.enqueue("client-c", request(1, LockMode::ProtectedRead, 3)).await.unwrap();
    assert!(!reader.granted);
    // Group holders still hear about the conflict
    recv(&mut h.blocking_rx).await;

    h.manager.cancel("client-a", &[g1.handle]).await.unwrap();
    h.manager.cancel("client-b", &[g2.handle]).await.unwrap();
    assert!(h.manager.lookup(reader.handle).unwrap().is_granted());

    h.manager.cancel("client-c", &[reader.handle]).await.unwrap();
    h.manager.stop().await.unwrap();
}

#[tokio::test]
async fn scenario_parallel_enqueues_on_disjoint_resources() {
    let h = harness();
    let manager = h.manager.clone();

    const CLIENTS: u64 = 8;
    const PER_CLIENT: u64 = 125;

    for c in 0..CLIENTS {
        manager.register_export(&format!("client-{c}"));
    }

    let mut tasks = Vec::new();
    for c in 0..CLIENTS {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            let export = format!("client-{c}");
            let mut handles = Vec::new();
            for i in 0..PER_CLIENT {
                let id = c * PER_CLIENT + i + 1;
                let reply = manager.enqueue(&export, request(id, LockMode::Exclusive, id)).await.unwrap();
                assert!(reply.granted, "disjoint resources never conflict");
                handles.push(reply.handle);
            }
            (export, handles)
        }));
    }

    let mut all: Vec<(String, Vec<LockHandle>)> = Vec::new();
    for task in tasks {
        all.push(task.await.unwrap());
    }

    let stats = manager.stats();
    assert_eq!(stats.granted_total, CLIENTS * PER_CLIENT);
    assert_eq!(stats.resource_count as u64, CLIENTS * PER_CLIENT);

    for (export, handles) in all {
        let reply = manager.cancel(&export, &handles).await.unwrap();
        assert_eq!(reply.cancelled as u64, PER_CLIENT);
    }
    assert_eq!(manager.stats().resource_count, 0);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn scenario_disconnect_mid_contention() {
    let mut h = harness();
    h.manager.register_export("client-a");
    h.manager.register_export("client-b");

    let held = h.manager.enqueue("client-a", request(1, LockMode::Exclusive, 1)).await.unwrap();
    let waiter = h.manager.enqueue("client-b", request(1, LockMode::ProtectedWrite, 2)).await.unwrap();
    assert!(!waiter.granted);
    recv(&mut h.blocking_rx).await;

    // The holder's connection goes away instead of answering
    h.manager.disconnect_export("client-a").await.unwrap();

    assert!(h.manager.lookup(held.handle).is_none());
    assert!(h.manager.lookup(waiter.handle).unwrap().is_granted());
    let promoted = recv(&mut h.completion_rx).await;
    assert_eq!(promoted.handle, waiter.handle);

    h.manager.cancel("client-b", &[waiter.handle]).await.unwrap();
    h.manager.stop().await.unwrap();
}
