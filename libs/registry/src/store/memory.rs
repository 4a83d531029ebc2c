//! In-memory [`KvStore`] with lease semantics.
//!
//! Keys attached to a lease vanish when the lease is revoked, writes under an
//! unknown lease fail the way etcd fails them, and watches see every change.
//! Lease TTLs are not timed: tests expire leases explicitly with
//! [`MemoryStore::revoke`] or [`MemoryStore::expire_unrenewed`].
//!
//! Every handle returned by [`MemoryStore::connect`] is a separate session over
//! the same data, so closing one does not affect reads through another.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::{EventKind, KvStore, LeaseId, Record, Renewal, WatchEvent, WatchStream};

const EVENT_CHANNEL_SIZE: usize = 1024;

/// Store operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Grant,
    Put,
    Delete,
    Get,
    KeepAlive,
    Watch,
}

#[derive(Debug)]
struct Entry {
    value: String,
    lease: LeaseId,
}

#[derive(Debug)]
struct MemoryLease {
    ttl_secs: i64,
    keys: BTreeSet<String>,
    renewals: Vec<CancellationToken>,
}

impl MemoryLease {
    fn is_renewing(&self) -> bool {
        self.renewals.iter().any(|t| !t.is_cancelled())
    }
}

#[derive(Debug, Default)]
struct Inner {
    data: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, MemoryLease>,
    next_lease: i64,
    faults: HashMap<Op, u32>,
    latency: Option<Duration>,
}

impl Inner {
    fn take_fault(&mut self, op: Op) -> bool {
        match self.faults.get_mut(&op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    fn remove_key(&mut self, key: &str, events: &broadcast::Sender<WatchEvent>) -> bool {
        let Some(entry) = self.data.remove(key) else {
            return false;
        };
        if let Some(lease) = self.leases.get_mut(&entry.lease) {
            lease.keys.remove(key);
        }
        // no receivers is fine
        let _ = events.send(WatchEvent {
            kind: EventKind::Delete,
            key: key.to_owned(),
            value: String::new(),
        });
        true
    }

    fn revoke(&mut self, lease: LeaseId, events: &broadcast::Sender<WatchEvent>) -> bool {
        let Some(removed) = self.leases.remove(&lease) else {
            return false;
        };
        for token in &removed.renewals {
            token.cancel();
        }
        for key in &removed.keys {
            self.remove_key(key, events);
        }
        true
    }
}

#[derive(Debug)]
struct Shared {
    inner: Mutex<Inner>,
    events: broadcast::Sender<WatchEvent>,
    calls: AtomicUsize,
}

/// In-memory lease-capable key-value store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    next_lease: 1,
                    ..Default::default()
                }),
                events,
                calls: AtomicUsize::new(0),
            }),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Open a new session over the same data.
    pub fn connect(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call, apply latency, and fail if closed or a fault is armed.
    async fn enter(&self, op: Op) -> StoreResult<()> {
        self.shared.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if self.lock().take_fault(op) {
            debug!(?op, "injected memory store failure");
            return Err(StoreError::Transport(format!("injected {op:?} failure")));
        }
        Ok(())
    }

    /// Make the next `n` calls of `op` fail with a transport error.
    pub fn fail_next(&self, op: Op, n: u32) {
        *self.lock().faults.entry(op).or_default() += n;
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Number of trait operations invoked across every session.
    pub fn calls(&self) -> usize {
        self.shared.calls.load(Ordering::SeqCst)
    }

    /// Revoke `lease` as if it expired: its keys are deleted and its renewals stop.
    pub fn revoke(&self, lease: LeaseId) -> bool {
        self.lock().revoke(lease, &self.shared.events)
    }

    /// Revoke every lease nobody is renewing, as if their TTL elapsed.
    pub fn expire_unrenewed(&self) -> usize {
        let mut inner = self.lock();
        let idle = inner
            .leases
            .iter()
            .filter(|(_, lease)| !lease.is_renewing())
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for lease in &idle {
            inner.revoke(*lease, &self.shared.events);
        }
        idle.len()
    }

    /// The value stored at `key`, bypassing sessions and faults.
    pub fn value(&self, key: &str) -> Option<String> {
        self.lock().data.get(key).map(|e| e.value.clone())
    }

    /// The lease `key` is attached to, bypassing sessions and faults.
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        self.lock().data.get(key).map(|e| e.lease)
    }

    pub fn lease_exists(&self, lease: LeaseId) -> bool {
        self.lock().leases.contains_key(&lease)
    }

    pub fn is_renewing(&self, lease: LeaseId) -> bool {
        self.lock()
            .leases
            .get(&lease)
            .is_some_and(MemoryLease::is_renewing)
    }

    pub fn lease_ttl(&self, lease: LeaseId) -> Option<i64> {
        self.lock().leases.get(&lease).map(|l| l.ttl_secs)
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn key_matches(candidate: &str, key: &str, prefix: bool) -> bool {
    if prefix {
        candidate.starts_with(key)
    } else {
        candidate == key
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn grant_lease(&self, ttl_secs: i64) -> StoreResult<LeaseId> {
        self.enter(Op::Grant).await?;
        if ttl_secs <= 0 {
            return Err(StoreError::Transport(format!("invalid lease ttl {ttl_secs}")));
        }
        let mut inner = self.lock();
        let id = LeaseId::new(inner.next_lease);
        inner.next_lease += 1;
        inner.leases.insert(
            id,
            MemoryLease {
                ttl_secs,
                keys: BTreeSet::new(),
                renewals: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()> {
        self.enter(Op::Put).await?;
        let lease = lease.unwrap_or(LeaseId::NONE);
        let mut inner = self.lock();
        if !lease.is_none() && !inner.leases.contains_key(&lease) {
            return Err(StoreError::LeaseNotFound(lease));
        }
        let previous = inner.data.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                lease,
            },
        );
        if let Some(previous) = previous.filter(|p| p.lease != lease) {
            if let Some(old) = inner.leases.get_mut(&previous.lease) {
                old.keys.remove(key);
            }
        }
        if let Some(current) = inner.leases.get_mut(&lease) {
            current.keys.insert(key.to_owned());
        }
        let _ = self.shared.events.send(WatchEvent {
            kind: EventKind::Put,
            key: key.to_owned(),
            value: value.to_owned(),
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.enter(Op::Delete).await?;
        self.lock().remove_key(key, &self.shared.events);
        Ok(())
    }

    async fn get(&self, key: &str, prefix: bool) -> StoreResult<Vec<Record>> {
        self.enter(Op::Get).await?;
        let inner = self.lock();
        let records = if prefix {
            inner
                .data
                .range(key.to_owned()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(k, e)| Record {
                    key: k.clone(),
                    value: e.value.clone(),
                    lease: e.lease,
                })
                .collect()
        } else {
            inner
                .data
                .get(key)
                .map(|e| Record {
                    key: key.to_owned(),
                    value: e.value.clone(),
                    lease: e.lease,
                })
                .into_iter()
                .collect()
        };
        Ok(records)
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<Renewal> {
        self.enter(Op::KeepAlive).await?;
        let mut inner = self.lock();
        let Some(entry) = inner.leases.get_mut(&lease) else {
            return Err(StoreError::LeaseNotFound(lease));
        };
        let token = self.shutdown.child_token();
        entry.renewals.push(token.clone());
        Ok(Renewal::new(lease, token))
    }

    async fn watch(&self, key: &str, prefix: bool) -> StoreResult<WatchStream> {
        self.enter(Op::Watch).await?;
        let rx = self.shared.events.subscribe();
        let key = key.to_owned();
        let events = futures::stream::unfold(rx, move |mut rx| {
            let key = key.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(event) if key_matches(&event.key, &key, prefix) => {
                            return Some((Ok(event), rx));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            return Some((
                                Err(StoreError::Transport(format!(
                                    "watch lagged behind by {n} events"
                                ))),
                                rx,
                            ));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(events
            .take_until(self.shutdown.clone().cancelled_owned())
            .boxed())
    }

    async fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        self.shutdown.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_under_unknown_lease_fails() {
        let store = MemoryStore::new();
        let err = store
            .put("/svc/a", "1", Some(LeaseId::new(42)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseNotFound(l) if l == LeaseId::new(42)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_zero_lease_never_expires() {
        let store = MemoryStore::new();
        store.put("/svc/a", "1", None).await.unwrap();
        assert_eq!(store.lease_of("/svc/a"), Some(LeaseId::NONE));
        assert_eq!(store.expire_unrenewed(), 0);
        assert_eq!(store.value("/svc/a").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_revoke_removes_attached_keys() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(5).await.unwrap();
        assert_eq!(store.lease_ttl(lease), Some(5));
        store.put("/svc/a", "1", Some(lease)).await.unwrap();
        store.put("/svc/b", "2", Some(lease)).await.unwrap();
        store.put("/other", "3", None).await.unwrap();

        assert!(store.revoke(lease));
        assert!(!store.lease_exists(lease));
        assert_eq!(store.value("/svc/a"), None);
        assert_eq!(store.value("/svc/b"), None);
        assert_eq!(store.value("/other").as_deref(), Some("3"));
        assert!(!store.revoke(lease));
    }

    #[tokio::test]
    async fn test_rewrite_moves_key_between_leases() {
        let store = MemoryStore::new();
        let first = store.grant_lease(5).await.unwrap();
        let second = store.grant_lease(5).await.unwrap();
        store.put("/svc/a", "1", Some(first)).await.unwrap();
        store.put("/svc/a", "2", Some(second)).await.unwrap();

        // the first lease no longer owns the key
        store.revoke(first);
        assert_eq!(store.value("/svc/a").as_deref(), Some("2"));
        assert_eq!(store.lease_of("/svc/a"), Some(second));
    }

    #[tokio::test]
    async fn test_prefix_get() {
        let store = MemoryStore::new();
        for (k, v) in [("/svc/a", "1"), ("/svc/b", "2"), ("/svd/c", "3")] {
            store.put(k, v, None).await.unwrap();
        }
        let records = store.get("/svc/", true).await.unwrap();
        let keys = records.iter().map(|r| r.key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, ["/svc/a", "/svc/b"]);

        assert!(store.get("/nothing/", true).await.unwrap().is_empty());
        assert!(store.get("/svc", false).await.unwrap().is_empty());
        assert_eq!(store.get("/svc/b", false).await.unwrap()[0].value, "2");
    }

    #[tokio::test]
    async fn test_keep_alive_and_expiry() {
        let store = MemoryStore::new();
        let renewed = store.grant_lease(5).await.unwrap();
        let idle = store.grant_lease(5).await.unwrap();
        let renewal = store.keep_alive(renewed).await.unwrap();
        assert!(store.is_renewing(renewed));
        assert!(!store.is_renewing(idle));

        assert_eq!(store.expire_unrenewed(), 1);
        assert!(store.lease_exists(renewed));
        assert!(!store.lease_exists(idle));

        drop(renewal);
        assert!(!store.is_renewing(renewed));
        assert!(matches!(
            store.keep_alive(idle).await,
            Err(StoreError::LeaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next(Op::Put, 2);
        assert!(store.put("/a", "1", None).await.is_err());
        assert!(store.put("/a", "1", None).await.is_err());
        assert!(store.put("/a", "1", None).await.is_ok());
        assert_eq!(store.calls(), 3);
    }

    #[tokio::test]
    async fn test_close_is_per_session() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(5).await.unwrap();
        let renewal = store.keep_alive(lease).await.unwrap();
        store.put("/a", "1", Some(lease)).await.unwrap();

        store.close().await.unwrap();
        assert!(store.is_closed());
        assert!(renewal.is_stopped());
        assert!(matches!(store.get("/a", false).await, Err(StoreError::Closed)));
        assert!(matches!(store.close().await, Err(StoreError::Closed)));

        let fresh = store.connect();
        assert_eq!(fresh.get("/a", false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watch_prefix_and_close() {
        let store = MemoryStore::new();
        let mut events = store.watch("/svc/", true).await.unwrap();

        store.put("/other", "x", None).await.unwrap();
        store.put("/svc/a", "1", None).await.unwrap();
        store.delete("/svc/a").await.unwrap();

        let put = events.next().await.unwrap().unwrap();
        assert_eq!(put.kind, EventKind::Put);
        assert_eq!(put.key, "/svc/a");
        assert_eq!(put.value, "1");
        let del = events.next().await.unwrap().unwrap();
        assert_eq!(del.kind, EventKind::Delete);
        assert_eq!(del.key, "/svc/a");

        store.close().await.unwrap();
        assert!(events.next().await.is_none());
    }
}
