//! Abstract key-value store interface consumed by the registry.
//!
//! The registry only needs lease grant, lease-tagged writes, deletes, point
//! and prefix reads, keep-alive and watch. `KvStore` captures exactly that so
//! the registration protocol can be exercised against [`MemoryStore`] in tests
//! and against etcd via [`EtcdStore`] in production.
//!
//! [`MemoryStore`]: memory::MemoryStore
//! [`EtcdStore`]: etcd::EtcdStore

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::StoreResult;

pub mod etcd;
pub mod memory;

/// Opaque lease identifier issued by the store.
///
/// Zero is reserved by etcd to mean "no lease": a key written with it never
/// expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(i64);

impl LeaseId {
    /// The "no lease" identifier.
    pub const NONE: LeaseId = LeaseId(0);

    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A single key/value record returned by a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub value: String,
    pub lease: LeaseId,
}

/// Kind of change delivered by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// A change notification. `value` is empty for deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    pub value: String,
}

/// Stream of change notifications. Ends when the subscription is cancelled
/// or the connection that produced it is closed; it is never restarted.
pub type WatchStream = BoxStream<'static, StoreResult<WatchEvent>>;

/// Handle to a running lease renewal.
///
/// Renewal keeps going until the lease is lost, the connection is closed, or
/// this handle is dropped.
#[derive(Debug)]
pub struct Renewal {
    lease: LeaseId,
    token: CancellationToken,
}

impl Renewal {
    pub fn new(lease: LeaseId, token: CancellationToken) -> Self {
        Self { lease, token }
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    /// Returns true once renewal has stopped for any reason.
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Renewal {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Operations the registry consumes from the backing store.
///
/// Implementations must be cheap to share across tasks; every method takes
/// `&self`.
#[async_trait]
pub trait KvStore: Send + Sync + fmt::Debug + 'static {
    /// Grant a new lease with the given TTL in seconds.
    async fn grant_lease(&self, ttl_secs: i64) -> StoreResult<LeaseId>;

    /// Write `key = value`, attached to `lease` when one is given.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Read `key`, or every key starting with `key` when `prefix` is set.
    async fn get(&self, key: &str, prefix: bool) -> StoreResult<Vec<Record>>;

    /// Start renewing `lease` in the background.
    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<Renewal>;

    /// Subscribe to changes of `key`, or of every key under it when `prefix` is set.
    async fn watch(&self, key: &str, prefix: bool) -> StoreResult<WatchStream>;

    /// Close the connection. Ends every watch and renewal obtained from it.
    async fn close(&self) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_id_none() {
        assert!(LeaseId::NONE.is_none());
        assert!(!LeaseId::new(1).is_none());
        assert_eq!(LeaseId::new(255).to_string(), "ff");
    }

    #[test]
    fn test_renewal_drop_cancels() {
        let token = CancellationToken::new();
        let renewal = Renewal::new(LeaseId::new(3), token.clone());
        assert!(!renewal.is_stopped());
        assert_eq!(renewal.lease(), LeaseId::new(3));
        drop(renewal);
        assert!(token.is_cancelled());
    }
}
