//! # registry
//!
//! Service registration and discovery over an etcd-style key-value store.
//!
//! This library provides:
//! - **Lease-backed registration**: a key is published under a fresh lease
//!   that is renewed for as long as the process holds it.
//! - **Self-healing updates**: when a publish under the current lease fails,
//!   the key is re-registered under a new lease instead of surfacing the
//!   error.
//! - **Discovery**: point reads, prefix reads and change subscriptions passed
//!   through to the store.
//! - **Orderly shutdown**: `close` deletes every registered key on a
//!   best-effort basis before closing the connection.
//!
//! The store is abstracted behind [`KvStore`]; [`EtcdStore`] talks to etcd and
//! [`MemoryStore`] keeps everything in process for tests.

pub mod error;
pub mod heartbeat;
mod ledger;
pub mod metrics;
pub mod registry;
pub mod store;

// Re-export key types for convenient access
pub use error::{RegistrationFailure, RegistryError, RegistryResult, StoreError, StoreResult};
pub use heartbeat::spawn_heartbeat;
pub use registry::{CloseSummary, Registry, RegistryOptions, WatchCallback};
pub use store::etcd::{ConnectionState, EtcdStore};
pub use store::memory::MemoryStore;
pub use store::{EventKind, KvStore, LeaseId, Record, Renewal, WatchEvent, WatchStream};
