//! Lease-backed registration with self-healing updates.
//!
//! # Invariant
//!
//! A key has a ledger entry only while it is published in the store under a
//! lease that is being renewed. `register` records the entry last, after the
//! grant, the publish and the renewal start all succeeded; `update` drops the
//! entry as soon as a publish under its lease fails and only re-creates it
//! through `register`.
//!
//! # Self-heal
//!
//! ```text
//! Bound(lease) --publish ok------> Bound(lease)
//! Bound(lease) --publish failed--> Unbound --register--> Bound(lease')
//! Unbound      --publish ok------> Unbound   (written without a lease)
//! Unbound      --publish failed--> Unbound --register--> Bound(lease')
//! ```
//!
//! The failure cause of the publish is not inspected: a transient transport
//! error re-registers exactly like an expired lease does.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use config::RegistryConfig;
use tracing::{debug, error, info, warn};

use crate::error::{RegistrationFailure, RegistryError, RegistryResult, StoreError, StoreResult};
use crate::ledger::{Binding, Ledger};
use crate::metrics;
use crate::store::etcd::EtcdStore;
use crate::store::{KvStore, LeaseId, WatchStream};

/// Callback handed the raw notification stream of a watch.
pub type WatchCallback = Box<dyn FnOnce(WatchStream) + Send>;

/// Outcome of [`Registry::close`].
#[derive(Debug, Default)]
pub struct CloseSummary {
    /// Keys deleted from the store.
    pub deleted: usize,
    /// Keys whose delete failed; they expire with their lease.
    pub failed: Vec<(String, StoreError)>,
}

impl CloseSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Where a key stands with respect to its lease, as seen by `update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    Bound(LeaseId),
    Unbound,
}

impl KeyState {
    fn lease(self) -> Option<LeaseId> {
        match self {
            KeyState::Bound(lease) => Some(lease),
            KeyState::Unbound => None,
        }
    }
}

/// Timing knobs the registry applies to its own store calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryOptions {
    /// TTL requested for every lease, in seconds.
    pub lease_ttl_secs: i64,
    /// Bound on every non-renewal store call.
    pub operation_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            lease_ttl_secs: config::DEFAULT_LEASE_TTL.as_secs() as i64,
            operation_timeout: config::DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

impl From<&RegistryConfig> for RegistryOptions {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            lease_ttl_secs: config.lease_ttl_secs(),
            operation_timeout: config.operation_timeout(),
        }
    }
}

/// Service registry over one store connection.
///
/// Share it behind an `Arc`; every operation takes `&self`. After
/// [`close`](Registry::close) every operation returns [`RegistryError::Closed`].
pub struct Registry<S> {
    store: S,
    ledger: Ledger,
    options: RegistryOptions,
    closed: AtomicBool,
}

impl<S: fmt::Debug> fmt::Debug for Registry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("store", &self.store)
            .field("options", &self.options)
            .field("registered", &self.ledger.len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Registry<EtcdStore> {
    /// Dial etcd per `config` and build a registry over the connection.
    pub async fn connect(config: RegistryConfig) -> RegistryResult<Self> {
        let options = RegistryOptions::from(&config);
        let store = EtcdStore::open(config)
            .await
            .map_err(|err| RegistryError::Connect(err.to_string()))?;
        Ok(Self::with_options(store, options))
    }
}

impl<S: KvStore> Registry<S> {
    /// Build a registry over an already connected store, with default options.
    pub fn new(store: S) -> Self {
        Self::with_options(store, RegistryOptions::default())
    }

    pub fn with_options(store: S, options: RegistryOptions) -> Self {
        Self {
            store,
            ledger: Ledger::new(),
            options,
            closed: AtomicBool::new(false),
        }
    }

    /// The underlying store connection.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn options(&self) -> RegistryOptions {
        self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> RegistryResult<()> {
        if self.is_closed() {
            return Err(RegistryError::Closed);
        }
        Ok(())
    }

    /// Run a store call under the operation timeout.
    async fn bounded<T>(
        &self,
        what: &str,
        fut: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        let limit = self.options.operation_timeout;
        tokio::time::timeout(limit, fut)
            .await
            .unwrap_or_else(|_| Err(StoreError::Timeout(format!("{what} exceeded {limit:?}"))))
    }

    /// The lease `key` is currently registered under, if any.
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        self.ledger.get(key)
    }

    /// Keys currently registered by this registry.
    pub fn registered_keys(&self) -> Vec<String> {
        self.ledger.keys()
    }

    /// Publish `key = value` under a fresh, self-renewing lease.
    ///
    /// Grant, publish and renewal start happen in that order and the ledger is
    /// only written once all three succeeded. A lease granted by a failed call
    /// is left to expire in the store.
    pub async fn register(&self, key: &str, value: &str) -> RegistryResult<LeaseId> {
        self.ensure_open()?;
        self.bind(key, value).await
    }

    async fn bind(&self, key: &str, value: &str) -> RegistryResult<LeaseId> {
        let fail = |cause: RegistrationFailure| {
            let step = match &cause {
                RegistrationFailure::LeaseGrantFailed(_) => "grant",
                RegistrationFailure::PublishFailed(_) => "publish",
                RegistrationFailure::RenewalStartFailed(_) => "renewal",
            };
            metrics::REGISTRATION_FAILURES
                .with_label_values(&[step])
                .inc();
            error!(key, error = %cause, "registration failed");
            RegistryError::Registration {
                key: key.to_owned(),
                cause,
            }
        };

        let lease = self
            .bounded(
                "lease grant",
                self.store.grant_lease(self.options.lease_ttl_secs),
            )
            .await
            .map_err(|e| fail(RegistrationFailure::LeaseGrantFailed(e)))?;

        let previous = self.ledger.get(key);
        self.bounded("put", self.store.put(key, value, Some(lease)))
            .await
            .map_err(|e| fail(RegistrationFailure::PublishFailed(e)))?;

        let renewal = match self
            .bounded("keep-alive", self.store.keep_alive(lease))
            .await
        {
            Ok(renewal) => renewal,
            Err(e) => {
                // the key now sits on `lease`, the old binding backs nothing
                if let Some(previous) = previous {
                    self.ledger.delete_if(key, previous);
                }
                return Err(fail(RegistrationFailure::RenewalStartFailed(e)));
            }
        };

        self.ledger.put(key, Binding::new(lease, renewal));
        if self.is_closed() {
            // close drained the ledger while this call was in flight
            self.ledger.delete_if(key, lease);
            warn!(key, %lease, "registry closed during registration, key left to expire");
            return Err(RegistryError::Closed);
        }
        metrics::REGISTRATIONS.inc();
        info!(key, value, %lease, "registered");
        Ok(lease)
    }

    /// Publish a new value for `key` under its current lease.
    ///
    /// If the publish fails for any reason the key is re-registered under a
    /// fresh lease; only a failure of that re-registration is returned. A key
    /// this registry never registered is written without a lease.
    pub async fn update(&self, key: &str, value: &str) -> RegistryResult<()> {
        self.ensure_open()?;
        let state = match self.ledger.get(key) {
            Some(lease) => KeyState::Bound(lease),
            None => KeyState::Unbound,
        };

        let err = match self
            .bounded("put", self.store.put(key, value, state.lease()))
            .await
        {
            Ok(()) => {
                debug!(key, ?state, "updated");
                return Ok(());
            }
            Err(err) => err,
        };

        // Bound -> Unbound
        if let KeyState::Bound(lease) = state {
            self.ledger.delete_if(key, lease);
        }
        warn!(key, ?state, error = %err, "update failed, re-registering");
        metrics::SELF_HEALS.inc();

        // Unbound -> Bound(lease')
        let lease = self.bind(key, value).await?;
        info!(key, %lease, "self-heal re-registered key");
        Ok(())
    }

    /// Forget `key` locally, then delete it from the store.
    ///
    /// A failed store delete is returned but the ledger removal stands; the
    /// key expires with its lease since renewal has stopped.
    pub async fn deregister(&self, key: &str) -> RegistryResult<()> {
        self.ensure_open()?;
        let lease = self.ledger.delete(key);
        metrics::DEREGISTRATIONS.inc();
        debug!(key, ?lease, "deregistering");
        self.bounded("delete", self.store.delete(key)).await?;
        info!(key, "deregistered");
        Ok(())
    }

    /// Read the value of `key`.
    ///
    /// Returns an empty string when the key does not exist.
    pub async fn get(&self, key: &str) -> RegistryResult<String> {
        self.ensure_open()?;
        let records = self.bounded("get", self.store.get(key, false)).await?;
        Ok(records
            .into_iter()
            .last()
            .map(|record| record.value)
            .unwrap_or_default())
    }

    /// Read every key starting with `prefix`. No match is an empty map.
    pub async fn get_by_prefix(&self, prefix: &str) -> RegistryResult<HashMap<String, String>> {
        self.ensure_open()?;
        let records = self.bounded("get", self.store.get(prefix, true)).await?;
        Ok(records.into_iter().map(|r| (r.key, r.value)).collect())
    }

    /// Open a change subscription for `key` (or everything under it when
    /// `prefix` is set) and return the stream.
    pub async fn subscribe(&self, key: &str, prefix: bool) -> RegistryResult<WatchStream> {
        self.ensure_open()?;
        let stream = self.bounded("watch", self.store.watch(key, prefix)).await?;
        debug!(key, prefix, "watch opened");
        Ok(stream)
    }

    /// Open a change subscription and hand its stream to `on_event`.
    ///
    /// A missing callback is rejected before the store is contacted.
    pub async fn watch(
        &self,
        key: &str,
        on_event: Option<WatchCallback>,
        prefix: bool,
    ) -> RegistryResult<()> {
        let Some(on_event) = on_event else {
            return Err(RegistryError::InvalidArgument(
                "watch callback is required".into(),
            ));
        };
        let stream = self.subscribe(key, prefix).await?;
        on_event(stream);
        Ok(())
    }

    /// Delete every registered key from the store, then close the connection.
    ///
    /// Deletes are best-effort: failures are logged and reported in the
    /// summary, and the connection is closed regardless. The registry is
    /// terminal afterwards.
    pub async fn close(&self) -> RegistryResult<CloseSummary> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(RegistryError::Closed);
        }

        let keys = self.ledger.drain();
        let mut summary = CloseSummary::default();
        for key in keys {
            match self.bounded("delete", self.store.delete(&key)).await {
                Ok(()) => summary.deleted += 1,
                Err(err) => {
                    warn!(key, error = %err, "failed to delete key during close");
                    metrics::CLOSE_DELETE_FAILURES.inc();
                    summary.failed.push((key, err));
                }
            }
        }

        self.store
            .close()
            .await
            .map_err(|err| RegistryError::Connect(err.to_string()))?;
        info!(
            deleted = summary.deleted,
            failed = summary.failed.len(),
            "registry closed"
        );
        Ok(summary)
    }
}
