//! Local bookkeeping of which keys this registry has live in the store.
//!
//! An entry for a key exists only while that key is published under a lease
//! that is being renewed. The ledger never performs store I/O and its lock is
//! only ever held for the duration of a map operation.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::metrics;
use crate::store::{LeaseId, Renewal};

/// A key's current lease together with the renewal keeping it alive.
#[derive(Debug)]
pub(crate) struct Binding {
    lease: LeaseId,
    // dropping the binding stops renewal of `lease`
    _renewal: Renewal,
}

impl Binding {
    pub(crate) fn new(lease: LeaseId, renewal: Renewal) -> Self {
        Self {
            lease,
            _renewal: renewal,
        }
    }
}

/// Mapping of registered key to lease identifier.
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    entries: RwLock<HashMap<String, Binding>>,
}

impl Ledger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Binding>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Binding>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `key -> binding`, returning the lease it replaced.
    pub(crate) fn put(&self, key: &str, binding: Binding) -> Option<LeaseId> {
        let previous = self.write().insert(key.to_owned(), binding);
        if previous.is_none() {
            metrics::LEDGER_ENTRIES.inc();
        }
        // old renewal is stopped here, outside the lock
        previous.map(|b| b.lease)
    }

    pub(crate) fn get(&self, key: &str) -> Option<LeaseId> {
        self.read().get(key).map(|b| b.lease)
    }

    pub(crate) fn delete(&self, key: &str) -> Option<LeaseId> {
        let removed = self.write().remove(key);
        if removed.is_some() {
            metrics::LEDGER_ENTRIES.dec();
        }
        removed.map(|b| b.lease)
    }

    /// Remove `key` only if it is still bound to `lease`.
    ///
    /// Used when a publish under `lease` failed: a concurrent caller may have
    /// already re-registered the key under a fresh lease, which must survive.
    pub(crate) fn delete_if(&self, key: &str, lease: LeaseId) -> bool {
        let removed = {
            let mut entries = self.write();
            match entries.get(key) {
                Some(binding) if binding.lease == lease => entries.remove(key),
                _ => None,
            }
        };
        if removed.is_some() {
            metrics::LEDGER_ENTRIES.dec();
        }
        removed.is_some()
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Remove every entry, returning the keys that were present.
    pub(crate) fn drain(&self) -> Vec<String> {
        let drained = std::mem::take(&mut *self.write());
        metrics::LEDGER_ENTRIES.sub(drained.len() as i64);
        drained.into_keys().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn binding(id: i64) -> (Binding, CancellationToken) {
        let token = CancellationToken::new();
        let lease = LeaseId::new(id);
        (Binding::new(lease, Renewal::new(lease, token.clone())), token)
    }

    #[test]
    fn test_put_get_delete() {
        let ledger = Ledger::new();
        assert_eq!(ledger.get("/svc/a"), None);

        let (b, _) = binding(1);
        assert_eq!(ledger.put("/svc/a", b), None);
        assert_eq!(ledger.get("/svc/a"), Some(LeaseId::new(1)));
        assert_eq!(ledger.len(), 1);

        assert_eq!(ledger.delete("/svc/a"), Some(LeaseId::new(1)));
        assert_eq!(ledger.get("/svc/a"), None);
        // absent is not an error
        assert_eq!(ledger.delete("/svc/a"), None);
    }

    #[test]
    fn test_replacing_binding_stops_old_renewal() {
        let ledger = Ledger::new();
        let (first, first_token) = binding(1);
        let (second, second_token) = binding(2);

        ledger.put("/svc/a", first);
        assert_eq!(ledger.put("/svc/a", second), Some(LeaseId::new(1)));
        assert!(first_token.is_cancelled());
        assert!(!second_token.is_cancelled());
        assert_eq!(ledger.get("/svc/a"), Some(LeaseId::new(2)));
    }

    #[test]
    fn test_delete_if_only_matches_same_lease() {
        let ledger = Ledger::new();
        let (b, token) = binding(5);
        ledger.put("/svc/a", b);

        assert!(!ledger.delete_if("/svc/a", LeaseId::new(4)));
        assert_eq!(ledger.get("/svc/a"), Some(LeaseId::new(5)));
        assert!(!token.is_cancelled());

        assert!(ledger.delete_if("/svc/a", LeaseId::new(5)));
        assert_eq!(ledger.get("/svc/a"), None);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_keys_and_drain() {
        let ledger = Ledger::new();
        let mut tokens = Vec::new();
        for (i, key) in ["/svc/a", "/svc/b", "/svc/c"].into_iter().enumerate() {
            let (b, token) = binding(i as i64 + 1);
            tokens.push(token);
            ledger.put(key, b);
        }

        let mut keys = ledger.keys();
        keys.sort();
        assert_eq!(keys, ["/svc/a", "/svc/b", "/svc/c"]);

        let mut drained = ledger.drain();
        drained.sort();
        assert_eq!(drained, keys);
        assert_eq!(ledger.len(), 0);
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }

    #[test]
    fn test_concurrent_access() {
        let ledger = std::sync::Arc::new(Ledger::new());
        let handles = (0..8)
            .map(|i| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    let key = format!("/svc/{i}");
                    for round in 0..100 {
                        let (b, _) = binding(round + 1);
                        ledger.put(&key, b);
                        assert_eq!(ledger.get(&key), Some(LeaseId::new(round + 1)));
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ledger.len(), 8);
    }
}
