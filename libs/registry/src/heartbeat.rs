//! Periodic re-publication of a registered key.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics;
use crate::registry::Registry;
use crate::store::KvStore;

/// Call [`Registry::update`] for `key` every `interval` with the value
/// produced by `value_fn`, until `token` is cancelled or the registry closes.
///
/// Each tick goes through the self-heal path, so a key whose lease was lost
/// between ticks is re-registered on the next one. The first tick fires
/// after one `interval`, not immediately.
pub fn spawn_heartbeat<S, F>(
    registry: Arc<Registry<S>>,
    key: String,
    value_fn: F,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()>
where
    S: KvStore,
    F: Fn() -> String + Send + 'static,
{
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(key, "heartbeat stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if registry.is_closed() {
                        debug!(key, "registry closed, heartbeat stopping");
                        return;
                    }
                    let value = value_fn();
                    if let Err(err) = registry.update(&key, &value).await {
                        metrics::HEARTBEAT_FAILURES.inc();
                        warn!(key, ?err, "heartbeat update failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_refreshes_and_heals() {
        let store = MemoryStore::new();
        let registry = Arc::new(Registry::new(store.clone()));
        let first = registry.register("/svc/a", "0").await.unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let value_counter = counter.clone();
        let token = CancellationToken::new();
        let handle = spawn_heartbeat(
            registry.clone(),
            "/svc/a".to_owned(),
            move || (value_counter.fetch_add(1, Ordering::SeqCst) + 1).to_string(),
            Duration::from_secs(1),
            token.clone(),
        );

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(store.value("/svc/a").as_deref(), Some("1"));
        assert_eq!(registry.lease_of("/svc/a"), Some(first));

        // lease lost between ticks
        store.revoke(first);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.value("/svc/a").as_deref(), Some("2"));
        let healed = registry.lease_of("/svc/a").unwrap();
        assert_ne!(healed, first);
        assert!(store.is_renewing(healed));

        token.cancel();
        handle.await.unwrap();
        let ticks = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(counter.load(Ordering::SeqCst), ticks);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_stops_after_close() {
        let store = MemoryStore::new();
        let registry = Arc::new(Registry::new(store.clone()));
        registry.register("/svc/a", "0").await.unwrap();
        registry.close().await.unwrap();

        let handle = spawn_heartbeat(
            registry,
            "/svc/a".to_owned(),
            || "1".to_owned(),
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(handle.is_finished());
    }
}
