//! etcd v3 connection and [`KvStore`] implementation.
//!
//! Wraps `etcd-client`. The connection is dialed once with a bounded timeout
//! (retried with backoff when `connect_retry_max` is set) and closed once;
//! closing cancels every renewal task and watch stream handed out by it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use config::RegistryConfig;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions,
    WatchOptions,
};
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{StoreError, StoreResult};
use crate::metrics;
use crate::store::{EventKind, KvStore, LeaseId, Record, Renewal, WatchEvent, WatchStream};

/// Base delay for retrying the initial dial.
const CONNECT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for retry backoff during the initial dial.
const MAX_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Connection state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected and operating normally.
    Connected,
    /// Dial in progress.
    Connecting,
    /// Never connected, or closed.
    Disconnected,
}

struct StoreInner {
    client: Option<Client>,
    state: ConnectionState,
}

/// etcd-backed store connection.
#[derive(Clone)]
pub struct EtcdStore {
    inner: Arc<RwLock<StoreInner>>,
    config: RegistryConfig,
    shutdown: CancellationToken,
}

impl EtcdStore {
    /// Create a store from config, without connecting yet.
    ///
    /// Call [`connect`](Self::connect) to dial.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                client: None,
                state: ConnectionState::Disconnected,
            })),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Create a store and dial it.
    pub async fn open(config: RegistryConfig) -> StoreResult<Self> {
        let store = Self::new(config);
        store.connect().await?;
        Ok(store)
    }

    fn connect_options(config: &RegistryConfig) -> ConnectOptions {
        let mut opts = ConnectOptions::new().with_connect_timeout(config.dial_timeout());
        if let Some(creds) = config.credentials() {
            opts = opts.with_user(creds.username.clone(), creds.password.clone());
        }
        opts
    }

    /// Dial once, bounded by the dial timeout, and confirm the cluster answers.
    async fn dial(config: &RegistryConfig) -> StoreResult<Client> {
        let dial_timeout = config.dial_timeout();
        let attempt = async {
            let mut client =
                Client::connect(config.endpoints(), Some(Self::connect_options(config))).await?;
            // the channel is lazy, make sure something is listening
            client.status().await?;
            Ok::<_, etcd_client::Error>(client)
        };
        match tokio::time::timeout(dial_timeout, attempt).await {
            Ok(Ok(client)) => Ok(client),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(StoreError::Timeout(format!(
                "dial to {:?} timed out after {dial_timeout:?}",
                config.endpoints()
            ))),
        }
    }

    /// Establish the etcd connection.
    ///
    /// On success the store transitions to `Connected`. Each attempt is bounded
    /// by the dial timeout; failed attempts are retried `connect_retry_max`
    /// times with exponential backoff.
    pub async fn connect(&self) -> StoreResult<()> {
        if self.connection_state().await == ConnectionState::Connected {
            debug!("etcd store already connected, skipping connect");
            return Ok(());
        }
        if self.shutdown.is_cancelled() {
            return Err(StoreError::Closed);
        }

        let config = &self.config;
        info!(
            endpoints = ?config.endpoints(),
            dial_timeout = ?config.dial_timeout(),
            connect_retry_max = config.connect_retry_max(),
            "connecting to etcd"
        );

        self.inner.write().await.state = ConnectionState::Connecting;

        let total_attempts = config.connect_retry_max().saturating_add(1);
        let mut attempt = 0;
        loop {
            match Self::dial(config).await {
                Ok(client) => {
                    let mut inner = self.inner.write().await;
                    inner.client = Some(client);
                    inner.state = ConnectionState::Connected;
                    info!(
                        attempt = attempt + 1,
                        total_attempts, "etcd connection established"
                    );
                    return Ok(());
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= total_attempts {
                        error!(
                            attempts = total_attempts,
                            error = %err,
                            "etcd connection failed after all retry attempts"
                        );
                        self.inner.write().await.state = ConnectionState::Disconnected;
                        return Err(err);
                    }

                    let delay = CONNECT_RETRY_BASE_DELAY
                        .saturating_mul(2u32.saturating_pow(attempt - 1))
                        .min(MAX_CONNECT_RETRY_DELAY);
                    warn!(
                        attempt,
                        total_attempts,
                        retry_in_ms = delay.as_millis(),
                        error = %err,
                        "etcd connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Returns the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.read().await.state
    }

    /// Returns true if the store is currently connected.
    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Connected
    }

    /// Returns the config this store was built from.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// A handle to the live client. `Client` is a cheap clone over one channel.
    async fn client(&self) -> StoreResult<Client> {
        self.inner
            .read()
            .await
            .client
            .clone()
            .ok_or(StoreError::Closed)
    }
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore")
            .field("endpoints", &self.config.endpoints())
            .finish_non_exhaustive()
    }
}

/// Keep `lease` alive until it is lost or `token` is cancelled.
async fn renew(
    mut keeper: LeaseKeeper,
    mut responses: LeaseKeepAliveStream,
    lease: LeaseId,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // the first renewal was already confirmed by keep_alive
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(%lease, "lease renewal stopping");
                return;
            }
            _ = ticker.tick() => {
                if let Err(err) = keeper.keep_alive().await {
                    warn!(%lease, error = %err, "failed to send lease keep-alive");
                    break;
                }
                match responses.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        trace!(%lease, ttl = resp.ttl(), "lease renewed");
                    }
                    Ok(Some(_)) => {
                        warn!(%lease, "lease expired in store, renewal stopping");
                        break;
                    }
                    Ok(None) => {
                        warn!(%lease, "lease keep-alive stream ended");
                        break;
                    }
                    Err(err) => {
                        warn!(%lease, error = %err, "lease keep-alive failed");
                        break;
                    }
                }
            }
        }
    }
    metrics::RENEWALS_LOST.inc();
    token.cancel();
}

fn to_record(kv: &etcd_client::KeyValue) -> StoreResult<Record> {
    Ok(Record {
        key: kv
            .key_str()
            .map_err(|e| StoreError::Codec(format!("key is not utf-8: {e}")))?
            .to_owned(),
        value: kv
            .value_str()
            .map_err(|e| StoreError::Codec(format!("value is not utf-8: {e}")))?
            .to_owned(),
        lease: LeaseId::new(kv.lease()),
    })
}

fn to_event(event: &etcd_client::Event) -> Option<StoreResult<WatchEvent>> {
    let kv = event.kv()?;
    let kind = match event.event_type() {
        EventType::Put => EventKind::Put,
        EventType::Delete => EventKind::Delete,
    };
    Some(to_record(kv).map(|record| WatchEvent {
        kind,
        key: record.key,
        value: record.value,
    }))
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn grant_lease(&self, ttl_secs: i64) -> StoreResult<LeaseId> {
        let mut client = self.client().await?;
        let resp = client.lease_grant(ttl_secs, None).await?;
        Ok(LeaseId::new(resp.id()))
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()> {
        let mut client = self.client().await?;
        let opts = lease
            .filter(|l| !l.is_none())
            .map(|l| PutOptions::new().with_lease(l.get()));
        client.put(key, value, opts).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut client = self.client().await?;
        client.delete(key, None).await?;
        Ok(())
    }

    async fn get(&self, key: &str, prefix: bool) -> StoreResult<Vec<Record>> {
        let mut client = self.client().await?;
        let opts = prefix.then(|| GetOptions::new().with_prefix());
        let resp = client.get(key, opts).await?;
        resp.kvs().iter().map(to_record).collect()
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<Renewal> {
        let mut client = self.client().await?;
        let (mut keeper, mut responses) = client.lease_keep_alive(lease.get()).await?;
        keeper.keep_alive().await?;
        match responses.message().await? {
            Some(resp) if resp.ttl() > 0 => {}
            _ => return Err(StoreError::LeaseNotFound(lease)),
        }

        let token = self.shutdown.child_token();
        tokio::spawn(renew(
            keeper,
            responses,
            lease,
            self.config.keep_alive_interval(),
            token.clone(),
        ));
        Ok(Renewal::new(lease, token))
    }

    async fn watch(&self, key: &str, prefix: bool) -> StoreResult<WatchStream> {
        let mut client = self.client().await?;
        let opts = prefix.then(|| WatchOptions::new().with_prefix());
        let (watcher, stream) = client.watch(key, opts).await?;

        // the watcher is carried along so the subscription lives as long as the stream
        let events = futures::stream::unfold(
            (watcher, stream, Vec::<StoreResult<WatchEvent>>::new()),
            |(watcher, mut stream, mut pending)| async move {
                loop {
                    if let Some(event) = pending.pop() {
                        return Some((event, (watcher, stream, pending)));
                    }
                    match stream.message().await {
                        Ok(Some(resp)) if resp.canceled() => return None,
                        Ok(Some(resp)) => {
                            // reversed so pop() yields store order
                            pending.extend(resp.events().iter().rev().filter_map(to_event));
                        }
                        Ok(None) => return None,
                        Err(err) => {
                            return Some((Err(err.into()), (watcher, stream, pending)));
                        }
                    }
                }
            },
        );
        Ok(events
            .take_until(self.shutdown.clone().cancelled_owned())
            .boxed())
    }

    async fn close(&self) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.client.take().is_none() {
            return Err(StoreError::Closed);
        }
        inner.state = ConnectionState::Disconnected;
        self.shutdown.cancel();
        info!("etcd connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RegistryConfig {
        RegistryConfig::parse_str(
            "endpoints: [\"http://127.0.0.1:1\"]\ndial_timeout: 200ms\nconnect_retry_max: 0\n",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_store_initial_state() {
        let store = EtcdStore::new(test_config());
        assert_eq!(store.connection_state().await, ConnectionState::Disconnected);
        assert!(!store.is_connected().await);
    }

    #[tokio::test]
    async fn test_ops_without_connection_fail() {
        let store = EtcdStore::new(test_config());
        assert!(matches!(store.grant_lease(5).await, Err(StoreError::Closed)));
        assert!(matches!(
            store.put("/a", "1", None).await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(store.get("/a", true).await, Err(StoreError::Closed)));
        assert!(matches!(store.close().await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn test_connect_refused_fails_fast() {
        let store = EtcdStore::new(test_config());
        let started = std::time::Instant::now();
        let result = store.connect().await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(store.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_silent_peer_times_out() {
        // accepts tcp through the backlog but never answers the http/2 handshake
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let config = RegistryConfig::parse_str(format!(
            "endpoints: [\"http://{addr}\"]\ndial_timeout: 200ms\nconnect_retry_max: 0\n"
        ))
        .unwrap();

        let store = EtcdStore::new(config);
        let started = std::time::Instant::now();
        let err = store.connect().await.unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(store.connection_state().await, ConnectionState::Disconnected);
        drop(listener);
    }

    #[test]
    fn test_debug_hides_client() {
        let store = EtcdStore::new(test_config());
        let s = format!("{store:?}");
        assert!(s.contains("127.0.0.1:1"));
    }
}
