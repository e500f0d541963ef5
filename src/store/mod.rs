//! Namespaced client over the consistent store.
//!
//! [`KvStore`] prefixes every key with the namespace on the way in and
//! strips it on the way out. Writes are bound to the registration lease
//! once one was acquired, and are re-bound whenever the lease is
//! rebootstrapped, so lease-bound keys survive a lost keepalive stream.
//!
//! The raw operations live behind [`KvBackend`]; [`EtcdBackend`] talks
//! to etcd and [`MemoryBackend`] keeps everything in process.

mod backend;
mod etcd_backend;
mod lease;
mod memory_backend;
mod watch;

pub use backend::*;
pub use etcd_backend::*;
pub use lease::*;
pub use memory_backend::*;
pub use watch::*;

#[cfg(test)]
mod watch_test;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::constants::OP_DELETE;
use crate::constants::OP_PUT;
use crate::Result;
use crate::RetryPolicies;
use crate::StoreConfig;
use crate::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchOp {
    Put,
    Delete,
}

impl WatchOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchOp::Put => OP_PUT,
            WatchOp::Delete => OP_DELETE,
        }
    }
}

/// One change below a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub op: WatchOp,
    /// Namespace-relative once delivered to callbacks
    pub key: String,
    /// Empty for deletes
    pub value: Vec<u8>,
    pub prev_value: Option<Vec<u8>>,
}

/// How to reach the store.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub endpoints: Vec<String>,
    /// `(user, password)`
    pub credentials: Option<(String, String)>,
    pub dial_timeout: Duration,
    /// Renewal period of the keepalive pump
    pub keepalive_interval: Duration,
}

impl ConnectParams {
    /// Keepalive renews every third of the lease TTL, at least once per
    /// second.
    pub fn new(
        endpoints: Vec<String>,
        credentials: Option<(String, String)>,
        store: &StoreConfig,
    ) -> Self {
        let keepalive_interval = (store.lease_ttl() / 3).max(Duration::from_secs(1));
        Self {
            endpoints,
            credentials,
            dial_timeout: store.dial_timeout(),
            keepalive_interval,
        }
    }
}

pub struct KvStore {
    backend: Arc<dyn KvBackend>,
    namespace: String,
    config: StoreConfig,
    lease: Arc<LeaseManager>,
    watches: WatchRegistry,
    /// Namespace-relative key -> value of every lease-bound write
    leased_keys: Arc<DashMap<String, Vec<u8>>>,
    shutdown_token: CancellationToken,
    closed: AtomicBool,
    rebinder: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for KvStore {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("namespace", &self.namespace)
            .field("lease", &self.lease)
            .field("closed", &self.closed)
            .finish()
    }
}

impl KvStore {
    /// Opens an etcd connection scoped to `namespace`.
    ///
    /// # Errors
    /// Fails fast when the endpoints are unreachable within the dial
    /// timeout or the credentials are rejected.
    pub async fn connect(
        params: &ConnectParams,
        namespace: impl Into<String>,
        store: &StoreConfig,
        retry: &RetryPolicies,
    ) -> Result<Self> {
        let backend = EtcdBackend::connect(params).await?;
        Ok(Self::with_backend(backend, namespace, store, retry))
    }

    pub fn with_backend(
        backend: Arc<dyn KvBackend>,
        namespace: impl Into<String>,
        store: &StoreConfig,
        retry: &RetryPolicies,
    ) -> Self {
        let namespace = namespace.into();
        let shutdown_token = CancellationToken::new();
        let lease = LeaseManager::new(
            backend.clone(),
            store.lease_ttl(),
            retry.lease_rebootstrap_interval(),
            shutdown_token.child_token(),
        );
        let watches = WatchRegistry::new(
            backend.clone(),
            namespace.clone(),
            WatchRetryPolicy::from(retry),
            shutdown_token.child_token(),
        );

        Self {
            backend,
            namespace,
            config: store.clone(),
            lease,
            watches,
            leased_keys: Arc::new(DashMap::new()),
            shutdown_token,
            closed: AtomicBool::new(false),
            rebinder: Mutex::new(None),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Acquires the registration lease and starts keeping it alive.
    ///
    /// From here on every write is lease-bound.
    pub async fn acquire_lease(&self) -> Result<i64> {
        let lease_id = self.lease.bootstrap().await?;
        info!(lease_id, ttl = self.config.lease_ttl_secs, "lease acquired");

        let rebinder = spawn_rebinder(
            self.backend.clone(),
            self.namespace.clone(),
            self.leased_keys.clone(),
            self.lease.subscribe(),
            lease_id,
            self.shutdown_token.child_token(),
        );
        if let Some(previous) = self.rebinder.lock().replace(rebinder) {
            previous.abort();
        }
        Ok(lease_id)
    }

    pub fn lease_id(&self) -> Option<i64> {
        self.lease.lease_id()
    }

    pub fn lease_status(&self) -> LeaseStatus {
        self.lease.status()
    }

    pub fn subscribe_lease(&self) -> tokio::sync::watch::Receiver<LeaseStatus> {
        self.lease.subscribe()
    }

    pub async fn put(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let value = value.into();
        let lease_bound = !matches!(self.lease.status(), LeaseStatus::Idle | LeaseStatus::Revoked);
        // May be absent while the lease is being reacquired; the rebinder
        // attaches the key once a new lease is active
        let lease_id = self.lease.lease_id();

        self.backend.put(&self.full_key(key), value.clone(), lease_id).await?;
        if lease_bound {
            self.leased_keys.insert(key.to_string(), value);
        }
        Ok(())
    }

    pub async fn put_string(
        &self,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.put(key, value.as_bytes()).await
    }

    /// # Errors
    /// [`StoreError::KeyNotFound`] when `key` does not exist.
    pub async fn get(
        &self,
        key: &str,
    ) -> Result<Vec<u8>> {
        self.backend
            .get(&self.full_key(key))
            .await?
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()).into())
    }

    pub async fn get_string(
        &self,
        key: &str,
    ) -> Result<String> {
        let bytes = self.get(key).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Pairs below `prefix`, keys namespace-relative.
    pub async fn get_all(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let pairs = self.backend.get_prefix(&self.full_key(prefix)).await?;
        Ok(pairs.into_iter().map(|(key, value)| (self.strip_namespace(key), value)).collect())
    }

    pub async fn delete(
        &self,
        key: &str,
        with_prefix: bool,
    ) -> Result<()> {
        self.backend.delete(&self.full_key(key), with_prefix).await?;
        if with_prefix {
            self.leased_keys.retain(|k, _| !k.starts_with(key));
        } else {
            self.leased_keys.remove(key);
        }
        Ok(())
    }

    pub async fn count(
        &self,
        key: &str,
        with_prefix: bool,
    ) -> Result<i64> {
        self.backend.count(&self.full_key(key), with_prefix).await
    }

    /// See [`WatchRegistry::watch`].
    pub async fn watch(
        &self,
        prefix: &str,
        callbacks: Vec<WatchCallback>,
    ) -> Result<()> {
        self.watches.watch(prefix, callbacks).await
    }

    pub fn watched_prefixes(&self) -> Vec<String> {
        self.watches.prefixes()
    }

    /// Revokes the lease, lets the deletes propagate, then stops every
    /// background task.
    ///
    /// Revoke failures and timeouts are logged and suppressed: the store
    /// reclaims the lease at TTL expiry anyway. Calling it again is a
    /// no-op.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("store already shut down");
            return Ok(());
        }

        if let Some(rebinder) = self.rebinder.lock().take() {
            rebinder.abort();
        }
        if let Err(e) = self.lease.revoke(self.config.revoke_timeout()).await {
            warn!(error = %e, "lease revoke failed during shutdown");
        }
        tokio::time::sleep(self.config.shutdown_delay()).await;

        self.shutdown_token.cancel();
        self.watches.stop().await;
        info!(namespace = %self.namespace, "store shut down");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn full_key(
        &self,
        key: &str,
    ) -> String {
        format!("{}{}", self.namespace, key)
    }

    fn strip_namespace(
        &self,
        key: String,
    ) -> String {
        match key.strip_prefix(&self.namespace) {
            Some(stripped) => stripped.to_string(),
            None => key,
        }
    }
}

/// Re-attaches every lease-bound key whenever a new lease becomes
/// active.
fn spawn_rebinder(
    backend: Arc<dyn KvBackend>,
    namespace: String,
    leased_keys: Arc<DashMap<String, Vec<u8>>>,
    mut status_rx: tokio::sync::watch::Receiver<LeaseStatus>,
    initial_lease: i64,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut bound_to = initial_lease;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }

            let status = *status_rx.borrow_and_update();
            let LeaseStatus::Active { lease_id } = status else {
                continue;
            };
            if lease_id == bound_to {
                continue;
            }
            bound_to = lease_id;

            let entries: Vec<(String, Vec<u8>)> =
                leased_keys.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
            for (key, value) in entries {
                let full_key = format!("{}{}", namespace, key);
                match backend.put(&full_key, value, Some(lease_id)).await {
                    Ok(()) => debug!(key = %full_key, lease_id, "re-bound key to new lease"),
                    Err(e) => warn!(key = %full_key, lease_id, error = %e, "re-binding key failed"),
                }
            }
        }
    })
}
