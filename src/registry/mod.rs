//! Registration of the local process and lookups over the registry.
//!
//! [`ServiceRegistry::register`] publishes this process under
//! `/servers/{type}/{id}` bound to a lease, fills the [`RegistryCache`]
//! with full syncs of servers, the own type's private keys and all public
//! keys, then keeps it current with one watch per prefix. Lookups never
//! touch the store.
//!
//! ```text
//! Unregistered -> Registering -> Active -> ShuttingDown -> Terminated
//! ```

mod params;
mod selector;

pub use params::*;
pub use selector::*;


use std::sync::Arc;

use bytes::Bytes;
use nanoid::nanoid;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::constants::PRIVATE_KEYS_PREFIX;
use crate::constants::PUBLIC_KEYS_PREFIX;
use crate::constants::SERVERS_PREFIX;
use crate::metrics;
use crate::utils;
use crate::CacheCategory;
use crate::ConnectParams;
use crate::KvBackend;
use crate::KvStore;
use crate::RegistrationError;
use crate::RegistryCache;
use crate::RegistryConfig;
use crate::Result;
use crate::ServerRecord;
use crate::WatchCallback;
use crate::WatchEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Unregistered,
    Registering,
    Active,
    ShuttingDown,
    Terminated,
}

impl RegistryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryState::Unregistered => "unregistered",
            RegistryState::Registering => "registering",
            RegistryState::Active => "active",
            RegistryState::ShuttingDown => "shutting_down",
            RegistryState::Terminated => "terminated",
        }
    }

    fn gauge_value(&self) -> i64 {
        *self as i64
    }
}

pub struct ServiceRegistry {
    me: ServerRecord,
    store: Arc<KvStore>,
    cache: Arc<RegistryCache>,
    state_tx: watch::Sender<RegistryState>,
    resync_cancel: CancellationToken,
    resync_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("id", &self.me.id)
            .field("server_type", &self.me.server_type)
            .field("state", &*self.state_tx.borrow())
            .finish()
    }
}

impl ServiceRegistry {
    /// Connects to the store named in `params` and registers this
    /// process.
    ///
    /// # Errors
    /// - [`RegistrationError::MissingParam`] /
    ///   [`RegistrationError::InvalidAuthKey`] before anything is opened
    /// - store failures while connecting, publishing or syncing; the
    ///   store is shut down before the error is returned
    pub async fn register(
        params: RegisterParams,
        config: &RegistryConfig,
    ) -> Result<Self> {
        params.validate()?;
        let credentials = params.credentials()?;
        let connect = ConnectParams::new(params.endpoints(), credentials, &config.store);

        set_state_gauge(RegistryState::Registering);
        let store = match KvStore::connect(
            &connect,
            params.namespace_prefix.as_str(),
            &config.store,
            &config.retry,
        )
        .await
        {
            Ok(store) => store,
            Err(e) => {
                error!(endpoints = %params.store_endpoints, error = %e, "store connection failed");
                set_state_gauge(RegistryState::Unregistered);
                return Err(e);
            }
        };

        Self::register_on(params, store, config).await
    }

    /// Same as [`register`](Self::register) over a caller-supplied
    /// backend.
    pub async fn register_with_backend(
        params: RegisterParams,
        backend: Arc<dyn KvBackend>,
        config: &RegistryConfig,
    ) -> Result<Self> {
        params.validate()?;
        params.credentials()?;

        set_state_gauge(RegistryState::Registering);
        let store = KvStore::with_backend(
            backend,
            params.namespace_prefix.as_str(),
            &config.store,
            &config.retry,
        );
        Self::register_on(params, store, config).await
    }

    async fn register_on(
        params: RegisterParams,
        store: KvStore,
        config: &RegistryConfig,
    ) -> Result<Self> {
        let store = Arc::new(store);
        let cache = Arc::new(RegistryCache::scoped_to(params.server_type.as_str()));

        let me = match bootstrap(&params, &store, &cache).await {
            Ok(me) => me,
            Err(e) => {
                error!(server_type = %params.server_type, error = %e, "registration failed");
                if let Err(shutdown_err) = store.shutdown().await {
                    warn!(error = %shutdown_err, "store shutdown after failed registration");
                }
                set_state_gauge(RegistryState::Unregistered);
                return Err(e);
            }
        };

        let (state_tx, _) = watch::channel(RegistryState::Active);
        set_state_gauge(RegistryState::Active);
        info!(
            id = %me.id,
            server_type = %me.server_type,
            namespace = %store.namespace(),
            "registry active"
        );

        let registry = Self {
            me,
            store,
            cache,
            state_tx,
            resync_cancel: CancellationToken::new(),
            resync_task: Mutex::new(None),
        };
        registry.schedule_resync(config);
        Ok(registry)
    }

    /// This process' own published record
    pub fn self_record(&self) -> &ServerRecord {
        &self.me
    }

    pub fn servers_of_type(
        &self,
        server_type: &str,
    ) -> Arc<Vec<ServerRecord>> {
        self.cache.servers_of_type(server_type)
    }

    /// Random `(host, port)` among the cached servers of `server_type`
    /// that publish an http endpoint. `None` means no instance is
    /// available right now.
    pub fn random_http_endpoint(
        &self,
        server_type: &str,
    ) -> Option<(String, String)> {
        let servers = self.cache.servers_of_type(server_type);
        select_http_endpoint(&servers, &mut rand::thread_rng())
    }

    /// Private key of the local server type
    pub fn private_key(
        &self,
        name: &str,
    ) -> Option<Bytes> {
        self.cache.private_key(name)
    }

    pub fn public_key(
        &self,
        server_type: &str,
        name: &str,
    ) -> Option<Bytes> {
        self.cache.public_key(server_type, name)
    }

    /// Re-reads every cached category from the store.
    ///
    /// # Errors
    /// [`RegistrationError::NotActive`] once shutdown began; store
    /// failures otherwise, leaving the previous cache contents in place
    /// for the categories not yet re-read.
    pub async fn resync(&self) -> Result<()> {
        let state = self.state();
        if state != RegistryState::Active {
            return Err(RegistrationError::NotActive(state.as_str()).into());
        }
        full_sync(&self.store, &self.cache, &self.me.server_type).await
    }

    pub fn state(&self) -> RegistryState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RegistryState> {
        self.state_tx.subscribe()
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    /// Removes this process from the registry and stops every
    /// background task.
    ///
    /// Only the first call does the work; later or concurrent calls
    /// return immediately.
    pub async fn shutdown(&self) -> Result<()> {
        let started = self.state_tx.send_if_modified(|state| {
            if *state == RegistryState::Active {
                *state = RegistryState::ShuttingDown;
                true
            } else {
                false
            }
        });
        if !started {
            debug!(state = self.state().as_str(), "registry shutdown already requested");
            return Ok(());
        }
        set_state_gauge(RegistryState::ShuttingDown);
        info!(id = %self.me.id, "registry shutting down");

        self.resync_cancel.cancel();
        if let Some(task) = self.resync_task.lock().take() {
            task.abort();
        }
        if let Err(e) = self.store.shutdown().await {
            warn!(error = %e, "store shutdown reported an error");
        }

        self.state_tx.send_replace(RegistryState::Terminated);
        set_state_gauge(RegistryState::Terminated);
        info!(id = %self.me.id, "registry terminated");
        Ok(())
    }

    /// One-shot resync absorbing events missed between the initial sync
    /// and the watch installation.
    fn schedule_resync(
        &self,
        config: &RegistryConfig,
    ) {
        let Some(delay) = config.sync.resync_delay() else {
            return;
        };
        let store = self.store.clone();
        let cache = self.cache.clone();
        let server_type = self.me.server_type.clone();
        let cancel = self.resync_cancel.clone();

        let handle = utils::async_task::spawn_task(
            "registry-resync",
            move || async move {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
                full_sync(&store, &cache, &server_type).await?;
                info!(server_type = %server_type, "scheduled resync done");
                Ok(())
            },
            None,
        );
        *self.resync_task.lock() = handle;
    }
}

async fn bootstrap(
    params: &RegisterParams,
    store: &KvStore,
    cache: &Arc<RegistryCache>,
) -> Result<ServerRecord> {
    store.acquire_lease().await?;

    let me = ServerRecord {
        id: nanoid!(),
        server_type: params.server_type.clone(),
        metadata: params.metadata.clone().unwrap_or_default(),
        hostname: utils::local_hostname(),
        cpu_count: utils::cpu_count(),
        created_at: utils::now_rfc3339(),
    };
    let payload = me.encode().map_err(RegistrationError::Encode)?;
    store.put(&me.key(), payload).await?;
    info!(id = %me.id, key = %me.key(), "self record published");

    full_sync(store, cache, &me.server_type).await?;

    store.watch(SERVERS_PREFIX, vec![cache_callback(cache, CacheCategory::Servers)]).await?;
    store
        .watch(
            &private_keys_prefix(&me.server_type),
            vec![cache_callback(cache, CacheCategory::PrivateKeys)],
        )
        .await?;
    store
        .watch(PUBLIC_KEYS_PREFIX, vec![cache_callback(cache, CacheCategory::PublicKeys)])
        .await?;

    Ok(me)
}

async fn full_sync(
    store: &KvStore,
    cache: &RegistryCache,
    server_type: &str,
) -> Result<()> {
    let servers = store.get_all(SERVERS_PREFIX).await?;
    let servers = cache.full_sync(CacheCategory::Servers, servers);

    let private_keys = store.get_all(&private_keys_prefix(server_type)).await?;
    let private_keys = cache.full_sync(CacheCategory::PrivateKeys, private_keys);

    let public_keys = store.get_all(PUBLIC_KEYS_PREFIX).await?;
    let public_keys = cache.full_sync(CacheCategory::PublicKeys, public_keys);

    debug!(servers, private_keys, public_keys, "cache synced");
    Ok(())
}

fn cache_callback(
    cache: &Arc<RegistryCache>,
    category: CacheCategory,
) -> WatchCallback {
    let cache = cache.clone();
    Arc::new(move |event: &WatchEvent| cache.apply(category, event))
}

/// Trailing `/` keeps `app` from matching `app-admin`
fn private_keys_prefix(server_type: &str) -> String {
    format!("{PRIVATE_KEYS_PREFIX}/{server_type}/")
}

fn set_state_gauge(state: RegistryState) {
    metrics::REGISTRY_STATE.set(state.gauge_value());
}
