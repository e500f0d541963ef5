use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::DropGuard;
use tonic::async_trait;
use tracing::trace;
use tracing::warn;

use super::KeepAliveStream;
use super::KvBackend;
use super::WatchEvent;
use super::WatchOp;
use super::WatchStream;
use crate::constants::KEEPALIVE_CHANNEL_CAPACITY;
use crate::constants::WATCH_CHANNEL_CAPACITY;
use crate::Error;
use crate::Result;
use crate::StoreError;

/// In-process [`KvBackend`] with etcd semantics for leases and prefix
/// watches.
///
/// Leases never expire on their own; [`expire_lease`](Self::expire_lease)
/// plays the role of a missed TTL. Keepalive streams are acknowledged
/// every TTL/3 like an etcd renewal loop. Fault hooks let callers
/// exercise the self-healing paths without a cluster.
///
/// Watch fan-out uses `try_send`: a subscriber whose buffer is full
/// loses the batch, and is expected to resync.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    failing_grants: AtomicUsize,
    failing_watches: AtomicUsize,
    watch_gate: Mutex<Option<Arc<Semaphore>>>,
    reconnects: AtomicUsize,
}

#[derive(Debug, Default)]
struct Inner {
    data: BTreeMap<String, Entry>,
    leases: HashMap<i64, Lease>,
    next_lease_id: i64,
    watchers: Vec<WatcherSlot>,
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    lease: Option<i64>,
}

#[derive(Debug)]
struct Lease {
    ttl: i64,
    keys: HashSet<String>,
    keepalives: Vec<KeepAliveSlot>,
}

/// Dropping the slot ends its renewal task and closes the stream.
struct KeepAliveSlot {
    silenced: Arc<AtomicBool>,
    _stop: DropGuard,
}

impl std::fmt::Debug for KeepAliveSlot {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KeepAliveSlot")
            .field("silenced", &self.silenced.load(Ordering::Relaxed))
            .finish()
    }
}

#[derive(Debug)]
struct WatcherSlot {
    prefix: String,
    tx: mpsc::Sender<Result<Vec<WatchEvent>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` lease grants fail.
    pub fn fail_next_grants(
        &self,
        n: usize,
    ) {
        self.failing_grants.store(n, Ordering::SeqCst);
    }

    /// The next `n` watch opens fail.
    pub fn fail_next_watches(
        &self,
        n: usize,
    ) {
        self.failing_watches.store(n, Ordering::SeqCst);
    }

    /// Terminates every keepalive stream; the leases stay granted.
    pub fn close_keepalives(&self) {
        let mut inner = self.inner.lock();
        for lease in inner.leases.values_mut() {
            lease.keepalives.clear();
        }
    }

    /// Watch opens block until [`release_watches`](Self::release_watches).
    pub fn hold_watches(&self) {
        *self.watch_gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_watches(&self) {
        if let Some(gate) = self.watch_gate.lock().take() {
            gate.close();
        }
    }

    /// Open keepalive streams stop acknowledging but stay open, as over
    /// a half-open connection. Streams opened later are unaffected.
    pub fn silence_keepalives(&self) {
        let inner = self.inner.lock();
        for slot in inner.leases.values().flat_map(|lease| lease.keepalives.iter()) {
            slot.silenced.store(true, Ordering::SeqCst);
        }
    }

    /// Terminates every open watch stream.
    pub fn close_watches(&self) {
        self.inner.lock().watchers.clear();
    }

    /// Delivers a transient error to every watcher of `prefix`.
    pub fn inject_watch_error(
        &self,
        prefix: &str,
    ) {
        let mut inner = self.inner.lock();
        inner.watchers.retain(|w| !w.tx.is_closed());
        for watcher in inner.watchers.iter().filter(|w| w.prefix == prefix) {
            let err = StoreError::Watch {
                prefix: prefix.to_string(),
                reason: "injected".into(),
            };
            let _ = watcher.tx.try_send(Err(err.into()));
        }
    }

    /// Acts as if `lease_id` ran out of TTL: attached keys are deleted
    /// and its keepalive streams end.
    pub fn expire_lease(
        &self,
        lease_id: i64,
    ) -> bool {
        let mut inner = self.inner.lock();
        inner.drop_lease(lease_id)
    }

    /// Lease grants still scheduled to fail.
    pub fn pending_grant_failures(&self) -> usize {
        self.failing_grants.load(Ordering::SeqCst)
    }

    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn active_leases(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.inner.lock().leases.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of open watch streams on exactly `prefix`.
    pub fn watcher_count(
        &self,
        prefix: &str,
    ) -> usize {
        let mut inner = self.inner.lock();
        inner.watchers.retain(|w| !w.tx.is_closed());
        inner.watchers.iter().filter(|w| w.prefix == prefix).count()
    }

    /// Lease attached to `key`, if any.
    pub fn lease_of(
        &self,
        key: &str,
    ) -> Option<i64> {
        self.inner.lock().data.get(key).and_then(|e| e.lease)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Inner {
    fn put(
        &mut self,
        key: &str,
        value: Vec<u8>,
        lease: Option<i64>,
    ) -> Result<()> {
        if let Some(id) = lease {
            let entry = self
                .leases
                .get_mut(&id)
                .ok_or_else(|| StoreError::Backend(format!("requested lease not found: {id}")))?;
            entry.keys.insert(key.to_string());
        }

        let previous = self.data.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease,
            },
        );

        // Rebinding a key moves it off its previous lease
        if let Some(Entry {
            lease: Some(old), ..
        }) = &previous
        {
            if Some(*old) != lease {
                if let Some(old_lease) = self.leases.get_mut(old) {
                    old_lease.keys.remove(key);
                }
            }
        }

        self.notify(vec![WatchEvent {
            op: WatchOp::Put,
            key: key.to_string(),
            value,
            prev_value: previous.map(|e| e.value),
        }]);
        Ok(())
    }

    fn remove_keys(
        &mut self,
        keys: Vec<String>,
    ) {
        let mut events = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.data.remove(&key) {
                if let Some(id) = entry.lease {
                    if let Some(lease) = self.leases.get_mut(&id) {
                        lease.keys.remove(&key);
                    }
                }
                events.push(WatchEvent {
                    op: WatchOp::Delete,
                    key,
                    value: Vec::new(),
                    prev_value: Some(entry.value),
                });
            }
        }
        self.notify(events);
    }

    fn drop_lease(
        &mut self,
        lease_id: i64,
    ) -> bool {
        match self.leases.remove(&lease_id) {
            Some(lease) => {
                let mut keys: Vec<String> = lease.keys.into_iter().collect();
                keys.sort();
                self.remove_keys(keys);
                true
            }
            None => false,
        }
    }

    fn keys_with_prefix(
        &self,
        prefix: &str,
    ) -> Vec<String> {
        self.data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn notify(
        &mut self,
        events: Vec<WatchEvent>,
    ) {
        if events.is_empty() {
            return;
        }
        self.watchers.retain(|w| !w.tx.is_closed());
        for watcher in &self.watchers {
            let batch: Vec<WatchEvent> =
                events.iter().filter(|e| e.key.starts_with(&watcher.prefix)).cloned().collect();
            if batch.is_empty() {
                continue;
            }
            match watcher.tx.try_send(Ok(batch)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(prefix = %watcher.prefix, "watch buffer full, dropping events");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<i64>,
    ) -> Result<()> {
        trace!(key, ?lease, "memory put");
        self.inner.lock().put(key, value, lease)
    }

    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().data.get(key).map(|e| e.value.clone()))
    }

    async fn get_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let inner = self.inner.lock();
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn delete(
        &self,
        key: &str,
        with_prefix: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let keys = if with_prefix {
            inner.keys_with_prefix(key)
        } else {
            vec![key.to_string()]
        };
        inner.remove_keys(keys);
        Ok(())
    }

    async fn count(
        &self,
        key: &str,
        with_prefix: bool,
    ) -> Result<i64> {
        let inner = self.inner.lock();
        if with_prefix {
            Ok(inner.keys_with_prefix(key).len() as i64)
        } else {
            Ok(inner.data.contains_key(key) as i64)
        }
    }

    async fn grant_lease(
        &self,
        ttl_secs: i64,
    ) -> Result<i64> {
        if Self::take_failure(&self.failing_grants) {
            return Err(StoreError::Backend("lease grant unavailable".into()).into());
        }
        let mut inner = self.inner.lock();
        inner.next_lease_id += 1;
        let id = inner.next_lease_id;
        inner.leases.insert(
            id,
            Lease {
                ttl: ttl_secs,
                keys: HashSet::new(),
                keepalives: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(
        &self,
        lease_id: i64,
    ) -> Result<KeepAliveStream> {
        let mut inner = self.inner.lock();
        let lease = inner
            .leases
            .get_mut(&lease_id)
            .ok_or_else(|| Error::from(StoreError::KeepAliveClosed(lease_id)))?;
        let (tx, rx) = mpsc::channel(KEEPALIVE_CHANNEL_CAPACITY);
        // First acknowledgement is immediate, like the first etcd renewal
        let _ = tx.try_send(lease.ttl);

        let ttl = lease.ttl;
        let period = Duration::from_secs((ttl / 3).max(1) as u64);
        let silenced = Arc::new(AtomicBool::new(false));
        let stop = CancellationToken::new();
        lease.keepalives.push(KeepAliveSlot {
            silenced: silenced.clone(),
            _stop: stop.clone().drop_guard(),
        });

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tx.closed() => break,
                    _ = interval.tick() => {}
                }
                if silenced.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(TrySendError::Closed(_)) = tx.try_send(ttl) {
                    break;
                }
            }
            trace!(lease_id, "keepalive renewal stopped");
        });
        Ok(rx)
    }

    async fn revoke_lease(
        &self,
        lease_id: i64,
    ) -> Result<()> {
        if self.inner.lock().drop_lease(lease_id) {
            Ok(())
        } else {
            Err(StoreError::Backend(format!("requested lease not found: {lease_id}")).into())
        }
    }

    async fn watch(
        &self,
        prefix: &str,
    ) -> Result<WatchStream> {
        let gate = self.watch_gate.lock().clone();
        if let Some(gate) = gate {
            // Only ever closed, never given permits
            let _ = gate.acquire().await;
        }
        if Self::take_failure(&self.failing_watches) {
            return Err(StoreError::Watch {
                prefix: prefix.to_string(),
                reason: "watch unavailable".into(),
            }
            .into());
        }
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        self.inner.lock().watchers.push(WatcherSlot {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
