//! Prefix subscriptions with one dispatcher task per prefix.
//!
//! A dispatcher is either streaming or recovering. While recovering it
//! waits the reopen interval, asks [`WatchRetryPolicy`] what to do with
//! the current failure count, and either re-opens the stream or first
//! re-establishes the whole connection.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::KvBackend;
use super::WatchEvent;
use super::WatchStream;
use crate::metrics;
use crate::Result;
use crate::RetryPolicies;
use crate::StoreError;

/// Receives every event of the prefix it was registered on.
///
/// Called on the dispatcher task; must not block.
pub type WatchCallback = Arc<dyn Fn(&WatchEvent) + Send + Sync>;

type CallbackList = Arc<RwLock<Vec<WatchCallback>>>;

/// Outcome of the first stream open of a prefix, shared with callers
/// that joined while it was pending.
#[derive(Debug, Clone, PartialEq, Eq)]
enum OpenState {
    Pending,
    Open,
    Failed(String),
}

struct Subscription {
    callbacks: CallbackList,
    opened: watch::Receiver<OpenState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchRetryAction {
    /// Open a new stream on the current connection
    Reopen,
    /// Re-establish the connection, then open a new stream
    Reconnect,
}

impl WatchRetryAction {
    fn as_str(&self) -> &'static str {
        match self {
            WatchRetryAction::Reopen => "reopen",
            WatchRetryAction::Reconnect => "reconnect",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchRetryPolicy {
    pub reopen_interval: Duration,
    pub max_failed_attempts: u32,
    pub error_pause: Duration,
}

impl Default for WatchRetryPolicy {
    fn default() -> Self {
        Self::from(&RetryPolicies::default())
    }
}

impl From<&RetryPolicies> for WatchRetryPolicy {
    fn from(retry: &RetryPolicies) -> Self {
        Self {
            reopen_interval: retry.watch_reopen_interval(),
            max_failed_attempts: retry.watch_max_failed_attempts,
            error_pause: retry.watch_error_pause(),
        }
    }
}

impl WatchRetryPolicy {
    /// Action for the `consecutive_failures`-th failure in a row
    /// (counting the stream close that started the recovery).
    pub fn on_failure(
        &self,
        consecutive_failures: u32,
    ) -> WatchRetryAction {
        if consecutive_failures > self.max_failed_attempts {
            WatchRetryAction::Reconnect
        } else {
            WatchRetryAction::Reopen
        }
    }
}

pub struct WatchRegistry {
    backend: Arc<dyn KvBackend>,
    namespace: String,
    policy: WatchRetryPolicy,
    subscriptions: DashMap<String, Subscription>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WatchRegistry {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WatchRegistry")
            .field("namespace", &self.namespace)
            .field("prefixes", &self.prefixes())
            .finish()
    }
}

impl WatchRegistry {
    pub fn new(
        backend: Arc<dyn KvBackend>,
        namespace: impl Into<String>,
        policy: WatchRetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            policy,
            subscriptions: DashMap::new(),
            cancel,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Registers `callbacks` on `prefix` (namespace-relative).
    ///
    /// The first registration for a prefix opens its stream and spawns
    /// its dispatcher; later ones only extend the callback list, and wait
    /// for the first open when it is still pending.
    ///
    /// # Errors
    /// Fails if the first stream of a new prefix cannot be opened; the
    /// prefix is then left unregistered and every caller that joined the
    /// pending open gets the error too.
    pub async fn watch(
        &self,
        prefix: &str,
        callbacks: Vec<WatchCallback>,
    ) -> Result<()> {
        let (list, opened_tx) = match self.subscriptions.entry(prefix.to_string()) {
            Entry::Occupied(existing) => {
                let sub = existing.get();
                sub.callbacks.write().extend(callbacks);
                let list = sub.callbacks.clone();
                let opened = sub.opened.clone();
                drop(existing);
                debug!(prefix, "appended watch callbacks");
                return self.await_first_open(prefix, &list, opened).await;
            }
            Entry::Vacant(slot) => {
                let list: CallbackList = Arc::new(RwLock::new(callbacks));
                let (opened_tx, opened) = watch::channel(OpenState::Pending);
                slot.insert(Subscription {
                    callbacks: list.clone(),
                    opened,
                });
                (list, opened_tx)
            }
        };

        let full_prefix = format!("{}{}", self.namespace, prefix);
        let stream = match self.backend.watch(&full_prefix).await {
            Ok(stream) => stream,
            Err(e) => {
                self.subscriptions.remove(prefix);
                opened_tx.send_replace(OpenState::Failed(e.to_string()));
                return Err(e);
            }
        };

        let dispatcher = PrefixDispatcher {
            backend: self.backend.clone(),
            namespace: self.namespace.clone(),
            prefix: prefix.to_string(),
            callbacks: list,
            policy: self.policy,
            cancel: self.cancel.clone(),
        };
        let handle = tokio::spawn(dispatcher.run(stream));
        self.tasks.lock().push(handle);
        opened_tx.send_replace(OpenState::Open);
        info!(prefix = %full_prefix, "watch installed");
        Ok(())
    }

    async fn await_first_open(
        &self,
        prefix: &str,
        list: &CallbackList,
        mut opened: watch::Receiver<OpenState>,
    ) -> Result<()> {
        let state = match opened.wait_for(|state| *state != OpenState::Pending).await {
            Ok(state) => state.clone(),
            // Opening caller went away before finishing
            Err(_) => {
                self.subscriptions.remove_if(prefix, |_, sub| Arc::ptr_eq(&sub.callbacks, list));
                OpenState::Failed("first open abandoned".into())
            }
        };
        match state {
            OpenState::Failed(reason) => Err(StoreError::Watch {
                prefix: format!("{}{}", self.namespace, prefix),
                reason,
            }
            .into()),
            _ => Ok(()),
        }
    }

    pub fn prefixes(&self) -> Vec<String> {
        self.subscriptions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn callback_count(
        &self,
        prefix: &str,
    ) -> usize {
        self.subscriptions.get(prefix).map(|sub| sub.callbacks.read().len()).unwrap_or(0)
    }

    /// Cancels every dispatcher and waits for them to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "watch dispatcher ended abnormally");
            }
        }
    }
}

struct PrefixDispatcher {
    backend: Arc<dyn KvBackend>,
    namespace: String,
    prefix: String,
    callbacks: CallbackList,
    policy: WatchRetryPolicy,
    cancel: CancellationToken,
}

impl PrefixDispatcher {
    async fn run(
        self,
        mut stream: WatchStream,
    ) {
        loop {
            self.stream_until_closed(&mut stream).await;
            if self.cancel.is_cancelled() {
                break;
            }
            match self.recover().await {
                Some(next) => stream = next,
                None => break,
            }
        }
        debug!(prefix = %self.prefix, "watch dispatcher stopped");
    }

    async fn stream_until_closed(
        &self,
        stream: &mut WatchStream,
    ) {
        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => return,
                item = stream.recv() => item,
            };

            match item {
                Some(Ok(events)) => {
                    for event in events {
                        self.dispatch(event);
                    }
                }
                Some(Err(e)) => {
                    warn!(prefix = %self.prefix, error = %e, "watch response error");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.policy.error_pause) => {}
                    }
                }
                None => {
                    warn!(
                        prefix = %self.prefix,
                        retry_in = ?self.policy.reopen_interval,
                        "watch stream closed"
                    );
                    return;
                }
            }
        }
    }

    /// Returns a fresh stream, or `None` once cancelled.
    async fn recover(&self) -> Option<WatchStream> {
        let full_prefix = format!("{}{}", self.namespace, self.prefix);
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.policy.reopen_interval) => {}
            }
            failures += 1;

            let action = self.policy.on_failure(failures);
            metrics::WATCH_RECOVERIES.with_label_values(&[&self.prefix, action.as_str()]).inc();
            if action == WatchRetryAction::Reconnect {
                warn!(prefix = %self.prefix, failures, "too many failed watch attempts, reconnecting");
                if let Err(e) = self.backend.reconnect().await {
                    error!(prefix = %self.prefix, error = %e, "reconnect failed");
                }
                failures = 0;
            }

            match self.backend.watch(&full_prefix).await {
                Ok(stream) => {
                    info!(prefix = %self.prefix, "watch stream re-opened");
                    return Some(stream);
                }
                Err(e) => {
                    warn!(prefix = %self.prefix, failures, error = %e, "watch re-open failed");
                }
            }
        }
    }

    fn dispatch(
        &self,
        mut event: WatchEvent,
    ) {
        if let Some(stripped) = event.key.strip_prefix(&self.namespace) {
            event.key = stripped.to_string();
        }
        metrics::WATCH_EVENTS.with_label_values(&[&self.prefix, event.op.as_str()]).inc();

        // Snapshot so callbacks run without holding the lock
        let callbacks: Vec<WatchCallback> = self.callbacks.read().clone();
        for callback in &callbacks {
            callback(&event);
        }
    }
}
