//! Lease lifecycle of one store connection.
//!
//! ```text
//!   Idle --Granted--> Active --KeepAliveClosed--> Reacquiring{1}
//!                       ^                           |      ^
//!                       +--------Granted------------+      | RetryTimerFired
//!                                               GrantFailed |
//!                                                   v      |
//!                                            RetryPending{n}
//!   any --Revoked--> Revoked (terminal)
//! ```
//!
//! The transition table is the pure [`LeaseStatus::on`]; the background
//! task in [`LeaseManager`] only produces events. A keepalive stream that
//! yields no acknowledgement for a whole TTL counts as closed.

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::KeepAliveStream;
use super::KvBackend;
use crate::constants::NO_LEASE;
use crate::metrics;
use crate::Result;
use crate::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// No lease was ever granted
    Idle,
    Active {
        lease_id: i64,
    },
    /// Keepalive stream lost; a grant is in flight
    Reacquiring {
        attempt: u32,
    },
    /// Last grant failed; waiting for the retry timer
    RetryPending {
        attempt: u32,
    },
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseEvent {
    Granted(i64),
    GrantFailed,
    KeepAliveClosed,
    RetryTimerFired,
    Revoked,
}

impl LeaseStatus {
    /// Next status after `event`. Events that make no sense in the
    /// current status leave it unchanged.
    pub fn on(
        self,
        event: LeaseEvent,
    ) -> LeaseStatus {
        use LeaseEvent as E;
        use LeaseStatus as S;

        match (self, event) {
            (S::Revoked, _) => S::Revoked,
            (_, E::Revoked) => S::Revoked,

            (S::Idle, E::Granted(lease_id)) => S::Active { lease_id },
            (S::Reacquiring { .. }, E::Granted(lease_id)) => S::Active { lease_id },

            (S::Active { .. }, E::KeepAliveClosed) => S::Reacquiring { attempt: 1 },

            (S::Reacquiring { attempt }, E::GrantFailed) => S::RetryPending { attempt },
            (S::RetryPending { attempt }, E::RetryTimerFired) => S::Reacquiring {
                attempt: attempt.saturating_add(1),
            },

            (status, _) => status,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, LeaseStatus::Active { .. })
    }
}

/// Owns the registration lease and the rebootstrap loop.
///
/// The lease id is readable without locking by the put path; `0` means
/// no usable lease. Only the background task and [`revoke`](Self::revoke)
/// write it.
pub struct LeaseManager {
    backend: Arc<dyn KvBackend>,
    ttl: Duration,
    rebootstrap_interval: Duration,
    lease_id: AtomicI64,
    status_tx: watch::Sender<LeaseStatus>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("ttl", &self.ttl)
            .field("lease_id", &self.lease_id)
            .field("status", &*self.status_tx.borrow())
            .finish()
    }
}

impl LeaseManager {
    pub fn new(
        backend: Arc<dyn KvBackend>,
        ttl: Duration,
        rebootstrap_interval: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(LeaseStatus::Idle);
        Arc::new(Self {
            backend,
            ttl,
            rebootstrap_interval,
            lease_id: AtomicI64::new(NO_LEASE),
            status_tx,
            cancel,
            task: Mutex::new(None),
        })
    }

    /// Grants the first lease and starts the keepalive monitor.
    ///
    /// # Errors
    /// Fails when the grant fails or the keepalive stream ends before
    /// its first acknowledgement; the manager stays `Idle`.
    pub async fn bootstrap(self: &Arc<Self>) -> Result<i64> {
        let (lease_id, stream) = match self.try_acquire().await {
            Ok(granted) => granted,
            Err(e) => {
                self.transition(LeaseEvent::GrantFailed);
                return Err(e);
            }
        };
        self.lease_id.store(lease_id, Ordering::SeqCst);
        self.transition(LeaseEvent::Granted(lease_id));

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run(stream).await });
        *self.task.lock() = Some(handle);
        Ok(lease_id)
    }

    /// Current lease id, or `None` while no lease is usable.
    pub fn lease_id(&self) -> Option<i64> {
        match self.lease_id.load(Ordering::SeqCst) {
            NO_LEASE => None,
            id => Some(id),
        }
    }

    pub fn status(&self) -> LeaseStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeaseStatus> {
        self.status_tx.subscribe()
    }

    /// Stops the rebootstrap loop and revokes the lease, waiting at
    /// most `revoke_timeout`.
    ///
    /// Revoking when no lease is held succeeds.
    pub async fn revoke(
        &self,
        revoke_timeout: Duration,
    ) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }

        let lease_id = self.lease_id.swap(NO_LEASE, Ordering::SeqCst);
        self.transition(LeaseEvent::Revoked);
        if lease_id == NO_LEASE {
            debug!("no lease to revoke");
            return Ok(());
        }

        match timeout(revoke_timeout, self.backend.revoke_lease(lease_id)).await {
            Ok(Ok(())) => {
                info!(lease_id, "lease revoked");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StoreError::RevokeTimeout(revoke_timeout).into()),
        }
    }

    async fn try_acquire(&self) -> Result<(i64, KeepAliveStream)> {
        let lease_id = self.backend.grant_lease(self.ttl.as_secs() as i64).await?;
        match self.first_ack(lease_id).await {
            Ok(stream) => Ok((lease_id, stream)),
            Err(e) => {
                self.discard(lease_id).await;
                Err(e)
            }
        }
    }

    async fn first_ack(
        &self,
        lease_id: i64,
    ) -> Result<KeepAliveStream> {
        let mut stream = self.backend.keep_alive(lease_id).await?;
        match timeout(self.ttl, stream.recv()).await {
            Ok(Some(ttl)) => {
                debug!(lease_id, ttl, "first keepalive acknowledged");
                Ok(stream)
            }
            Ok(None) | Err(_) => Err(StoreError::KeepAliveClosed(lease_id).into()),
        }
    }

    /// Best-effort revoke of a lease that never became usable.
    async fn discard(
        &self,
        lease_id: i64,
    ) {
        match timeout(self.rebootstrap_interval, self.backend.revoke_lease(lease_id)).await {
            Ok(Ok(())) => debug!(lease_id, "unusable lease revoked"),
            Ok(Err(e)) => debug!(lease_id, error = %e, "unusable lease left to expire"),
            Err(_) => debug!(lease_id, "revoke of unusable lease timed out"),
        }
    }

    async fn run(
        self: Arc<Self>,
        mut stream: KeepAliveStream,
    ) {
        loop {
            // Active: drain acknowledgements until the stream ends or
            // stays silent for a whole TTL
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    ack = timeout(self.ttl, stream.recv()) => match ack {
                        Ok(Some(ttl)) => trace!(ttl, "keepalive"),
                        Ok(None) => {
                            warn!("keepalive stream closed");
                            break;
                        }
                        Err(_) => {
                            warn!(ttl = ?self.ttl, "no keepalive acknowledgement within ttl");
                            break;
                        }
                    },
                }
            }

            let lost = self.lease_id.swap(NO_LEASE, Ordering::SeqCst);
            warn!(lease_id = lost, "lease lost, rebootstrapping");
            self.transition(LeaseEvent::KeepAliveClosed);

            // Reacquiring / RetryPending
            loop {
                match self.try_acquire().await {
                    Ok((lease_id, next)) => {
                        self.lease_id.store(lease_id, Ordering::SeqCst);
                        self.transition(LeaseEvent::Granted(lease_id));
                        metrics::LEASE_REBOOTSTRAPS.with_label_values(&["success"]).inc();
                        info!(lease_id, "lease rebootstrapped");
                        stream = next;
                        break;
                    }
                    Err(e) => {
                        let status = self.transition(LeaseEvent::GrantFailed);
                        metrics::LEASE_REBOOTSTRAPS.with_label_values(&["failure"]).inc();
                        warn!(
                            ?status,
                            error = %e,
                            retry_in = ?self.rebootstrap_interval,
                            "lease rebootstrap failed"
                        );
                    }
                }

                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.rebootstrap_interval) => {}
                }
                self.transition(LeaseEvent::RetryTimerFired);
            }
        }
    }

    fn transition(
        &self,
        event: LeaseEvent,
    ) -> LeaseStatus {
        let mut next = LeaseStatus::Idle;
        self.status_tx.send_modify(|status| {
            let prev = *status;
            *status = prev.on(event);
            next = *status;
            if prev != next {
                debug!(?prev, ?next, ?event, "lease status changed");
            }
        });
        next
    }
}
