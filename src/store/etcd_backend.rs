use std::sync::Arc;
use std::time::Duration;

use etcd_client::Client;
use etcd_client::Compare;
use etcd_client::CompareOp;
use etcd_client::ConnectOptions;
use etcd_client::DeleteOptions;
use etcd_client::EventType;
use etcd_client::GetOptions;
use etcd_client::PutOptions;
use etcd_client::Txn;
use etcd_client::TxnOp;
use etcd_client::WatchOptions;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tonic::async_trait;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::ConnectParams;
use super::KeepAliveStream;
use super::KvBackend;
use super::WatchEvent;
use super::WatchOp;
use super::WatchStream;
use crate::constants::KEEPALIVE_CHANNEL_CAPACITY;
use crate::constants::WATCH_CHANNEL_CAPACITY;
use crate::Result;
use crate::StoreError;

/// [`KvBackend`] over an etcd v3 cluster.
///
/// The client sits behind a lock so [`reconnect`](KvBackend::reconnect)
/// can swap it; every request works on a clone taken under the read
/// lock, never holding the lock across an await.
pub struct EtcdBackend {
    client: RwLock<Client>,
    endpoints: Vec<String>,
    connect_options: Option<ConnectOptions>,
    dial_timeout: Duration,
    keepalive_interval: Duration,
}

impl std::fmt::Debug for EtcdBackend {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("EtcdBackend")
            .field("endpoints", &self.endpoints)
            .field("dial_timeout", &self.dial_timeout)
            .finish()
    }
}

impl EtcdBackend {
    /// Dials the cluster and verifies it answers within the dial timeout.
    ///
    /// # Errors
    /// - [`StoreError::AuthRejected`] when credentials are refused
    /// - [`StoreError::Connect`] when no endpoint answers in time
    pub async fn connect(params: &ConnectParams) -> Result<Arc<Self>> {
        let mut options = ConnectOptions::new().with_connect_timeout(params.dial_timeout);
        if let Some((user, password)) = &params.credentials {
            options = options.with_user(user.clone(), password.clone());
        }
        let connect_options = Some(options);

        let client = Self::dial(&params.endpoints, &connect_options, params.dial_timeout).await?;
        info!(endpoints = ?params.endpoints, "connected to etcd");

        Ok(Arc::new(Self {
            client: RwLock::new(client),
            endpoints: params.endpoints.clone(),
            connect_options,
            dial_timeout: params.dial_timeout,
            keepalive_interval: params.keepalive_interval,
        }))
    }

    async fn dial(
        endpoints: &[String],
        connect_options: &Option<ConnectOptions>,
        dial_timeout: Duration,
    ) -> Result<Client> {
        let joined = endpoints.join(",");
        let attempt = async {
            let mut client = Client::connect(endpoints.to_vec(), connect_options.clone()).await?;
            // Client::connect is lazy on some transports; force a round trip
            client.status().await?;
            Ok::<Client, etcd_client::Error>(client)
        };

        match timeout(dial_timeout, attempt).await {
            Ok(Ok(client)) => Ok(client),
            Ok(Err(e)) => match StoreError::from(e) {
                StoreError::AuthRejected(msg) => Err(StoreError::AuthRejected(msg).into()),
                other => Err(StoreError::Connect {
                    endpoints: joined,
                    source: Box::new(other),
                }
                .into()),
            },
            Err(elapsed) => Err(StoreError::Connect {
                endpoints: joined,
                source: Box::new(elapsed),
            }
            .into()),
        }
    }

    fn client(&self) -> Client {
        self.client.read().clone()
    }
}

#[async_trait]
impl KvBackend for EtcdBackend {
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<i64>,
    ) -> Result<()> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        self.client().put(key, value, options).await?;
        Ok(())
    }

    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<Vec<u8>>> {
        let resp = self.client().get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn get_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let resp = self.client().get(prefix, Some(GetOptions::new().with_prefix())).await?;
        let mut pairs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match kv.key_str() {
                Ok(key) => pairs.push((key.to_string(), kv.value().to_vec())),
                Err(e) => warn!(error = %e, "skipping non utf-8 key"),
            }
        }
        Ok(pairs)
    }

    async fn delete(
        &self,
        key: &str,
        with_prefix: bool,
    ) -> Result<()> {
        if !with_prefix {
            let resp = self.client().delete(key, None).await?;
            trace!(key, deleted = resp.deleted(), "delete");
            return Ok(());
        }

        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Greater, 0).with_prefix()])
            .and_then(vec![TxnOp::delete(key, Some(DeleteOptions::new().with_prefix()))]);
        let resp = self.client().txn(txn).await?;
        trace!(key, succeeded = resp.succeeded(), "prefix delete");
        Ok(())
    }

    async fn count(
        &self,
        key: &str,
        with_prefix: bool,
    ) -> Result<i64> {
        let mut options = GetOptions::new().with_count_only();
        if with_prefix {
            options = options.with_prefix();
        }
        let resp = self.client().get(key, Some(options)).await?;
        Ok(resp.count())
    }

    async fn grant_lease(
        &self,
        ttl_secs: i64,
    ) -> Result<i64> {
        let resp = self.client().lease_grant(ttl_secs, None).await?;
        debug!(lease_id = resp.id(), ttl = resp.ttl(), "lease granted");
        Ok(resp.id())
    }

    async fn keep_alive(
        &self,
        lease_id: i64,
    ) -> Result<KeepAliveStream> {
        let (mut keeper, mut stream) = self.client().lease_keep_alive(lease_id).await?;
        let (tx, rx) = mpsc::channel(KEEPALIVE_CHANNEL_CAPACITY);
        let keepalive_interval = self.keepalive_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(keepalive_interval);
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!(lease_id, "keepalive consumer gone");
                        break;
                    }
                    _ = interval.tick() => {}
                }

                if let Err(e) = keeper.keep_alive().await {
                    error!(lease_id, error = %e, "keepalive send failed");
                    break;
                }

                let message = match timeout(keepalive_interval * 3, stream.message()).await {
                    Ok(message) => message,
                    Err(_) => {
                        warn!(lease_id, "keepalive response timed out");
                        break;
                    }
                };
                match message {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        trace!(lease_id, ttl = resp.ttl(), "keepalive ok");
                        if tx.send(resp.ttl()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(_)) => {
                        warn!(lease_id, "lease expired on server");
                        break;
                    }
                    Ok(None) => {
                        warn!(lease_id, "keepalive stream closed");
                        break;
                    }
                    Err(e) => {
                        error!(lease_id, error = %e, "keepalive failed");
                        break;
                    }
                }
            }
            // Dropping tx closes the stream for the lease manager
        });

        Ok(rx)
    }

    async fn revoke_lease(
        &self,
        lease_id: i64,
    ) -> Result<()> {
        self.client().lease_revoke(lease_id).await?;
        Ok(())
    }

    async fn watch(
        &self,
        prefix: &str,
    ) -> Result<WatchStream> {
        let options = WatchOptions::new().with_prefix().with_prev_key();
        let (mut watcher, mut stream) =
            self.client().watch(prefix, Some(options)).await.map_err(|e| StoreError::Watch {
                prefix: prefix.to_string(),
                reason: e.to_string(),
            })?;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = tx.closed() => {
                        let _ = watcher.cancel().await;
                        break;
                    }
                    message = stream.message() => message,
                };

                match message {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            warn!(
                                prefix = %prefix,
                                compact_revision = resp.compact_revision(),
                                "watch canceled by server"
                            );
                            break;
                        }
                        let events = convert_events(resp.events());
                        if events.is_empty() {
                            continue;
                        }
                        if tx.send(Ok(events)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(prefix = %prefix, "watch stream ended");
                        break;
                    }
                    Err(e) => {
                        let err = StoreError::Watch {
                            prefix: prefix.clone(),
                            reason: e.to_string(),
                        };
                        if tx.send(Err(err.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn reconnect(&self) -> Result<()> {
        warn!(endpoints = ?self.endpoints, "reconnecting to etcd");
        let client = Self::dial(&self.endpoints, &self.connect_options, self.dial_timeout).await?;
        *self.client.write() = client;
        info!("reconnected to etcd");
        Ok(())
    }
}

fn convert_events(events: &[etcd_client::Event]) -> Vec<WatchEvent> {
    events
        .iter()
        .filter_map(|event| {
            let kv = event.kv()?;
            let key = match kv.key_str() {
                Ok(key) => key.to_string(),
                Err(e) => {
                    warn!(error = %e, "skipping event with non utf-8 key");
                    return None;
                }
            };
            let op = match event.event_type() {
                EventType::Put => WatchOp::Put,
                EventType::Delete => WatchOp::Delete,
            };
            Some(WatchEvent {
                op,
                key,
                value: kv.value().to_vec(),
                prev_value: event.prev_kv().map(|prev| prev.value().to_vec()),
            })
        })
        .collect()
}
