//! In-memory projections of the registry namespace.
//!
//! Three categories are cached:
//! - servers by type (`/servers/{type}/{id}`)
//! - private keys of the local server type (`/certs/private/{type}/{name}`)
//! - public keys of every type (`/certs/public/{type}/{name}`)
//!
//! Each category is an immutable map behind an [`ArcSwap`]. Writers
//! build a new map (or a new bucket) and swap it in; readers load a
//! snapshot and never observe a half-updated bucket. Writers are the
//! full-sync path and the watch dispatchers, both owned by the
//! registry.

mod record;
pub use record::*;

#[cfg(test)]
mod cache_test;

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use tracing::debug;
use tracing::warn;

use crate::metrics;
use crate::DecodeError;
use crate::WatchEvent;
use crate::WatchOp;

type ServerBuckets = HashMap<String, Arc<Vec<ServerRecord>>>;
type KeyBucket = HashMap<String, Bytes>;
type PublicKeyBuckets = HashMap<String, Arc<KeyBucket>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheCategory {
    Servers,
    PrivateKeys,
    PublicKeys,
}

impl CacheCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheCategory::Servers => "servers",
            CacheCategory::PrivateKeys => "private_keys",
            CacheCategory::PublicKeys => "public_keys",
        }
    }
}

#[derive(Debug, Default)]
pub struct RegistryCache {
    servers: ArcSwap<ServerBuckets>,
    private_keys: ArcSwap<KeyBucket>,
    public_keys: ArcSwap<PublicKeyBuckets>,
    /// Only private keys published under this type are kept. `None`
    /// accepts every type.
    private_key_owner: Option<String>,
}

impl RegistryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache that keeps private keys of `server_type` only.
    pub fn scoped_to(server_type: impl Into<String>) -> Self {
        Self {
            private_key_owner: Some(server_type.into()),
            ..Self::default()
        }
    }

    /// Replaces the whole map of one category from a flat list of
    /// `(key, value)` pairs read under the category prefix.
    ///
    /// Entries that fail to decode are logged and skipped. Returns the
    /// number of entries ingested.
    pub fn full_sync(
        &self,
        category: CacheCategory,
        entries: Vec<(String, Vec<u8>)>,
    ) -> usize {
        let total = entries.len();
        let ingested = match category {
            CacheCategory::Servers => self.sync_servers(entries),
            CacheCategory::PrivateKeys => self.sync_private_keys(entries),
            CacheCategory::PublicKeys => self.sync_public_keys(entries),
        };
        debug!(
            category = category.as_str(),
            total,
            ingested,
            "full sync applied"
        );
        ingested
    }

    /// Routes a watch event to the handler of `category`.
    pub fn apply(
        &self,
        category: CacheCategory,
        event: &WatchEvent,
    ) {
        match category {
            CacheCategory::Servers => self.apply_server_event(event.op, &event.key, &event.value),
            CacheCategory::PrivateKeys => {
                self.apply_private_key_event(event.op, &event.key, &event.value)
            }
            CacheCategory::PublicKeys => {
                self.apply_public_key_event(event.op, &event.key, &event.value)
            }
        }
    }

    /// `put`: decode and upsert by id into the record's type bucket.
    /// `delete`: remove the `(type, id)` taken from the key path.
    pub fn apply_server_event(
        &self,
        op: WatchOp,
        key: &str,
        value: &[u8],
    ) {
        match op {
            WatchOp::Put => {
                let record = match ServerRecord::decode(key, value) {
                    Ok(record) => record,
                    Err(e) => {
                        report_decode_failure(CacheCategory::Servers, &e);
                        return;
                    }
                };
                self.servers.rcu(|current| {
                    let mut next = ServerBuckets::clone(current);
                    let mut bucket: Vec<ServerRecord> = next
                        .get(&record.server_type)
                        .map(|b| b.iter().filter(|r| r.id != record.id).cloned().collect())
                        .unwrap_or_default();
                    bucket.push(record.clone());
                    next.insert(record.server_type.clone(), Arc::new(bucket));
                    next
                });
                self.update_server_gauge(&record.server_type);
            }
            WatchOp::Delete => {
                let (server_type, id) = match split_key_path(key) {
                    Ok(parts) => parts,
                    Err(e) => {
                        report_decode_failure(CacheCategory::Servers, &e);
                        return;
                    }
                };
                self.servers.rcu(|current| {
                    let mut next = ServerBuckets::clone(current);
                    if let Some(bucket) = current.get(server_type) {
                        let remaining: Vec<ServerRecord> =
                            bucket.iter().filter(|r| r.id != id).cloned().collect();
                        if remaining.is_empty() {
                            next.remove(server_type);
                        } else {
                            next.insert(server_type.to_string(), Arc::new(remaining));
                        }
                    }
                    next
                });
                self.update_server_gauge(server_type);
            }
        }
    }

    pub fn apply_private_key_event(
        &self,
        op: WatchOp,
        key: &str,
        value: &[u8],
    ) {
        let name = match split_key_path(key) {
            Ok((owner, name)) if self.owns_private_key(owner) => name,
            Ok((owner, _)) => {
                warn!(key, owner, "ignoring private key of another server type");
                return;
            }
            Err(e) => {
                report_decode_failure(CacheCategory::PrivateKeys, &e);
                return;
            }
        };
        match op {
            WatchOp::Put => {
                let material = decode_private_key(value);
                self.private_keys.rcu(|current| {
                    let mut next = KeyBucket::clone(current);
                    next.insert(name.to_string(), material.clone());
                    next
                });
            }
            WatchOp::Delete => {
                self.private_keys.rcu(|current| {
                    let mut next = KeyBucket::clone(current);
                    next.remove(name);
                    next
                });
            }
        }
    }

    pub fn apply_public_key_event(
        &self,
        op: WatchOp,
        key: &str,
        value: &[u8],
    ) {
        let (server_type, name) = match split_key_path(key) {
            Ok(parts) => parts,
            Err(e) => {
                report_decode_failure(CacheCategory::PublicKeys, &e);
                return;
            }
        };
        let material = Bytes::copy_from_slice(value);
        self.public_keys.rcu(|current| {
            let mut next = PublicKeyBuckets::clone(current);
            let mut bucket = current
                .get(server_type)
                .map(|b| KeyBucket::clone(b))
                .unwrap_or_default();
            match op {
                WatchOp::Put => {
                    bucket.insert(name.to_string(), material.clone());
                }
                WatchOp::Delete => {
                    bucket.remove(name);
                }
            }
            next.insert(server_type.to_string(), Arc::new(bucket));
            next
        });
    }

    /// Snapshot of the servers of one type; empty when none are known.
    pub fn servers_of_type(
        &self,
        server_type: &str,
    ) -> Arc<Vec<ServerRecord>> {
        self.servers.load().get(server_type).cloned().unwrap_or_default()
    }

    pub fn server_types(&self) -> Vec<String> {
        self.servers.load().keys().cloned().collect()
    }

    pub fn private_key(
        &self,
        name: &str,
    ) -> Option<Bytes> {
        self.private_keys.load().get(name).cloned()
    }

    pub fn public_key(
        &self,
        server_type: &str,
        name: &str,
    ) -> Option<Bytes> {
        self.public_keys.load().get(server_type).and_then(|bucket| bucket.get(name).cloned())
    }

    fn sync_servers(
        &self,
        entries: Vec<(String, Vec<u8>)>,
    ) -> usize {
        let mut grouped: HashMap<String, Vec<ServerRecord>> = HashMap::new();
        let mut ingested = 0;
        for (key, value) in entries {
            match ServerRecord::decode(&key, &value) {
                Ok(record) => {
                    let bucket = grouped.entry(record.server_type.clone()).or_default();
                    // One record per (type, id)
                    bucket.retain(|r| r.id != record.id);
                    bucket.push(record);
                    ingested += 1;
                }
                Err(e) => report_decode_failure(CacheCategory::Servers, &e),
            }
        }

        let previous_types = self.server_types();
        let next: ServerBuckets = grouped.into_iter().map(|(t, list)| (t, Arc::new(list))).collect();
        self.servers.store(Arc::new(next));

        for server_type in previous_types.iter().chain(self.server_types().iter()) {
            self.update_server_gauge(server_type);
        }
        ingested
    }

    fn sync_private_keys(
        &self,
        entries: Vec<(String, Vec<u8>)>,
    ) -> usize {
        let mut next = KeyBucket::new();
        for (key, value) in entries {
            match split_key_path(&key) {
                Ok((owner, name)) if self.owns_private_key(owner) => {
                    next.insert(name.to_string(), decode_private_key(&value));
                }
                Ok((owner, _)) => warn!(key = %key, owner, "ignoring private key of another server type"),
                Err(e) => report_decode_failure(CacheCategory::PrivateKeys, &e),
            }
        }
        let ingested = next.len();
        self.private_keys.store(Arc::new(next));
        ingested
    }

    fn owns_private_key(
        &self,
        owner: &str,
    ) -> bool {
        self.private_key_owner.as_deref().map_or(true, |own| own == owner)
    }

    fn sync_public_keys(
        &self,
        entries: Vec<(String, Vec<u8>)>,
    ) -> usize {
        let mut grouped: HashMap<String, KeyBucket> = HashMap::new();
        let mut ingested = 0;
        for (key, value) in entries {
            match split_key_path(&key) {
                Ok((server_type, name)) => {
                    grouped
                        .entry(server_type.to_string())
                        .or_default()
                        .insert(name.to_string(), Bytes::from(value));
                    ingested += 1;
                }
                Err(e) => report_decode_failure(CacheCategory::PublicKeys, &e),
            }
        }
        let next: PublicKeyBuckets = grouped.into_iter().map(|(t, b)| (t, Arc::new(b))).collect();
        self.public_keys.store(Arc::new(next));
        ingested
    }

    fn update_server_gauge(
        &self,
        server_type: &str,
    ) {
        let count = self.servers.load().get(server_type).map(|b| b.len()).unwrap_or(0);
        metrics::CACHED_SERVERS.with_label_values(&[server_type]).set(count as i64);
    }
}

/// Private keys may be published base64-encoded; decode when the value
/// is valid base64, otherwise keep the raw bytes.
pub(crate) fn decode_private_key(value: &[u8]) -> Bytes {
    match STANDARD.decode(value) {
        Ok(decoded) => Bytes::from(decoded),
        Err(_) => Bytes::copy_from_slice(value),
    }
}

fn report_decode_failure(
    category: CacheCategory,
    err: &DecodeError,
) {
    warn!(category = category.as_str(), error = %err, "skipping undecodable store entry");
    metrics::CACHE_DECODE_FAILURES.with_label_values(&[category.as_str()]).inc();
}
