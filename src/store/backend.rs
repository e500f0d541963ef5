#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tonic::async_trait;

use super::WatchEvent;
use crate::Result;

/// Acknowledgements of one keepalive session; each item is the
/// remaining TTL in seconds reported by the store.
///
/// The receiver yielding `None` means the keepalive stream terminated
/// and the lease can no longer be trusted.
pub type KeepAliveStream = mpsc::Receiver<i64>;

/// Batches of changes below a watched prefix.
///
/// An `Err` item is a transient response error: the stream stays open.
/// The receiver yielding `None` means the watch stream closed.
pub type WatchStream = mpsc::Receiver<Result<Vec<WatchEvent>>>;

/// Consistent key-value store primitives consumed by [`KvStore`](super::KvStore).
///
/// Keys are absolute: namespace prefixing happens one layer up.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    /// Writes `value` at `key`, attached to `lease` when given.
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<i64>,
    ) -> Result<()>;

    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<Vec<u8>>>;

    /// All pairs whose key starts with `prefix`, keys unmodified.
    async fn get_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>>;

    /// Deletes `key`, or every key below it when `with_prefix` is set.
    /// The prefix form runs only if the prefix exists; deleting nothing
    /// is not an error.
    async fn delete(
        &self,
        key: &str,
        with_prefix: bool,
    ) -> Result<()>;

    /// Number of keys equal to `key`, or below it when `with_prefix`.
    async fn count(
        &self,
        key: &str,
        with_prefix: bool,
    ) -> Result<i64>;

    /// Grants a lease of `ttl_secs` and returns its id.
    async fn grant_lease(
        &self,
        ttl_secs: i64,
    ) -> Result<i64>;

    /// Starts renewing `lease_id` in the background.
    ///
    /// # Errors
    /// Fails when the keepalive stream cannot be opened.
    async fn keep_alive(
        &self,
        lease_id: i64,
    ) -> Result<KeepAliveStream>;

    /// Revokes `lease_id`; every key attached to it is deleted.
    async fn revoke_lease(
        &self,
        lease_id: i64,
    ) -> Result<()>;

    /// Opens a prefix watch that reports previous values.
    async fn watch(
        &self,
        prefix: &str,
    ) -> Result<WatchStream>;

    /// Drops the current connection and dials a fresh one.
    async fn reconnect(&self) -> Result<()>;
}
