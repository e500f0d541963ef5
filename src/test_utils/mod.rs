//! Helpers shared by the unit tests of every module.

use std::time::Duration;

use crate::KvBackend;
use crate::MemoryBackend;
use crate::Metadata;
use crate::RegisterParams;
use crate::RegistryConfig;
use crate::ServerRecord;

pub(crate) const TEST_NAMESPACE: &str = "/unit";

/// Params of an `http` server at `host:8080` in [`TEST_NAMESPACE`].
pub(crate) fn test_params(
    server_type: &str,
    host: &str,
) -> RegisterParams {
    RegisterParams::new(
        server_type,
        TEST_NAMESPACE,
        "http://127.0.0.1:2379",
        Metadata::http(host, "8080"),
    )
}

/// Defaults with the shutdown pause removed.
pub(crate) fn test_config() -> RegistryConfig {
    let mut config = RegistryConfig::default();
    config.store.shutdown_delay_ms = 0;
    config
}

pub(crate) fn peer_record(
    server_type: &str,
    id: &str,
    host: &str,
) -> ServerRecord {
    ServerRecord {
        id: id.to_string(),
        server_type: server_type.to_string(),
        metadata: Metadata::http(host, "8080"),
        hostname: format!("{id}.local"),
        cpu_count: 2,
        created_at: "2026-01-01T00:00:00Z".to_string(),
    }
}

/// Writes `record` into `backend` under [`TEST_NAMESPACE`], unleased.
pub(crate) async fn seed_record(
    backend: &MemoryBackend,
    record: &ServerRecord,
) {
    seed(backend, &record.key(), record.encode().unwrap()).await;
}

pub(crate) async fn seed(
    backend: &MemoryBackend,
    key: &str,
    value: impl Into<Vec<u8>>,
) {
    backend.put(&format!("{TEST_NAMESPACE}{key}"), value.into(), None).await.unwrap();
}

/// Polls `cond` until it holds; panics with `what` after 5 s.
pub(crate) async fn eventually<F: Fn() -> bool>(
    what: &str,
    cond: F,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
