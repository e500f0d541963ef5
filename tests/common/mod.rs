#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sd_registry::KvBackend;
use sd_registry::MemoryBackend;
use sd_registry::Metadata;
use sd_registry::RegisterParams;
use sd_registry::RegistryConfig;
use sd_registry::ServiceRegistry;
use tracing_subscriber::EnvFilter;

pub const NAMESPACE: &str = "/it";

pub fn enable_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

pub fn fast_config() -> RegistryConfig {
    let mut config = RegistryConfig::default();
    config.store.shutdown_delay_ms = 10;
    config
}

pub fn http_params(
    server_type: &str,
    host: &str,
    port: &str,
) -> RegisterParams {
    RegisterParams::new(
        server_type,
        NAMESPACE,
        "http://127.0.0.1:2379",
        Metadata::http(host, port),
    )
}

pub async fn register(
    backend: &Arc<MemoryBackend>,
    params: RegisterParams,
) -> ServiceRegistry {
    ServiceRegistry::register_with_backend(params, backend.clone(), &fast_config())
        .await
        .expect("registration on the in-memory store failed")
}

/// Number of keys stored below `prefix` in [`NAMESPACE`].
pub async fn stored_under(
    backend: &MemoryBackend,
    prefix: &str,
) -> i64 {
    backend.count(&format!("{NAMESPACE}{prefix}"), true).await.unwrap()
}

/// Polls `cond` until it holds; panics with `what` after 5 s.
pub async fn eventually<F: Fn() -> bool>(
    what: &str,
    cond: F,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
