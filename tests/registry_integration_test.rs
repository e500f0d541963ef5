//! End-to-end registry scenarios over the in-process store.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::enable_logger;
use common::eventually;
use common::http_params;
use common::register;
use common::stored_under;
use common::NAMESPACE;
use sd_registry::KvBackend;
use sd_registry::LeaseStatus;
use sd_registry::MemoryBackend;
use sd_registry::RegistryState;

#[tokio::test]
async fn test_two_instances_see_each_other() {
    enable_logger();
    let backend = Arc::new(MemoryBackend::new());

    let first = register(&backend, http_params("app", "10.0.0.1", "8080")).await;
    let second = register(&backend, http_params("app", "10.0.0.2", "8080")).await;

    assert_ne!(first.self_record().id, second.self_record().id);
    eventually("first sees second", || first.servers_of_type("app").len() == 2).await;
    assert_eq!(second.servers_of_type("app").len(), 2);

    let hosts: HashSet<String> = first
        .servers_of_type("app")
        .iter()
        .filter_map(|s| s.metadata.http_host.clone())
        .collect();
    assert_eq!(hosts, HashSet::from(["10.0.0.1".to_string(), "10.0.0.2".to_string()]));

    first.shutdown().await.unwrap();
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_is_observed_by_peers() {
    enable_logger();
    let backend = Arc::new(MemoryBackend::new());
    let leaving = register(&backend, http_params("app", "10.0.0.1", "8080")).await;
    let staying = register(&backend, http_params("app", "10.0.0.2", "8080")).await;
    eventually("both registered", || leaving.servers_of_type("app").len() == 2).await;

    leaving.shutdown().await.unwrap();
    leaving.shutdown().await.unwrap();

    assert_eq!(leaving.state(), RegistryState::Terminated);
    eventually("peer drops the leaver", || staying.servers_of_type("app").len() == 1).await;
    assert_eq!(staying.servers_of_type("app")[0].id, staying.self_record().id);
    assert_eq!(stored_under(&backend, "/servers").await, 1);

    staying.shutdown().await.unwrap();
    assert_eq!(stored_under(&backend, "/servers").await, 0);
}

#[tokio::test]
async fn test_random_endpoint_visits_every_instance() {
    enable_logger();
    let backend = Arc::new(MemoryBackend::new());
    let mut registries = Vec::new();
    for host in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
        registries.push(register(&backend, http_params("web", host, "80")).await);
    }
    let caller = register(&backend, http_params("gateway", "10.0.9.9", "80")).await;
    eventually("all web instances cached", || caller.servers_of_type("web").len() == 3).await;

    let mut seen = HashSet::new();
    for _ in 0..300 {
        let (host, port) = caller.random_http_endpoint("web").expect("web instances exist");
        assert_eq!(port, "80");
        seen.insert(host);
    }
    assert_eq!(seen.len(), 3);
    assert_eq!(caller.random_http_endpoint("missing"), None);

    for r in registries.iter().chain(std::iter::once(&caller)) {
        r.shutdown().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_lost_lease_is_rebootstrapped_and_record_restored() {
    enable_logger();
    let backend = Arc::new(MemoryBackend::new());
    let registry = register(&backend, http_params("app", "10.0.0.1", "8080")).await;
    let first_lease = registry.store().lease_id().unwrap();
    let mut status = registry.store().subscribe_lease();

    backend.fail_next_grants(1);
    assert!(backend.expire_lease(first_lease));
    eventually("record removed with the lease", || registry.servers_of_type("app").is_empty()).await;

    let restored = *tokio::time::timeout(
        Duration::from_secs(30),
        status.wait_for(|s| matches!(s, LeaseStatus::Active { lease_id } if *lease_id != first_lease)),
    )
    .await
    .expect("lease not reacquired")
    .unwrap();
    let LeaseStatus::Active { lease_id } = restored else {
        unreachable!()
    };

    let key = format!("{NAMESPACE}{}", registry.self_record().key());
    eventually("record re-bound", || backend.lease_of(&key) == Some(lease_id)).await;
    eventually("record back in cache", || registry.servers_of_type("app").len() == 1).await;
    assert_eq!(backend.pending_grant_failures(), 0);

    registry.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_key_material_flows_to_every_instance() {
    enable_logger();
    let backend = Arc::new(MemoryBackend::new());
    let app = register(&backend, http_params("app", "10.0.0.1", "8080")).await;
    let db = register(&backend, http_params("db", "10.0.1.1", "5432")).await;

    backend.put(&format!("{NAMESPACE}/certs/private/app/sign"), b"app-only".to_vec(), None).await.unwrap();
    backend.put(&format!("{NAMESPACE}/certs/public/app/sign"), b"app-pub".to_vec(), None).await.unwrap();

    eventually("app private key", || app.private_key("sign").is_some()).await;
    eventually("db sees app public key", || db.public_key("app", "sign").is_some()).await;
    assert_eq!(db.private_key("sign"), None);

    app.shutdown().await.unwrap();
    db.shutdown().await.unwrap();
}
