use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::WatchCallback;
use super::WatchEvent;
use super::WatchOp;
use super::WatchRegistry;
use super::WatchRetryAction;
use super::WatchRetryPolicy;
use crate::KvBackend;
use crate::MemoryBackend;

const NS: &str = "/ns";

fn registry_on(
    backend: Arc<MemoryBackend>,
    cancel: CancellationToken,
) -> WatchRegistry {
    WatchRegistry::new(backend, NS, WatchRetryPolicy::default(), cancel)
}

/// Callback forwarding `(tag, event)` into a channel the test awaits.
fn forwarding(
    tag: &'static str,
    tx: mpsc::UnboundedSender<(&'static str, WatchEvent)>,
) -> WatchCallback {
    Arc::new(move |event: &WatchEvent| {
        let _ = tx.send((tag, event.clone()));
    })
}

async fn next(rx: &mut mpsc::UnboundedReceiver<(&'static str, WatchEvent)>) -> (&'static str, WatchEvent) {
    timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("no event delivered in time")
        .expect("callback channel closed")
}

#[test]
fn test_retry_policy_escalates_after_max_failures() {
    let policy = WatchRetryPolicy {
        reopen_interval: Duration::from_secs(1),
        max_failed_attempts: 10,
        error_pause: Duration::from_millis(100),
    };

    assert_eq!(policy.on_failure(1), WatchRetryAction::Reopen);
    assert_eq!(policy.on_failure(10), WatchRetryAction::Reopen);
    assert_eq!(policy.on_failure(11), WatchRetryAction::Reconnect);
}

#[test]
fn test_default_policy_values() {
    let policy = WatchRetryPolicy::default();
    assert_eq!(policy.reopen_interval, Duration::from_secs(1));
    assert_eq!(policy.max_failed_attempts, 10);
    assert_eq!(policy.error_pause, Duration::from_millis(100));
}

#[tokio::test]
async fn test_same_prefix_shares_one_stream_and_fans_out_in_order() {
    let backend = Arc::new(MemoryBackend::new());
    let watches = registry_on(backend.clone(), CancellationToken::new());
    let (tx, mut rx) = mpsc::unbounded_channel();

    watches.watch("/servers", vec![forwarding("first", tx.clone())]).await.unwrap();
    watches.watch("/servers", vec![forwarding("second", tx.clone())]).await.unwrap();

    assert_eq!(backend.watcher_count("/ns/servers"), 1);
    assert_eq!(watches.callback_count("/servers"), 2);

    backend.put("/ns/servers/app/a", b"v1".to_vec(), None).await.unwrap();

    let (tag, event) = next(&mut rx).await;
    assert_eq!(tag, "first");
    assert_eq!(event.op, WatchOp::Put);
    assert_eq!(event.key, "/servers/app/a");
    assert_eq!(event.value, b"v1".to_vec());
    assert_eq!(next(&mut rx).await.0, "second");
}

#[tokio::test]
async fn test_delete_event_carries_previous_value() {
    let backend = Arc::new(MemoryBackend::new());
    let watches = registry_on(backend.clone(), CancellationToken::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    watches.watch("/certs/public", vec![forwarding("cb", tx)]).await.unwrap();

    backend.put("/ns/certs/public/app/sign", b"key".to_vec(), None).await.unwrap();
    backend.delete("/ns/certs/public/app/sign", false).await.unwrap();

    assert_eq!(next(&mut rx).await.1.op, WatchOp::Put);
    let (_, deleted) = next(&mut rx).await;
    assert_eq!(deleted.op, WatchOp::Delete);
    assert_eq!(deleted.prev_value, Some(b"key".to_vec()));
}

#[tokio::test(start_paused = true)]
async fn test_transient_error_keeps_stream() {
    let backend = Arc::new(MemoryBackend::new());
    let watches = registry_on(backend.clone(), CancellationToken::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    watches.watch("/servers", vec![forwarding("cb", tx)]).await.unwrap();

    backend.inject_watch_error("/ns/servers");
    backend.put("/ns/servers/app/a", Vec::new(), None).await.unwrap();

    assert_eq!(next(&mut rx).await.1.key, "/servers/app/a");
    assert_eq!(backend.watcher_count("/ns/servers"), 1);
    assert_eq!(backend.reconnect_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_closed_stream_is_reopened() {
    let backend = Arc::new(MemoryBackend::new());
    let watches = registry_on(backend.clone(), CancellationToken::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    watches.watch("/servers", vec![forwarding("cb", tx)]).await.unwrap();

    backend.close_watches();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(backend.watcher_count("/ns/servers"), 1);
    backend.put("/ns/servers/app/b", Vec::new(), None).await.unwrap();
    assert_eq!(next(&mut rx).await.1.key, "/servers/app/b");
    assert_eq!(backend.reconnect_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_too_many_failed_reopens() {
    let backend = Arc::new(MemoryBackend::new());
    let watches = registry_on(backend.clone(), CancellationToken::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    watches.watch("/servers", vec![forwarding("cb", tx)]).await.unwrap();

    backend.fail_next_watches(11);
    backend.close_watches();
    tokio::time::sleep(Duration::from_secs(13)).await;

    assert_eq!(backend.reconnect_count(), 1);
    assert_eq!(backend.watcher_count("/ns/servers"), 1);
    backend.put("/ns/servers/app/c", Vec::new(), None).await.unwrap();
    assert_eq!(next(&mut rx).await.1.key, "/servers/app/c");
}

#[tokio::test(start_paused = true)]
async fn test_stop_ends_dispatchers() {
    let backend = Arc::new(MemoryBackend::new());
    let cancel = CancellationToken::new();
    let watches = registry_on(backend.clone(), cancel.clone());
    let (tx, _rx) = mpsc::unbounded_channel();
    watches.watch("/servers", vec![forwarding("cb", tx.clone())]).await.unwrap();
    watches.watch("/certs/public", vec![forwarding("cb", tx)]).await.unwrap();

    watches.stop().await;

    assert!(cancel.is_cancelled());
    assert_eq!(backend.watcher_count("/ns/servers"), 0);
    assert_eq!(backend.watcher_count("/ns/certs/public"), 0);
}

#[tokio::test]
async fn test_failed_first_open_leaves_prefix_unregistered() {
    let backend = Arc::new(MemoryBackend::new());
    let watches = registry_on(backend.clone(), CancellationToken::new());
    backend.fail_next_watches(1);

    assert!(watches.watch("/servers", Vec::new()).await.is_err());
    assert!(watches.prefixes().is_empty());

    watches.watch("/servers", Vec::new()).await.unwrap();
    assert_eq!(watches.prefixes(), vec!["/servers".to_string()]);
}

#[tokio::test]
async fn test_failed_first_open_fails_every_joined_caller() {
    let backend = Arc::new(MemoryBackend::new());
    let watches = Arc::new(registry_on(backend.clone(), CancellationToken::new()));
    let (tx, _rx) = mpsc::unbounded_channel();
    backend.hold_watches();
    backend.fail_next_watches(1);

    let first = tokio::spawn({
        let watches = watches.clone();
        async move { watches.watch("/servers", Vec::new()).await }
    });
    while watches.prefixes().is_empty() {
        tokio::task::yield_now().await;
    }
    let joined = tokio::spawn({
        let watches = watches.clone();
        let callback = forwarding("joined", tx);
        async move { watches.watch("/servers", vec![callback]).await }
    });
    while watches.callback_count("/servers") == 0 {
        tokio::task::yield_now().await;
    }

    backend.release_watches();

    assert!(first.await.unwrap().is_err());
    assert!(joined.await.unwrap().is_err());
    assert!(watches.prefixes().is_empty());

    watches.watch("/servers", Vec::new()).await.unwrap();
    assert_eq!(backend.watcher_count("/ns/servers"), 1);
}

#[tokio::test]
async fn test_caller_joining_pending_open_waits_for_it() {
    let backend = Arc::new(MemoryBackend::new());
    let watches = Arc::new(registry_on(backend.clone(), CancellationToken::new()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    backend.hold_watches();

    let first = tokio::spawn({
        let watches = watches.clone();
        async move { watches.watch("/servers", Vec::new()).await }
    });
    while watches.prefixes().is_empty() {
        tokio::task::yield_now().await;
    }
    let joined = tokio::spawn({
        let watches = watches.clone();
        let callback = forwarding("joined", tx);
        async move { watches.watch("/servers", vec![callback]).await }
    });
    tokio::task::yield_now().await;
    assert!(!joined.is_finished());

    backend.release_watches();
    first.await.unwrap().unwrap();
    joined.await.unwrap().unwrap();

    backend.put("/ns/servers/app/a", b"1".to_vec(), None).await.unwrap();
    let (tag, event) = next(&mut rx).await;
    assert_eq!(tag, "joined");
    assert_eq!(event.key, "/servers/app/a");
}
