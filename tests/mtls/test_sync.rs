use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use flowplane_sidecar::{
    storage::FileSecretStore,
    sync::{Cycle, InitProbe, ProbeExit, SyncLoop},
    BackoffPolicy,
};
use serde_json::json;
use tempfile::TempDir;

use super::support::{secrets_file, MockAuthority, Reply, TestCa, AUTHORITY_ID, WORKLOAD_ID};

fn policy() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(8), 2, 1, 1)
}

#[tokio::test]
async fn sync_cycle_writes_secret_file_verbatim() {
    let ca = TestCa::new("Flowplane Test CA");
    let body = "{\n  \"api_key\": \"abc123\"\n}\n";
    let authority =
        MockAuthority::spawn(&ca, AUTHORITY_ID, &ca, Reply::Json(json!({ "data": body }))).await;

    let output = TempDir::new().unwrap();
    let path = secrets_file(&output);
    let fetcher = Arc::new(authority.fetcher(ca.static_source(WORKLOAD_ID)));
    let store = Arc::new(FileSecretStore::new(path.clone()));

    let mut sync = SyncLoop::new(fetcher, store, policy());
    assert_eq!(sync.step().await, Cycle::Continue(Duration::from_secs(1)));

    assert_eq!(std::fs::read_to_string(&path).unwrap(), body);
    assert_eq!(sync.state().error_streak(), 0);
}

#[tokio::test]
async fn sync_cycle_backs_off_while_secret_is_missing() {
    let ca = TestCa::new("Flowplane Test CA");
    let authority =
        MockAuthority::spawn(&ca, AUTHORITY_ID, &ca, Reply::Status(StatusCode::NOT_FOUND)).await;

    let output = TempDir::new().unwrap();
    let path = secrets_file(&output);
    let fetcher = Arc::new(authority.fetcher(ca.static_source(WORKLOAD_ID)));
    let store = Arc::new(FileSecretStore::new(path.clone()));

    let mut sync = SyncLoop::new(fetcher, store, policy());
    assert_eq!(sync.step().await, Cycle::Continue(Duration::from_secs(2)));
    assert_eq!(sync.step().await, Cycle::Continue(Duration::from_secs(4)));

    assert!(!path.exists());
}

#[tokio::test]
async fn sync_cycle_leaves_file_untouched_for_untrusted_server() {
    let ca = TestCa::new("Flowplane Test CA");
    let authority = MockAuthority::spawn(
        &ca,
        "spiffe://flowplane.local/ns/attacker/sa/impostor",
        &ca,
        Reply::Json(json!({ "data": "forged" })),
    )
    .await;

    let output = TempDir::new().unwrap();
    let path = secrets_file(&output);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "previous").unwrap();

    let fetcher = Arc::new(authority.fetcher(ca.static_source(WORKLOAD_ID)));
    let store = Arc::new(FileSecretStore::new(path.clone()));

    let mut sync = SyncLoop::new(fetcher, store, policy());
    assert_eq!(sync.step().await, Cycle::Continue(Duration::from_secs(2)));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "previous");
}

#[tokio::test]
async fn init_probe_is_ready_once_secret_exists() {
    let ca = TestCa::new("Flowplane Test CA");
    let authority =
        MockAuthority::spawn(&ca, AUTHORITY_ID, &ca, Reply::Json(json!({ "data": "ready" }))).await;

    let probe = InitProbe::new(
        Arc::new(authority.fetcher(ca.static_source(WORKLOAD_ID))),
        Duration::from_secs(5),
    );
    assert_eq!(probe.check().await, Some(ProbeExit::Ready));
}

#[tokio::test]
async fn init_probe_keeps_waiting_on_empty_secret() {
    let ca = TestCa::new("Flowplane Test CA");
    let authority =
        MockAuthority::spawn(&ca, AUTHORITY_ID, &ca, Reply::Json(json!({ "data": "" }))).await;

    let probe = InitProbe::new(
        Arc::new(authority.fetcher(ca.static_source(WORKLOAD_ID))),
        Duration::from_secs(5),
    );
    assert_eq!(probe.check().await, None);
}
