use std::sync::Arc;

use axum::http::{Method, StatusCode};
use flowplane_sidecar::{
    authz::{AllowLists, PrefixAllowList},
    fetch::{FetchError, FetchMethod, FetchOutcome, SecretFetcher},
    SpiffeId,
};
use serde_json::json;

use super::support::{
    MockAuthority, Reply, TestCa, AUTHORITY_ID, AUTHORITY_PREFIX, WORKLOAD_ID,
};

#[tokio::test]
async fn secret_is_delivered_over_mtls() {
    let ca = TestCa::new("Flowplane Test CA");
    let authority = MockAuthority::spawn(
        &ca,
        AUTHORITY_ID,
        &ca,
        Reply::Json(json!({
            "data": "{\"db_password\":\"hunter2\"}",
            "created": "2026-01-01T00:00:00Z",
            "updated": "2026-02-01T00:00:00Z"
        })),
    )
    .await;

    let fetcher = authority.fetcher(ca.static_source(WORKLOAD_ID));

    match fetcher.fetch().await {
        FetchOutcome::Secret(payload) => {
            assert_eq!(payload.as_str(), "{\"db_password\":\"hunter2\"}");
            assert_eq!(payload.created(), Some("2026-01-01T00:00:00Z"));
            assert_eq!(payload.updated(), Some("2026-02-01T00:00:00Z"));
        }
        other => panic!("expected secret, got {other:?}"),
    }
    assert_eq!(authority.methods(), vec![Method::GET]);
}

#[tokio::test]
async fn post_method_is_used_when_configured() {
    let ca = TestCa::new("Flowplane Test CA");
    let authority =
        MockAuthority::spawn(&ca, AUTHORITY_ID, &ca, Reply::Json(json!({ "data": "v1" }))).await;

    let fetcher = authority.fetcher(ca.static_source(WORKLOAD_ID)).with_method(FetchMethod::Post);

    assert!(fetcher.fetch().await.is_success());
    assert_eq!(authority.methods(), vec![Method::POST]);
}

#[tokio::test]
async fn missing_secret_is_not_found() {
    let ca = TestCa::new("Flowplane Test CA");
    let authority =
        MockAuthority::spawn(&ca, AUTHORITY_ID, &ca, Reply::Status(StatusCode::NOT_FOUND)).await;

    let outcome = authority.fetcher(ca.static_source(WORKLOAD_ID)).fetch().await;
    assert!(matches!(outcome, FetchOutcome::NotFound), "{outcome:?}");
}

#[tokio::test]
async fn server_error_is_transient() {
    let ca = TestCa::new("Flowplane Test CA");
    let authority =
        MockAuthority::spawn(&ca, AUTHORITY_ID, &ca, Reply::Status(StatusCode::SERVICE_UNAVAILABLE))
            .await;

    let outcome = authority.fetcher(ca.static_source(WORKLOAD_ID)).fetch().await;
    assert!(matches!(outcome, FetchOutcome::TransientError(FetchError::Status(503))), "{outcome:?}");
}

#[tokio::test]
async fn redirect_is_not_followed() {
    let ca = TestCa::new("Flowplane Test CA");
    let authority = MockAuthority::spawn(&ca, AUTHORITY_ID, &ca, Reply::Redirect).await;

    let outcome = authority.fetcher(ca.static_source(WORKLOAD_ID)).fetch().await;
    assert!(matches!(outcome, FetchOutcome::TransientError(FetchError::Status(307))), "{outcome:?}");
    assert_eq!(authority.methods().len(), 1);
}

#[tokio::test]
async fn malformed_body_is_transient() {
    let ca = TestCa::new("Flowplane Test CA");
    let authority = MockAuthority::spawn(&ca, AUTHORITY_ID, &ca, Reply::Raw("not json")).await;

    let outcome = authority.fetcher(ca.static_source(WORKLOAD_ID)).fetch().await;
    assert!(matches!(outcome, FetchOutcome::TransientError(FetchError::Decode(_))), "{outcome:?}");
}

#[tokio::test]
async fn server_outside_allow_list_is_untrusted_peer() {
    let ca = TestCa::new("Flowplane Test CA");
    let authority = MockAuthority::spawn(
        &ca,
        "spiffe://flowplane.local/ns/attacker/sa/impostor",
        &ca,
        Reply::Json(json!({ "data": "stolen" })),
    )
    .await;

    let outcome = authority.fetcher(ca.static_source(WORKLOAD_ID)).fetch().await;
    match outcome {
        FetchOutcome::UntrustedPeer(reason) => assert!(reason.contains("impostor"), "{reason}"),
        other => panic!("expected untrusted peer, got {other:?}"),
    }
    assert!(authority.methods().is_empty());
}

#[tokio::test]
async fn server_from_foreign_ca_is_untrusted_peer() {
    let workload_ca = TestCa::new("Flowplane Test CA");
    let foreign_ca = TestCa::new("Foreign CA");
    let authority = MockAuthority::spawn(
        &foreign_ca,
        AUTHORITY_ID,
        &workload_ca,
        Reply::Json(json!({ "data": "stolen" })),
    )
    .await;

    let outcome = authority.fetcher(workload_ca.static_source(WORKLOAD_ID)).fetch().await;
    assert!(matches!(outcome, FetchOutcome::UntrustedPeer(_)), "{outcome:?}");
    assert!(authority.methods().is_empty());
}

#[tokio::test]
async fn workload_outside_allow_list_never_connects() {
    let ca = TestCa::new("Flowplane Test CA");
    let authority =
        MockAuthority::spawn(&ca, AUTHORITY_ID, &ca, Reply::Json(json!({ "data": "v1" }))).await;

    let intruder = "spiffe://flowplane.local/ns/other/sa/job";
    let outcome = authority.fetcher(ca.static_source(intruder)).fetch().await;

    match outcome {
        FetchOutcome::UntrustedSelf(id) => assert_eq!(id, SpiffeId::parse(intruder).unwrap()),
        other => panic!("expected untrusted self, got {other:?}"),
    }
    assert!(authority.methods().is_empty());
}

#[tokio::test]
async fn allow_list_change_takes_effect_without_new_certificates() {
    let ca = TestCa::new("Flowplane Test CA");
    let authority =
        MockAuthority::spawn(&ca, AUTHORITY_ID, &ca, Reply::Json(json!({ "data": "v1" }))).await;
    let endpoint = flowplane_sidecar::fetch::secrets_endpoint(&authority.base_url()).unwrap();

    let narrowed = AllowLists::new(
        PrefixAllowList::new(["spiffe://flowplane.local/ns/payments/"]),
        PrefixAllowList::new(["spiffe://flowplane.local/ns/other-system/"]),
    );
    let fetcher = flowplane_sidecar::fetch::AuthorizedFetcher::new(
        ca.static_source(WORKLOAD_ID),
        narrowed,
        endpoint.clone(),
    );
    assert!(matches!(fetcher.fetch().await, FetchOutcome::UntrustedPeer(_)));

    let widened = AllowLists::new(
        PrefixAllowList::new(["spiffe://flowplane.local/ns/payments/"]),
        PrefixAllowList::new([AUTHORITY_PREFIX]),
    );
    let fetcher =
        flowplane_sidecar::fetch::AuthorizedFetcher::new(ca.static_source(WORKLOAD_ID), widened, endpoint);
    assert!(fetcher.fetch().await.is_success());
}

#[tokio::test]
async fn svid_files_identity_is_presented() {
    let ca = TestCa::new("Flowplane Test CA");
    let authority =
        MockAuthority::spawn(&ca, AUTHORITY_ID, &ca, Reply::Json(json!({ "data": "from-files" }))).await;
    let svid_dir = ca.write_svid_files(WORKLOAD_ID);

    match authority.fetcher(svid_dir.source()).fetch().await {
        FetchOutcome::Secret(payload) => assert_eq!(payload.as_str(), "from-files"),
        other => panic!("expected secret, got {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_authority_is_transient() {
    let ca = TestCa::new("Flowplane Test CA");
    let authority =
        MockAuthority::spawn(&ca, AUTHORITY_ID, &ca, Reply::Json(json!({ "data": "v1" }))).await;
    let fetcher = authority.fetcher(ca.static_source(WORKLOAD_ID));
    drop(authority);

    // Give the aborted server task a moment to release the port.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let outcome = fetcher.fetch().await;
    assert!(matches!(outcome, FetchOutcome::TransientError(_)), "{outcome:?}");
}

#[test]
fn fetcher_is_shareable_across_tasks() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Arc<flowplane_sidecar::fetch::AuthorizedFetcher>>();
}
