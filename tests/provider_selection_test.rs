//! Provider selection through the full service.

mod common;

use assert_matches::assert_matches;
use tokio_util::sync::CancellationToken;

use common::{request, TestHarness};
use playforged::core::{Error, ErrorKind};

#[tokio::test]
async fn highest_priority_supporting_provider_wins() {
    let h = TestHarness::new();
    h.mock("low", 1, &["mp4"]);
    h.mock("high", 10, &["mp4", "hls"]);
    h.mock("hls-only", 100, &["hls"]);
    let cancel = CancellationToken::new();

    let mp4 = h.service.start_transcode(&cancel, request("a", "mp4")).await.unwrap();
    assert_eq!(mp4.provider, "high");

    let hls = h.service.start_transcode(&cancel, request("b", "HLS")).await.unwrap();
    assert_eq!(hls.provider, "hls-only");

    let record = h.service.session(hls.session_id).await.unwrap();
    assert_eq!(record.provider, "hls-only");
}

#[tokio::test]
async fn equal_priority_breaks_ties_by_id() {
    let h = TestHarness::new();
    h.mock("zeta", 5, &["mp4"]);
    h.mock("alpha", 5, &["mp4"]);
    let cancel = CancellationToken::new();

    let handle = h.service.start_transcode(&cancel, request("a", "mp4")).await.unwrap();
    assert_eq!(handle.provider, "alpha");
}

#[tokio::test]
async fn unsupported_container_fails_and_frees_the_slot() {
    let h = TestHarness::new();
    let mock = h.mock("mock", 10, &["mp4"]);
    let cancel = CancellationToken::new();

    let err = h
        .service
        .start_transcode(&cancel, request("a", "avi"))
        .await
        .unwrap_err();
    assert_matches!(err.root(), Error::NoProvidersAvailable(c) if c == "avi");
    assert_eq!(err.kind(), ErrorKind::Provider);
    assert_eq!(err.http_status(), 503);
    assert_eq!(mock.started(), 0);
    assert_eq!(h.resources.active_sessions(), 0);

    // The slot is usable again.
    h.service.start_transcode(&cancel, request("b", "mp4")).await.unwrap();
    assert_eq!(mock.started(), 1);
}

#[tokio::test]
async fn replaced_provider_takes_over() {
    let h = TestHarness::new();
    h.mock("mock", 1, &["mp4"]);
    h.mock("mock", 1, &["webm"]);
    assert_eq!(h.registry.len(), 1);

    let cancel = CancellationToken::new();
    let err = h
        .service
        .start_transcode(&cancel, request("a", "mp4"))
        .await
        .unwrap_err();
    assert_matches!(err.root(), Error::NoProvidersAvailable(_));

    let handle = h.service.start_transcode(&cancel, request("b", "webm")).await.unwrap();
    assert_eq!(handle.provider, "mock");

    let listed = h.service.providers();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].capabilities.supports_container("webm"));
}
