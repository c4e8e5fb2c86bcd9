//! Discovery client scenarios against an in-process axum stub.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;

use pulse::{DiscoveryClient, DiscoveryConfig, DiscoveryError, DiscoveryPhase};

// ── Stub service ──────────────────────────────────────────────────────────────

fn fleet_body() -> serde_json::Value {
    serde_json::json!({
        "servers": [
            { "locationid": 1, "regionid": "us-central",
              "ipv4": "127.0.0.1", "ipv6": "", "port": 7777 },
            { "locationid": 2, "regionid": "eu-west",
              "ipv4": "127.0.0.1", "ipv6": "", "port": 7778 },
            // invalid: empty region, dropped by the client
            { "locationid": 3, "regionid": "",
              "ipv4": "127.0.0.1", "ipv6": "", "port": 7779 }
        ]
    })
}

async fn spawn_stub(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn client_for(addr: SocketAddr, overrides: impl FnOnce(&mut DiscoveryConfig)) -> DiscoveryClient {
    let mut cfg = DiscoveryConfig {
        discovery_service_uri: format!("http://{addr}/v1/fleets/{{fleet}}/servers"),
        fleet_id: "test-fleet".to_string(),
        failure_cache_time_ms: 100,
        ..Default::default()
    };
    overrides(&mut cfg);
    DiscoveryClient::new(&cfg).unwrap()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// A fresh 200 with max-age keeps the list cached: the second call issues
/// no request at all.
#[tokio::test]
async fn fresh_list_is_served_from_cache() {
    let hits = Arc::new(AtomicU32::new(0));
    let app = Router::new().route("/v1/fleets/{fleet}/servers", {
        let hits = hits.clone();
        get(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (
                    [
                        (header::ETAG, "W/\"abc\""),
                        (header::CACHE_CONTROL, "max-age=60"),
                    ],
                    axum::Json(fleet_body()),
                )
            }
        })
    });
    let addr = spawn_stub(app).await;
    let client = client_for(addr, |_| {});

    let first = client.discover().await.unwrap();
    assert_eq!(first.len(), 2, "the invalid server is dropped");
    assert_eq!(client.phase(), DiscoveryPhase::Done);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let second = client.discover().await.unwrap();
    assert_eq!(second.len(), 2);
    assert_eq!(hits.load(Ordering::SeqCst), 1, "cache hit, no request");
}

/// An expired cache revalidates with If-None-Match and a 304 refreshes the
/// expiry from the response's max-age.
#[tokio::test]
async fn expired_cache_revalidates_with_etag() {
    let hits = Arc::new(AtomicU32::new(0));
    let revalidated = Arc::new(AtomicBool::new(false));
    let app = Router::new().route("/v1/fleets/{fleet}/servers", {
        let hits = hits.clone();
        let revalidated = revalidated.clone();
        get(move |headers: HeaderMap| {
            let hits = hits.clone();
            let revalidated = revalidated.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                let matches = headers
                    .get(header::IF_NONE_MATCH)
                    .and_then(|v| v.to_str().ok())
                    == Some("abc");
                if matches {
                    revalidated.store(true, Ordering::SeqCst);
                    (
                        StatusCode::NOT_MODIFIED,
                        [(header::CACHE_CONTROL, "max-age=60")],
                    )
                        .into_response()
                } else {
                    (
                        [
                            (header::ETAG, "W/\"abc\""),
                            // expires immediately, forcing revalidation
                            (header::CACHE_CONTROL, "max-age=0"),
                        ],
                        axum::Json(fleet_body()),
                    )
                        .into_response()
                }
            }
        })
    });
    let addr = spawn_stub(app).await;
    let client = client_for(addr, |_| {});

    let first = client.discover().await.unwrap();
    assert_eq!(first.len(), 2);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = client.discover().await.unwrap();
    assert_eq!(second.len(), 2, "304 re-serves the cached list");
    assert!(revalidated.load(Ordering::SeqCst), "If-None-Match was sent");
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // the 304's max-age=60 re-armed the cache
    let third = client.discover().await.unwrap();
    assert_eq!(third.len(), 2);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

/// Server errors are retried; the attempt that succeeds wins.
#[tokio::test]
async fn five_hundreds_are_retried() {
    let hits = Arc::new(AtomicU32::new(0));
    let app = Router::new().route("/v1/fleets/{fleet}/servers", {
        let hits = hits.clone();
        get(move || {
            let hits = hits.clone();
            async move {
                let attempt = hits.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= 2 {
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                } else {
                    axum::Json(fleet_body()).into_response()
                }
            }
        })
    });
    let addr = spawn_stub(app).await;
    let client = client_for(addr, |_| {});

    let servers = client.discover().await.unwrap();
    assert_eq!(servers.len(), 2);
    assert_eq!(hits.load(Ordering::SeqCst), 3, "two failures, one success");
}

/// Client errors are terminal, and the failure is remembered briefly so
/// back-to-back calls coalesce.
#[tokio::test]
async fn four_oh_four_is_terminal_and_failure_cached() {
    let hits = Arc::new(AtomicU32::new(0));
    let app = Router::new().route("/v1/fleets/{fleet}/servers", {
        let hits = hits.clone();
        get(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                StatusCode::NOT_FOUND
            }
        })
    });
    let addr = spawn_stub(app).await;
    let client = client_for(addr, |_| {});

    let error = client.discover().await.unwrap_err();
    assert_eq!(error, DiscoveryError::Http(404));
    assert_eq!(hits.load(Ordering::SeqCst), 1, "4xx is never retried");
    assert_eq!(client.phase(), DiscoveryPhase::Failed);

    let error = client.discover().await.unwrap_err();
    assert!(matches!(error, DiscoveryError::RecentFailure(_)));
    assert_eq!(hits.load(Ordering::SeqCst), 1, "failure window absorbs the call");

    tokio::time::sleep(Duration::from_millis(150)).await;
    let _ = client.discover().await.unwrap_err();
    assert_eq!(hits.load(Ordering::SeqCst), 2, "window expired, request issued");
}

/// Gzip-encoded bodies decode transparently.
#[tokio::test]
async fn gzip_body_is_decoded() {
    let app = Router::new().route(
        "/v1/fleets/{fleet}/servers",
        get(|| async {
            let body = serde_json::to_vec(&fleet_body()).unwrap();
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(&body).unwrap();
            let compressed = encoder.finish().unwrap();

            Response::builder()
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::CONTENT_ENCODING, "gzip")
                .body(axum::body::Body::from(compressed))
                .unwrap()
        }),
    );
    let addr = spawn_stub(app).await;
    let client = client_for(addr, |cfg| cfg.use_gzip = true);

    let servers = client.discover().await.unwrap();
    assert_eq!(servers.len(), 2);
    assert_eq!(servers[0].regionid, "us-central");
}

/// Cancel keeps the cache; reset purges it; changing fleet purges it too.
#[tokio::test]
async fn cancel_preserves_cache_reset_purges_it() {
    let hits = Arc::new(AtomicU32::new(0));
    let app = Router::new().route("/v1/fleets/{fleet}/servers", {
        let hits = hits.clone();
        get(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (
                    [(header::CACHE_CONTROL, "max-age=60")],
                    axum::Json(fleet_body()),
                )
            }
        })
    });
    let addr = spawn_stub(app).await;
    let client = client_for(addr, |_| {});

    client.discover().await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    client.cancel();
    assert_eq!(client.phase(), DiscoveryPhase::NotStarted);
    client.discover().await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1, "cancel kept the cache");

    client.reset();
    client.discover().await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2, "reset purged the cache");

    client.set_fleet_id("another-fleet");
    client.discover().await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 3, "fleet change purged the cache");
}
