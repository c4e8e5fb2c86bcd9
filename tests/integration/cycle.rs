//! Whole-loop scenarios: discovery, probing, statistics, and flow-control
//! back-off working together through the orchestrator.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use axum::Router;
use axum::http::header;
use axum::routing::get;

use pulse::wire::FlowControl;
use pulse::{Orchestrator, PulseConfig, QosServer, backoff_duration};

use crate::{EchoBehavior, EchoServer, fast_probe_config, spawn_echo};

/// Serve a fixed server list, counting requests.
async fn spawn_fleet_stub(servers: Vec<QosServer>) -> (SocketAddr, Arc<AtomicU32>) {
    let hits = Arc::new(AtomicU32::new(0));
    let body = serde_json::json!({ "servers": servers });

    let app = Router::new().route("/v1/fleets/{fleet}/servers", {
        let hits = hits.clone();
        get(move || {
            let hits = hits.clone();
            let body = body.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (
                    [(header::CACHE_CONTROL, "max-age=60")],
                    axum::Json(body),
                )
            }
        })
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits)
}

fn cycle_config(stub: SocketAddr) -> PulseConfig {
    let mut cfg = PulseConfig::default();
    cfg.title = "itest".to_string();
    cfg.probe = fast_probe_config();
    cfg.discovery.discovery_service_uri = format!("http://{stub}/v1/fleets/{{fleet}}/servers");
    cfg.discovery.fleet_id = "test-fleet".to_string();
    cfg
}

/// A full cycle measures every server and lands in the statistics store,
/// and the next cycle reuses the cached discovery list.
#[tokio::test]
async fn cycle_feeds_measurements_into_stats() {
    let echoes: Vec<EchoServer> = (0..2).map(|_| spawn_echo()).collect();
    let servers: Vec<QosServer> = echoes
        .iter()
        .enumerate()
        .map(|(i, echo)| echo.server(&format!("region-{i}")))
        .collect();
    let (stub, hits) = spawn_fleet_stub(servers).await;

    let mut orchestrator = Orchestrator::new(&cycle_config(stub)).unwrap();
    let stats = orchestrator.stats();

    let outcomes = orchestrator.run_cycle().await.unwrap();
    assert_eq!(outcomes.len(), 2);
    for outcome in &outcomes {
        assert_eq!(outcome.result.requests_sent, 5);
        assert_eq!(outcome.result.responses_received, 5);

        let average = stats.weighted_average(&outcome.key).unwrap();
        assert_eq!(average.packet_loss, 0.0);
        assert_eq!(stats.all_samples(&outcome.key).unwrap().len(), 1);
    }

    let outcomes = orchestrator.run_cycle().await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(hits.load(Ordering::SeqCst), 1, "second cycle used the cache");
    for outcome in &outcomes {
        assert_eq!(stats.all_samples(&outcome.key).unwrap().len(), 2);
    }
}

/// A flow-controlled server is backed off for the server-dictated window:
/// the next cycle sends it nothing, which also evicts its history.
#[tokio::test]
async fn flow_control_backs_off_the_server() {
    let banned = EchoServer::spawn(EchoBehavior {
        flow: FlowControl::Ban(3), // nibble 0b1010 on the wire
        ..Default::default()
    });
    let healthy = spawn_echo();
    let (stub, _hits) = spawn_fleet_stub(vec![
        banned.server("banned-region"),
        healthy.server("healthy-region"),
    ])
    .await;

    let mut orchestrator = Orchestrator::new(&cycle_config(stub)).unwrap();
    let stats = orchestrator.stats();

    let outcomes = orchestrator.run_cycle().await.unwrap();
    assert_eq!(outcomes[0].result.fc, FlowControl::Ban(3));
    assert_eq!(outcomes[0].result.responses_received, 5);
    assert!(stats.weighted_average(&outcomes[0].key).is_some());

    // two minutes per unit plus the half-minute guard
    assert_eq!(backoff_duration(3).as_secs(), 390);

    let probes_before = banned.requests_seen();
    let outcomes = orchestrator.run_cycle().await.unwrap();

    assert_eq!(outcomes[0].result.requests_sent, 0, "server is backed off");
    assert_eq!(banned.requests_seen(), probes_before, "nothing hit the wire");
    assert!(
        stats.weighted_average(&outcomes[0].key).is_none(),
        "an unmeasurable cycle evicts the history"
    );

    assert_eq!(outcomes[1].result.responses_received, 5);
    assert_eq!(
        stats.all_samples(&outcomes[1].key).unwrap().len(),
        2,
        "the healthy server keeps accumulating"
    );
}
