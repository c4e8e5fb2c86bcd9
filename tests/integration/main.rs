//! pulse integration test harness.
//!
//! Everything runs in-process on loopback: UDP echo servers stand in for
//! the regional probe fleet, an axum stub stands in for the discovery
//! service. No privileges, no real network.
//!
//! Each test owns the servers it spawns. Echo threads are detached and die
//! with the test process.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use pulse::wire::{FlowControl, ProbeRequest, ProbeResponse};
use pulse::{ProbeConfig, QosServer};

mod cycle;
mod discovery;

// ── Echo fleet harness ────────────────────────────────────────────────────────

/// How a fake probe server behaves.
#[derive(Clone, Copy, Default)]
pub struct EchoBehavior {
    /// Flow-control nibble applied to every response.
    pub flow: FlowControl,
    /// Answer only every `keep_one_in`-th request when set (1-based).
    pub keep_one_in: Option<u32>,
    /// Reply with a mangled identifier, so every response fails matching.
    pub corrupt_identifier: bool,
}

/// A detached UDP echo server implementing the probe response transform.
pub struct EchoServer {
    pub addr: SocketAddr,
    requests: Arc<AtomicU32>,
}

impl EchoServer {
    pub fn spawn(behavior: EchoBehavior) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind echo socket");
        let addr = socket.local_addr().expect("echo local addr");
        let requests = Arc::new(AtomicU32::new(0));

        let seen = requests.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 2048];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf) else {
                    return;
                };
                let Ok(request) = ProbeRequest::decode(&buf[..len]) else {
                    continue;
                };
                let count = seen.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(keep) = behavior.keep_one_in {
                    if count % keep != 0 {
                        continue;
                    }
                }
                let mut response = ProbeResponse::echoing(&request, behavior.flow);
                if behavior.corrupt_identifier {
                    response.identifier ^= 0xffff;
                }
                let _ = socket.send_to(&response.encode(), peer);
            }
        });

        Self { addr, requests }
    }

    /// Requests decoded so far.
    pub fn requests_seen(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    /// A server record pointing at this echo.
    pub fn server(&self, regionid: &str) -> QosServer {
        QosServer::new(regionid, self.addr.ip().to_string(), self.addr.port())
    }
}

/// Spawn a well-behaved echo.
pub fn spawn_echo() -> EchoServer {
    EchoServer::spawn(EchoBehavior::default())
}

/// Probe config tuned for loopback tests: full bursts, short waits.
pub fn fast_probe_config() -> ProbeConfig {
    ProbeConfig {
        requests_per_endpoint: 5,
        timeout_ms: 3_000,
        max_wait_ms: 500,
        requests_between_pause: 10,
        request_pause_ms: 1,
        receive_wait_ms: 10,
    }
}
