//! QoS probe engine — a single-pass UDP send/receive pipeline.
//!
//! One run fires `requests_per_endpoint` probes at every endpoint from one
//! unconnected socket, paced to avoid bursting the NIC, then drains
//! responses until everything outstanding is answered or the deadline
//! closes. Losses are never retried — loss is the measurement.
//!
//! Endpoints sharing a probe address are coalesced: only the first gets
//! packets, the rest receive a copy of its result at finalize.

mod result;
mod socket;

pub use result::{INVALID_LATENCY, INVALID_PACKET_LOSS, ProbeResult};

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io::ErrorKind;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant, SystemTime};

use pulse_core::config::ProbeConfig;
use pulse_core::endpoint::QosServer;
use pulse_core::wire::{self, MAX_PACKET_LEN, ProbeRequest, ProbeResponse};

/// A configured probe engine. Cheap to clone; every [`ProbeEngine::run`]
/// call is an independent job with its own socket.
#[derive(Debug, Clone)]
pub struct ProbeEngine {
    title: String,
    cfg: ProbeConfig,
}

/// Per-endpoint bookkeeping for one run.
struct EndpointState {
    /// None when the server record does not parse; nothing is sent.
    addr: Option<SocketAddrV4>,
    /// Index of the first endpoint sharing our address. Equal to our own
    /// index unless this entry is a duplicate.
    first_idx: usize,
    /// Random identifier stamped into this endpoint's burst.
    identifier: u16,
    /// The identifier is only meaningful once the burst was dispatched.
    dispatched: bool,
}

/// Run-wide state threaded through dispatch and drain.
struct RunState {
    states: Vec<EndpointState>,
    index: HashMap<SocketAddrV4, usize>,
    outstanding: u32,
    total_sent: u64,
    max_sequence: u8,
}

impl ProbeEngine {
    pub fn new(title: impl Into<String>, cfg: ProbeConfig) -> Self {
        Self {
            title: title.into(),
            cfg,
        }
    }

    /// Probe every server once. The returned vector is index-aligned with
    /// `servers`; entries the run never touched stay zeroed.
    ///
    /// Errors never escape: a dead socket aborts the run with zeroed
    /// results, individual send failures abandon only their endpoint.
    pub fn run(&self, servers: &[QosServer]) -> Vec<ProbeResult> {
        let mut results = vec![ProbeResult::default(); servers.len()];
        if servers.is_empty() {
            return results;
        }

        let socket = match socket::bind_probe_socket() {
            Ok(socket) => socket,
            Err(e) => {
                tracing::error!(error = %e, "probe socket unavailable, aborting run");
                return results;
            }
        };

        let deadline = Instant::now() + self.cfg.timeout();
        let mut run = index_endpoints(servers, self.cfg.requests_per_endpoint);

        self.dispatch(&socket, servers, &mut run, &mut results, deadline);
        self.drain(&socket, &mut run, &mut results, deadline);
        finalize(&run, &mut results);

        results
    }

    /// Send every endpoint's burst in list order, draining opportunistically
    /// between bursts so the receive buffer never overflows.
    fn dispatch(
        &self,
        socket: &UdpSocket,
        servers: &[QosServer],
        run: &mut RunState,
        results: &mut [ProbeResult],
        deadline: Instant,
    ) {
        'endpoints: for idx in 0..run.states.len() {
            if run.states[idx].first_idx != idx {
                continue; // duplicate address, result is copied at finalize
            }
            let Some(addr) = run.states[idx].addr else {
                continue;
            };

            if Instant::now() >= deadline {
                tracing::warn!(
                    dispatched = idx,
                    total = run.states.len(),
                    "deadline reached, abandoning remaining sends"
                );
                break;
            }
            if servers[idx].is_backed_off(SystemTime::now()) {
                tracing::debug!(server = %addr, "server is backed off, skipping");
                continue;
            }

            let identifier: u16 = rand::random();
            run.states[idx].identifier = identifier;
            run.states[idx].dispatched = true;

            'burst: for sequence in 0..self.cfg.requests_per_endpoint {
                let request = ProbeRequest {
                    title: &self.title,
                    sequence: sequence as u8,
                    identifier,
                    timestamp_ms: wire::now_unix_millis(),
                };
                let packet = match request.encode() {
                    Ok(packet) => packet,
                    Err(e) => {
                        tracing::warn!(error = %e, "probe request not encodable");
                        results[idx].invalid_requests += 1;
                        break 'burst;
                    }
                };

                loop {
                    match socket.send_to(&packet, SocketAddr::V4(addr)) {
                        Ok(sent) if sent == packet.len() => {
                            results[idx].requests_sent += 1;
                            run.outstanding += 1;
                            run.total_sent += 1;
                            if self.cfg.requests_between_pause > 0
                                && run.total_sent % u64::from(self.cfg.requests_between_pause) == 0
                            {
                                std::thread::sleep(Duration::from_millis(
                                    self.cfg.request_pause_ms,
                                ));
                            }
                            break;
                        }
                        Ok(sent) => {
                            tracing::debug!(server = %addr, sent, expected = packet.len(), "short write");
                            results[idx].invalid_requests += 1;
                            break;
                        }
                        Err(e) if is_transient(&e) => {
                            if Instant::now() >= deadline {
                                tracing::warn!(server = %addr, "deadline reached while retrying send");
                                break 'endpoints;
                            }
                            std::thread::sleep(Duration::from_millis(1));
                        }
                        Err(e) => {
                            tracing::warn!(server = %addr, error = %e, "send failed, abandoning endpoint");
                            break 'burst;
                        }
                    }
                }
            }

            self.drain_ready(socket, run, results);
        }
    }

    /// Consume whatever already sits in the receive buffer, without waiting.
    fn drain_ready(&self, socket: &UdpSocket, run: &mut RunState, results: &mut [ProbeResult]) {
        let mut buf = [0u8; MAX_PACKET_LEN];
        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => handle_response(&buf[..len], from, run, results),
                Err(e) if is_transient(&e) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "recv failed during dispatch drain");
                    break;
                }
            }
        }
    }

    /// Blocking receive loop after all sends: wait out stragglers until
    /// everything is answered or the drain window closes.
    fn drain(
        &self,
        socket: &UdpSocket,
        run: &mut RunState,
        results: &mut [ProbeResult],
        deadline: Instant,
    ) {
        if run.outstanding == 0 {
            return;
        }

        let drain_deadline =
            deadline.min(Instant::now() + Duration::from_millis(self.cfg.max_wait_ms));
        let receive_wait = Duration::from_millis(self.cfg.receive_wait_ms.max(1));
        if let Err(e) = socket
            .set_nonblocking(false)
            .and_then(|()| socket.set_read_timeout(Some(receive_wait)))
        {
            tracing::warn!(error = %e, "could not switch socket to blocking drain");
            return;
        }

        let mut buf = [0u8; MAX_PACKET_LEN];
        while run.outstanding > 0 && Instant::now() < drain_deadline {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => handle_response(&buf[..len], from, run, results),
                Err(e) if is_transient(&e) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "recv failed during drain");
                    break;
                }
            }
        }

        if run.outstanding > 0 {
            tracing::debug!(
                outstanding = run.outstanding,
                "drain window closed with probes unanswered"
            );
        }
    }
}

/// Normalize every server to its binary address and coalesce duplicates:
/// the first index owning an address probes it, later ones only point back.
fn index_endpoints(servers: &[QosServer], requests_per_endpoint: u32) -> RunState {
    let mut states = Vec::with_capacity(servers.len());
    let mut index = HashMap::with_capacity(servers.len());

    for (idx, server) in servers.iter().enumerate() {
        let mut state = EndpointState {
            addr: None,
            first_idx: idx,
            identifier: 0,
            dispatched: false,
        };
        match server.probe_addr() {
            Ok(addr) => {
                state.addr = Some(addr);
                match index.entry(addr) {
                    Entry::Vacant(slot) => {
                        slot.insert(idx);
                    }
                    Entry::Occupied(first) => {
                        tracing::debug!(server = %addr, idx, first = *first.get(), "duplicate probe address");
                        state.first_idx = *first.get();
                    }
                }
            }
            Err(e) => {
                tracing::warn!(region = %server.regionid, error = %e, "server has no probe address");
            }
        }
        states.push(state);
    }

    RunState {
        states,
        index,
        outstanding: 0,
        total_sent: 0,
        max_sequence: requests_per_endpoint.saturating_sub(1) as u8,
    }
}

/// Match one received datagram against the run: known sender, matching
/// identifier, passing verification. Anything else is counted or dropped.
fn handle_response(data: &[u8], from: SocketAddr, run: &mut RunState, results: &mut [ProbeResult]) {
    let SocketAddr::V4(from) = from else {
        tracing::debug!(%from, "unexpected response from non-IPv4 sender");
        return;
    };
    let Some(&idx) = run.index.get(&from) else {
        tracing::debug!(%from, "unexpected response from unknown sender");
        return;
    };

    let response = match ProbeResponse::decode(data) {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(server = %from, error = %e, "undecodable response");
            results[idx].invalid_responses += 1;
            return;
        }
    };

    let (dispatched, identifier) = (run.states[idx].dispatched, run.states[idx].identifier);
    if !dispatched || response.identifier != identifier {
        tracing::debug!(server = %from, "response identifier mismatch");
        results[idx].invalid_responses += 1;
        return;
    }

    if let Err(e) = response.verify(run.max_sequence) {
        tracing::debug!(server = %from, error = %e, "response failed verification");
        results[idx].invalid_responses += 1;
        return;
    }

    let latency = wire::now_unix_millis().saturating_sub(response.timestamp_ms);
    results[idx].record_response(latency.min(u64::from(u32::MAX)) as u32);
    run.outstanding = run.outstanding.saturating_sub(1);
    results[idx].fc = results[idx].fc.merge_max(response.flow_control());
}

/// Copy each duplicate endpoint's result from the endpoint that actually
/// probed its address, flow control included.
fn finalize(run: &RunState, results: &mut [ProbeResult]) {
    for idx in 0..run.states.len() {
        let first = run.states[idx].first_idx;
        if first != idx {
            let copied = results[first].clone();
            results[idx] = copied;
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
