//! Per-endpoint outcome of one probe run.

use pulse_core::wire::FlowControl;

/// Average latency reported when no response ever arrived.
pub const INVALID_LATENCY: u32 = u32::MAX;

/// Packet loss reported when the counters cannot support a ratio.
pub const INVALID_PACKET_LOSS: f32 = f32::MAX;

/// Counters gathered for one endpoint during one run. The result at index
/// `i` of a run always describes the endpoint at index `i` of the input,
/// even when nothing was sent (back-off, duplicate address, dead socket).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeResult {
    pub requests_sent: u32,
    pub responses_received: u32,
    /// Short writes: the kernel accepted fewer bytes than the packet.
    pub invalid_requests: u32,
    /// Responses that failed identifier matching or verification.
    pub invalid_responses: u32,
    /// Reserved. Nothing increments this today.
    pub duplicate_responses: u32,
    /// Sum of round-trip times; average is computed on read.
    pub aggregate_latency_ms: u32,
    /// Strongest flow control any response carried.
    pub fc: FlowControl,
}

impl ProbeResult {
    /// Mean round-trip time, or [`INVALID_LATENCY`] when nothing came back.
    pub fn average_latency_ms(&self) -> u32 {
        if self.responses_received > 0 {
            self.aggregate_latency_ms / self.responses_received
        } else {
            INVALID_LATENCY
        }
    }

    /// Fraction of probes lost, or [`INVALID_PACKET_LOSS`] when nothing was
    /// sent or the counters are inconsistent.
    pub fn packet_loss(&self) -> f32 {
        if self.requests_sent > 0 && self.responses_received <= self.requests_sent {
            1.0 - self.responses_received as f32 / self.requests_sent as f32
        } else {
            INVALID_PACKET_LOSS
        }
    }

    /// Fold in one verified response.
    pub fn record_response(&mut self, latency_ms: u32) {
        self.responses_received += 1;
        self.aggregate_latency_ms = self.aggregate_latency_ms.saturating_add(latency_ms);
    }
}
