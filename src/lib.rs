//! pulse — client-side QoS probing for region selection.
//!
//! Facade crate: re-exports the public surface of pulse-core and
//! pulse-engine so applications depend on a single crate.

pub use pulse_core::config::{
    CheckConfig, ConfigError, DiscoveryConfig, ProbeConfig, PulseConfig, StatsConfig,
};
pub use pulse_core::endpoint::{QosServer, ServerList};
pub use pulse_core::wire;
pub use pulse_core::wire::FlowControl;

pub use pulse_engine::discovery::{DiscoveryClient, DiscoveryError, DiscoveryPhase};
pub use pulse_engine::orchestrator::{backoff_duration, Orchestrator};
pub use pulse_engine::probe::{ProbeEngine, ProbeResult, INVALID_LATENCY, INVALID_PACKET_LOSS};
pub use pulse_engine::stats::{QosSample, QosStats};
