//! The periodic QoS cycle: discover the fleet, probe it, fold the results
//! into statistics, and honor server-issued flow control.
//!
//! The probe engine is synchronous by design (it flips its socket between
//! non-blocking and blocking modes), so each run is pushed onto the
//! blocking pool and awaited.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

use pulse_core::config::PulseConfig;
use pulse_core::endpoint::QosServer;
use pulse_core::wire::FlowControl;

use crate::discovery::DiscoveryClient;
use crate::probe::{ProbeEngine, ProbeResult};
use crate::stats::QosStats;

/// How long a server stays off-limits per flow-control unit: two minutes
/// per unit plus a half-minute guard. Server-dictated encoding.
pub fn backoff_duration(units: u8) -> Duration {
    Duration::from_secs(u64::from(units) * 120 + 30)
}

/// What one cycle learned about one server.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    /// Stats-store key (`ipv6:port` or `ipv4:port`).
    pub key: String,
    pub regionid: String,
    pub result: ProbeResult,
}

/// Owns one fleet's QoS state across cycles.
pub struct Orchestrator {
    interval: Duration,
    discovery: DiscoveryClient,
    engine: ProbeEngine,
    stats: Arc<QosStats>,
    /// Flow-control windows by stats key. Survives discovery refreshes;
    /// the server list is rebuilt every cycle but back-off must not be.
    backoff: HashMap<String, SystemTime>,
}

impl Orchestrator {
    pub fn new(cfg: &PulseConfig) -> Result<Self> {
        cfg.validate().context("invalid configuration")?;

        let interval = Duration::from_millis(cfg.check.qos_check_interval_ms);
        let busy = cfg.probe.timeout() + cfg.discovery.worst_case();
        if busy > interval {
            tracing::warn!(
                busy_ms = busy.as_millis() as u64,
                interval_ms = interval.as_millis() as u64,
                "a worst-case qos cycle exceeds the check interval"
            );
        }

        Ok(Self {
            interval,
            discovery: DiscoveryClient::new(&cfg.discovery)
                .context("failed to construct discovery client")?,
            engine: ProbeEngine::new(cfg.title.clone(), cfg.probe.clone()),
            stats: Arc::new(QosStats::new(&cfg.stats)),
            backoff: HashMap::new(),
        })
    }

    /// Shared handle to the statistics store for readers outside the loop.
    pub fn stats(&self) -> Arc<QosStats> {
        self.stats.clone()
    }

    pub fn discovery(&self) -> &DiscoveryClient {
        &self.discovery
    }

    /// Run cycles forever at the configured interval. Cycle failures are
    /// logged and the loop keeps going; discovery may recover next tick.
    pub async fn run(&mut self) -> Result<()> {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            match self.run_cycle().await {
                Ok(results) => {
                    tracing::debug!(servers = results.len(), "qos cycle complete");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "qos cycle failed");
                }
            }
        }
    }

    /// One full cycle. Returns what was fed into the store, in server-list
    /// order.
    pub async fn run_cycle(&mut self) -> Result<Vec<CycleOutcome>> {
        let servers = self
            .discovery
            .discover()
            .await
            .context("discovery failed")?;

        // snapshot the list and stamp our back-off windows onto it
        let now = SystemTime::now();
        self.backoff.retain(|_, until| *until > now);
        let mut snapshot: Vec<QosServer> = servers.as_ref().clone();
        for server in &mut snapshot {
            server.backoff_until = self.backoff.get(&server.stats_key()).copied();
        }

        let engine = self.engine.clone();
        let probe_list = snapshot.clone();
        let results = tokio::task::spawn_blocking(move || engine.run(&probe_list))
            .await
            .context("probe task panicked")?;

        let mut fed = Vec::with_capacity(results.len());
        for (server, result) in snapshot.iter().zip(results) {
            let key = server.stats_key();
            self.stats.process(&key, &result);

            if result.responses_received > 0 && result.fc != FlowControl::None {
                let units = result.fc.units();
                let until = SystemTime::now() + backoff_duration(units);
                tracing::info!(server = %key, units, "server requested back-off");
                self.backoff.insert(key.clone(), until);
            }

            fed.push(CycleOutcome {
                key,
                regionid: server.regionid.clone(),
                result,
            });
        }

        Ok(fed)
    }
}
