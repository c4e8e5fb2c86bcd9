//! pulsed — periodic QoS driver.
//!
//! Discovers a fleet's probe servers, measures them every cycle, and prints
//! a ranked per-region summary of the weighted rolling statistics. The
//! fleet id comes from the first argument, falling back to config.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};

use pulse_core::config::PulseConfig;
use pulse_engine::orchestrator::{CycleOutcome, Orchestrator};
use pulse_engine::stats::QosStats;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = PulseConfig::write_default_if_missing()
        .context("failed to write default configuration")?;
    let mut config = PulseConfig::load().context("failed to load configuration")?;
    tracing::info!(path = %config_path.display(), "configuration loaded");

    if let Some(fleet) = std::env::args().nth(1) {
        config.discovery.fleet_id = fleet;
    }
    if config.discovery.fleet_id.is_empty() {
        anyhow::bail!("no fleet id: pass one as the first argument or set discovery.fleet_id");
    }

    let interval = Duration::from_millis(config.check.qos_check_interval_ms);
    let mut orchestrator = Orchestrator::new(&config).context("failed to start orchestrator")?;
    let stats = orchestrator.stats();

    tracing::info!(
        fleet = %config.discovery.fleet_id,
        interval_ms = config.check.qos_check_interval_ms,
        "pulsed starting"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
            _ = ticker.tick() => {
                match orchestrator.run_cycle().await {
                    Ok(outcomes) => report_regions(&outcomes, &stats),
                    Err(e) => tracing::warn!(error = %e, "qos cycle failed"),
                }
            }
        }
    }

    Ok(())
}

/// Print regions ranked by their best server's weighted latency.
fn report_regions(outcomes: &[CycleOutcome], stats: &QosStats) {
    // best weighted sample per region
    let mut regions: BTreeMap<&str, (u32, f32)> = BTreeMap::new();
    for outcome in outcomes {
        let Some(average) = stats.weighted_average(&outcome.key) else {
            continue;
        };
        regions
            .entry(outcome.regionid.as_str())
            .and_modify(|best| {
                if average.latency_ms < best.0 {
                    *best = (average.latency_ms, average.packet_loss);
                }
            })
            .or_insert((average.latency_ms, average.packet_loss));
    }

    if regions.is_empty() {
        println!("No reachable regions this cycle.");
        return;
    }

    let mut ranked: Vec<_> = regions.into_iter().collect();
    ranked.sort_by_key(|(_, (latency, _))| *latency);

    println!("═══════════════════════════════════════");
    println!("  Region quality (weighted)");
    println!("═══════════════════════════════════════");
    for (region, (latency, loss)) in ranked {
        println!("  {:<16} {:>5} ms   {:>5.1}% loss", region, latency, loss * 100.0);
    }
}
