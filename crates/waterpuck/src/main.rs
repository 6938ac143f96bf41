mod command;
mod config;
mod credentials;
mod dispatcher;
mod engine;
mod network;
mod sequencer;
mod state;
mod timer;
mod valve;

use anyhow::Result;
use std::env;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use credentials::Credentials;
use network::HostStation;
use sequencer::Sequencer;
use valve::ValveBoard;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "waterpuck.toml".to_string());
    let cfg = config::load(&config_path)?;
    let plan = cfg.plan()?;
    let valves = cfg.valve_ids();

    // ── Network ─────────────────────────────────────────────────────
    let creds = Credentials::load(&cfg.credentials_path)?;
    info!(ssid = %creds.ssid, "loaded network credentials");
    let mut station = HostStation;
    if !network::associate(&mut station, &creds, cfg.network.as_ref()).await {
        warn!("network association failed, starting listener anyway");
    }

    // ── Valve board ─────────────────────────────────────────────────
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(cfg.valves.active_low);

    let board = ValveBoard::new(&valves, active_low)?;
    let (sequencer, engine_task) = engine::spawn(Sequencer::new(board, plan));

    info!(
        valves = ?valves,
        minutes_per_valve = plan.total().as_secs() / 60,
        sub_intervals = plan.count,
        port = cfg.port,
        "waterpuck ready"
    );

    // ── Command listener ────────────────────────────────────────────
    let outcome = tokio::select! {
        res = dispatcher::listen(cfg.port, valves, sequencer.clone()) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    };

    // Fail-safe: every valve closed before the process goes away.
    if let Err(e) = sequencer.stop().await {
        warn!("final stop failed: {e:#}");
    }
    let last = sequencer.snapshot();
    drop(sequencer);
    engine_task.await?;

    info!(
        valve_changes = last.events.len(),
        last_change = ?last
            .events
            .last()
            .map(|e| format!("{} {} at {}", e.valve, if e.on { "on" } else { "off" }, e.at)),
        "service stopped"
    );
    if let Some(fault) = &last.state.last_fault {
        warn!(fault = %fault, "last hardware fault");
    }

    outcome
}
