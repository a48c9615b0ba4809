// =============================================================================
// SignalForge — Main Entry Point
// =============================================================================
//
// Market pattern detection and alerting engine: provider gateway with
// fallback, rule + learned pattern detection fused across timeframes,
// sentiment-aware composite scoring, deduplicated alert dispatch, and a
// background label/learn loop that feeds detection quality back into itself.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod app_state;
mod composite;
mod config;
mod detect;
mod error;
mod fusion;
mod gateway;
mod indicators;
mod learner;
mod market_data;
mod model;
mod outcome;
mod regime;
mod scheduler;
mod sentiment;
mod store;
mod timing;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alerts::{AlertChannel, LogChannel, WebhookChannel};
use crate::app_state::AppState;
use crate::config::EngineConfig;

const CONFIG_PATH: &str = "signalforge.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        SignalForge — Starting Up                        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("SIGNALFORGE_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    config.validate()?;

    info!(symbols = ?config.symbols, timeframes = ?config.timeframes, "Scan universe configured");

    // ── 2. Delivery channels ─────────────────────────────────────────────
    let mut channels: Vec<Arc<dyn AlertChannel>> = vec![Arc::new(LogChannel)];
    if let Ok(url) = std::env::var("SIGNALFORGE_WEBHOOK_URL") {
        if !url.is_empty() {
            info!("Webhook delivery channel enabled");
            channels.push(Arc::new(WebhookChannel::new(url)));
        }
    }

    // ── 3. Build shared state ────────────────────────────────────────────
    let state = AppState::build(config, channels);
    info!(patterns = ?state.pattern_catalogue(), "Detection catalogue loaded");

    // ── 4. Scan scheduler ────────────────────────────────────────────────
    let scan_state = state.clone();
    tokio::spawn(async move {
        scheduler::run(scan_state).await;
    });

    // ── 5. Outcome labeler ───────────────────────────────────────────────
    let label_state = state.clone();
    tokio::spawn(async move {
        label_state.labeler.run().await;
    });

    // ── 6. Incremental learner ───────────────────────────────────────────
    let learn_state = state.clone();
    tokio::spawn(async move {
        learn_state.learner.run().await;
    });

    // ── 7. Digest flush loop ─────────────────────────────────────────────
    let digest_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
            digest_state.config.digest_flush_secs,
        ));
        loop {
            interval.tick().await;
            let flushed = digest_state.dispatcher.flush_digest(chrono::Utc::now()).await;
            if flushed > 0 {
                info!(flushed, "digest flushed");
            }
        }
    });

    // ── 8. Health log loop ───────────────────────────────────────────────
    let health_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            let health = health_state.health_snapshot();
            info!(
                uptime_secs = health.uptime_secs,
                alerts = health.alerts,
                outcomes = health.outcomes,
                fired = health.dispatcher.fired,
                suppressed = health.dispatcher.suppressed_cooldown,
                models = health.model_versions.len(),
                timing_states = health.timing_states,
                "engine health"
            );
            for provider in &health.providers {
                if provider.degraded {
                    warn!(
                        provider = %provider.name,
                        failures = provider.consecutive_failures,
                        "provider degraded"
                    );
                }
            }
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = state.config.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save config on shutdown");
    }

    info!("SignalForge shut down complete.");
    Ok(())
}
