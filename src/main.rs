use anyhow::Result;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};
use v2g_orchestrator::{config, controller, telemetry};

use config::Config;
use telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cfg = Config::load()?;

    if cfg.price_feed.enabled && cfg.price_feed.api_token.is_none() {
        warn!("price feed enabled without V2G__PRICE_FEED__API_TOKEN, tariff fallback only");
    }
    if cfg.scheduler.fleet.is_empty() {
        warn!("scheduler.fleet is empty, no device will be optimized");
    }

    let app_state = controller::AppState::new(cfg.clone())?;

    info!(
        currency = %cfg.compensation.currency,
        operator_margin = cfg.compensation.operator_margin,
        min_payout = cfg.compensation.min_payout_amount,
        fleet = cfg.scheduler.fleet.len(),
        "starting V2G orchestrator"
    );

    let scheduler = app_state.scheduler();
    let handles = scheduler.clone().start();

    telemetry::shutdown_signal().await;
    scheduler.stop();
    for handle in handles {
        if timeout(Duration::from_secs(10), handle).await.is_err() {
            warn!("periodic task did not stop in time");
        }
    }

    for session in app_state.sessions.active_sessions().await {
        warn!(
            session_id = %session.id,
            device_id = %session.device_id,
            "session still active at shutdown"
        );
    }

    info!("shutdown complete");
    Ok(())
}
