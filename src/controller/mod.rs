pub mod capability_cache;
pub mod scheduler;
pub mod session_store;
pub mod v2g_session;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::events::{BroadcastEventBus, EventBus};
use crate::hardware::SimulatedDeviceFleet;
use crate::pricing::{PldPriceOracle, PriceOracle, TariffPriceOracle};
use crate::repo::InMemoryV2gRepository;
use crate::settlement::CompensationEngine;
use crate::wallet::InMemoryWallet;

pub use capability_cache::CapabilityCache;
pub use scheduler::{OptimizeRound, TaskStatus, V2gScheduler};
pub use session_store::{InMemorySessionStore, SessionStore};
pub use v2g_session::{
    Collaborators, DischargeRequest, OptimizeDecision, SessionManager, SkipReason,
};

/// Max discharge power for fleet chargers registered from configuration (kW)
const SIMULATED_CHARGER_KW: f64 = 11.0;

/// Engine wired against the single-node collaborators.
#[derive(Clone)]
pub struct AppState {
    pub cfg: Config,
    pub fleet: Arc<SimulatedDeviceFleet>,
    pub repo: Arc<InMemoryV2gRepository>,
    pub wallet: Arc<InMemoryWallet>,
    pub events: BroadcastEventBus,
    pub prices: Arc<dyn PriceOracle>,
    pub compensation: Arc<CompensationEngine>,
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    pub fn new(cfg: Config) -> Result<Self> {
        Self::with_clock(cfg, Arc::new(SystemClock))
    }

    pub fn with_clock(cfg: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let fleet = Arc::new(SimulatedDeviceFleet::new(clock.clone()));
        for entry in &cfg.scheduler.fleet {
            fleet.add_v2g_charger(&entry.device_id, SIMULATED_CHARGER_KW);
        }

        let margin = cfg.compensation.operator_margin;
        let prices: Arc<dyn PriceOracle> = if cfg.price_feed.enabled {
            info!(
                region = cfg.price_feed.region.code(),
                base_url = %cfg.price_feed.base_url,
                "using wholesale price feed"
            );
            Arc::new(
                PldPriceOracle::new(
                    cfg.price_feed.clone(),
                    cfg.tariff.clone(),
                    margin,
                    clock.clone(),
                )
                .context("failed to build price feed client")?,
            )
        } else {
            info!("using simulated time-of-use tariff");
            Arc::new(TariffPriceOracle::new(cfg.tariff.clone(), margin, clock.clone()))
        };

        let repo = Arc::new(InMemoryV2gRepository::new());
        let wallet = Arc::new(InMemoryWallet::new());
        let events = BroadcastEventBus::default();
        let bus: Arc<dyn EventBus> = Arc::new(events.clone());

        let compensation = Arc::new(CompensationEngine::new(
            cfg.compensation.clone(),
            repo.clone(),
            wallet.clone(),
            bus.clone(),
            clock.clone(),
        ));
        let deps = Collaborators {
            directory: fleet.clone(),
            control: fleet.clone(),
            prices: prices.clone(),
            repo: repo.clone(),
            store: Arc::new(InMemorySessionStore::new()),
            events: bus,
            clock,
        };
        let sessions = Arc::new(SessionManager::new(&cfg, deps, compensation.clone()));

        Ok(Self {
            cfg,
            fleet,
            repo,
            wallet,
            events,
            prices,
            compensation,
            sessions,
        })
    }

    pub fn scheduler(&self) -> Arc<V2gScheduler> {
        Arc::new(V2gScheduler::new(
            self.sessions.clone(),
            self.cfg.scheduler.clone(),
        ))
    }
}
