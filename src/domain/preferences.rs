use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Owner-level V2G configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2GPreferences {
    pub owner_id: Uuid,
    /// Let the optimizer start sessions without the owner asking
    pub auto_discharge_enabled: bool,
    /// Grid price (currency/kWh) at or above which auto-discharge kicks in
    pub min_grid_price: f64,
    /// Energy budget per local day (kWh)
    pub max_discharge_kwh_per_period: f64,
    /// SOC floor preserved for driving (%)
    pub min_soc_percent: f64,
    pub notify_on_start: bool,
    pub notify_on_end: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl V2GPreferences {
    /// Defaults applied when the owner never saved preferences; the SOC floor
    /// comes from `session.default_min_soc_percent`.
    pub fn defaults_for(owner_id: Uuid, min_soc_percent: f64) -> Self {
        Self {
            owner_id,
            auto_discharge_enabled: false,
            min_grid_price: 0.80,
            max_discharge_kwh_per_period: 20.0,
            min_soc_percent,
            notify_on_start: true,
            notify_on_end: true,
            updated_at: None,
        }
    }
}
