use anyhow::{Context, Result};
use chrono_tz::Tz;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::pricing::PldRegion;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub session: SessionConfig,
    pub capability: CapabilityConfig,
    pub tariff: TariffConfig,
    pub price_feed: PriceFeedConfig,
    pub compensation: CompensationConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// SOC floor used when neither the request nor the owner sets one (%)
    pub default_min_soc_percent: f64,
    /// Price recorded when the oracle cannot answer (currency/kWh)
    pub default_price: f64,
    /// Profile duration when the request has neither end time nor energy cap
    pub default_session_hours: u32,
    pub stop_retry_attempts: u32,
    pub stop_retry_backoff_ms: u64,
    /// Upper bound for a single device-control call
    pub device_timeout_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_min_soc_percent: 30.0,
            default_price: 0.50,
            default_session_hours: 4,
            stop_retry_attempts: 3,
            stop_retry_backoff_ms: 200,
            device_timeout_seconds: 15,
        }
    }
}

impl SessionConfig {
    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_seconds.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    pub cache_ttl_seconds: u64,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 30,
        }
    }
}

/// Time-of-use tariff model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TariffConfig {
    pub timezone: Tz,
    /// Off-peak base price (currency/kWh)
    pub base_price: f64,
    pub peak_multiplier: f64,
    pub super_peak_multiplier: f64,
    pub weekend_multiplier: f64,
    pub morning_ramp_multiplier: f64,
    pub night_discount_multiplier: f64,
    /// Weekday peak window [start, end) in local hours
    pub peak_start_hour: u32,
    pub peak_end_hour: u32,
    pub super_peak_start_hour: u32,
    pub super_peak_end_hour: u32,
    /// Relative amplitude of the minute-of-hour smoothing term
    pub variation_amplitude: f64,
    pub forecast_cache_ttl_seconds: u64,
    pub max_forecast_hours: u32,
}

impl Default for TariffConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::America::Sao_Paulo,
            base_price: 0.60,
            peak_multiplier: 1.5,
            super_peak_multiplier: 2.0,
            weekend_multiplier: 0.85,
            morning_ramp_multiplier: 1.1,
            night_discount_multiplier: 0.8,
            peak_start_hour: 17,
            peak_end_hour: 22,
            super_peak_start_hour: 18,
            super_peak_end_hour: 21,
            variation_amplitude: 0.02,
            forecast_cache_ttl_seconds: 300,
            max_forecast_hours: 168,
        }
    }
}

/// External wholesale (PLD) price feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceFeedConfig {
    pub enabled: bool,
    pub base_url: String,
    /// Bearer token; normally injected via `V2G__PRICE_FEED__API_TOKEN`
    pub api_token: Option<String>,
    pub region: PldRegion,
    /// Wholesale -> retail factor covering distribution and taxes
    pub markup_factor: f64,
    pub fallback_enabled: bool,
    pub http_timeout_seconds: u64,
    pub cache_ttl_seconds: u64,
    /// How long a failed fetch is remembered before the feed is tried again
    pub failure_backoff_seconds: u64,
    pub source_name: String,
}

impl Default for PriceFeedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.pld.example.invalid".to_string(),
            api_token: None,
            region: PldRegion::Southeast,
            markup_factor: 2.5,
            fallback_enabled: true,
            http_timeout_seconds: 10,
            cache_ttl_seconds: 900,
            failure_backoff_seconds: 60,
            source_name: "pld".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationConfig {
    /// Fraction of gross kept by the operator (0.0 - 1.0)
    pub operator_margin: f64,
    /// Net amounts below this stay pending for the batch sweep
    pub min_payout_amount: f64,
    pub currency: String,
    pub auto_payout_enabled: bool,
    /// Pending records older than this are paid regardless of the minimum
    pub retention_days: i64,
    pub retry_failed_in_batch: bool,
}

impl Default for CompensationConfig {
    fn default() -> Self {
        Self {
            operator_margin: 0.10,
            min_payout_amount: 5.0,
            currency: "BRL".to_string(),
            auto_payout_enabled: true,
            retention_days: 30,
            retry_failed_in_batch: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub optimize_every_seconds: u64,
    pub batch_payout_every_minutes: u64,
    pub fleet: Vec<FleetEntry>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            optimize_every_seconds: 300,
            batch_payout_every_minutes: 60,
            fleet: Vec::new(),
        }
    }
}

/// A device the scheduler optimizes on behalf of its owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetEntry {
    pub device_id: String,
    pub owner_id: Uuid,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from("config/default.toml")
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("V2G__").split("__"));
        let cfg: Config = figment.extract().context("invalid configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let margin = self.compensation.operator_margin;
        if !(0.0..1.0).contains(&margin) {
            anyhow::bail!("compensation.operator_margin must be in [0, 1), got {margin}");
        }
        if self.compensation.min_payout_amount < 0.0 {
            anyhow::bail!("compensation.min_payout_amount must not be negative");
        }
        let floor = self.session.default_min_soc_percent;
        if !(0.0..100.0).contains(&floor) {
            anyhow::bail!("session.default_min_soc_percent must be in [0, 100), got {floor}");
        }
        let t = &self.tariff;
        if t.base_price <= 0.0 {
            anyhow::bail!("tariff.base_price must be positive");
        }
        if t.peak_start_hour >= t.peak_end_hour || t.peak_end_hour > 24 {
            anyhow::bail!("tariff peak window is empty or out of range");
        }
        if t.super_peak_start_hour < t.peak_start_hour || t.super_peak_end_hour > t.peak_end_hour
        {
            anyhow::bail!("tariff super-peak window must lie inside the peak window");
        }
        if self.price_feed.enabled && self.price_feed.markup_factor <= 0.0 {
            anyhow::bail!("price_feed.markup_factor must be positive");
        }
        Ok(())
    }
}
