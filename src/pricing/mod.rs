//! Retail grid pricing.
//!
//! [`TariffPriceOracle`] evaluates the deterministic time-of-use model;
//! [`PldPriceOracle`] prefers the external wholesale feed and falls back to
//! the same model when the feed is unavailable.

pub mod oracle;
pub mod pld;
pub mod tariff;

pub use oracle::*;
pub use pld::*;
pub use tariff::*;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::context::{Interrupted, OpContext};
use crate::domain::{round_currency, GridPricePoint};

#[derive(Debug, Error)]
pub enum PriceError {
    #[error("forecast horizon {requested}h exceeds maximum {max}h")]
    HorizonTooLong { requested: u32, max: u32 },
    #[error("price feed credential missing")]
    MissingCredential,
    #[error("price feed request failed: {0}")]
    Transport(String),
    #[error("price feed backing off after failure: {0}")]
    BackingOff(String),
    #[error("price feed returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("price feed payload invalid: {0}")]
    Decode(String),
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Retail price (currency/kWh) for now.
    async fn current_price(&self, ctx: &OpContext) -> Result<f64, PriceError>;

    /// One point per hour starting at the current hour; `hours` points long.
    ///
    /// Fails with `HorizonTooLong` when `hours` exceeds `tariff.max_forecast_hours`.
    async fn price_forecast(
        &self,
        ctx: &OpContext,
        hours: u32,
    ) -> Result<Vec<GridPricePoint>, PriceError>;

    fn is_peak_hour(&self) -> bool;

    fn is_super_peak_hour(&self) -> bool;

    /// Owner compensation for `energy_kwh` discharged between `start` and `end`,
    /// priced at the mean of the hourly prices across the interval.
    async fn calculate_v2g_compensation(
        &self,
        ctx: &OpContext,
        energy_kwh: f64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<f64, PriceError>;
}

pub fn truncate_to_hour(at: DateTime<Utc>) -> DateTime<Utc> {
    let secs = at.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(3600), 0).unwrap_or(at)
}

/// Hourly sample instants in `[start, end)`; at least one sample.
pub fn hourly_samples(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    let mut samples = Vec::new();
    let mut t = start;
    while t < end {
        samples.push(t);
        t += Duration::hours(1);
    }
    if samples.is_empty() {
        samples.push(start);
    }
    samples
}

/// `energy * mean(prices) * (1 - margin)`, rounded once at the end.
pub fn compensated_amount(energy_kwh: f64, prices: &[f64], operator_margin: f64) -> f64 {
    if prices.is_empty() {
        return 0.0;
    }
    let average = prices.iter().sum::<f64>() / prices.len() as f64;
    round_currency(energy_kwh.abs() * average * (1.0 - operator_margin))
}
