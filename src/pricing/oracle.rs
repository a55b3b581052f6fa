use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::debug;

use super::{compensated_amount, hourly_samples, truncate_to_hour, PriceError, PriceOracle, TariffModel};
use crate::clock::Clock;
use crate::config::TariffConfig;
use crate::context::OpContext;
use crate::domain::GridPricePoint;

#[derive(Debug, Clone)]
struct CachedForecast {
    generated_at: DateTime<Utc>,
    points: Vec<GridPricePoint>,
}

/// Price oracle backed only by the deterministic tariff model.
pub struct TariffPriceOracle {
    model: TariffModel,
    clock: Arc<dyn Clock>,
    operator_margin: f64,
    cache_ttl: Duration,
    forecasts: RwLock<HashMap<u32, CachedForecast>>,
}

impl TariffPriceOracle {
    pub fn new(cfg: TariffConfig, operator_margin: f64, clock: Arc<dyn Clock>) -> Self {
        let cache_ttl = Duration::seconds(cfg.forecast_cache_ttl_seconds as i64);
        Self {
            model: TariffModel::new(cfg),
            clock,
            operator_margin,
            cache_ttl,
            forecasts: RwLock::new(HashMap::new()),
        }
    }

    pub fn model(&self) -> &TariffModel {
        &self.model
    }

    fn cached(&self, hours: u32, now: DateTime<Utc>) -> Option<Vec<GridPricePoint>> {
        let cache = self.forecasts.read();
        cache
            .get(&hours)
            .filter(|c| now - c.generated_at < self.cache_ttl)
            .map(|c| c.points.clone())
    }
}

#[async_trait]
impl PriceOracle for TariffPriceOracle {
    async fn current_price(&self, _ctx: &OpContext) -> Result<f64, PriceError> {
        Ok(self.model.price_at(self.clock.now()))
    }

    async fn price_forecast(
        &self,
        _ctx: &OpContext,
        hours: u32,
    ) -> Result<Vec<GridPricePoint>, PriceError> {
        let max = self.model.config().max_forecast_hours;
        if hours > max {
            return Err(PriceError::HorizonTooLong {
                requested: hours,
                max,
            });
        }

        let now = self.clock.now();
        if let Some(points) = self.cached(hours, now) {
            debug!(hours, "forecast cache hit");
            return Ok(points);
        }

        let start = truncate_to_hour(now);
        let points: Vec<GridPricePoint> = (0..hours)
            .map(|h| self.model.point_at(start + Duration::hours(h as i64), 1.0))
            .collect();

        self.forecasts.write().insert(
            hours,
            CachedForecast {
                generated_at: now,
                points: points.clone(),
            },
        );
        Ok(points)
    }

    fn is_peak_hour(&self) -> bool {
        self.model.is_peak_hour(self.clock.now())
    }

    fn is_super_peak_hour(&self) -> bool {
        self.model.is_super_peak_hour(self.clock.now())
    }

    async fn calculate_v2g_compensation(
        &self,
        _ctx: &OpContext,
        energy_kwh: f64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<f64, PriceError> {
        let prices: Vec<f64> = hourly_samples(start, end)
            .into_iter()
            .map(|t| self.model.price_at(t))
            .collect();
        Ok(compensated_amount(energy_kwh, &prices, self.operator_margin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::pricing::tariff::tests::utc_tariff;
    use chrono::TimeZone;

    fn oracle_at(at: DateTime<Utc>) -> (TariffPriceOracle, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(at));
        let oracle = TariffPriceOracle::new(utc_tariff(), 0.10, clock.clone());
        (oracle, clock)
    }

    fn wednesday(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 19, hour, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn forecast_has_requested_length_and_increasing_hours() {
        let (oracle, _) = oracle_at(wednesday(14, 37));
        let ctx = OpContext::background();
        let points = oracle.price_forecast(&ctx, 24).await.unwrap();

        assert_eq!(points.len(), 24);
        assert_eq!(points[0].timestamp, wednesday(14, 0));
        for pair in points.windows(2) {
            assert!(pair[1].timestamp > pair[0].timestamp);
            assert_eq!(pair[1].timestamp - pair[0].timestamp, Duration::hours(1));
        }
        assert!(points.iter().all(|p| p.price > 0.0));
    }

    #[tokio::test]
    async fn zero_hours_is_empty_and_overlong_horizon_rejected() {
        let (oracle, _) = oracle_at(wednesday(14, 0));
        let ctx = OpContext::background();
        assert!(oracle.price_forecast(&ctx, 0).await.unwrap().is_empty());
        let err = oracle.price_forecast(&ctx, 1000).await.unwrap_err();
        assert!(matches!(err, PriceError::HorizonTooLong { requested: 1000, .. }));
    }

    #[tokio::test]
    async fn forecast_is_stable_within_cache_window() {
        let (oracle, clock) = oracle_at(wednesday(16, 59));
        let ctx = OpContext::background();
        let first = oracle.price_forecast(&ctx, 6).await.unwrap();

        // crosses the hour boundary but stays inside the 300s TTL
        clock.advance(Duration::seconds(120));
        let second = oracle.price_forecast(&ctx, 6).await.unwrap();
        assert_eq!(first[0].timestamp, second[0].timestamp);
        assert!((first[0].price - second[0].price).abs() < 1e-9);

        clock.advance(Duration::seconds(600));
        let third = oracle.price_forecast(&ctx, 6).await.unwrap();
        assert_eq!(third[0].timestamp, wednesday(17, 0));
    }

    #[tokio::test]
    async fn current_price_and_peak_flags_follow_clock() {
        let (oracle, clock) = oracle_at(wednesday(19, 0));
        let ctx = OpContext::background();
        assert_eq!(oracle.current_price(&ctx).await.unwrap(), 1.20);
        assert!(oracle.is_peak_hour());
        assert!(oracle.is_super_peak_hour());

        clock.set(wednesday(3, 0));
        assert_eq!(oracle.current_price(&ctx).await.unwrap(), 0.48);
        assert!(!oracle.is_peak_hour());
    }

    #[tokio::test]
    async fn range_compensation_averages_hourly_prices() {
        let (oracle, _) = oracle_at(wednesday(12, 0));
        let ctx = OpContext::background();

        // 17:00 peak 0.90, 18:00 super-peak 1.20 -> mean 1.05
        // 10 kWh * 1.05 * 0.9 = 9.45
        let amount = oracle
            .calculate_v2g_compensation(&ctx, 10.0, wednesday(17, 0), wednesday(19, 0))
            .await
            .unwrap();
        assert_eq!(amount, 9.45);

        // empty interval still samples the start hour
        let amount = oracle
            .calculate_v2g_compensation(&ctx, 10.0, wednesday(12, 0), wednesday(12, 0))
            .await
            .unwrap();
        assert_eq!(amount, 5.40);
    }
}
