//! Wholesale-price (PLD) feed adapter.
//!
//! Quotes arrive per MWh, tagged by submarket region and load level, and are
//! converted to retail currency/kWh with a fixed markup. When the feed cannot
//! answer (no credential, transport error, non-2xx, deadline) and fallback is
//! enabled, the region-adjusted tariff model answers instead. A stale cached
//! response is preferred over the model. A failed fetch is not retried until
//! `failure_backoff_seconds` have passed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{compensated_amount, hourly_samples, truncate_to_hour, PriceError, PriceOracle, TariffModel};
use crate::clock::Clock;
use crate::config::{PriceFeedConfig, TariffConfig};
use crate::context::{Interrupted, OpContext};
use crate::domain::{round_currency, GridPricePoint, PriceSource};

/// Wholesale submarket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PldRegion {
    #[serde(rename = "SE", alias = "SE/CO", alias = "southeast")]
    Southeast,
    #[serde(rename = "S", alias = "south")]
    South,
    #[serde(rename = "NE", alias = "northeast")]
    Northeast,
    #[serde(rename = "N", alias = "north")]
    North,
}

impl PldRegion {
    pub fn code(self) -> &'static str {
        match self {
            PldRegion::Southeast => "SE",
            PldRegion::South => "S",
            PldRegion::Northeast => "NE",
            PldRegion::North => "N",
        }
    }

    /// Relative price level of the region, applied to the fallback model.
    pub fn fallback_factor(self) -> f64 {
        match self {
            PldRegion::Southeast => 1.0,
            PldRegion::South => 0.97,
            PldRegion::Northeast => 0.93,
            PldRegion::North => 0.95,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadLevel {
    #[serde(alias = "leve")]
    Light,
    #[serde(alias = "media", alias = "medio")]
    Medium,
    #[serde(alias = "pesada", alias = "pesado")]
    Heavy,
}

#[derive(Debug, Deserialize)]
struct PldQuote {
    timestamp: DateTime<Utc>,
    #[serde(alias = "price_mwh", alias = "pld")]
    price_per_mwh: f64,
    region: String,
    load_level: LoadLevel,
}

#[derive(Debug, Clone)]
struct CachedQuotes {
    fetched_at: DateTime<Utc>,
    points: Vec<GridPricePoint>,
}

#[derive(Debug, Clone)]
struct FailedFetch {
    at: DateTime<Utc>,
    error: String,
}

type DateRange = (NaiveDate, NaiveDate);

pub struct PldPriceOracle {
    cfg: PriceFeedConfig,
    client: reqwest::Client,
    fallback: TariffModel,
    clock: Arc<dyn Clock>,
    operator_margin: f64,
    cache_ttl: Duration,
    failure_backoff: Duration,
    cache: RwLock<HashMap<DateRange, CachedQuotes>>,
    failures: RwLock<HashMap<DateRange, FailedFetch>>,
}

impl PldPriceOracle {
    pub fn new(
        cfg: PriceFeedConfig,
        tariff: TariffConfig,
        operator_margin: f64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PriceError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("v2g-orchestrator/0.2"));
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(cfg.http_timeout_seconds.max(1)))
            .default_headers(headers)
            .build()
            .map_err(|e| PriceError::Transport(e.to_string()))?;
        let cache_ttl = Duration::seconds(cfg.cache_ttl_seconds as i64);
        let failure_backoff = Duration::seconds(cfg.failure_backoff_seconds as i64);
        Ok(Self {
            cfg,
            client,
            fallback: TariffModel::new(tariff),
            clock,
            operator_margin,
            cache_ttl,
            failure_backoff,
            cache: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
        })
    }

    fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.fallback.config().timezone).date_naive()
    }

    fn fallback_point(&self, at: DateTime<Utc>) -> GridPricePoint {
        self.fallback.point_at(at, self.cfg.region.fallback_factor())
    }

    fn to_retail(&self, quote: PldQuote) -> GridPricePoint {
        GridPricePoint {
            timestamp: truncate_to_hour(quote.timestamp),
            price: round_currency(quote.price_per_mwh / 1000.0 * self.cfg.markup_factor),
            is_peak: quote.load_level == LoadLevel::Heavy,
            source: PriceSource::External(self.cfg.source_name.clone()),
        }
    }

    async fn fetch_quotes(
        &self,
        ctx: &OpContext,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<GridPricePoint>, PriceError> {
        let token = self
            .cfg
            .api_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or(PriceError::MissingCredential)?;

        let url = format!("{}/pld", self.cfg.base_url.trim_end_matches('/'));
        let request = self
            .client
            .get(url)
            .bearer_auth(token)
            .query(&[
                ("region", self.cfg.region.code().to_string()),
                ("start_date", start.to_string()),
                ("end_date", end.to_string()),
            ]);

        let call_ctx =
            ctx.child_with_timeout(StdDuration::from_secs(self.cfg.http_timeout_seconds.max(1)));
        let (status, body) = call_ctx
            .run(async {
                let resp = request
                    .send()
                    .await
                    .map_err(|e| PriceError::Transport(e.to_string()))?;
                let status = resp.status();
                let body = resp
                    .text()
                    .await
                    .map_err(|e| PriceError::Transport(e.to_string()))?;
                Ok::<_, PriceError>((status, body))
            })
            .await??;

        if !status.is_success() {
            return Err(PriceError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let quotes: Vec<PldQuote> =
            serde_json::from_str(&body).map_err(|e| PriceError::Decode(e.to_string()))?;
        let region = self.cfg.region.code();
        let mut points: Vec<GridPricePoint> = quotes
            .into_iter()
            .filter(|q| q.region.eq_ignore_ascii_case(region))
            .map(|q| self.to_retail(q))
            .collect();
        points.sort_by_key(|p| p.timestamp);
        Ok(points)
    }

    /// Feed points for the local date range, or `None` when the model should answer.
    async fn quotes_for(
        &self,
        ctx: &OpContext,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Option<Vec<GridPricePoint>>, PriceError> {
        let now = self.clock.now();
        let key = (start, end);
        let stale = {
            let cache = self.cache.read();
            match cache.get(&key) {
                Some(c) if now - c.fetched_at < self.cache_ttl => {
                    debug!(%start, %end, "price feed cache hit");
                    return Ok(Some(c.points.clone()));
                }
                other => other.map(|c| c.points.clone()),
            }
        };

        let backing_off = self
            .failures
            .read()
            .get(&key)
            .filter(|f| now - f.at < self.failure_backoff)
            .map(|f| f.error.clone());
        let fetched = match backing_off {
            Some(last) => Err(PriceError::BackingOff(last)),
            None => self.fetch_quotes(ctx, start, end).await,
        };

        match fetched {
            Ok(points) => {
                self.failures.write().remove(&key);
                self.cache.write().insert(
                    key,
                    CachedQuotes {
                        fetched_at: now,
                        points: points.clone(),
                    },
                );
                Ok(Some(points))
            }
            Err(e) => {
                let fresh_failure = !matches!(
                    e,
                    PriceError::BackingOff(_) | PriceError::Interrupted(Interrupted::Cancelled)
                );
                if fresh_failure {
                    self.failures.write().insert(
                        key,
                        FailedFetch {
                            at: now,
                            error: e.to_string(),
                        },
                    );
                }
                if let Some(points) = stale {
                    if fresh_failure {
                        warn!(error = %e, %start, %end, "price feed refresh failed, serving stale quotes");
                    }
                    Ok(Some(points))
                } else if self.cfg.fallback_enabled {
                    if fresh_failure {
                        warn!(error = %e, region = self.cfg.region.code(), "price feed unavailable, using simulated tariff");
                    } else {
                        debug!(error = %e, "price feed backing off, using simulated tariff");
                    }
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    pub async fn price_point_at(
        &self,
        ctx: &OpContext,
        at: DateTime<Utc>,
    ) -> Result<GridPricePoint, PriceError> {
        let date = self.local_date(at);
        let hour = truncate_to_hour(at);
        let quotes = self.quotes_for(ctx, date, date).await?;
        Ok(quotes
            .and_then(|points| points.into_iter().find(|p| p.timestamp == hour))
            .unwrap_or_else(|| self.fallback_point(at)))
    }
}

#[async_trait]
impl PriceOracle for PldPriceOracle {
    async fn current_price(&self, ctx: &OpContext) -> Result<f64, PriceError> {
        let point = self.price_point_at(ctx, self.clock.now()).await?;
        Ok(point.price)
    }

    async fn price_forecast(
        &self,
        ctx: &OpContext,
        hours: u32,
    ) -> Result<Vec<GridPricePoint>, PriceError> {
        let max = self.fallback.config().max_forecast_hours;
        if hours > max {
            return Err(PriceError::HorizonTooLong {
                requested: hours,
                max,
            });
        }
        if hours == 0 {
            return Ok(Vec::new());
        }

        let start = truncate_to_hour(self.clock.now());
        let last = start + Duration::hours(hours as i64 - 1);
        let quotes = self
            .quotes_for(ctx, self.local_date(start), self.local_date(last))
            .await?
            .unwrap_or_default();
        let by_hour: HashMap<DateTime<Utc>, GridPricePoint> =
            quotes.into_iter().map(|p| (p.timestamp, p)).collect();

        Ok((0..hours)
            .map(|h| {
                let t = start + Duration::hours(h as i64);
                by_hour
                    .get(&t)
                    .cloned()
                    .unwrap_or_else(|| self.fallback_point(t))
            })
            .collect())
    }

    fn is_peak_hour(&self) -> bool {
        self.fallback.is_peak_hour(self.clock.now())
    }

    fn is_super_peak_hour(&self) -> bool {
        self.fallback.is_super_peak_hour(self.clock.now())
    }

    async fn calculate_v2g_compensation(
        &self,
        ctx: &OpContext,
        energy_kwh: f64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<f64, PriceError> {
        let mut prices = Vec::new();
        for t in hourly_samples(start, end) {
            prices.push(self.price_point_at(ctx, t).await?.price);
        }
        Ok(compensated_amount(energy_kwh, &prices, self.operator_margin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::pricing::tariff::tests::utc_tariff;
    use chrono::TimeZone;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 19, 12, 0, 0).unwrap()
    }

    fn feed_cfg(base_url: String, token: Option<&str>) -> PriceFeedConfig {
        PriceFeedConfig {
            enabled: true,
            base_url,
            api_token: token.map(str::to_string),
            ..PriceFeedConfig::default()
        }
    }

    fn oracle(cfg: PriceFeedConfig) -> (PldPriceOracle, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(noon()));
        let oracle = PldPriceOracle::new(cfg, utc_tariff(), 0.10, clock.clone()).unwrap();
        (oracle, clock)
    }

    fn quotes() -> serde_json::Value {
        json!([
            { "timestamp": "2024-06-19T12:00:00Z", "price_mwh": 400.0, "region": "SE", "load_level": "medio" },
            { "timestamp": "2024-06-19T13:00:00Z", "price_mwh": 300.0, "region": "SE", "load_level": "pesada" },
            { "timestamp": "2024-06-19T12:00:00Z", "price_mwh": 100.0, "region": "NE", "load_level": "leve" }
        ])
    }

    #[tokio::test]
    async fn converts_wholesale_quotes_to_retail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pld"))
            .and(query_param("region", "SE"))
            .and(query_param("start_date", "2024-06-19"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(quotes()))
            .expect(1)
            .mount(&server)
            .await;

        let (oracle, _) = oracle(feed_cfg(server.uri(), Some("secret")));
        let ctx = OpContext::background();

        // 400 /MWh -> 0.40 /kWh * 2.5 markup
        assert_eq!(oracle.current_price(&ctx).await.unwrap(), 1.0);

        let forecast = oracle.price_forecast(&ctx, 3).await.unwrap();
        assert_eq!(forecast.len(), 3);
        assert_eq!(forecast[0].source, PriceSource::External("pld".into()));
        assert_eq!(forecast[1].price, 0.75);
        assert!(forecast[1].is_peak);
        // 14:00 is missing from the feed and filled from the model
        assert_eq!(forecast[2].source, PriceSource::Simulated);
    }

    #[tokio::test]
    async fn non_2xx_falls_back_to_simulated_model() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pld"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (oracle, _) = oracle(feed_cfg(server.uri(), Some("secret")));
        let ctx = OpContext::background();
        let forecast = oracle.price_forecast(&ctx, 4).await.unwrap();
        assert_eq!(forecast.len(), 4);
        assert!(forecast.iter().all(|p| p.source == PriceSource::Simulated));
        // southeast factor is 1.0, so the model price is unchanged
        assert_eq!(forecast[0].price, 0.60);
    }

    #[tokio::test]
    async fn outage_is_not_refetched_until_backoff_passes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pld"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let (oracle, clock) = oracle(feed_cfg(server.uri(), Some("secret")));
        let ctx = OpContext::background();
        for advance in [0, 30, 31] {
            clock.advance(Duration::seconds(advance));
            let point = oracle.price_point_at(&ctx, noon()).await.unwrap();
            assert_eq!(point.source, PriceSource::Simulated);
            assert_eq!(point.price, 0.60);
        }
    }

    #[tokio::test]
    async fn missing_credential_skips_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(quotes()))
            .expect(0)
            .mount(&server)
            .await;

        let mut cfg = feed_cfg(server.uri(), None);
        cfg.region = PldRegion::Northeast;
        let (oracle, _) = oracle(cfg);
        let price = oracle.current_price(&OpContext::background()).await.unwrap();
        // 0.60 * 0.93 regional factor
        assert_eq!(price, 0.56);
    }

    #[tokio::test]
    async fn deadline_exceeded_triggers_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pld"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(quotes())
                    .set_delay(StdDuration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let (oracle, _) = oracle(feed_cfg(server.uri(), Some("secret")));
        let ctx = OpContext::with_timeout(StdDuration::from_millis(200));
        let point = oracle.price_point_at(&ctx, noon()).await.unwrap();
        assert_eq!(point.source, PriceSource::Simulated);
    }

    #[tokio::test]
    async fn errors_surface_when_fallback_disabled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let mut cfg = feed_cfg(server.uri(), Some("secret"));
        cfg.fallback_enabled = false;
        let (oracle, _) = oracle(cfg);
        let err = oracle
            .current_price(&OpContext::background())
            .await
            .unwrap_err();
        assert!(matches!(err, PriceError::Http { status: 500, .. }));
    }

    #[tokio::test]
    async fn stale_quotes_served_when_refresh_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pld"))
            .respond_with(ResponseTemplate::new(200).set_body_json(quotes()))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/pld"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let (oracle, clock) = oracle(feed_cfg(server.uri(), Some("secret")));
        let ctx = OpContext::background();
        assert_eq!(oracle.current_price(&ctx).await.unwrap(), 1.0);

        clock.advance(Duration::hours(1));
        let point = oracle.price_point_at(&ctx, noon()).await.unwrap();
        assert_eq!(point.source, PriceSource::External("pld".into()));
        assert_eq!(point.price, 1.0);
    }
}
