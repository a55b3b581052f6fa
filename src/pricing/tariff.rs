//! Deterministic time-of-use tariff.
//!
//! Price is `base * multiplier(local time) * smoothing(minute)`, rounded to
//! cents. Multipliers:
//! - weekday peak window, replaced by the super-peak multiplier inside its sub-window
//! - weekend discount; weekends are never peak or super-peak
//! - morning ramp for 06:00-09:00
//! - late-night discount for 23:00-05:00
//!
//! The smoothing term is a fixed sine of the minute-of-hour. It is not random:
//! the same instant always yields the same price.

use std::f64::consts::PI;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;

use crate::config::TariffConfig;
use crate::domain::{round_currency, GridPricePoint, PriceSource};

#[derive(Debug, Clone)]
pub struct TariffModel {
    cfg: TariffConfig,
}

impl TariffModel {
    pub fn new(cfg: TariffConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &TariffConfig {
        &self.cfg
    }

    fn local(&self, at: DateTime<Utc>) -> DateTime<Tz> {
        at.with_timezone(&self.cfg.timezone)
    }

    pub fn is_weekend(&self, at: DateTime<Utc>) -> bool {
        matches!(self.local(at).weekday(), Weekday::Sat | Weekday::Sun)
    }

    pub fn is_peak_hour(&self, at: DateTime<Utc>) -> bool {
        if self.is_weekend(at) {
            return false;
        }
        let hour = self.local(at).hour();
        hour >= self.cfg.peak_start_hour && hour < self.cfg.peak_end_hour
    }

    pub fn is_super_peak_hour(&self, at: DateTime<Utc>) -> bool {
        if self.is_weekend(at) {
            return false;
        }
        let hour = self.local(at).hour();
        hour >= self.cfg.super_peak_start_hour && hour < self.cfg.super_peak_end_hour
    }

    /// Combined time-of-day/week multiplier, without smoothing.
    pub fn multiplier(&self, at: DateTime<Utc>) -> f64 {
        let hour = self.local(at).hour();
        let mut m = 1.0;

        if self.is_weekend(at) {
            m *= self.cfg.weekend_multiplier;
        } else if self.is_super_peak_hour(at) {
            m *= self.cfg.super_peak_multiplier;
        } else if self.is_peak_hour(at) {
            m *= self.cfg.peak_multiplier;
        }

        if (6..9).contains(&hour) {
            m *= self.cfg.morning_ramp_multiplier;
        }
        if hour >= 23 || hour < 5 {
            m *= self.cfg.night_discount_multiplier;
        }
        m
    }

    /// Presentational smoothing keyed off the minute; exactly 1.0 on the hour.
    pub fn smoothing(&self, at: DateTime<Utc>) -> f64 {
        let minute = self.local(at).minute() as f64;
        1.0 + self.cfg.variation_amplitude * (2.0 * PI * minute / 60.0).sin()
    }

    pub fn price_at(&self, at: DateTime<Utc>) -> f64 {
        self.scaled_price_at(at, 1.0)
    }

    /// Price with an extra factor (regional adjustment of the fallback path).
    pub fn scaled_price_at(&self, at: DateTime<Utc>, factor: f64) -> f64 {
        round_currency(self.cfg.base_price * factor * self.multiplier(at) * self.smoothing(at))
    }

    pub fn point_at(&self, at: DateTime<Utc>, factor: f64) -> GridPricePoint {
        GridPricePoint {
            timestamp: at,
            price: self.scaled_price_at(at, factor),
            is_peak: self.is_peak_hour(at),
            source: PriceSource::Simulated,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    pub(crate) fn utc_tariff() -> TariffConfig {
        TariffConfig {
            timezone: chrono_tz::UTC,
            ..TariffConfig::default()
        }
    }

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        // June 2024: 17-21 are Mon-Fri, 22-23 are Sat-Sun
        Utc.with_ymd_and_hms(2024, 6, day, hour, minute, 0).unwrap()
    }

    #[rstest]
    #[case::weekday_night(19, 3, 0.48)]
    #[case::weekday_morning_ramp(19, 7, 0.66)]
    #[case::weekday_midday(19, 12, 0.60)]
    #[case::weekday_peak(19, 17, 0.90)]
    #[case::weekday_super_peak(19, 19, 1.20)]
    #[case::weekday_late_peak(19, 21, 0.90)]
    #[case::weekday_late_night(19, 23, 0.48)]
    #[case::weekend_evening(22, 19, 0.51)]
    #[case::weekend_midday(23, 12, 0.51)]
    fn prices_on_the_hour(#[case] day: u32, #[case] hour: u32, #[case] expected: f64) {
        let model = TariffModel::new(utc_tariff());
        assert_eq!(model.price_at(at(day, hour, 0)), expected);
    }

    #[test]
    fn weekday_peak_exceeds_night_by_peak_ratio() {
        let cfg = utc_tariff();
        let ratio = cfg.peak_multiplier;
        let model = TariffModel::new(cfg);
        let peak = model.price_at(at(19, 19, 0));
        let night = model.price_at(at(19, 3, 0));
        assert!(peak / night >= ratio, "peak {peak} night {night}");
    }

    #[test]
    fn weekend_is_never_peak() {
        let model = TariffModel::new(utc_tariff());
        for hour in 0..24 {
            assert!(!model.is_peak_hour(at(22, hour, 0)));
            assert!(!model.is_super_peak_hour(at(23, hour, 0)));
        }
        assert!(model.is_peak_hour(at(19, 17, 0)));
        assert!(!model.is_super_peak_hour(at(19, 17, 0)));
        assert!(model.is_super_peak_hour(at(19, 18, 0)));
        assert!(!model.is_peak_hour(at(19, 22, 0)));
    }

    #[test]
    fn smoothing_is_deterministic_and_bounded() {
        let model = TariffModel::new(utc_tariff());
        let amplitude = model.config().variation_amplitude;
        for minute in 0..60 {
            let t = at(19, 12, minute);
            assert_eq!(model.price_at(t), model.price_at(t));
            let s = model.smoothing(t);
            assert!((s - 1.0).abs() <= amplitude + 1e-12);
        }
        assert_eq!(model.smoothing(at(19, 12, 0)), 1.0);
        assert!(model.smoothing(at(19, 12, 15)) > 1.0);
        assert!(model.smoothing(at(19, 12, 45)) < 1.0);
    }

    #[test]
    fn local_timezone_shifts_peak_window() {
        // 21:00 UTC is 18:00 in Sao Paulo (UTC-3), inside the super-peak window
        let model = TariffModel::new(TariffConfig::default());
        assert!(model.is_super_peak_hour(at(19, 21, 0)));
        assert!(!model.is_peak_hour(at(19, 18, 0)));
    }

    #[test]
    fn regional_factor_scales_price() {
        let model = TariffModel::new(utc_tariff());
        let point = model.point_at(at(19, 12, 0), 0.5);
        assert_eq!(point.price, 0.30);
        assert_eq!(point.source, PriceSource::Simulated);
        assert!(!point.is_peak);
    }
}
