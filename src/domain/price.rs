use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a price point came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    /// Deterministic time-of-use model
    Simulated,
    /// External wholesale feed, tagged with the feed name
    External(String),
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceSource::Simulated => write!(f, "simulated"),
            PriceSource::External(name) => write!(f, "{name}"),
        }
    }
}

/// Retail grid price for the hour starting at `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridPricePoint {
    pub timestamp: DateTime<Utc>,
    /// Currency per kWh
    pub price: f64,
    pub is_peak: bool,
    pub source: PriceSource,
}

/// Round to the currency minor unit (2 decimals).
pub fn round_currency(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_cents() {
        assert_eq!(round_currency(0.8349), 0.83);
        assert_eq!(round_currency(1.005_1), 1.01);
        assert_eq!(PriceSource::External("pld".into()).to_string(), "pld");
    }
}
