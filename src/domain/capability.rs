use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-device V2G capability snapshot.
///
/// Cache-only; the device-control collaborator is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2GCapability {
    pub device_id: String,
    /// Device and vehicle agreed on V2G (ISO 15118-20 / CHAdeMO bidirectional)
    pub supported: bool,
    /// Maximum discharge power towards the grid (kW)
    pub max_discharge_power_kw: f64,
    /// Maximum discharge current (A)
    pub max_discharge_current_a: f64,
    pub bidirectional: bool,
    pub connector_id: u32,
    /// Vehicle state of charge (%), if the vehicle reports it
    pub current_soc_percent: Option<f64>,
    pub refreshed_at: DateTime<Utc>,
}

impl V2GCapability {
    pub fn unsupported(device_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            supported: false,
            max_discharge_power_kw: 0.0,
            max_discharge_current_a: 0.0,
            bidirectional: false,
            connector_id: 1,
            current_soc_percent: None,
            refreshed_at: at,
        }
    }

    /// Requested power capped at what the device can deliver.
    pub fn cap_power(&self, requested_kw: f64) -> f64 {
        requested_kw.min(self.max_discharge_power_kw)
    }
}
