use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "id")]
pub enum StatsScope {
    Owner(Uuid),
    Device(String),
    Global,
}

/// Aggregated discharge statistics for a scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct V2GStats {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub completed_sessions: u64,
    pub failed_sessions: u64,
    pub total_energy_discharged_kwh: f64,
    pub total_compensation: f64,
    /// Mean measured power over sessions that reported any (kW)
    pub average_power_kw: Option<f64>,
}
