use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Charge point status as reported by the device directory (OCPP naming).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "PascalCase")]
pub enum DeviceStatus {
    Available,
    Preparing,
    Charging,
    SuspendedEV,
    SuspendedEVSE,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

impl DeviceStatus {
    /// Statuses in which a vehicle is plugged in.
    pub fn vehicle_connected(self) -> bool {
        matches!(
            self,
            DeviceStatus::Preparing
                | DeviceStatus::Charging
                | DeviceStatus::SuspendedEV
                | DeviceStatus::SuspendedEVSE
                | DeviceStatus::Finishing
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub status: DeviceStatus,
    pub connector_count: u32,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_statuses() {
        assert!(DeviceStatus::Preparing.vehicle_connected());
        assert!(DeviceStatus::SuspendedEVSE.vehicle_connected());
        assert!(!DeviceStatus::Available.vehicle_connected());
        assert!(!DeviceStatus::Faulted.vehicle_connected());
    }

    #[test]
    fn status_parses_from_ocpp_name() {
        let status: DeviceStatus = "SuspendedEV".parse().unwrap();
        assert_eq!(status, DeviceStatus::SuspendedEV);
    }
}
