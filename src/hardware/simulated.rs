//! Simulated charge-point fleet for development and testing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use super::{DeviceDirectory, DeviceError, V2gDeviceControl};
use crate::clock::Clock;
use crate::context::OpContext;
use crate::domain::{Device, DeviceStatus, V2GCapability};

/// Last discharge profile accepted by a simulated device.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileCommand {
    pub connector_id: u32,
    pub power_kw: f64,
    pub duration_seconds: u64,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub device: Device,
    pub capability: V2GCapability,
    pub active_profile: Option<ProfileCommand>,
    pub set_profile_calls: u32,
    pub clear_profile_calls: u32,
}

#[derive(Debug, Clone, Default)]
struct FaultPlan {
    fail_set: u32,
    fail_clear: u32,
    fail_capability: bool,
    command_delay: Option<Duration>,
}

pub struct SimulatedDeviceFleet {
    devices: RwLock<HashMap<String, SimulatedDevice>>,
    faults: RwLock<HashMap<String, FaultPlan>>,
    clock: Arc<dyn Clock>,
}

impl SimulatedDeviceFleet {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            faults: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Bidirectional charger (ISO 15118-20 capable), initially without a vehicle.
    pub fn add_v2g_charger(&self, device_id: &str, max_discharge_kw: f64) {
        let now = self.clock.now();
        let capability = V2GCapability {
            device_id: device_id.to_string(),
            supported: true,
            max_discharge_power_kw: max_discharge_kw,
            // 3-phase 230 V
            max_discharge_current_a: max_discharge_kw * 1000.0 / (230.0 * 3.0),
            bidirectional: true,
            connector_id: 1,
            current_soc_percent: None,
            refreshed_at: now,
        };
        self.insert(device_id, capability);
    }

    /// Unidirectional charger; never V2G capable.
    pub fn add_charger(&self, device_id: &str) {
        let capability = V2GCapability::unsupported(device_id, self.clock.now());
        self.insert(device_id, capability);
    }

    fn insert(&self, device_id: &str, capability: V2GCapability) {
        let device = Device {
            id: device_id.to_string(),
            status: DeviceStatus::Available,
            connector_count: 1,
            vendor: Some("Simulated".to_string()),
            model: None,
            last_seen: self.clock.now(),
        };
        self.devices.write().insert(
            device_id.to_string(),
            SimulatedDevice {
                device,
                capability,
                active_profile: None,
                set_profile_calls: 0,
                clear_profile_calls: 0,
            },
        );
    }

    /// Simulate a vehicle plugging in with the given state of charge.
    pub fn simulate_connect(&self, device_id: &str, soc_percent: f64) {
        if let Some(d) = self.devices.write().get_mut(device_id) {
            d.device.status = DeviceStatus::Preparing;
            d.capability.current_soc_percent = Some(soc_percent);
            d.device.last_seen = self.clock.now();
        }
    }

    pub fn simulate_disconnect(&self, device_id: &str) {
        if let Some(d) = self.devices.write().get_mut(device_id) {
            d.device.status = DeviceStatus::Available;
            d.capability.current_soc_percent = None;
            d.active_profile = None;
        }
    }

    pub fn set_soc(&self, device_id: &str, soc_percent: f64) {
        if let Some(d) = self.devices.write().get_mut(device_id) {
            d.capability.current_soc_percent = Some(soc_percent);
        }
    }

    pub fn fail_next_set(&self, device_id: &str, times: u32) {
        self.faults.write().entry(device_id.to_string()).or_default().fail_set = times;
    }

    pub fn fail_next_clear(&self, device_id: &str, times: u32) {
        self.faults.write().entry(device_id.to_string()).or_default().fail_clear = times;
    }

    pub fn fail_capability(&self, device_id: &str, fail: bool) {
        self.faults
            .write()
            .entry(device_id.to_string())
            .or_default()
            .fail_capability = fail;
    }

    /// Delay every profile command to this device.
    pub fn set_command_delay(&self, device_id: &str, delay: Duration) {
        self.faults
            .write()
            .entry(device_id.to_string())
            .or_default()
            .command_delay = Some(delay);
    }

    pub fn device(&self, device_id: &str) -> Option<SimulatedDevice> {
        self.devices.read().get(device_id).cloned()
    }

    pub fn active_profile(&self, device_id: &str) -> Option<ProfileCommand> {
        self.device(device_id).and_then(|d| d.active_profile)
    }

    async fn command_delay(&self, ctx: &OpContext, device_id: &str) -> Result<(), DeviceError> {
        let delay = self
            .faults
            .read()
            .get(device_id)
            .and_then(|f| f.command_delay);
        match delay {
            Some(delay) => Ok(ctx.run(tokio::time::sleep(delay)).await?),
            None => Ok(ctx.check()?),
        }
    }

    /// Consume one injected failure from the counter picked by `pick`.
    fn take_fault(&self, device_id: &str, pick: impl Fn(&mut FaultPlan) -> &mut u32) -> bool {
        let mut faults = self.faults.write();
        match faults.get_mut(device_id) {
            Some(plan) => {
                let counter = pick(plan);
                if *counter > 0 {
                    *counter -= 1;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }
}

#[async_trait]
impl DeviceDirectory for SimulatedDeviceFleet {
    async fn get_device(&self, ctx: &OpContext, device_id: &str) -> Result<Device, DeviceError> {
        ctx.check()?;
        self.devices
            .read()
            .get(device_id)
            .map(|d| d.device.clone())
            .ok_or_else(|| DeviceError::NotFound(device_id.to_string()))
    }
}

#[async_trait]
impl V2gDeviceControl for SimulatedDeviceFleet {
    async fn set_v2g_charging_profile(
        &self,
        ctx: &OpContext,
        device_id: &str,
        connector_id: u32,
        power_kw: f64,
        duration_seconds: u64,
    ) -> Result<(), DeviceError> {
        self.command_delay(ctx, device_id).await?;
        let injected = self.take_fault(device_id, |f| &mut f.fail_set);

        let mut devices = self.devices.write();
        let d = devices
            .get_mut(device_id)
            .ok_or_else(|| DeviceError::NotFound(device_id.to_string()))?;
        d.set_profile_calls += 1;

        if injected {
            return Err(DeviceError::Communication(format!(
                "simulated SetChargingProfile failure on {device_id}"
            )));
        }
        if !d.device.status.vehicle_connected() {
            return Err(DeviceError::Rejected("no vehicle connected".to_string()));
        }

        d.active_profile = Some(ProfileCommand {
            connector_id,
            power_kw,
            duration_seconds,
            issued_at: self.clock.now(),
        });
        d.device.status = DeviceStatus::Charging;
        info!(device_id, connector_id, power_kw, duration_seconds, "simulated V2G profile set");
        Ok(())
    }

    async fn clear_v2g_charging_profile(
        &self,
        ctx: &OpContext,
        device_id: &str,
        connector_id: u32,
    ) -> Result<(), DeviceError> {
        self.command_delay(ctx, device_id).await?;
        let injected = self.take_fault(device_id, |f| &mut f.fail_clear);

        let mut devices = self.devices.write();
        let d = devices
            .get_mut(device_id)
            .ok_or_else(|| DeviceError::NotFound(device_id.to_string()))?;
        d.clear_profile_calls += 1;

        if injected {
            return Err(DeviceError::Communication(format!(
                "simulated ClearChargingProfile failure on {device_id}"
            )));
        }

        d.active_profile = None;
        if d.device.status.vehicle_connected() {
            d.device.status = DeviceStatus::SuspendedEVSE;
        }
        debug!(device_id, connector_id, "simulated V2G profile cleared");
        Ok(())
    }

    async fn get_v2g_capability(
        &self,
        ctx: &OpContext,
        device_id: &str,
    ) -> Result<V2GCapability, DeviceError> {
        ctx.check()?;
        let failing = self
            .faults
            .read()
            .get(device_id)
            .is_some_and(|f| f.fail_capability);
        if failing {
            return Err(DeviceError::Communication(format!(
                "simulated capability query failure on {device_id}"
            )));
        }
        let devices = self.devices.read();
        let d = devices
            .get(device_id)
            .ok_or_else(|| DeviceError::NotFound(device_id.to_string()))?;
        Ok(V2GCapability {
            refreshed_at: self.clock.now(),
            ..d.capability.clone()
        })
    }

    async fn is_connected(&self, ctx: &OpContext, device_id: &str) -> Result<bool, DeviceError> {
        let device = self.get_device(ctx, device_id).await?;
        Ok(device.status.vehicle_connected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn fleet() -> SimulatedDeviceFleet {
        let fleet = SimulatedDeviceFleet::new(Arc::new(SystemClock));
        fleet.add_v2g_charger("CP001", 11.0);
        fleet
    }

    #[tokio::test]
    async fn profile_requires_connected_vehicle() {
        let fleet = fleet();
        let ctx = OpContext::background();

        let err = fleet
            .set_v2g_charging_profile(&ctx, "CP001", 1, 7.0, 3600)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Rejected(_)));

        fleet.simulate_connect("CP001", 80.0);
        assert!(fleet.is_connected(&ctx, "CP001").await.unwrap());
        fleet
            .set_v2g_charging_profile(&ctx, "CP001", 1, 7.0, 3600)
            .await
            .unwrap();
        let profile = fleet.active_profile("CP001").unwrap();
        assert_eq!(profile.power_kw, 7.0);

        fleet
            .clear_v2g_charging_profile(&ctx, "CP001", 1)
            .await
            .unwrap();
        assert!(fleet.active_profile("CP001").is_none());
        let d = fleet.device("CP001").unwrap();
        assert_eq!(d.device.status, DeviceStatus::SuspendedEVSE);
        assert_eq!((d.set_profile_calls, d.clear_profile_calls), (2, 1));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let fleet = fleet();
        let ctx = OpContext::background();
        fleet.simulate_connect("CP001", 80.0);
        fleet.fail_next_set("CP001", 1);

        assert!(fleet
            .set_v2g_charging_profile(&ctx, "CP001", 1, 7.0, 60)
            .await
            .is_err());
        assert!(fleet
            .set_v2g_charging_profile(&ctx, "CP001", 1, 7.0, 60)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn capability_reports_soc() {
        let fleet = fleet();
        let ctx = OpContext::background();
        fleet.simulate_connect("CP001", 64.0);
        let cap = fleet.get_v2g_capability(&ctx, "CP001").await.unwrap();
        assert!(cap.supported);
        assert_eq!(cap.current_soc_percent, Some(64.0));

        fleet.add_charger("CP002");
        let cap = fleet.get_v2g_capability(&ctx, "CP002").await.unwrap();
        assert!(!cap.supported);
    }
}
