use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::context::OpContext;
use crate::domain::V2GCapability;
use crate::hardware::{DeviceError, V2gDeviceControl};

/// Short-TTL capability snapshots per device.
///
/// Entries are refreshed on read once older than the TTL. A failed refresh
/// serves the last-known snapshot; only a device never seen before surfaces
/// the error.
pub struct CapabilityCache {
    control: Arc<dyn V2gDeviceControl>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    entries: RwLock<HashMap<String, V2GCapability>>,
}

impl CapabilityCache {
    pub fn new(control: Arc<dyn V2gDeviceControl>, clock: Arc<dyn Clock>, ttl_seconds: u64) -> Self {
        Self {
            control,
            clock,
            ttl: Duration::seconds(ttl_seconds as i64),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, ctx: &OpContext, device_id: &str) -> Result<V2GCapability, DeviceError> {
        let now = self.clock.now();
        let cached = self.entries.read().get(device_id).cloned();
        if let Some(cap) = &cached {
            if now - cap.refreshed_at < self.ttl {
                return Ok(cap.clone());
            }
        }

        match self.control.get_v2g_capability(ctx, device_id).await {
            Ok(fresh) => {
                debug!(device_id, supported = fresh.supported, "capability refreshed");
                self.entries
                    .write()
                    .insert(device_id.to_string(), fresh.clone());
                Ok(fresh)
            }
            Err(e) => match cached {
                Some(stale) => {
                    warn!(device_id, error = %e, "capability refresh failed, serving last known");
                    Ok(stale)
                }
                None => Err(e),
            },
        }
    }

    /// Fold a telemetry SOC reading into the cached snapshot, if any.
    pub fn record_soc(&self, device_id: &str, soc_percent: f64) {
        if let Some(cap) = self.entries.write().get_mut(device_id) {
            cap.current_soc_percent = Some(soc_percent);
        }
    }

    pub fn invalidate(&self, device_id: &str) {
        self.entries.write().remove(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hardware::SimulatedDeviceFleet;
    use chrono::{TimeZone, Utc};

    fn setup() -> (Arc<ManualClock>, Arc<SimulatedDeviceFleet>, CapabilityCache) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 19, 18, 0, 0).unwrap(),
        ));
        let fleet = Arc::new(SimulatedDeviceFleet::new(clock.clone()));
        fleet.add_v2g_charger("CP001", 11.0);
        fleet.simulate_connect("CP001", 70.0);
        let cache = CapabilityCache::new(fleet.clone(), clock.clone(), 30);
        (clock, fleet, cache)
    }

    #[tokio::test]
    async fn serves_cached_value_within_ttl() {
        let (clock, fleet, cache) = setup();
        let ctx = OpContext::background();
        assert_eq!(cache.get(&ctx, "CP001").await.unwrap().current_soc_percent, Some(70.0));

        fleet.set_soc("CP001", 50.0);
        clock.advance(Duration::seconds(10));
        assert_eq!(cache.get(&ctx, "CP001").await.unwrap().current_soc_percent, Some(70.0));

        clock.advance(Duration::seconds(30));
        assert_eq!(cache.get(&ctx, "CP001").await.unwrap().current_soc_percent, Some(50.0));
    }

    #[tokio::test]
    async fn failed_refresh_returns_last_known() {
        let (clock, fleet, cache) = setup();
        let ctx = OpContext::background();
        cache.get(&ctx, "CP001").await.unwrap();

        fleet.fail_capability("CP001", true);
        clock.advance(Duration::minutes(5));
        let cap = cache.get(&ctx, "CP001").await.unwrap();
        assert_eq!(cap.current_soc_percent, Some(70.0));

        cache.invalidate("CP001");
        assert!(cache.get(&ctx, "CP001").await.is_err());
    }

    #[tokio::test]
    async fn telemetry_soc_overrides_cached_reading() {
        let (_clock, _fleet, cache) = setup();
        let ctx = OpContext::background();
        cache.record_soc("CP001", 40.0);
        assert_eq!(cache.get(&ctx, "CP001").await.unwrap().current_soc_percent, Some(70.0));

        cache.record_soc("CP001", 40.0);
        assert_eq!(cache.get(&ctx, "CP001").await.unwrap().current_soc_percent, Some(40.0));
    }
}
