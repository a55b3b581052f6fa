//! Device collaborators.
//!
//! The wire protocol that reaches the charge point lives behind these traits;
//! the engine only needs the directory lookup and the V2G profile commands.

pub mod simulated;

pub use simulated::*;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::{Interrupted, OpContext};
use crate::domain::{Device, V2GCapability};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device {0} not found")]
    NotFound(String),
    #[error("communication error: {0}")]
    Communication(String),
    #[error("command rejected by device: {0}")]
    Rejected(String),
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn get_device(&self, ctx: &OpContext, device_id: &str) -> Result<Device, DeviceError>;
}

/// Device-control dispatcher for bidirectional charging profiles.
#[async_trait]
pub trait V2gDeviceControl: Send + Sync {
    /// Push a discharge profile of `power_kw` for `duration_seconds`.
    async fn set_v2g_charging_profile(
        &self,
        ctx: &OpContext,
        device_id: &str,
        connector_id: u32,
        power_kw: f64,
        duration_seconds: u64,
    ) -> Result<(), DeviceError>;

    async fn clear_v2g_charging_profile(
        &self,
        ctx: &OpContext,
        device_id: &str,
        connector_id: u32,
    ) -> Result<(), DeviceError>;

    async fn get_v2g_capability(
        &self,
        ctx: &OpContext,
        device_id: &str,
    ) -> Result<V2GCapability, DeviceError>;

    async fn is_connected(&self, ctx: &OpContext, device_id: &str) -> Result<bool, DeviceError>;
}
