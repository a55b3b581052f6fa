use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::context::Interrupted;
use crate::domain::{CompensationStatus, SessionStateError};
use crate::hardware::DeviceError;
use crate::pricing::PriceError;
use crate::repo::RepositoryError;
use crate::wallet::WalletError;

pub type V2gResult<T> = std::result::Result<T, V2gError>;

/// Engine error taxonomy.
///
/// Validation variants are returned before any side effect happens.
/// Dependency variants wrap the collaborator that failed.
#[derive(Debug, Error)]
pub enum V2gError {
    #[error("vehicle not connected to device {0}")]
    VehicleNotConnected(String),

    #[error("V2G not supported by device {0}")]
    V2gNotSupported(String),

    #[error("state of charge {current_soc:.1}% is at or below floor {min_soc:.1}%")]
    SocTooLow { current_soc: f64, min_soc: f64 },

    #[error("device {0} did not report a state of charge")]
    SocUnavailable(String),

    #[error("end time {0} is not in the future")]
    InvalidWindow(DateTime<Utc>),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("session already active on device {device_id} connector {connector_id}")]
    SessionAlreadyActive { device_id: String, connector_id: u32 },

    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    #[error("compensation record {0} not found")]
    CompensationNotFound(Uuid),

    #[error("compensation record {record_id} already processed (status {status})")]
    AlreadyProcessed {
        record_id: Uuid,
        status: CompensationStatus,
    },

    #[error("session {session_id} is not eligible for compensation: {reason}")]
    IneligibleSession { session_id: Uuid, reason: String },

    #[error("device control failed: {0}")]
    Device(#[from] DeviceError),

    #[error("repository failed: {0}")]
    Repository(#[from] RepositoryError),

    #[error("payout failed: {0}")]
    Wallet(#[from] WalletError),

    #[error("price source failed: {0}")]
    Price(#[from] PriceError),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    #[error(transparent)]
    State(#[from] SessionStateError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl V2gError {
    /// Synchronous, side-effect free rejections.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            V2gError::VehicleNotConnected(_)
                | V2gError::V2gNotSupported(_)
                | V2gError::SocTooLow { .. }
                | V2gError::SocUnavailable(_)
                | V2gError::InvalidWindow(_)
                | V2gError::InvalidRequest(_)
                | V2gError::SessionAlreadyActive { .. }
                | V2gError::AlreadyProcessed { .. }
                | V2gError::IneligibleSession { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            V2gError::SessionNotFound(_) | V2gError::CompensationNotFound(_)
        )
    }
}
