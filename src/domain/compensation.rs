use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CompensationStatus {
    Pending,
    Paid,
    Failed,
}

/// Owner payout for one completed discharge session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2GCompensationRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub owner_id: Uuid,
    pub device_id: String,
    /// Positive magnitude (kWh)
    pub energy_discharged_kwh: f64,
    pub average_price: f64,
    pub operator_margin: f64,
    pub gross_amount: f64,
    pub net_amount: f64,
    pub currency: String,
    pub status: CompensationStatus,
    pub payment_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl V2GCompensationRecord {
    /// Wallet idempotency key; stable for the lifetime of the record.
    pub fn payment_key(&self) -> String {
        format!("v2g-comp-{}", self.id)
    }

    pub fn operator_revenue(&self) -> f64 {
        self.gross_amount - self.net_amount
    }
}
