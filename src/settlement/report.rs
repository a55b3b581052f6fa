use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{round_currency, CompensationStatus, V2GCompensationRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerCompensation {
    pub owner_id: Uuid,
    pub records: u32,
    pub energy_kwh: f64,
    pub net_amount: f64,
    pub paid_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationReport {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub currency: String,
    pub total_records: u32,
    pub pending_records: u32,
    pub paid_records: u32,
    pub failed_records: u32,
    pub total_energy_kwh: f64,
    pub total_gross: f64,
    pub total_net: f64,
    pub total_paid: f64,
    pub operator_revenue: f64,
    /// Energy-weighted; `None` when nothing was discharged
    pub average_price: Option<f64>,
    /// Highest net amount first
    pub owners: Vec<OwnerCompensation>,
}

impl CompensationReport {
    pub fn from_records(
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        currency: &str,
        records: &[V2GCompensationRecord],
    ) -> Self {
        let count = |status: CompensationStatus| records.iter().filter(|r| r.status == status).count() as u32;
        let paid_sum = |rs: &[&V2GCompensationRecord]| -> f64 {
            rs.iter()
                .filter(|r| r.status == CompensationStatus::Paid)
                .map(|r| r.net_amount)
                .sum()
        };

        let total_energy: f64 = records.iter().map(|r| r.energy_discharged_kwh).sum();
        let weighted_price: f64 = records
            .iter()
            .map(|r| r.energy_discharged_kwh * r.average_price)
            .sum();
        let total_gross: f64 = records.iter().map(|r| r.gross_amount).sum();
        let total_net: f64 = records.iter().map(|r| r.net_amount).sum();
        let all: Vec<&V2GCompensationRecord> = records.iter().collect();

        let owners = records
            .iter()
            .into_group_map_by(|r| r.owner_id)
            .into_iter()
            .map(|(owner_id, rs)| OwnerCompensation {
                owner_id,
                records: rs.len() as u32,
                energy_kwh: rs.iter().map(|r| r.energy_discharged_kwh).sum(),
                net_amount: round_currency(rs.iter().map(|r| r.net_amount).sum()),
                paid_amount: round_currency(paid_sum(&rs)),
            })
            .sorted_by(|a, b| b.net_amount.total_cmp(&a.net_amount))
            .collect();

        Self {
            period_start,
            period_end,
            currency: currency.to_string(),
            total_records: records.len() as u32,
            pending_records: count(CompensationStatus::Pending),
            paid_records: count(CompensationStatus::Paid),
            failed_records: count(CompensationStatus::Failed),
            total_energy_kwh: total_energy,
            total_gross: round_currency(total_gross),
            total_net: round_currency(total_net),
            total_paid: round_currency(paid_sum(&all)),
            operator_revenue: round_currency(total_gross - total_net),
            average_price: (total_energy > 0.0).then(|| weighted_price / total_energy),
            owners,
        }
    }
}
