//! V2G session model and its state machine.
//!
//! `pending -> active -> completed`, with `active -> failed` when the stop
//! command cannot be delivered and `pending -> cancelled` when the start
//! command was never accepted. No transition skips `active`, and a session is
//! immutable once it reaches a terminal status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Direction {
    Charging,
    Discharging,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Pending, SessionStatus::Active)
                | (SessionStatus::Pending, SessionStatus::Cancelled)
                | (SessionStatus::Active, SessionStatus::Completed)
                | (SessionStatus::Active, SessionStatus::Failed)
        )
    }
}

/// Why a session left the `active` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    Requested,
    SocFloorReached,
    EnergyLimitReached,
    WindowElapsed,
}

impl StopReason {
    /// Stops triggered by telemetry must always release local state.
    pub fn is_safety_limit(self) -> bool {
        !matches!(self, StopReason::Requested)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionStateError {
    #[error("session {session_id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        session_id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("session {0} is terminal and cannot be modified")]
    Immutable(Uuid),
}

/// One bidirectional-energy episode on a (device, connector) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2GSession {
    pub id: Uuid,
    pub device_id: String,
    pub connector_id: u32,
    pub owner_id: Uuid,
    pub direction: Direction,
    pub requested_power_kw: f64,
    /// Last measured power magnitude (kW); `None` until the first telemetry
    pub actual_power_kw: Option<f64>,
    /// Net energy (kWh), negative = discharged to grid; `None` until metered
    pub energy_transferred_kwh: Option<f64>,
    pub max_energy_kwh: Option<f64>,
    pub price_at_start: f64,
    pub current_price: f64,
    pub min_soc_percent: f64,
    pub soc_at_start: f64,
    pub current_soc_percent: f64,
    pub status: SessionStatus,
    pub stop_reason: Option<StopReason>,
    pub started_at: DateTime<Utc>,
    pub planned_end: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Net owner compensation, set once the session is settled
    pub compensation: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for a validated discharge request.
#[derive(Debug, Clone)]
pub struct NewDischarge {
    pub device_id: String,
    pub connector_id: u32,
    pub owner_id: Uuid,
    pub power_kw: f64,
    pub max_energy_kwh: Option<f64>,
    pub price: f64,
    pub min_soc_percent: f64,
    pub soc_at_start: f64,
    pub planned_end: Option<DateTime<Utc>>,
}

impl V2GSession {
    /// Build a `pending` discharge session. Callers validate the SOC floor first.
    pub fn new_discharge(req: NewDischarge, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: req.device_id,
            connector_id: req.connector_id,
            owner_id: req.owner_id,
            direction: Direction::Discharging,
            requested_power_kw: req.power_kw,
            actual_power_kw: None,
            energy_transferred_kwh: None,
            max_energy_kwh: req.max_energy_kwh,
            price_at_start: req.price,
            current_price: req.price,
            min_soc_percent: req.min_soc_percent,
            soc_at_start: req.soc_at_start,
            current_soc_percent: req.soc_at_start,
            status: SessionStatus::Pending,
            stop_reason: None,
            started_at: at,
            planned_end: req.planned_end,
            ended_at: None,
            compensation: None,
            updated_at: at,
        }
    }

    pub fn transition(
        &mut self,
        next: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<(), SessionStateError> {
        if !self.status.can_transition_to(next) {
            return Err(SessionStateError::IllegalTransition {
                session_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = at;
        if next == SessionStatus::Active {
            self.started_at = at;
        }
        if next.is_terminal() {
            self.ended_at = Some(at);
        }
        Ok(())
    }

    /// Overwrite measured values from telemetry.
    ///
    /// While discharging the stored energy is always `-|energy|`, whatever sign
    /// convention the meter uses.
    pub fn apply_telemetry(
        &mut self,
        power_kw: f64,
        energy_kwh: f64,
        soc_percent: f64,
        price: Option<f64>,
        at: DateTime<Utc>,
    ) -> Result<(), SessionStateError> {
        if self.status.is_terminal() {
            return Err(SessionStateError::Immutable(self.id));
        }
        self.actual_power_kw = Some(power_kw.abs());
        self.energy_transferred_kwh = Some(match self.direction {
            Direction::Discharging => -energy_kwh.abs(),
            Direction::Charging => energy_kwh.abs(),
            Direction::Idle => energy_kwh,
        });
        self.current_soc_percent = soc_percent;
        if let Some(price) = price {
            self.current_price = price;
        }
        self.updated_at = at;
        Ok(())
    }

    /// Energy delivered to the grid (kWh, positive magnitude).
    pub fn discharged_kwh(&self) -> f64 {
        match self.energy_transferred_kwh {
            Some(e) if e < 0.0 => -e,
            _ => 0.0,
        }
    }

    pub fn soc_floor_reached(&self) -> bool {
        self.current_soc_percent <= self.min_soc_percent
    }

    pub fn energy_limit_reached(&self) -> bool {
        match self.max_energy_kwh {
            Some(limit) if limit > 0.0 => self.discharged_kwh() >= limit,
            _ => false,
        }
    }

    pub fn window_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.planned_end.is_some_and(|end| now >= end)
    }

    /// First safety limit breached by the latest telemetry, if any.
    pub fn breached_limit(&self, now: DateTime<Utc>) -> Option<StopReason> {
        if self.soc_floor_reached() {
            Some(StopReason::SocFloorReached)
        } else if self.energy_limit_reached() {
            Some(StopReason::EnergyLimitReached)
        } else if self.window_elapsed(now) {
            Some(StopReason::WindowElapsed)
        } else {
            None
        }
    }
}
