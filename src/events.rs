//! Settlement and session events.
//!
//! Publishing is fire-and-forget with at-least-once delivery: a consumer may
//! see the same event twice and must key on the session or record id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{StopReason, V2GCompensationRecord, V2GSession};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStarted {
    pub session_id: Uuid,
    pub owner_id: Uuid,
    pub device_id: String,
    pub connector_id: u32,
    pub power_kw: f64,
    pub price: f64,
    pub min_soc_percent: f64,
    pub notify_owner: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdated {
    pub session_id: Uuid,
    pub owner_id: Uuid,
    pub device_id: String,
    pub power_kw: f64,
    pub energy_kwh: f64,
    pub soc_percent: f64,
    pub price: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCompleted {
    pub session_id: Uuid,
    pub owner_id: Uuid,
    pub device_id: String,
    pub energy_kwh: f64,
    pub compensation: Option<f64>,
    pub currency: String,
    pub reason: StopReason,
    /// `false` when the stop command could not be delivered
    pub device_cleared: bool,
    pub notify_owner: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationCalculated {
    pub record_id: Uuid,
    pub session_id: Uuid,
    pub owner_id: Uuid,
    pub device_id: String,
    pub energy_kwh: f64,
    pub gross_amount: f64,
    pub net_amount: f64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationPaid {
    pub record_id: Uuid,
    pub session_id: Uuid,
    pub owner_id: Uuid,
    pub device_id: String,
    pub amount: f64,
    pub currency: String,
    pub payment_reference: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationFailed {
    pub record_id: Uuid,
    pub session_id: Uuid,
    pub owner_id: Uuid,
    pub device_id: String,
    pub amount: f64,
    pub currency: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload")]
pub enum V2gEvent {
    #[serde(rename = "v2g.session.started")]
    SessionStarted(SessionStarted),
    #[serde(rename = "v2g.session.updated")]
    SessionUpdated(SessionUpdated),
    #[serde(rename = "v2g.session.completed")]
    SessionCompleted(SessionCompleted),
    #[serde(rename = "v2g.compensation.calculated")]
    CompensationCalculated(CompensationCalculated),
    #[serde(rename = "v2g.compensation.paid")]
    CompensationPaid(CompensationPaid),
    #[serde(rename = "v2g.compensation.failed")]
    CompensationFailed(CompensationFailed),
}

impl V2gEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            V2gEvent::SessionStarted(_) => "v2g.session.started",
            V2gEvent::SessionUpdated(_) => "v2g.session.updated",
            V2gEvent::SessionCompleted(_) => "v2g.session.completed",
            V2gEvent::CompensationCalculated(_) => "v2g.compensation.calculated",
            V2gEvent::CompensationPaid(_) => "v2g.compensation.paid",
            V2gEvent::CompensationFailed(_) => "v2g.compensation.failed",
        }
    }

    pub fn session_started(s: &V2GSession, notify_owner: bool) -> Self {
        V2gEvent::SessionStarted(SessionStarted {
            session_id: s.id,
            owner_id: s.owner_id,
            device_id: s.device_id.clone(),
            connector_id: s.connector_id,
            power_kw: s.requested_power_kw,
            price: s.price_at_start,
            min_soc_percent: s.min_soc_percent,
            notify_owner,
            at: s.started_at,
        })
    }

    pub fn session_updated(s: &V2GSession) -> Self {
        V2gEvent::SessionUpdated(SessionUpdated {
            session_id: s.id,
            owner_id: s.owner_id,
            device_id: s.device_id.clone(),
            power_kw: s.actual_power_kw.unwrap_or(0.0),
            energy_kwh: s.energy_transferred_kwh.unwrap_or(0.0),
            soc_percent: s.current_soc_percent,
            price: s.current_price,
            at: s.updated_at,
        })
    }

    pub fn session_completed(
        s: &V2GSession,
        currency: &str,
        device_cleared: bool,
        notify_owner: bool,
    ) -> Self {
        V2gEvent::SessionCompleted(SessionCompleted {
            session_id: s.id,
            owner_id: s.owner_id,
            device_id: s.device_id.clone(),
            energy_kwh: s.energy_transferred_kwh.unwrap_or(0.0),
            compensation: s.compensation,
            currency: currency.to_string(),
            reason: s.stop_reason.unwrap_or(StopReason::Requested),
            device_cleared,
            notify_owner,
            at: s.ended_at.unwrap_or(s.updated_at),
        })
    }

    pub fn compensation_calculated(r: &V2GCompensationRecord) -> Self {
        V2gEvent::CompensationCalculated(CompensationCalculated {
            record_id: r.id,
            session_id: r.session_id,
            owner_id: r.owner_id,
            device_id: r.device_id.clone(),
            energy_kwh: r.energy_discharged_kwh,
            gross_amount: r.gross_amount,
            net_amount: r.net_amount,
            currency: r.currency.clone(),
        })
    }

    pub fn compensation_paid(r: &V2GCompensationRecord, amount: f64, at: DateTime<Utc>) -> Self {
        V2gEvent::CompensationPaid(CompensationPaid {
            record_id: r.id,
            session_id: r.session_id,
            owner_id: r.owner_id,
            device_id: r.device_id.clone(),
            amount,
            currency: r.currency.clone(),
            payment_reference: r.payment_reference.clone().unwrap_or_default(),
            at,
        })
    }

    pub fn compensation_failed(
        r: &V2GCompensationRecord,
        amount: f64,
        error: String,
        at: DateTime<Utc>,
    ) -> Self {
        V2gEvent::CompensationFailed(CompensationFailed {
            record_id: r.id,
            session_id: r.session_id,
            owner_id: r.owner_id,
            device_id: r.device_id.clone(),
            amount,
            currency: r.currency.clone(),
            error,
            at,
        })
    }
}

pub trait EventBus: Send + Sync {
    fn publish(&self, event: V2gEvent);
}

/// In-process bus over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    tx: broadcast::Sender<V2gEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<V2gEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: V2gEvent) {
        let topic = event.topic();
        match self.tx.send(event) {
            Ok(receivers) => debug!(topic, receivers, "event published"),
            Err(_) => warn!(topic, "event dropped, no subscribers"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CompensationStatus, V2GCompensationRecord};

    fn record() -> V2GCompensationRecord {
        let now = Utc::now();
        V2GCompensationRecord {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            device_id: "CP001".into(),
            energy_discharged_kwh: 25.0,
            average_price: 0.85,
            operator_margin: 0.1,
            gross_amount: 21.25,
            net_amount: 19.125,
            currency: "BRL".into(),
            status: CompensationStatus::Pending,
            payment_reference: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            paid_at: None,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_typed_events() {
        let bus = BroadcastEventBus::new(8);
        let mut rx = bus.subscribe();
        let r = record();
        bus.publish(V2gEvent::compensation_calculated(&r));

        match rx.recv().await.unwrap() {
            V2gEvent::CompensationCalculated(e) => {
                assert_eq!(e.record_id, r.id);
                assert_eq!(e.net_amount, 19.125);
            }
            other => panic!("unexpected event {}", other.topic()),
        }
    }

    #[test]
    fn serializes_with_topic_tag() {
        let event = V2gEvent::compensation_paid(&record(), 19.13, Utc::now());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["topic"], "v2g.compensation.paid");
        assert_eq!(json["payload"]["amount"], 19.13);
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        BroadcastEventBus::default().publish(V2gEvent::compensation_calculated(&record()));
    }
}
