use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::report::CompensationReport;
use crate::clock::Clock;
use crate::config::CompensationConfig;
use crate::context::OpContext;
use crate::domain::{
    round_currency, CompensationStatus, Direction, SessionStatus, V2GCompensationRecord,
    V2GSession,
};
use crate::error::{V2gError, V2gResult};
use crate::events::{EventBus, V2gEvent};
use crate::repo::{RepositoryError, V2gRepository};
use crate::wallet::{WalletError, WalletService};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum PayoutOutcome {
    Paid { amount: f64, reference: String },
    /// Left `pending` for the batch sweep
    BelowMinimum { net_amount: f64, minimum: f64 },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchPayoutSummary {
    /// Completed sessions that had no record before the sweep
    pub sessions_compensated: u32,
    pub failed_reset: u32,
    pub considered: u32,
    pub paid: u32,
    pub paid_amount: f64,
    pub deferred: u32,
    /// Listed as pending but settled by another payout before the sweep got to it
    pub already_settled: u32,
    pub failed: u32,
}

/// Converts completed discharge sessions into owner payouts.
pub struct CompensationEngine {
    cfg: CompensationConfig,
    repo: Arc<dyn V2gRepository>,
    wallet: Arc<dyn WalletService>,
    events: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    in_flight: Mutex<HashSet<Uuid>>,
}

/// Holds a record id in the in-flight set until dropped.
struct PayoutClaim<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for PayoutClaim<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

impl CompensationEngine {
    pub fn new(
        cfg: CompensationConfig,
        repo: Arc<dyn V2gRepository>,
        wallet: Arc<dyn WalletService>,
        events: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cfg,
            repo,
            wallet,
            events,
            clock,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &CompensationConfig {
        &self.cfg
    }

    fn claim(&self, record_id: Uuid) -> V2gResult<PayoutClaim<'_>> {
        if !self.in_flight.lock().insert(record_id) {
            return Err(V2gError::InvalidRequest(format!(
                "payout for record {record_id} already in progress"
            )));
        }
        Ok(PayoutClaim {
            set: &self.in_flight,
            id: record_id,
        })
    }

    /// Create the `pending` record for a completed discharge session.
    ///
    /// Returns the existing record when the session was already compensated.
    pub async fn calculate_and_record_compensation(
        &self,
        ctx: &OpContext,
        session: &V2GSession,
    ) -> V2gResult<V2GCompensationRecord> {
        check_eligible(session)?;

        if let Some(existing) = self.repo.compensation_for_session(ctx, session.id).await? {
            debug!(session_id = %session.id, record_id = %existing.id, "compensation already recorded");
            return Ok(existing);
        }

        let now = self.clock.now();
        let energy = session.discharged_kwh();
        let average_price = (session.price_at_start + session.current_price) / 2.0;
        let gross = energy * average_price;
        let net = gross * (1.0 - self.cfg.operator_margin);

        let record = V2GCompensationRecord {
            id: Uuid::new_v4(),
            session_id: session.id,
            owner_id: session.owner_id,
            device_id: session.device_id.clone(),
            energy_discharged_kwh: energy,
            average_price,
            operator_margin: self.cfg.operator_margin,
            gross_amount: gross,
            net_amount: net,
            currency: self.cfg.currency.clone(),
            status: CompensationStatus::Pending,
            payment_reference: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            paid_at: None,
        };

        match self.repo.create_compensation(ctx, &record).await {
            Ok(()) => {}
            Err(RepositoryError::Conflict(_)) => {
                // lost a race with a concurrent calculation
                if let Some(existing) = self.repo.compensation_for_session(ctx, session.id).await?
                {
                    return Ok(existing);
                }
                return Err(V2gError::Internal(format!(
                    "compensation for session {} conflicted but is missing",
                    session.id
                )));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            session_id = %session.id,
            record_id = %record.id,
            owner_id = %record.owner_id,
            energy_kwh = energy,
            average_price,
            gross,
            net,
            "compensation calculated"
        );
        self.events.publish(V2gEvent::compensation_calculated(&record));
        Ok(record)
    }

    /// Credit the owner's wallet for a `pending` record.
    ///
    /// A net amount under the configured minimum is a successful no-op; the
    /// record stays `pending` for the batch sweep.
    pub async fn process_payout(&self, ctx: &OpContext, record_id: Uuid) -> V2gResult<PayoutOutcome> {
        let _claim = self.claim(record_id)?;
        let record = self.load(ctx, record_id).await?;
        if record.status != CompensationStatus::Pending {
            return Err(V2gError::AlreadyProcessed {
                record_id,
                status: record.status,
            });
        }
        if record.net_amount < self.cfg.min_payout_amount {
            debug!(
                %record_id,
                net_amount = record.net_amount,
                minimum = self.cfg.min_payout_amount,
                "payout below minimum, deferred"
            );
            return Ok(PayoutOutcome::BelowMinimum {
                net_amount: record.net_amount,
                minimum: self.cfg.min_payout_amount,
            });
        }
        self.pay(ctx, record).await
    }

    /// Calculate and, when auto payout is enabled, pay out a finished session.
    ///
    /// Payout failures are recorded on the record and do not fail the call.
    pub async fn process_session_compensation(
        &self,
        ctx: &OpContext,
        session: &V2GSession,
    ) -> V2gResult<V2GCompensationRecord> {
        let record = self.calculate_and_record_compensation(ctx, session).await?;
        if !self.cfg.auto_payout_enabled || record.status != CompensationStatus::Pending {
            return Ok(record);
        }
        match self.process_payout(ctx, record.id).await {
            Ok(outcome) => debug!(record_id = %record.id, ?outcome, "session payout processed"),
            Err(e) => warn!(record_id = %record.id, error = %e, "session payout failed"),
        }
        Ok(self.repo.get_compensation(ctx, record.id).await?.unwrap_or(record))
    }

    /// Reset one `failed` record to `pending` and pay it.
    pub async fn retry_failed_payout(&self, ctx: &OpContext, record_id: Uuid) -> V2gResult<PayoutOutcome> {
        let _claim = self.claim(record_id)?;
        let mut record = self.load(ctx, record_id).await?;
        if record.status != CompensationStatus::Failed {
            return Err(V2gError::AlreadyProcessed {
                record_id,
                status: record.status,
            });
        }
        self.reset_failed(ctx, &mut record).await?;
        self.pay(ctx, record).await
    }

    /// Sweep `pending` records.
    ///
    /// Completed sessions without a record are compensated first. A record is
    /// paid once its owner's combined pending net reaches the minimum, or once
    /// it is older than the retention period.
    pub async fn batch_process_pending_payouts(&self, ctx: &OpContext) -> V2gResult<BatchPayoutSummary> {
        let mut summary = BatchPayoutSummary::default();

        for session in self.repo.sessions_pending_compensation(ctx).await? {
            if self.repo.compensation_for_session(ctx, session.id).await?.is_some() {
                continue;
            }
            match self.calculate_and_record_compensation(ctx, &session).await {
                Ok(_) => summary.sessions_compensated += 1,
                Err(e) => warn!(session_id = %session.id, error = %e, "catch-up compensation failed"),
            }
        }

        if self.cfg.retry_failed_in_batch {
            for listed in self
                .repo
                .compensations_by_status(ctx, CompensationStatus::Failed)
                .await?
            {
                let Ok(_claim) = self.claim(listed.id) else {
                    continue;
                };
                let Some(mut record) = self
                    .reload_with_status(ctx, listed.id, CompensationStatus::Failed)
                    .await?
                else {
                    continue;
                };
                self.reset_failed(ctx, &mut record).await?;
                summary.failed_reset += 1;
            }
        }

        let now = self.clock.now();
        let max_age = Duration::days(self.cfg.retention_days.max(0));
        let by_owner = self
            .repo
            .compensations_by_status(ctx, CompensationStatus::Pending)
            .await?
            .into_iter()
            .into_group_map_by(|r| r.owner_id);

        for (owner_id, records) in by_owner {
            let owner_total: f64 = records.iter().map(|r| r.net_amount).sum();
            let threshold_met = owner_total >= self.cfg.min_payout_amount;
            for record in records {
                summary.considered += 1;
                if !(threshold_met || now - record.created_at >= max_age) {
                    summary.deferred += 1;
                    continue;
                }
                let Ok(_claim) = self.claim(record.id) else {
                    summary.deferred += 1;
                    continue;
                };
                let record = match self
                    .reload_with_status(ctx, record.id, CompensationStatus::Pending)
                    .await
                {
                    Ok(Some(current)) => current,
                    Ok(None) => {
                        debug!(record_id = %record.id, "record settled since listing, skipped");
                        summary.already_settled += 1;
                        continue;
                    }
                    Err(e) => {
                        summary.failed += 1;
                        warn!(%owner_id, record_id = %record.id, error = %e, "batch payout reload failed");
                        continue;
                    }
                };
                match self.pay(ctx, record).await {
                    Ok(PayoutOutcome::Paid { amount, .. }) => {
                        summary.paid += 1;
                        summary.paid_amount += amount;
                    }
                    Ok(PayoutOutcome::BelowMinimum { .. }) => summary.deferred += 1,
                    Err(e) => {
                        summary.failed += 1;
                        warn!(%owner_id, error = %e, "batch payout failed");
                    }
                }
            }
        }

        summary.paid_amount = round_currency(summary.paid_amount);
        info!(
            sessions_compensated = summary.sessions_compensated,
            considered = summary.considered,
            paid = summary.paid,
            paid_amount = summary.paid_amount,
            deferred = summary.deferred,
            already_settled = summary.already_settled,
            failed = summary.failed,
            "batch payout sweep finished"
        );
        Ok(summary)
    }

    /// Totals for records created in `[start, end)`.
    pub async fn generate_compensation_report(
        &self,
        ctx: &OpContext,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> V2gResult<CompensationReport> {
        if end <= start {
            return Err(V2gError::InvalidRequest(format!(
                "report period {start} .. {end} is empty"
            )));
        }
        let records = self.repo.compensations_between(ctx, start, end).await?;
        Ok(CompensationReport::from_records(
            start,
            end,
            &self.cfg.currency,
            &records,
        ))
    }

    async fn load(&self, ctx: &OpContext, record_id: Uuid) -> V2gResult<V2GCompensationRecord> {
        self.repo
            .get_compensation(ctx, record_id)
            .await?
            .ok_or(V2gError::CompensationNotFound(record_id))
    }

    /// Current copy of the record if it still has `status`. Caller holds the claim.
    async fn reload_with_status(
        &self,
        ctx: &OpContext,
        record_id: Uuid,
        status: CompensationStatus,
    ) -> V2gResult<Option<V2GCompensationRecord>> {
        Ok(self
            .repo
            .get_compensation(ctx, record_id)
            .await?
            .filter(|r| r.status == status))
    }

    async fn reset_failed(&self, ctx: &OpContext, record: &mut V2GCompensationRecord) -> V2gResult<()> {
        record.status = CompensationStatus::Pending;
        record.failure_reason = None;
        record.updated_at = self.clock.now();
        self.repo.update_compensation(ctx, record).await?;
        debug!(record_id = %record.id, "failed payout reset for retry");
        Ok(())
    }

    /// Credit the wallet and settle the record. Caller holds the claim.
    async fn pay(&self, ctx: &OpContext, mut record: V2GCompensationRecord) -> V2gResult<PayoutOutcome> {
        let amount = round_currency(record.net_amount);
        if amount <= 0.0 {
            return Ok(PayoutOutcome::BelowMinimum {
                net_amount: record.net_amount,
                minimum: self.cfg.min_payout_amount,
            });
        }
        let reference = record.payment_key();

        match self
            .wallet
            .add_funds(ctx, record.owner_id, amount, reference.clone())
            .await
        {
            Ok(()) => {
                let now = self.clock.now();
                record.status = CompensationStatus::Paid;
                record.payment_reference = Some(reference.clone());
                record.failure_reason = None;
                record.paid_at = Some(now);
                record.updated_at = now;
                // the wallet dedupes on the reference, so a retry after this
                // write fails cannot double-credit
                self.repo.update_compensation(ctx, &record).await?;
                if let Err(e) = self
                    .repo
                    .mark_compensation_paid(ctx, record.session_id, &reference)
                    .await
                {
                    warn!(session_id = %record.session_id, error = %e, "failed to mark session compensation paid");
                }
                info!(
                    record_id = %record.id,
                    owner_id = %record.owner_id,
                    amount,
                    currency = %record.currency,
                    "compensation paid"
                );
                self.events
                    .publish(V2gEvent::compensation_paid(&record, amount, now));
                Ok(PayoutOutcome::Paid { amount, reference })
            }
            Err(WalletError::Interrupted(i)) => {
                // caller went away; leave the record pending
                Err(V2gError::Interrupted(i))
            }
            Err(e) => {
                let now = self.clock.now();
                record.status = CompensationStatus::Failed;
                record.failure_reason = Some(e.to_string());
                record.updated_at = now;
                if let Err(re) = self.repo.update_compensation(ctx, &record).await {
                    error!(record_id = %record.id, error = %re, "failed to persist payout failure");
                }
                error!(record_id = %record.id, owner_id = %record.owner_id, error = %e, "compensation payout failed");
                self.events.publish(V2gEvent::compensation_failed(
                    &record,
                    amount,
                    e.to_string(),
                    now,
                ));
                Err(e.into())
            }
        }
    }
}

fn check_eligible(session: &V2GSession) -> V2gResult<()> {
    let reason = if session.status != SessionStatus::Completed {
        format!("status is {}", session.status)
    } else if session.direction != Direction::Discharging {
        format!("direction is {}", session.direction)
    } else if !session.energy_transferred_kwh.is_some_and(|e| e < 0.0) {
        "no energy discharged".to_string()
    } else {
        return Ok(());
    };
    Err(V2gError::IneligibleSession {
        session_id: session.id,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::NewDischarge;
    use crate::events::BroadcastEventBus;
    use crate::repo::{InMemoryV2gRepository, MockV2gRepository};
    use crate::wallet::{InMemoryWallet, MockWalletService};
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 19, 18, 0, 0).unwrap()
    }

    fn session(owner: Uuid, energy: f64, price_start: f64, price_end: f64) -> V2GSession {
        let mut s = V2GSession::new_discharge(
            NewDischarge {
                device_id: "CP001".into(),
                connector_id: 1,
                owner_id: owner,
                power_kw: 7.0,
                max_energy_kwh: None,
                price: price_start,
                min_soc_percent: 20.0,
                soc_at_start: 80.0,
                planned_end: None,
            },
            start(),
        );
        s.transition(SessionStatus::Active, start()).unwrap();
        s.apply_telemetry(7.0, energy, 50.0, Some(price_end), start())
            .unwrap();
        s.transition(SessionStatus::Completed, start()).unwrap();
        s
    }

    struct Harness {
        engine: CompensationEngine,
        repo: Arc<InMemoryV2gRepository>,
        bus: BroadcastEventBus,
        clock: Arc<ManualClock>,
    }

    fn harness(wallet: Arc<dyn WalletService>, cfg: CompensationConfig) -> Harness {
        let repo = Arc::new(InMemoryV2gRepository::new());
        let bus = BroadcastEventBus::new(64);
        let clock = Arc::new(ManualClock::new(start()));
        let engine = CompensationEngine::new(
            cfg,
            repo.clone(),
            wallet,
            Arc::new(bus.clone()),
            clock.clone(),
        );
        Harness {
            engine,
            repo,
            bus,
            clock,
        }
    }

    #[tokio::test]
    async fn computes_exact_net_without_intermediate_rounding() {
        let h = harness(Arc::new(InMemoryWallet::new()), CompensationConfig::default());
        let ctx = OpContext::background();
        let record = h
            .engine
            .calculate_and_record_compensation(&ctx, &session(Uuid::new_v4(), 25.0, 0.80, 0.90))
            .await
            .unwrap();

        assert!((record.average_price - 0.85).abs() < 1e-12);
        assert!((record.gross_amount - 21.25).abs() < 1e-9);
        assert!((record.net_amount - 19.125).abs() < 1e-9);
        assert_eq!(record.energy_discharged_kwh, 25.0);
        assert_eq!(record.status, CompensationStatus::Pending);
    }

    #[tokio::test]
    async fn ineligible_sessions_produce_no_record() {
        let h = harness(Arc::new(InMemoryWallet::new()), CompensationConfig::default());
        let ctx = OpContext::background();

        let mut charging = session(Uuid::new_v4(), 10.0, 1.0, 1.0);
        charging.direction = Direction::Charging;
        let err = h
            .engine
            .calculate_and_record_compensation(&ctx, &charging)
            .await
            .unwrap_err();
        assert!(matches!(err, V2gError::IneligibleSession { .. }));

        let mut active = session(Uuid::new_v4(), 10.0, 1.0, 1.0);
        active.status = SessionStatus::Active;
        assert!(h
            .engine
            .calculate_and_record_compensation(&ctx, &active)
            .await
            .is_err());

        let all = h
            .repo
            .compensations_by_status(&ctx, CompensationStatus::Pending)
            .await
            .unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn recording_twice_returns_same_record() {
        let h = harness(Arc::new(InMemoryWallet::new()), CompensationConfig::default());
        let ctx = OpContext::background();
        let s = session(Uuid::new_v4(), 10.0, 1.0, 1.0);
        let a = h.engine.calculate_and_record_compensation(&ctx, &s).await.unwrap();
        let b = h.engine.calculate_and_record_compensation(&ctx, &s).await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn pays_once_and_rejects_reprocessing() {
        let owner = Uuid::new_v4();
        let mut wallet = MockWalletService::new();
        wallet
            .expect_add_funds()
            .withf(move |_, o, amount, reference| {
                *o == owner && (*amount - 19.13).abs() < 1e-9 && reference.starts_with("v2g-comp-")
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let h = harness(Arc::new(wallet), CompensationConfig::default());
        let mut rx = h.bus.subscribe();
        let ctx = OpContext::background();

        let record = h
            .engine
            .calculate_and_record_compensation(&ctx, &session(owner, 25.0, 0.80, 0.90))
            .await
            .unwrap();
        let outcome = h.engine.process_payout(&ctx, record.id).await.unwrap();
        assert_eq!(
            outcome,
            PayoutOutcome::Paid {
                amount: 19.13,
                reference: record.payment_key()
            }
        );

        let err = h.engine.process_payout(&ctx, record.id).await.unwrap_err();
        assert!(matches!(
            err,
            V2gError::AlreadyProcessed {
                status: CompensationStatus::Paid,
                ..
            }
        ));

        let paid = h.repo.get_compensation(&ctx, record.id).await.unwrap().unwrap();
        assert_eq!(paid.status, CompensationStatus::Paid);
        assert_eq!(paid.paid_at, Some(start()));

        let topics: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.topic())
            .collect();
        assert_eq!(topics, vec!["v2g.compensation.calculated", "v2g.compensation.paid"]);
    }

    #[tokio::test]
    async fn below_minimum_credits_nothing() {
        let mut wallet = MockWalletService::new();
        wallet.expect_add_funds().never();
        let h = harness(Arc::new(wallet), CompensationConfig::default());
        let ctx = OpContext::background();

        let record = h
            .engine
            .calculate_and_record_compensation(&ctx, &session(Uuid::new_v4(), 2.0, 1.0, 1.0))
            .await
            .unwrap();
        let outcome = h.engine.process_payout(&ctx, record.id).await.unwrap();
        assert!(matches!(outcome, PayoutOutcome::BelowMinimum { .. }));
        let stored = h.repo.get_compensation(&ctx, record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CompensationStatus::Pending);
    }

    #[tokio::test]
    async fn wallet_failure_marks_record_failed_and_retry_pays() {
        let wallet = Arc::new(InMemoryWallet::new());
        let h = harness(wallet.clone(), CompensationConfig::default());
        let mut rx = h.bus.subscribe();
        let ctx = OpContext::background();
        let owner = Uuid::new_v4();

        let record = h
            .engine
            .calculate_and_record_compensation(&ctx, &session(owner, 20.0, 1.0, 1.0))
            .await
            .unwrap();
        wallet.fail_next(1);
        let err = h.engine.process_payout(&ctx, record.id).await.unwrap_err();
        assert!(matches!(err, V2gError::Wallet(_)));

        let failed = h.repo.get_compensation(&ctx, record.id).await.unwrap().unwrap();
        assert_eq!(failed.status, CompensationStatus::Failed);
        assert!(failed.failure_reason.is_some());
        let topics: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.topic())
            .collect();
        assert!(topics.contains(&"v2g.compensation.failed"));

        let outcome = h.engine.retry_failed_payout(&ctx, record.id).await.unwrap();
        assert!(matches!(outcome, PayoutOutcome::Paid { amount, .. } if amount == 18.0));
        assert_eq!(wallet.balance(owner), 18.0);
    }

    #[tokio::test]
    async fn batch_pays_when_owner_total_crosses_minimum() {
        let wallet = Arc::new(InMemoryWallet::new());
        let h = harness(wallet.clone(), CompensationConfig::default());
        let ctx = OpContext::background();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();

        // 3 kWh * 1.0 * 0.9 = 2.70 each; two of them cross 5.00
        for _ in 0..2 {
            h.engine
                .calculate_and_record_compensation(&ctx, &session(owner, 3.0, 1.0, 1.0))
                .await
                .unwrap();
        }
        h.engine
            .calculate_and_record_compensation(&ctx, &session(other, 3.0, 1.0, 1.0))
            .await
            .unwrap();

        let summary = h.engine.batch_process_pending_payouts(&ctx).await.unwrap();
        assert_eq!(summary.considered, 3);
        assert_eq!(summary.paid, 2);
        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.paid_amount, 5.4);
        assert_eq!(wallet.balance(owner), 5.4);
        assert_eq!(wallet.balance(other), 0.0);

        // past retention the small record is paid regardless
        h.clock.advance(Duration::days(31));
        let summary = h.engine.batch_process_pending_payouts(&ctx).await.unwrap();
        assert_eq!(summary.paid, 1);
        assert_eq!(wallet.balance(other), 2.7);
    }

    #[tokio::test]
    async fn batch_compensates_sessions_missing_a_record() {
        let h = harness(Arc::new(InMemoryWallet::new()), CompensationConfig::default());
        let ctx = OpContext::background();
        let s = session(Uuid::new_v4(), 10.0, 1.0, 1.0);
        h.repo.create_session(&ctx, &s).await.unwrap();

        let summary = h.engine.batch_process_pending_payouts(&ctx).await.unwrap();
        assert_eq!(summary.sessions_compensated, 1);
        assert_eq!(summary.paid, 1);
        assert!(h
            .repo
            .sessions_pending_compensation(&ctx)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn session_compensation_respects_auto_payout_flag() {
        let mut wallet = MockWalletService::new();
        wallet.expect_add_funds().never();
        let cfg = CompensationConfig {
            auto_payout_enabled: false,
            ..CompensationConfig::default()
        };
        let h = harness(Arc::new(wallet), cfg);
        let record = h
            .engine
            .process_session_compensation(
                &OpContext::background(),
                &session(Uuid::new_v4(), 25.0, 1.0, 1.0),
            )
            .await
            .unwrap();
        assert_eq!(record.status, CompensationStatus::Pending);
    }

    #[tokio::test]
    async fn sweep_skips_record_paid_after_listing() {
        let ctx = OpContext::background();
        let owner = Uuid::new_v4();
        let seed = harness(Arc::new(InMemoryWallet::new()), CompensationConfig::default());
        let listed = seed
            .engine
            .calculate_and_record_compensation(&ctx, &session(owner, 25.0, 0.80, 0.90))
            .await
            .unwrap();
        let mut settled = listed.clone();
        settled.status = CompensationStatus::Paid;
        settled.payment_reference = Some(listed.payment_key());
        settled.paid_at = Some(start());

        let mut repo = MockV2gRepository::new();
        repo.expect_sessions_pending_compensation()
            .returning(|_| Ok(Vec::new()));
        repo.expect_compensations_by_status()
            .withf(|_, status| *status == CompensationStatus::Failed)
            .returning(|_, _| Ok(Vec::new()));
        repo.expect_compensations_by_status()
            .withf(|_, status| *status == CompensationStatus::Pending)
            .returning(move |_, _| Ok(vec![listed.clone()]));
        repo.expect_get_compensation()
            .returning(move |_, _| Ok(Some(settled.clone())));
        repo.expect_update_compensation().never();
        repo.expect_mark_compensation_paid().never();

        let mut wallet = MockWalletService::new();
        wallet.expect_add_funds().never();

        let bus = BroadcastEventBus::new(16);
        let mut rx = bus.subscribe();
        let engine = CompensationEngine::new(
            CompensationConfig::default(),
            Arc::new(repo),
            Arc::new(wallet),
            Arc::new(bus.clone()),
            Arc::new(ManualClock::new(start())),
        );

        let summary = engine.batch_process_pending_payouts(&ctx).await.unwrap();
        assert_eq!(summary.considered, 1);
        assert_eq!(summary.paid, 0);
        assert_eq!(summary.already_settled, 1);
        assert!(rx.try_recv().is_err(), "no second paid event");
    }

    proptest! {
        #[test]
        fn net_is_energy_times_mean_price_less_margin(
            energy in 0.1f64..200.0,
            p0 in 0.1f64..3.0,
            p1 in 0.1f64..3.0,
            margin in 0.0f64..0.5,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let cfg = CompensationConfig { operator_margin: margin, ..CompensationConfig::default() };
            let h = harness(Arc::new(InMemoryWallet::new()), cfg);
            let s = session(Uuid::new_v4(), energy, p0, p1);
            let record = rt
                .block_on(h.engine.calculate_and_record_compensation(&OpContext::background(), &s))
                .unwrap();
            let expected = energy * ((p0 + p1) / 2.0) * (1.0 - margin);
            prop_assert!((record.net_amount - expected).abs() < 1e-9);
            prop_assert!(record.net_amount <= record.gross_amount);
        }
    }
}
