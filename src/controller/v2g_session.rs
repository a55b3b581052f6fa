//! V2G session manager
//!
//! Owns the discharge state machine: validates start requests against the
//! device and owner limits, dispatches charging profiles, ingests telemetry,
//! enforces the safety limits and hands finished sessions to settlement.
//!
//! Device and persistence I/O never happens while a table lock is held; the
//! session store and caches are only touched between awaits.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::capability_cache::CapabilityCache;
use super::session_store::SessionStore;
use crate::clock::Clock;
use crate::config::{Config, SessionConfig};
use crate::context::OpContext;
use crate::domain::{
    NewDischarge, SessionStatus, StatsScope, StopReason, V2GPreferences, V2GSession, V2GStats,
};
use crate::error::{V2gError, V2gResult};
use crate::events::{EventBus, V2gEvent};
use crate::hardware::{DeviceDirectory, DeviceError, V2gDeviceControl};
use crate::pricing::PriceOracle;
use crate::repo::V2gRepository;
use crate::settlement::CompensationEngine;

/// Shared handles to the engine's collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn DeviceDirectory>,
    pub control: Arc<dyn V2gDeviceControl>,
    pub prices: Arc<dyn PriceOracle>,
    pub repo: Arc<dyn V2gRepository>,
    pub store: Arc<dyn SessionStore>,
    pub events: Arc<dyn EventBus>,
    pub clock: Arc<dyn Clock>,
}

/// Owner request to discharge a connected vehicle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DischargeRequest {
    pub device_id: String,
    pub connector_id: u32,
    pub owner_id: Uuid,
    pub max_power_kw: f64,
    pub max_energy_kwh: Option<f64>,
    /// Overrides the owner's preferred SOC floor
    pub min_soc_percent: Option<f64>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OptimizeDecision {
    Started(V2GSession),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    AutoDischargeDisabled,
    PriceBelowThreshold { price: f64, threshold: f64 },
    NotCapable,
    DeviceBusy,
    BudgetExhausted { used_kwh: f64, budget_kwh: f64 },
    /// Start was refused by validation (vehicle gone, SOC at floor, ...)
    Rejected { error: String },
}

pub struct SessionManager {
    cfg: SessionConfig,
    timezone: Tz,
    currency: String,
    deps: Collaborators,
    capabilities: CapabilityCache,
    compensation: Arc<CompensationEngine>,
}

impl SessionManager {
    pub fn new(cfg: &Config, deps: Collaborators, compensation: Arc<CompensationEngine>) -> Self {
        let capabilities = CapabilityCache::new(
            deps.control.clone(),
            deps.clock.clone(),
            cfg.capability.cache_ttl_seconds,
        );
        Self {
            cfg: cfg.session.clone(),
            timezone: cfg.tariff.timezone,
            currency: cfg.compensation.currency.clone(),
            deps,
            capabilities,
            compensation,
        }
    }

    pub fn compensation(&self) -> &Arc<CompensationEngine> {
        &self.compensation
    }

    /// Validate, dispatch the discharge profile, then record the session as
    /// `active`.
    ///
    /// Nothing is left behind when dispatch fails. Once the device accepts the
    /// profile the session is recorded even if the caller has gone away.
    pub async fn start_discharge(
        &self,
        ctx: &OpContext,
        req: DischargeRequest,
    ) -> V2gResult<V2GSession> {
        let now = self.deps.clock.now();
        if let Some(end) = req.end_time {
            if end <= now {
                return Err(V2gError::InvalidWindow(end));
            }
        }
        if !(req.max_power_kw.is_finite() && req.max_power_kw > 0.0) {
            return Err(V2gError::InvalidRequest(format!(
                "max power must be positive, got {}",
                req.max_power_kw
            )));
        }
        if req.max_energy_kwh.is_some_and(|e| !(e.is_finite() && e > 0.0)) {
            return Err(V2gError::InvalidRequest(
                "max energy must be positive".to_string(),
            ));
        }

        let device = self.deps.directory.get_device(ctx, &req.device_id).await?;
        if !device.status.vehicle_connected() {
            return Err(V2gError::VehicleNotConnected(req.device_id));
        }
        if req.connector_id == 0 || req.connector_id > device.connector_count {
            return Err(V2gError::InvalidRequest(format!(
                "device {} has no connector {}",
                req.device_id, req.connector_id
            )));
        }

        let capability = self.capabilities.get(ctx, &req.device_id).await?;
        if !capability.supported {
            return Err(V2gError::V2gNotSupported(req.device_id));
        }

        let prefs = self.preferences(ctx, req.owner_id).await;
        let min_soc = req.min_soc_percent.unwrap_or(prefs.min_soc_percent);
        let current_soc = capability
            .current_soc_percent
            .ok_or_else(|| V2gError::SocUnavailable(req.device_id.clone()))?;
        if min_soc >= current_soc {
            return Err(V2gError::SocTooLow {
                current_soc,
                min_soc,
            });
        }

        let power_kw = capability.cap_power(req.max_power_kw);
        if power_kw <= 0.0 {
            return Err(V2gError::InvalidRequest(format!(
                "device {} reports no discharge power",
                req.device_id
            )));
        }

        let price = self.price_or_default(ctx).await;
        let (duration_seconds, planned_end) = self.plan_window(now, power_kw, &req);

        let session = V2GSession::new_discharge(
            NewDischarge {
                device_id: req.device_id.clone(),
                connector_id: req.connector_id,
                owner_id: req.owner_id,
                power_kw,
                max_energy_kwh: req.max_energy_kwh,
                price,
                min_soc_percent: min_soc,
                soc_at_start: current_soc,
                planned_end,
            },
            now,
        );

        if !self.deps.store.reserve(session.clone()).await {
            return Err(V2gError::SessionAlreadyActive {
                device_id: req.device_id,
                connector_id: req.connector_id,
            });
        }

        let task = tokio::spawn(dispatch_and_record(
            self.deps.clone(),
            ctx.child_with_timeout(self.cfg.device_timeout()),
            session,
            duration_seconds,
            prefs.notify_on_start,
        ));
        task.await
            .map_err(|e| V2gError::Internal(format!("discharge dispatch task failed: {e}")))?
    }

    /// Stop an active session on request.
    ///
    /// A second stop for the same session returns `SessionNotFound`. Once the
    /// session is taken, cancelling `ctx` no longer interrupts the stop.
    pub async fn stop_discharge(&self, ctx: &OpContext, session_id: Uuid) -> V2gResult<V2GSession> {
        ctx.check()?;
        let session = self
            .deps
            .store
            .take_active(session_id)
            .await
            .ok_or(V2gError::SessionNotFound(session_id))?;
        self.finish(session, StopReason::Requested).await
    }

    /// Ingest telemetry for an active session and enforce its limits.
    ///
    /// Returns the updated session, or the finished one when a limit stopped it.
    pub async fn update_session_metrics(
        &self,
        ctx: &OpContext,
        session_id: Uuid,
        power_kw: f64,
        energy_kwh: f64,
        soc_percent: f64,
    ) -> V2gResult<V2GSession> {
        if !(power_kw.is_finite() && energy_kwh.is_finite() && (0.0..=100.0).contains(&soc_percent))
        {
            return Err(V2gError::InvalidRequest(format!(
                "invalid telemetry: power {power_kw}, energy {energy_kwh}, soc {soc_percent}"
            )));
        }

        let mut session = self
            .deps
            .store
            .get(session_id)
            .await
            .ok_or(V2gError::SessionNotFound(session_id))?;
        if session.status != SessionStatus::Active {
            return Err(V2gError::InvalidRequest(format!(
                "session {session_id} is {}",
                session.status
            )));
        }

        let price = match self.deps.prices.current_price(ctx).await {
            Ok(p) => Some(p),
            Err(e) => {
                debug!(%session_id, error = %e, "price refresh skipped");
                None
            }
        };
        let now = self.deps.clock.now();
        session.apply_telemetry(power_kw, energy_kwh, soc_percent, price, now)?;
        if !self.deps.store.replace(session.clone()).await {
            return Err(V2gError::SessionNotFound(session_id));
        }
        self.capabilities.record_soc(&session.device_id, soc_percent);

        if let Some(reason) = session.breached_limit(now) {
            info!(
                %session_id,
                device_id = %session.device_id,
                %reason,
                soc = soc_percent,
                discharged_kwh = session.discharged_kwh(),
                "safety limit reached, stopping discharge"
            );
            let current = self
                .deps
                .store
                .take_active(session_id)
                .await
                .ok_or(V2gError::SessionNotFound(session_id))?;
            return self.finish(current, reason).await;
        }

        self.persist(ctx, &session).await;
        self.deps.events.publish(V2gEvent::session_updated(&session));
        Ok(session)
    }

    /// Active session on the device, from memory only.
    pub async fn get_active_session(&self, device_id: &str) -> Option<V2GSession> {
        self.deps.store.active_for_device(device_id).await
    }

    pub async fn get_session(&self, ctx: &OpContext, session_id: Uuid) -> V2gResult<V2GSession> {
        if let Some(s) = self.deps.store.get(session_id).await {
            return Ok(s);
        }
        self.deps
            .repo
            .get_session(ctx, session_id)
            .await?
            .ok_or(V2gError::SessionNotFound(session_id))
    }

    pub async fn active_sessions(&self) -> Vec<V2GSession> {
        self.deps.store.active_sessions().await
    }

    pub async fn sessions_for_owner(&self, ctx: &OpContext, owner_id: Uuid) -> V2gResult<Vec<V2GSession>> {
        Ok(self.deps.repo.sessions_by_owner(ctx, owner_id).await?)
    }

    pub async fn stats(&self, ctx: &OpContext, scope: StatsScope) -> V2gResult<V2GStats> {
        Ok(self.deps.repo.stats(ctx, &scope, None).await?)
    }

    /// Stored preferences, or the defaults when unset or unreadable.
    pub async fn preferences(&self, ctx: &OpContext, owner_id: Uuid) -> V2GPreferences {
        let defaults = || V2GPreferences::defaults_for(owner_id, self.cfg.default_min_soc_percent);
        match self.deps.repo.get_preferences(ctx, owner_id).await {
            Ok(Some(p)) => p,
            Ok(None) => defaults(),
            Err(e) => {
                warn!(%owner_id, error = %e, "preferences unavailable, using defaults");
                defaults()
            }
        }
    }

    pub async fn save_preferences(
        &self,
        ctx: &OpContext,
        mut prefs: V2GPreferences,
    ) -> V2gResult<V2GPreferences> {
        if !(0.0..100.0).contains(&prefs.min_soc_percent) {
            return Err(V2gError::InvalidRequest(format!(
                "min SOC must be in [0, 100), got {}",
                prefs.min_soc_percent
            )));
        }
        if prefs.min_grid_price < 0.0 || prefs.max_discharge_kwh_per_period < 0.0 {
            return Err(V2gError::InvalidRequest(
                "price threshold and energy budget must not be negative".to_string(),
            ));
        }
        prefs.updated_at = Some(self.deps.clock.now());
        self.deps.repo.save_preferences(ctx, &prefs).await?;
        Ok(prefs)
    }

    /// Start a discharge on the owner's behalf when their preferences allow.
    ///
    /// Performs one evaluation; the scheduler decides how often to call it.
    pub async fn optimize_v2g(
        &self,
        ctx: &OpContext,
        device_id: &str,
        owner_id: Uuid,
    ) -> V2gResult<OptimizeDecision> {
        let prefs = self.preferences(ctx, owner_id).await;
        if !prefs.auto_discharge_enabled {
            return Ok(OptimizeDecision::Skipped(SkipReason::AutoDischargeDisabled));
        }

        let price = self.price_or_default(ctx).await;
        if price < prefs.min_grid_price {
            return Ok(OptimizeDecision::Skipped(SkipReason::PriceBelowThreshold {
                price,
                threshold: prefs.min_grid_price,
            }));
        }

        let capability = match self.capabilities.get(ctx, device_id).await {
            Ok(c) if c.supported => c,
            Ok(_) => return Ok(OptimizeDecision::Skipped(SkipReason::NotCapable)),
            Err(e) => {
                warn!(device_id, error = %e, "capability unavailable for optimization");
                return Ok(OptimizeDecision::Skipped(SkipReason::NotCapable));
            }
        };

        if self.deps.store.is_device_busy(device_id).await {
            return Ok(OptimizeDecision::Skipped(SkipReason::DeviceBusy));
        }

        let since = self.start_of_local_day(self.deps.clock.now());
        let used_kwh = self
            .deps
            .repo
            .stats(ctx, &StatsScope::Owner(owner_id), Some(since))
            .await?
            .total_energy_discharged_kwh;
        let remaining = prefs.max_discharge_kwh_per_period - used_kwh;
        if remaining <= 0.0 {
            return Ok(OptimizeDecision::Skipped(SkipReason::BudgetExhausted {
                used_kwh,
                budget_kwh: prefs.max_discharge_kwh_per_period,
            }));
        }

        let req = DischargeRequest {
            device_id: device_id.to_string(),
            connector_id: capability.connector_id,
            owner_id,
            max_power_kw: capability.max_discharge_power_kw,
            max_energy_kwh: Some(remaining),
            min_soc_percent: Some(prefs.min_soc_percent),
            end_time: None,
        };
        match self.start_discharge(ctx, req).await {
            Ok(session) => {
                info!(
                    device_id,
                    %owner_id,
                    session_id = %session.id,
                    price,
                    energy_budget_kwh = remaining,
                    "auto discharge started"
                );
                Ok(OptimizeDecision::Started(session))
            }
            Err(e) if e.is_validation() => {
                debug!(device_id, error = %e, "auto discharge rejected");
                Ok(OptimizeDecision::Skipped(SkipReason::Rejected {
                    error: e.to_string(),
                }))
            }
            Err(e) => Err(e),
        }
    }

    async fn price_or_default(&self, ctx: &OpContext) -> f64 {
        match self.deps.prices.current_price(ctx).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, default_price = self.cfg.default_price, "price unavailable, using default");
                self.cfg.default_price
            }
        }
    }

    /// Profile duration and the instant the local window closes.
    fn plan_window(
        &self,
        now: DateTime<Utc>,
        power_kw: f64,
        req: &DischargeRequest,
    ) -> (u64, Option<DateTime<Utc>>) {
        if let Some(end) = req.end_time {
            return ((end - now).num_seconds().max(1) as u64, Some(end));
        }
        if let Some(energy) = req.max_energy_kwh {
            return (((energy / power_kw) * 3600.0).ceil().max(1.0) as u64, None);
        }
        let window = Duration::hours(i64::from(self.cfg.default_session_hours.max(1)));
        (window.num_seconds() as u64, Some(now + window))
    }

    fn start_of_local_day(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.with_timezone(&self.timezone)
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .and_then(|midnight| self.timezone.from_local_datetime(&midnight).earliest())
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or(now - Duration::hours(24))
    }

    /// Finalize a session already removed from the store.
    ///
    /// Runs on a context detached from the caller: the session has left the
    /// active set and must reach `completed` or `failed`.
    async fn finish(&self, mut session: V2GSession, reason: StopReason) -> V2gResult<V2GSession> {
        let ctx = &OpContext::background();
        let cleared = self.clear_with_retry(ctx, &session).await;
        self.capabilities.invalidate(&session.device_id);
        let notify = self.preferences(ctx, session.owner_id).await.notify_on_end;
        let now = self.deps.clock.now();
        session.stop_reason = Some(reason);

        if let Err(e) = cleared {
            session.transition(SessionStatus::Failed, now)?;
            error!(
                session_id = %session.id,
                device_id = %session.device_id,
                %reason,
                error = %e,
                "stop command not delivered, session failed"
            );
            self.persist(ctx, &session).await;
            self.deps.events.publish(V2gEvent::session_completed(
                &session,
                &self.currency,
                false,
                notify,
            ));
            return if reason.is_safety_limit() {
                Ok(session)
            } else {
                Err(V2gError::Device(e))
            };
        }

        session.transition(SessionStatus::Completed, now)?;
        match self
            .compensation
            .process_session_compensation(ctx, &session)
            .await
        {
            Ok(record) => session.compensation = Some(record.net_amount),
            Err(e @ V2gError::IneligibleSession { .. }) => {
                debug!(session_id = %session.id, error = %e, "no compensation for session")
            }
            Err(e) => warn!(session_id = %session.id, error = %e, "compensation failed"),
        }

        self.persist(ctx, &session).await;
        info!(
            session_id = %session.id,
            device_id = %session.device_id,
            %reason,
            discharged_kwh = session.discharged_kwh(),
            compensation = session.compensation,
            "discharge session completed"
        );
        self.deps.events.publish(V2gEvent::session_completed(
            &session,
            &self.currency,
            true,
            notify,
        ));
        Ok(session)
    }

    async fn clear_with_retry(&self, ctx: &OpContext, session: &V2GSession) -> Result<(), DeviceError> {
        let attempts = self.cfg.stop_retry_attempts.max(1);
        let mut backoff = StdDuration::from_millis(self.cfg.stop_retry_backoff_ms);
        let mut attempt = 1;
        loop {
            let call_ctx = ctx.child_with_timeout(self.cfg.device_timeout());
            let result = self
                .deps
                .control
                .clear_v2g_charging_profile(&call_ctx, &session.device_id, session.connector_id)
                .await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!(
                        session_id = %session.id,
                        device_id = %session.device_id,
                        attempt,
                        error = %e,
                        "clear profile failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
            }
        }
    }

    /// Persistence failures are logged; the in-memory copy stays authoritative.
    async fn persist(&self, ctx: &OpContext, session: &V2GSession) {
        if let Err(e) = self.deps.repo.update_session(ctx, session).await {
            error!(session_id = %session.id, error = %e, "failed to persist session");
        }
    }
}

/// Runs detached from the caller so an accepted profile is always recorded.
async fn dispatch_and_record(
    deps: Collaborators,
    ctx: OpContext,
    mut session: V2GSession,
    duration_seconds: u64,
    notify_owner: bool,
) -> V2gResult<V2GSession> {
    let dispatched = deps
        .control
        .set_v2g_charging_profile(
            &ctx,
            &session.device_id,
            session.connector_id,
            session.requested_power_kw,
            duration_seconds,
        )
        .await;
    if let Err(e) = dispatched {
        deps.store.release(session.id).await;
        warn!(
            device_id = %session.device_id,
            connector_id = session.connector_id,
            error = %e,
            "discharge dispatch failed, nothing recorded"
        );
        return Err(e.into());
    }

    session.transition(SessionStatus::Active, deps.clock.now())?;
    deps.store.replace(session.clone()).await;

    let repo = deps.repo.clone();
    let persisted = session.clone();
    tokio::spawn(async move {
        if let Err(e) = repo.create_session(&OpContext::background(), &persisted).await {
            error!(session_id = %persisted.id, error = %e, "failed to persist new session");
        }
    });

    info!(
        session_id = %session.id,
        device_id = %session.device_id,
        connector_id = session.connector_id,
        owner_id = %session.owner_id,
        power_kw = session.requested_power_kw,
        price = session.price_at_start,
        "discharge session started"
    );
    deps.events
        .publish(V2gEvent::session_started(&session, notify_owner));
    Ok(session)
}
