use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{RepoResult, RepositoryError, V2gRepository};
use crate::context::OpContext;
use crate::domain::{
    CompensationStatus, Direction, SessionStatus, StatsScope, V2GCompensationRecord,
    V2GPreferences, V2GSession, V2GStats,
};

#[derive(Debug, Default)]
struct Tables {
    sessions: HashMap<Uuid, V2GSession>,
    preferences: HashMap<Uuid, V2GPreferences>,
    records: HashMap<Uuid, V2GCompensationRecord>,
    /// session id -> payment reference
    paid: HashMap<Uuid, String>,
}

/// In-process repository. `set_unavailable` simulates a storage outage.
#[derive(Debug, Default)]
pub struct InMemoryV2gRepository {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
}

impl InMemoryV2gRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn guard(&self, ctx: &OpContext) -> RepoResult<()> {
        ctx.check()?;
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }

    fn select(&self, pred: impl Fn(&V2GSession) -> bool) -> Vec<V2GSession> {
        let mut out: Vec<V2GSession> = self
            .tables
            .read()
            .sessions
            .values()
            .filter(|s| pred(s))
            .cloned()
            .collect();
        out.sort_by_key(|s| s.started_at);
        out
    }
}

fn in_scope(session: &V2GSession, scope: &StatsScope) -> bool {
    match scope {
        StatsScope::Owner(owner) => session.owner_id == *owner,
        StatsScope::Device(device) => session.device_id == *device,
        StatsScope::Global => true,
    }
}

#[async_trait]
impl V2gRepository for InMemoryV2gRepository {
    async fn create_session(&self, ctx: &OpContext, session: &V2GSession) -> RepoResult<()> {
        self.guard(ctx)?;
        let mut t = self.tables.write();
        if t.sessions.contains_key(&session.id) {
            return Err(RepositoryError::Conflict(format!("session {}", session.id)));
        }
        t.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn update_session(&self, ctx: &OpContext, session: &V2GSession) -> RepoResult<()> {
        self.guard(ctx)?;
        // upsert: a failed create must not block the final write
        self.tables
            .write()
            .sessions
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, ctx: &OpContext, id: Uuid) -> RepoResult<Option<V2GSession>> {
        self.guard(ctx)?;
        Ok(self.tables.read().sessions.get(&id).cloned())
    }

    async fn sessions_by_device(
        &self,
        ctx: &OpContext,
        device_id: &str,
    ) -> RepoResult<Vec<V2GSession>> {
        self.guard(ctx)?;
        Ok(self.select(|s| s.device_id == device_id))
    }

    async fn sessions_by_owner(
        &self,
        ctx: &OpContext,
        owner_id: Uuid,
    ) -> RepoResult<Vec<V2GSession>> {
        self.guard(ctx)?;
        Ok(self.select(|s| s.owner_id == owner_id))
    }

    async fn sessions_by_status(
        &self,
        ctx: &OpContext,
        status: SessionStatus,
    ) -> RepoResult<Vec<V2GSession>> {
        self.guard(ctx)?;
        Ok(self.select(|s| s.status == status))
    }

    async fn get_preferences(
        &self,
        ctx: &OpContext,
        owner_id: Uuid,
    ) -> RepoResult<Option<V2GPreferences>> {
        self.guard(ctx)?;
        Ok(self.tables.read().preferences.get(&owner_id).cloned())
    }

    async fn save_preferences(&self, ctx: &OpContext, prefs: &V2GPreferences) -> RepoResult<()> {
        self.guard(ctx)?;
        self.tables
            .write()
            .preferences
            .insert(prefs.owner_id, prefs.clone());
        Ok(())
    }

    async fn stats(
        &self,
        ctx: &OpContext,
        scope: &StatsScope,
        since: Option<DateTime<Utc>>,
    ) -> RepoResult<V2GStats> {
        self.guard(ctx)?;
        let sessions =
            self.select(|s| in_scope(s, scope) && since.map_or(true, |t| s.started_at >= t));

        let mut stats = V2GStats::default();
        let mut power_sum = 0.0;
        let mut power_samples = 0u32;
        for s in &sessions {
            stats.total_sessions += 1;
            match s.status {
                SessionStatus::Active => stats.active_sessions += 1,
                SessionStatus::Completed => stats.completed_sessions += 1,
                SessionStatus::Failed => stats.failed_sessions += 1,
                _ => {}
            }
            stats.total_energy_discharged_kwh += s.discharged_kwh();
            stats.total_compensation += s.compensation.unwrap_or(0.0);
            if let Some(p) = s.actual_power_kw {
                power_sum += p;
                power_samples += 1;
            }
        }
        if power_samples > 0 {
            stats.average_power_kw = Some(power_sum / power_samples as f64);
        }
        Ok(stats)
    }

    async fn sessions_pending_compensation(&self, ctx: &OpContext) -> RepoResult<Vec<V2GSession>> {
        self.guard(ctx)?;
        let paid: Vec<Uuid> = self.tables.read().paid.keys().copied().collect();
        Ok(self.select(|s| {
            s.status == SessionStatus::Completed
                && s.direction == Direction::Discharging
                && s.discharged_kwh() > 0.0
                && !paid.contains(&s.id)
        }))
    }

    async fn mark_compensation_paid(
        &self,
        ctx: &OpContext,
        session_id: Uuid,
        payment_reference: &str,
    ) -> RepoResult<()> {
        self.guard(ctx)?;
        self.tables
            .write()
            .paid
            .insert(session_id, payment_reference.to_string());
        Ok(())
    }

    async fn create_compensation(
        &self,
        ctx: &OpContext,
        record: &V2GCompensationRecord,
    ) -> RepoResult<()> {
        self.guard(ctx)?;
        let mut t = self.tables.write();
        if t.records.values().any(|r| r.session_id == record.session_id) {
            return Err(RepositoryError::Conflict(format!(
                "compensation for session {}",
                record.session_id
            )));
        }
        t.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn update_compensation(
        &self,
        ctx: &OpContext,
        record: &V2GCompensationRecord,
    ) -> RepoResult<()> {
        self.guard(ctx)?;
        let mut t = self.tables.write();
        match t.records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(format!("compensation {}", record.id))),
        }
    }

    async fn get_compensation(
        &self,
        ctx: &OpContext,
        id: Uuid,
    ) -> RepoResult<Option<V2GCompensationRecord>> {
        self.guard(ctx)?;
        Ok(self.tables.read().records.get(&id).cloned())
    }

    async fn compensation_for_session(
        &self,
        ctx: &OpContext,
        session_id: Uuid,
    ) -> RepoResult<Option<V2GCompensationRecord>> {
        self.guard(ctx)?;
        Ok(self
            .tables
            .read()
            .records
            .values()
            .find(|r| r.session_id == session_id)
            .cloned())
    }

    async fn compensations_by_status(
        &self,
        ctx: &OpContext,
        status: CompensationStatus,
    ) -> RepoResult<Vec<V2GCompensationRecord>> {
        self.guard(ctx)?;
        let mut out: Vec<V2GCompensationRecord> = self
            .tables
            .read()
            .records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn compensations_between(
        &self,
        ctx: &OpContext,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RepoResult<Vec<V2GCompensationRecord>> {
        self.guard(ctx)?;
        let mut out: Vec<V2GCompensationRecord> = self
            .tables
            .read()
            .records
            .values()
            .filter(|r| r.created_at >= start && r.created_at < end)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }
}
