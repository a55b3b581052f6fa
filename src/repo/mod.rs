//! Persistence contract for sessions, preferences and compensation records.
//!
//! Storage engines implement [`V2gRepository`]; [`InMemoryV2gRepository`] is
//! the single-node implementation used by the binary and the tests.

pub mod memory;

pub use memory::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::context::{Interrupted, OpContext};
use crate::domain::{
    CompensationStatus, SessionStatus, StatsScope, V2GCompensationRecord, V2GPreferences,
    V2GSession, V2GStats,
};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

pub type RepoResult<T> = Result<T, RepositoryError>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait V2gRepository: Send + Sync {
    async fn create_session(&self, ctx: &OpContext, session: &V2GSession) -> RepoResult<()>;
    async fn update_session(&self, ctx: &OpContext, session: &V2GSession) -> RepoResult<()>;
    async fn get_session(&self, ctx: &OpContext, id: Uuid) -> RepoResult<Option<V2GSession>>;
    async fn sessions_by_device(
        &self,
        ctx: &OpContext,
        device_id: &str,
    ) -> RepoResult<Vec<V2GSession>>;
    async fn sessions_by_owner(&self, ctx: &OpContext, owner_id: Uuid)
        -> RepoResult<Vec<V2GSession>>;
    async fn sessions_by_status(
        &self,
        ctx: &OpContext,
        status: SessionStatus,
    ) -> RepoResult<Vec<V2GSession>>;

    async fn get_preferences(
        &self,
        ctx: &OpContext,
        owner_id: Uuid,
    ) -> RepoResult<Option<V2GPreferences>>;
    async fn save_preferences(&self, ctx: &OpContext, prefs: &V2GPreferences) -> RepoResult<()>;

    /// Aggregate over sessions in scope started at or after `since`.
    async fn stats(
        &self,
        ctx: &OpContext,
        scope: &StatsScope,
        since: Option<DateTime<Utc>>,
    ) -> RepoResult<V2GStats>;

    /// Completed discharge sessions whose compensation has not been paid.
    async fn sessions_pending_compensation(&self, ctx: &OpContext) -> RepoResult<Vec<V2GSession>>;
    async fn mark_compensation_paid(
        &self,
        ctx: &OpContext,
        session_id: Uuid,
        payment_reference: &str,
    ) -> RepoResult<()>;

    /// Fails with `Conflict` if the session already has a record.
    async fn create_compensation(
        &self,
        ctx: &OpContext,
        record: &V2GCompensationRecord,
    ) -> RepoResult<()>;
    async fn update_compensation(
        &self,
        ctx: &OpContext,
        record: &V2GCompensationRecord,
    ) -> RepoResult<()>;
    async fn get_compensation(
        &self,
        ctx: &OpContext,
        id: Uuid,
    ) -> RepoResult<Option<V2GCompensationRecord>>;
    async fn compensation_for_session(
        &self,
        ctx: &OpContext,
        session_id: Uuid,
    ) -> RepoResult<Option<V2GCompensationRecord>>;
    async fn compensations_by_status(
        &self,
        ctx: &OpContext,
        status: CompensationStatus,
    ) -> RepoResult<Vec<V2GCompensationRecord>>;
    /// Records created in `[start, end)`.
    async fn compensations_between(
        &self,
        ctx: &OpContext,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RepoResult<Vec<V2GCompensationRecord>>;
}
