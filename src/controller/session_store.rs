//! Live session table.
//!
//! The store is the single source of truth for "is this connector
//! discharging". A clustered deployment swaps [`InMemorySessionStore`] for a
//! shared backend without touching the session manager.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::domain::{SessionStatus, V2GSession};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Claim the session's (device, connector) slot. `false` if it is taken.
    async fn reserve(&self, session: V2GSession) -> bool;

    /// Overwrite a held session. `false` if it is no longer held.
    async fn replace(&self, session: V2GSession) -> bool;

    /// Drop a reservation that never became active.
    async fn release(&self, session_id: Uuid) -> Option<V2GSession>;

    /// Remove an `active` session; pending reservations are left alone.
    async fn take_active(&self, session_id: Uuid) -> Option<V2GSession>;

    async fn get(&self, session_id: Uuid) -> Option<V2GSession>;

    async fn active_for_device(&self, device_id: &str) -> Option<V2GSession>;

    /// Any held session on the device, pending or active.
    async fn is_device_busy(&self, device_id: &str) -> bool;

    async fn active_sessions(&self) -> Vec<V2GSession>;
}

type Slot = (String, u32);

#[derive(Debug, Default)]
struct Table {
    sessions: HashMap<Uuid, V2GSession>,
    slots: HashMap<Slot, Uuid>,
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    table: RwLock<Table>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn slot_of(session: &V2GSession) -> Slot {
    (session.device_id.clone(), session.connector_id)
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn reserve(&self, session: V2GSession) -> bool {
        let mut t = self.table.write();
        let slot = slot_of(&session);
        if t.slots.contains_key(&slot) {
            return false;
        }
        t.slots.insert(slot, session.id);
        t.sessions.insert(session.id, session);
        true
    }

    async fn replace(&self, session: V2GSession) -> bool {
        let mut t = self.table.write();
        match t.sessions.get_mut(&session.id) {
            Some(held) => {
                *held = session;
                true
            }
            None => false,
        }
    }

    async fn release(&self, session_id: Uuid) -> Option<V2GSession> {
        let mut t = self.table.write();
        let session = t.sessions.remove(&session_id)?;
        t.slots.remove(&slot_of(&session));
        Some(session)
    }

    async fn take_active(&self, session_id: Uuid) -> Option<V2GSession> {
        let mut t = self.table.write();
        if t.sessions.get(&session_id)?.status != SessionStatus::Active {
            return None;
        }
        let session = t.sessions.remove(&session_id)?;
        t.slots.remove(&slot_of(&session));
        Some(session)
    }

    async fn get(&self, session_id: Uuid) -> Option<V2GSession> {
        self.table.read().sessions.get(&session_id).cloned()
    }

    async fn active_for_device(&self, device_id: &str) -> Option<V2GSession> {
        self.table
            .read()
            .sessions
            .values()
            .find(|s| s.device_id == device_id && s.status == SessionStatus::Active)
            .cloned()
    }

    async fn is_device_busy(&self, device_id: &str) -> bool {
        self.table.read().slots.keys().any(|(d, _)| d == device_id)
    }

    async fn active_sessions(&self) -> Vec<V2GSession> {
        self.table
            .read()
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .cloned()
            .collect()
    }
}
