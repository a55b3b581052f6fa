//! Owner wallet collaborator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::context::{Interrupted, OpContext};

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("wallet for owner {0} not found")]
    WalletNotFound(Uuid),
    #[error("invalid amount {0}")]
    InvalidAmount(f64),
    #[error("wallet service unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

/// Credits owner balances. `add_funds` must be idempotent per `reference_id`:
/// a repeated reference is accepted without crediting twice.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WalletService: Send + Sync {
    async fn add_funds(
        &self,
        ctx: &OpContext,
        owner_id: Uuid,
        amount: f64,
        reference_id: String,
    ) -> Result<(), WalletError>;
}

#[derive(Debug, Default)]
struct Ledger {
    balances: HashMap<Uuid, f64>,
    /// reference -> (owner, amount)
    applied: HashMap<String, (Uuid, f64)>,
}

#[derive(Debug, Default)]
pub struct InMemoryWallet {
    ledger: Mutex<Ledger>,
    fail_next: AtomicU32,
}

impl InMemoryWallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, owner_id: Uuid) -> f64 {
        self.ledger
            .lock()
            .balances
            .get(&owner_id)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn credit_count(&self) -> usize {
        self.ledger.lock().applied.len()
    }

    /// Make the next `times` credits fail with `Unavailable`.
    pub fn fail_next(&self, times: u32) {
        self.fail_next.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl WalletService for InMemoryWallet {
    async fn add_funds(
        &self,
        ctx: &OpContext,
        owner_id: Uuid,
        amount: f64,
        reference_id: String,
    ) -> Result<(), WalletError> {
        ctx.check()?;
        if !amount.is_finite() || amount <= 0.0 {
            return Err(WalletError::InvalidAmount(amount));
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(WalletError::Unavailable("simulated wallet outage".to_string()));
        }

        let mut ledger = self.ledger.lock();
        if ledger.applied.contains_key(&reference_id) {
            debug!(%owner_id, reference_id, "duplicate wallet credit ignored");
            return Ok(());
        }
        *ledger.balances.entry(owner_id).or_insert(0.0) += amount;
        ledger.applied.insert(reference_id, (owner_id, amount));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn credits_once_per_reference() {
        let wallet = InMemoryWallet::new();
        let ctx = OpContext::background();
        let owner = Uuid::new_v4();

        wallet.add_funds(&ctx, owner, 12.5, "ref-1".into()).await.unwrap();
        wallet.add_funds(&ctx, owner, 12.5, "ref-1".into()).await.unwrap();
        wallet.add_funds(&ctx, owner, 1.0, "ref-2".into()).await.unwrap();

        assert_eq!(wallet.balance(owner), 13.5);
        assert_eq!(wallet.credit_count(), 2);
    }

    #[tokio::test]
    async fn injected_outage_is_consumed() {
        let wallet = InMemoryWallet::new();
        let ctx = OpContext::background();
        let owner = Uuid::new_v4();
        wallet.fail_next(1);

        let err = wallet.add_funds(&ctx, owner, 5.0, "r".into()).await.unwrap_err();
        assert!(matches!(err, WalletError::Unavailable(_)));
        wallet.add_funds(&ctx, owner, 5.0, "r".into()).await.unwrap();
        assert_eq!(wallet.balance(owner), 5.0);
    }

    #[tokio::test]
    async fn rejects_non_positive_amounts() {
        let wallet = InMemoryWallet::new();
        let err = wallet
            .add_funds(&OpContext::background(), Uuid::new_v4(), 0.0, "r".into())
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InvalidAmount(_)));
    }
}
