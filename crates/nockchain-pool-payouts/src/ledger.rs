//! Per-user credited-but-unpaid balances.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::database::{Amount, UserId};
use crate::error::{PayoutError, Result};

#[async_trait]
pub trait BalanceLedger: Send + Sync {
    /// Zero for users never credited.
    async fn get_balance(&self, user_id: UserId) -> Result<Amount>;

    /// Returns the new balance.
    async fn add_to_balance(&self, user_id: UserId, amount: Amount) -> Result<Amount>;

    /// Fails with `InsufficientBalance`, leaving the balance untouched, when `amount` exceeds it.
    async fn deduct_from_balance(&self, user_id: UserId, amount: Amount) -> Result<Amount>;

    /// Gives back an amount previously deducted for a payout that did not go through.
    async fn return_to_balance(&self, user_id: UserId, amount: Amount) -> Result<Amount> {
        self.add_to_balance(user_id, amount).await
    }
}

/// Each user's balance sits behind its own mutex; the outer map is only write-locked to
/// insert a user the first time they are credited.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    balances: RwLock<HashMap<UserId, Arc<Mutex<Amount>>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, user_id: UserId) -> Arc<Mutex<Amount>> {
        if let Some(entry) = self.balances.read().await.get(&user_id) {
            return entry.clone();
        }
        self.balances.write().await.entry(user_id).or_default().clone()
    }

    /// Sum of every balance; used for reconciliation.
    pub async fn total(&self) -> Amount {
        let entries: Vec<_> = self.balances.read().await.values().cloned().collect();
        let mut total: Amount = 0;
        for entry in entries {
            total = total.saturating_add(*entry.lock().await);
        }
        total
    }
}

#[async_trait]
impl BalanceLedger for InMemoryLedger {
    async fn get_balance(&self, user_id: UserId) -> Result<Amount> {
        let entry = self.balances.read().await.get(&user_id).cloned();
        match entry {
            Some(entry) => Ok(*entry.lock().await),
            None => Ok(0),
        }
    }

    async fn add_to_balance(&self, user_id: UserId, amount: Amount) -> Result<Amount> {
        let entry = self.entry(user_id).await;
        let mut balance = entry.lock().await;
        *balance = balance
            .checked_add(amount)
            .ok_or(PayoutError::BalanceOverflow(user_id))?;
        debug!(user_id, amount, balance = *balance, "credited balance");
        Ok(*balance)
    }

    async fn deduct_from_balance(&self, user_id: UserId, amount: Amount) -> Result<Amount> {
        let entry = self.entry(user_id).await;
        let mut balance = entry.lock().await;
        if amount > *balance {
            return Err(PayoutError::InsufficientBalance {
                user_id,
                requested: amount,
                available: *balance,
            });
        }
        *balance -= amount;
        debug!(user_id, amount, balance = *balance, "debited balance");
        Ok(*balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_user_has_zero_balance() {
        let ledger = InMemoryLedger::new();
        assert_eq!(ledger.get_balance(77).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn overdraft_is_rejected_without_change() {
        let ledger = InMemoryLedger::new();
        ledger.add_to_balance(1, 500).await.unwrap();

        let err = ledger.deduct_from_balance(1, 501).await.unwrap_err();
        assert!(matches!(
            err,
            PayoutError::InsufficientBalance { user_id: 1, requested: 501, available: 500 }
        ));
        assert_eq!(ledger.get_balance(1).await.unwrap(), 500);
    }

    #[tokio::test]
    async fn add_then_deduct_restores_balance() {
        let ledger = InMemoryLedger::new();
        ledger.add_to_balance(1, 1_000).await.unwrap();
        ledger.add_to_balance(1, 250).await.unwrap();
        ledger.deduct_from_balance(1, 250).await.unwrap();
        assert_eq!(ledger.get_balance(1).await.unwrap(), 1_000);

        ledger.deduct_from_balance(1, 400).await.unwrap();
        ledger.return_to_balance(1, 400).await.unwrap();
        assert_eq!(ledger.get_balance(1).await.unwrap(), 1_000);
    }

    #[tokio::test]
    async fn overflow_is_rejected() {
        let ledger = InMemoryLedger::new();
        ledger.add_to_balance(1, u64::MAX).await.unwrap();
        assert!(matches!(ledger.add_to_balance(1, 1).await, Err(PayoutError::BalanceOverflow(1))));
        assert_eq!(ledger.get_balance(1).await.unwrap(), u64::MAX);
    }

    #[tokio::test]
    async fn concurrent_credits_are_not_lost() {
        let ledger = Arc::new(InMemoryLedger::new());
        let mut handles = Vec::new();
        for i in 0..50u64 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.add_to_balance(i % 5, 10).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(ledger.total().await, 500);
        assert_eq!(ledger.get_balance(3).await.unwrap(), 100);
    }
}
