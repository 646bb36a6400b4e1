//! Payouts that have been decided but not yet sent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::database::{Amount, PayoutStatus, PendingPayout, UserId};
use crate::error::{PayoutError, Result};
use crate::ledger::BalanceLedger;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub processed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub pending_amount: Amount,
    pub total_paid: Amount,
}

impl QueueStats {
    pub(crate) fn record(&mut self, payout: &PendingPayout) {
        match payout.status {
            PayoutStatus::Pending => {
                self.pending += 1;
                self.pending_amount = self.pending_amount.saturating_add(payout.amount);
            }
            PayoutStatus::Processing => self.processing += 1,
            PayoutStatus::Processed => {
                self.processed += 1;
                self.total_paid = self.total_paid.saturating_add(payout.amount);
            }
            PayoutStatus::Failed => self.failed += 1,
            PayoutStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// How far back [`PayoutQueue::statistics`] looks through a user's history.
pub const STATISTICS_HISTORY_LIMIT: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutStatistics {
    pub user_id: UserId,
    pub total_payout: Amount,
    pub payout_count: u64,
    pub average_payout: Amount,
    pub last_payout: Option<DateTime<Utc>>,
    pub since: DateTime<Utc>,
}

#[async_trait]
pub trait PayoutQueue: Send + Sync {
    /// Assigns an id when the payout has none, resets it to pending and stamps `created_at`.
    async fn enqueue(&self, payout: PendingPayout) -> Result<PendingPayout> {
        let mut queued = self.enqueue_batch(vec![payout]).await?;
        queued
            .pop()
            .ok_or_else(|| PayoutError::Queue("enqueue returned no payout".into()))
    }

    /// Either every payout is queued or none is.
    async fn enqueue_batch(&self, payouts: Vec<PendingPayout>) -> Result<Vec<PendingPayout>>;

    async fn get(&self, id: Uuid) -> Result<PendingPayout>;

    /// Pending payouts only, oldest first.
    async fn get_pending(&self, limit: usize) -> Result<Vec<PendingPayout>>;

    async fn mark_processing(&self, id: Uuid) -> Result<PendingPayout>;

    async fn mark_processed(&self, id: Uuid, tx_hash: &str) -> Result<PendingPayout>;

    /// Moves the payout to failed and returns its amount to the user's balance.
    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<PendingPayout>;

    /// Withdraws a payout that has not started yet and returns its amount to the balance.
    async fn cancel(&self, id: Uuid) -> Result<PendingPayout>;

    /// Cancels a pending payout whose amount was never taken from the balance. Nothing is
    /// returned to the ledger.
    async fn revoke(&self, id: Uuid) -> Result<PendingPayout>;

    /// A user's payouts in any state, newest first.
    async fn history(&self, user_id: UserId, limit: usize) -> Result<Vec<PendingPayout>>;

    async fn stats(&self) -> Result<QueueStats>;

    /// Totals over the user's payouts created after `since`. Failed and cancelled payouts are
    /// left out; their amounts went back to the balance.
    async fn statistics(&self, user_id: UserId, since: DateTime<Utc>) -> Result<PayoutStatistics> {
        let history = self.history(user_id, STATISTICS_HISTORY_LIMIT).await?;
        let mut stats = PayoutStatistics {
            user_id,
            total_payout: 0,
            payout_count: 0,
            average_payout: 0,
            last_payout: None,
            since,
        };

        for payout in history
            .iter()
            .filter(|p| p.created_at > since)
            .filter(|p| !matches!(p.status, PayoutStatus::Failed | PayoutStatus::Cancelled))
        {
            stats.total_payout = stats.total_payout.saturating_add(payout.amount);
            stats.payout_count += 1;
            if stats.last_payout.map_or(true, |last| payout.created_at > last) {
                stats.last_payout = Some(payout.created_at);
            }
        }
        if stats.payout_count > 0 {
            stats.average_payout = stats.total_payout / stats.payout_count;
        }
        Ok(stats)
    }
}

/// Normalizes a payout for insertion and rejects ones that could never be sent.
pub(crate) fn prepare_for_enqueue(mut payout: PendingPayout) -> Result<PendingPayout> {
    if payout.amount == 0 {
        return Err(PayoutError::Queue(format!("payout for user {} has zero amount", payout.user_id)));
    }
    if payout.address.trim().is_empty() {
        return Err(PayoutError::Queue(format!("payout for user {} has no address", payout.user_id)));
    }
    if payout.id.is_nil() {
        payout.id = Uuid::new_v4();
    }
    payout.status = PayoutStatus::Pending;
    payout.created_at = Utc::now();
    payout.processed_at = None;
    payout.tx_hash = None;
    payout.error_message = None;
    Ok(payout)
}

/// Checks and applies a status change, stamping `processed_at` on terminal states.
pub(crate) fn transition(payout: &mut PendingPayout, to: PayoutStatus) -> Result<()> {
    if !payout.status.can_transition_to(to) {
        return Err(PayoutError::InvalidTransition { id: payout.id, from: payout.status, to });
    }
    payout.status = to;
    if to.is_terminal() {
        payout.processed_at = Some(Utc::now());
    }
    Ok(())
}

#[derive(Debug, Default)]
struct QueueState {
    payouts: HashMap<Uuid, PendingPayout>,
    // Insertion order; doubles as oldest-first order
    order: Vec<Uuid>,
}

pub struct InMemoryPayoutQueue {
    state: Mutex<QueueState>,
    ledger: Arc<dyn BalanceLedger>,
}

impl InMemoryPayoutQueue {
    pub fn new(ledger: Arc<dyn BalanceLedger>) -> Self {
        Self { state: Mutex::new(QueueState::default()), ledger }
    }

    async fn update(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut PendingPayout) -> Result<()> + Send,
    ) -> Result<PendingPayout> {
        let mut state = self.state.lock().await;
        let payout = state.payouts.get_mut(&id).ok_or(PayoutError::PayoutNotFound(id))?;
        apply(payout)?;
        Ok(payout.clone())
    }

    // The new status is committed only after the refund lands, so a failed refund leaves the
    // payout where it was and the call can be retried.
    async fn close(&self, id: Uuid, to: PayoutStatus, reason: Option<String>, refund: bool) -> Result<PendingPayout> {
        let mut state = self.state.lock().await;
        let mut payout = state.payouts.get(&id).cloned().ok_or(PayoutError::PayoutNotFound(id))?;
        transition(&mut payout, to)?;
        if reason.is_some() {
            payout.error_message = reason;
        }

        if refund {
            self.ledger.return_to_balance(payout.user_id, payout.amount).await?;
            info!(
                payout_id = %payout.id,
                user_id = payout.user_id,
                amount = payout.amount,
                status = %payout.status,
                "returned payout amount to balance"
            );
        }
        state.payouts.insert(id, payout.clone());
        Ok(payout)
    }
}

#[async_trait]
impl PayoutQueue for InMemoryPayoutQueue {
    async fn enqueue_batch(&self, payouts: Vec<PendingPayout>) -> Result<Vec<PendingPayout>> {
        let prepared = payouts
            .into_iter()
            .map(prepare_for_enqueue)
            .collect::<Result<Vec<_>>>()?;

        let mut state = self.state.lock().await;
        for payout in &prepared {
            if state.payouts.contains_key(&payout.id) {
                return Err(PayoutError::Queue(format!("payout {} already queued", payout.id)));
            }
        }
        for payout in &prepared {
            state.order.push(payout.id);
            state.payouts.insert(payout.id, payout.clone());
        }
        Ok(prepared)
    }

    async fn get(&self, id: Uuid) -> Result<PendingPayout> {
        self.state
            .lock()
            .await
            .payouts
            .get(&id)
            .cloned()
            .ok_or(PayoutError::PayoutNotFound(id))
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<PendingPayout>> {
        let state = self.state.lock().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.payouts.get(id))
            .filter(|p| p.status == PayoutStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_processing(&self, id: Uuid) -> Result<PendingPayout> {
        self.update(id, |p| transition(p, PayoutStatus::Processing)).await
    }

    async fn mark_processed(&self, id: Uuid, tx_hash: &str) -> Result<PendingPayout> {
        let tx_hash = tx_hash.to_string();
        let payout = self
            .update(id, move |p| {
                transition(p, PayoutStatus::Processed)?;
                p.tx_hash = Some(tx_hash);
                Ok(())
            })
            .await?;
        info!(payout_id = %id, user_id = payout.user_id, amount = payout.amount, "payout processed");
        Ok(payout)
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<PendingPayout> {
        let payout = self.close(id, PayoutStatus::Failed, Some(reason.to_string()), true).await?;
        warn!(payout_id = %id, user_id = payout.user_id, "payout failed: {}", reason);
        Ok(payout)
    }

    async fn cancel(&self, id: Uuid) -> Result<PendingPayout> {
        self.close(id, PayoutStatus::Cancelled, None, true).await
    }

    async fn revoke(&self, id: Uuid) -> Result<PendingPayout> {
        self.close(id, PayoutStatus::Cancelled, Some("revoked before debit".into()), false).await
    }

    async fn history(&self, user_id: UserId, limit: usize) -> Result<Vec<PendingPayout>> {
        let state = self.state.lock().await;
        Ok(state
            .order
            .iter()
            .rev()
            .filter_map(|id| state.payouts.get(id))
            .filter(|p| p.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for payout in state.payouts.values() {
            stats.record(payout);
        }
        Ok(stats)
    }
}
