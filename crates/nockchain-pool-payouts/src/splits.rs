//! Payout destinations: a user may spread each payout across several wallets by percentage.
//!
//! Active wallet percentages always sum to exactly 100% whenever any wallet is active. Every
//! lifecycle operation that would break that (adding, re-weighting, deactivating, reactivating
//! or removing a wallet) rebalances the other active wallets proportionally first, then
//! validates, then persists. Nothing invalid is ever saved.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::allocation::largest_remainder;
use crate::database::{Amount, PayoutSplit, Percentage, UserId, UserWallet};
use crate::error::{PayoutError, Result};
use crate::locks::UserLocks;

#[async_trait]
pub trait WalletRepository: Send + Sync {
    async fn load_wallets(&self, user_id: UserId) -> Result<Vec<UserWallet>>;

    async fn save_wallets(&self, user_id: UserId, wallets: &[UserWallet]) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryWalletRepository {
    wallets: Arc<RwLock<HashMap<UserId, Vec<UserWallet>>>>,
}

impl InMemoryWalletRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WalletRepository for InMemoryWalletRepository {
    async fn load_wallets(&self, user_id: UserId) -> Result<Vec<UserWallet>> {
        Ok(self.wallets.read().await.get(&user_id).cloned().unwrap_or_default())
    }

    async fn save_wallets(&self, user_id: UserId, wallets: &[UserWallet]) -> Result<()> {
        self.wallets.write().await.insert(user_id, wallets.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSummary {
    pub total_wallets: usize,
    pub active_wallets: usize,
    pub active_percentage: Percentage,
    pub remaining_percentage: Percentage,
    pub has_primary: bool,
}

/// Field changes for [`WalletSplitResolver::update_wallet`]; `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct WalletUpdate {
    pub address: Option<String>,
    pub label: Option<String>,
    pub percentage: Option<Percentage>,
    pub is_primary: Option<bool>,
}

pub fn validate_splits(wallets: &[UserWallet]) -> Result<()> {
    let mut active_sum: u64 = 0;
    let mut any_active = false;
    let mut primaries = 0;

    for wallet in wallets {
        if wallet.percentage == Percentage::ZERO || wallet.percentage > Percentage::FULL {
            return Err(PayoutError::InvalidSplit(format!(
                "wallet {} has percentage {}, must be above 0% and at most 100%",
                wallet.id, wallet.percentage
            )));
        }
        if wallet.address.trim().is_empty() {
            return Err(PayoutError::InvalidSplit(format!("wallet {} has no address", wallet.id)));
        }
        if wallet.is_primary {
            primaries += 1;
        }
        if wallet.is_active {
            any_active = true;
            active_sum += wallet.percentage.basis_points() as u64;
        }
    }

    if primaries > 1 {
        return Err(PayoutError::InvalidSplit(format!("{} primary wallets, at most one allowed", primaries)));
    }
    if any_active && active_sum != Percentage::BASIS_POINTS as u64 {
        return Err(PayoutError::InvalidSplit(format!(
            "active wallets sum to {}.{:02}%, expected 100.00%",
            active_sum / 100,
            active_sum % 100
        )));
    }
    Ok(())
}

/// Splits `total` across the active wallets by percentage. The parts always add up to `total`;
/// wallets whose part rounds to zero are left out.
pub fn calculate_split_payouts(wallets: &[UserWallet], total: Amount) -> Result<Vec<PayoutSplit>> {
    let active: Vec<UserWallet> = wallets.iter().filter(|w| w.is_active).cloned().collect();
    if active.is_empty() {
        return Err(PayoutError::InvalidSplit("no active wallets".into()));
    }
    validate_splits(&active)?;

    let weights: Vec<(usize, u128)> = active
        .iter()
        .enumerate()
        .map(|(i, w)| (i, w.percentage.basis_points() as u128))
        .collect();

    Ok(largest_remainder(total, &weights)
        .into_iter()
        .filter(|(_, amount)| *amount > 0)
        .map(|(i, amount)| PayoutSplit {
            wallet_id: active[i].id,
            address: active[i].address.clone(),
            percentage: active[i].percentage,
            amount,
        })
        .collect())
}

// Scales the wallets at `indices` so their percentages keep their current proportions but sum
// to `target` basis points.
fn rebalance(wallets: &mut [UserWallet], indices: &[usize], target: u32) {
    if indices.is_empty() {
        return;
    }
    let mut weights: Vec<(usize, u128)> = indices
        .iter()
        .map(|&i| (i, wallets[i].percentage.basis_points() as u128))
        .collect();
    if weights.iter().all(|(_, w)| *w == 0) {
        weights.iter_mut().for_each(|(_, w)| *w = 1);
    }

    for (i, bp) in largest_remainder(target as u64, &weights) {
        wallets[i].percentage = Percentage::from_basis_points(bp as u32);
    }
}

fn active_indices(wallets: &[UserWallet], except: Option<usize>) -> Vec<usize> {
    wallets
        .iter()
        .enumerate()
        .filter(|(i, w)| w.is_active && Some(*i) != except)
        .map(|(i, _)| i)
        .collect()
}

fn position(wallets: &[UserWallet], wallet_id: u64) -> Result<usize> {
    wallets
        .iter()
        .position(|w| w.id == wallet_id)
        .ok_or(PayoutError::WalletNotFound(wallet_id))
}

fn remaining_after(percentage: Percentage) -> Result<u32> {
    Percentage::BASIS_POINTS
        .checked_sub(percentage.basis_points())
        .ok_or_else(|| PayoutError::InvalidSplit(format!("percentage {} exceeds 100%", percentage)))
}

pub struct WalletSplitResolver {
    repository: Arc<dyn WalletRepository>,
    locks: UserLocks,
}

impl WalletSplitResolver {
    pub fn new(repository: Arc<dyn WalletRepository>) -> Self {
        Self { repository, locks: UserLocks::new() }
    }

    pub async fn get_wallets(&self, user_id: UserId) -> Result<Vec<UserWallet>> {
        self.repository.load_wallets(user_id).await
    }

    pub async fn get_active_wallets(&self, user_id: UserId) -> Result<Vec<UserWallet>> {
        let mut wallets = self.repository.load_wallets(user_id).await?;
        wallets.retain(|w| w.is_active);
        Ok(wallets)
    }

    /// Splits `total` across the user's active wallets.
    pub async fn split_payout(&self, user_id: UserId, total: Amount) -> Result<Vec<PayoutSplit>> {
        let wallets = self.repository.load_wallets(user_id).await?;
        calculate_split_payouts(&wallets, total)
    }

    /// Replaces the user's whole wallet list. Ids are reassigned in order.
    pub async fn set_wallets(&self, user_id: UserId, mut wallets: Vec<UserWallet>) -> Result<Vec<UserWallet>> {
        let _guard = self.locks.lock(user_id).await;
        let now = Utc::now();
        for (i, wallet) in wallets.iter_mut().enumerate() {
            wallet.id = i as u64 + 1;
            wallet.user_id = user_id;
            wallet.updated_at = now;
        }
        validate_splits(&wallets)?;
        self.repository.save_wallets(user_id, &wallets).await?;
        info!(user_id, wallets = wallets.len(), "replaced payout wallets");
        Ok(wallets)
    }

    /// Adds a wallet at its requested percentage, shrinking the other active wallets to make room.
    pub async fn add_wallet(&self, user_id: UserId, mut wallet: UserWallet) -> Result<UserWallet> {
        let _guard = self.locks.lock(user_id).await;
        let mut wallets = self.repository.load_wallets(user_id).await?;

        let now = Utc::now();
        wallet.id = wallets.iter().map(|w| w.id).max().unwrap_or(0) + 1;
        wallet.user_id = user_id;
        wallet.created_at = now;
        wallet.updated_at = now;

        if wallet.is_active {
            let others = active_indices(&wallets, None);
            if others.is_empty() {
                // The only active wallet takes everything
                wallet.percentage = Percentage::FULL;
            } else {
                let remaining = remaining_after(wallet.percentage)?;
                rebalance(&mut wallets, &others, remaining);
            }
        }
        if wallet.is_primary {
            wallets.iter_mut().for_each(|w| w.is_primary = false);
        }

        wallets.push(wallet.clone());
        validate_splits(&wallets)?;
        self.repository.save_wallets(user_id, &wallets).await?;
        info!(user_id, wallet_id = wallet.id, percentage = %wallet.percentage, "added payout wallet");
        Ok(wallet)
    }

    pub async fn update_wallet(&self, user_id: UserId, wallet_id: u64, update: WalletUpdate) -> Result<UserWallet> {
        let _guard = self.locks.lock(user_id).await;
        let mut wallets = self.repository.load_wallets(user_id).await?;
        let idx = position(&wallets, wallet_id)?;

        if let Some(address) = update.address {
            wallets[idx].address = address;
        }
        if let Some(label) = update.label {
            wallets[idx].label = label;
        }
        if let Some(is_primary) = update.is_primary {
            if is_primary {
                wallets.iter_mut().for_each(|w| w.is_primary = false);
            }
            wallets[idx].is_primary = is_primary;
        }
        if let Some(percentage) = update.percentage {
            wallets[idx].percentage = percentage;
            if wallets[idx].is_active {
                let others = active_indices(&wallets, Some(idx));
                if !others.is_empty() {
                    let remaining = remaining_after(percentage)?;
                    rebalance(&mut wallets, &others, remaining);
                }
            }
        }
        wallets[idx].updated_at = Utc::now();

        validate_splits(&wallets)?;
        self.repository.save_wallets(user_id, &wallets).await?;
        Ok(wallets[idx].clone())
    }

    /// Removes a wallet; its share goes to the remaining active wallets in proportion.
    pub async fn remove_wallet(&self, user_id: UserId, wallet_id: u64) -> Result<()> {
        let _guard = self.locks.lock(user_id).await;
        let mut wallets = self.repository.load_wallets(user_id).await?;
        let idx = position(&wallets, wallet_id)?;

        let removed = wallets.remove(idx);
        if removed.is_active {
            let others = active_indices(&wallets, None);
            rebalance(&mut wallets, &others, Percentage::BASIS_POINTS);
        }

        validate_splits(&wallets)?;
        self.repository.save_wallets(user_id, &wallets).await?;
        info!(user_id, wallet_id, "removed payout wallet");
        Ok(())
    }

    /// Deactivating hands the wallet's share to the other active wallets. Reactivating gives it
    /// back its stored share (everything, if it is the only active wallet) and scales the others
    /// down to fit. When that would squeeze any other wallet to zero, all active wallets are
    /// renormalized by their stored percentages instead.
    pub async fn set_wallet_active(&self, user_id: UserId, wallet_id: u64, active: bool) -> Result<UserWallet> {
        let _guard = self.locks.lock(user_id).await;
        let mut wallets = self.repository.load_wallets(user_id).await?;
        let idx = position(&wallets, wallet_id)?;

        if wallets[idx].is_active != active {
            wallets[idx].is_active = active;
            let others = active_indices(&wallets, Some(idx));
            if active {
                if others.is_empty() {
                    wallets[idx].percentage = Percentage::FULL;
                } else {
                    let remaining = remaining_after(wallets[idx].percentage)?;
                    let mut scaled = wallets.clone();
                    rebalance(&mut scaled, &others, remaining);
                    if others.iter().all(|&i| scaled[i].percentage > Percentage::ZERO) {
                        wallets = scaled;
                    } else {
                        // No room left for the others: every active wallet shares by its stored weight
                        let all = active_indices(&wallets, None);
                        rebalance(&mut wallets, &all, Percentage::BASIS_POINTS);
                    }
                }
            } else {
                rebalance(&mut wallets, &others, Percentage::BASIS_POINTS);
            }
            wallets[idx].updated_at = Utc::now();
        }

        validate_splits(&wallets)?;
        self.repository.save_wallets(user_id, &wallets).await?;
        info!(user_id, wallet_id, active, "changed wallet state");
        Ok(wallets[idx].clone())
    }

    pub async fn summary(&self, user_id: UserId) -> Result<WalletSummary> {
        let wallets = self.repository.load_wallets(user_id).await?;
        let active: u32 = wallets
            .iter()
            .filter(|w| w.is_active)
            .map(|w| w.percentage.basis_points())
            .sum();
        let active = active.min(Percentage::BASIS_POINTS);

        Ok(WalletSummary {
            total_wallets: wallets.len(),
            active_wallets: wallets.iter().filter(|w| w.is_active).count(),
            active_percentage: Percentage::from_basis_points(active),
            remaining_percentage: Percentage::from_basis_points(Percentage::BASIS_POINTS - active),
            has_primary: wallets.iter().any(|w| w.is_primary),
        })
    }
}
