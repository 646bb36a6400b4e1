//! PPLNS (Pay Per Last N Shares).
//!
//! N is measured in total difficulty, not share count. The share straddling the window edge
//! only contributes the part of its difficulty that still fits.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::{distribute, eligible_newest_first, total_reward, validate_fee, Payout, PayoutMode};
use crate::database::{Amount, Percentage, Share, UserId};
use crate::error::{PayoutError, Result};

#[derive(Debug, Clone)]
pub struct PplnsCalculator {
    window_size: u64,
    fee: Percentage,
}

impl PplnsCalculator {
    pub fn new(window_size: u64, fee: Percentage) -> Result<Self> {
        if window_size == 0 {
            return Err(PayoutError::Configuration("PPLNS window size must be positive".into()));
        }
        validate_fee(fee)?;
        Ok(Self { window_size, fee })
    }

    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    pub fn fee(&self) -> Percentage {
        self.fee
    }

    pub fn calculate_payouts(
        &self,
        shares: &[Share],
        block_reward: Amount,
        carry: Amount,
        block_time: DateTime<Utc>,
    ) -> Result<Vec<Payout>> {
        let total = total_reward(block_reward, carry)?;
        if total == 0 || shares.is_empty() {
            return Ok(Vec::new());
        }

        let mut weights: BTreeMap<UserId, u128> = BTreeMap::new();
        for (user_id, difficulty) in self.apply_window(shares, block_time) {
            *weights.entry(user_id).or_insert(0) += difficulty as u128;
        }

        Ok(distribute(&weights, total, self.fee, PayoutMode::Pplns, block_time))
    }

    /// Walks back from the block collecting `(user, effective difficulty)` until the window is full.
    pub(crate) fn apply_window(&self, shares: &[Share], block_time: DateTime<Utc>) -> Vec<(UserId, u64)> {
        window_by_difficulty(shares, block_time, self.window_size)
    }
}

pub(crate) fn window_by_difficulty(
    shares: &[Share],
    block_time: DateTime<Utc>,
    window_size: u64,
) -> Vec<(UserId, u64)> {
    let mut window = Vec::new();
    let mut accumulated: u64 = 0;

    for share in eligible_newest_first(shares, block_time) {
        let remaining = window_size - accumulated;
        if remaining == 0 {
            break;
        }
        // Partial share at the window edge
        let effective = share.difficulty.min(remaining);
        if effective == 0 {
            continue;
        }
        window.push((share.user_id, effective));
        accumulated += effective;
    }

    window
}
