//! PPS (Pay Per Share).
//!
//! Every share is worth a fixed rate per unit of difficulty:
//!
//! ```text
//! rate = expected_block_reward × (1 − fee) / network_difficulty
//! ```
//!
//! The rate comes from configuration, never from the block being processed, so the pool carries
//! the variance. The actual block reward only matters in that a zero-reward block pays nothing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::{eligible_newest_first, total_reward, validate_fee, Payout, PayoutMode};
use crate::database::{Amount, Percentage, Share, UserId};
use crate::error::{PayoutError, Result};

#[derive(Debug, Clone)]
pub struct PpsCalculator {
    fee: Percentage,
    network_difficulty: u64,
    expected_block_reward: Amount,
}

impl PpsCalculator {
    pub fn new(fee: Percentage, network_difficulty: u64, expected_block_reward: Amount) -> Result<Self> {
        validate_fee(fee)?;
        if network_difficulty == 0 {
            return Err(PayoutError::Configuration("network difficulty must be positive".into()));
        }
        Ok(Self { fee, network_difficulty, expected_block_reward })
    }

    pub fn fee(&self) -> Percentage {
        self.fee
    }

    /// Value of `difficulty` worth of shares, floored to whole units.
    pub fn share_value(&self, difficulty: u128) -> Result<Amount> {
        let keep = (Percentage::BASIS_POINTS - self.fee.basis_points()) as u128;
        let numerator = difficulty
            .checked_mul(self.expected_block_reward as u128)
            .and_then(|v| v.checked_mul(keep))
            .ok_or_else(|| PayoutError::Calculation("PPS share value overflows".into()))?;
        let denominator = self.network_difficulty as u128 * Percentage::BASIS_POINTS as u128;

        Amount::try_from(numerator / denominator)
            .map_err(|_| PayoutError::Calculation("PPS payout exceeds amount range".into()))
    }

    pub fn calculate_payouts(
        &self,
        shares: &[Share],
        block_reward: Amount,
        carry: Amount,
        block_time: DateTime<Utc>,
    ) -> Result<Vec<Payout>> {
        if total_reward(block_reward, carry)? == 0 || shares.is_empty() {
            return Ok(Vec::new());
        }

        let mut difficulty: BTreeMap<UserId, u128> = BTreeMap::new();
        for share in eligible_newest_first(shares, block_time) {
            *difficulty.entry(share.user_id).or_insert(0) += share.difficulty as u128;
        }

        let mut payouts = Vec::with_capacity(difficulty.len());
        for (user_id, diff) in difficulty {
            let amount = self.share_value(diff)?;
            if amount > 0 {
                payouts.push(Payout { user_id, amount, mode: PayoutMode::Pps, timestamp: block_time });
            }
        }
        Ok(payouts)
    }
}
