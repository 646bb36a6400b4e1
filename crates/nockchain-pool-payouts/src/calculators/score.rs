//! SCORE: PPLNS window, but each share is discounted by how long before the block it arrived.
//!
//! weight = effective difficulty × decay^(hours before block), floored at 1% so old shares
//! inside the window never become worthless.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::{
    distribute, eligible_newest_first, total_reward, validate_decay, validate_fee, Payout,
    PayoutMode, WEIGHT_SCALE,
};
use crate::database::{Amount, Percentage, Share, UserId};
use crate::error::{PayoutError, Result};

const MIN_TIME_WEIGHT: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct ScoreCalculator {
    window_size: u64,
    fee: Percentage,
    decay_factor: f64,
}

impl ScoreCalculator {
    pub fn new(window_size: u64, fee: Percentage, decay_factor: f64) -> Result<Self> {
        if window_size == 0 {
            return Err(PayoutError::Configuration("SCORE window size must be positive".into()));
        }
        validate_fee(fee)?;
        validate_decay("SCORE decay factor", decay_factor)?;
        Ok(Self { window_size, fee, decay_factor })
    }

    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    pub fn fee(&self) -> Percentage {
        self.fee
    }

    pub fn decay_factor(&self) -> f64 {
        self.decay_factor
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
        let mut accumulated: u64 = 0;

        for share in eligible_newest_first(shares, block_time) {
            let remaining = self.window_size - accumulated;
            if remaining == 0 {
                break;
            }
            let effective = share.difficulty.min(remaining);
            if effective == 0 {
                continue;
            }
            accumulated += effective;

            let score = effective as f64 * self.time_weight(share.timestamp, block_time);
            *weights.entry(share.user_id).or_insert(0) += (score * WEIGHT_SCALE).round() as u128;
        }

        Ok(distribute(&weights, total, self.fee, PayoutMode::Score, block_time))
    }

    fn time_weight(&self, submitted: DateTime<Utc>, block_time: DateTime<Utc>) -> f64 {
        let hours_old = ((block_time - submitted).num_milliseconds() as f64 / 3_600_000.0).max(0.0);
        self.decay_factor.powf(hours_old).max(MIN_TIME_WEIGHT)
    }
}
