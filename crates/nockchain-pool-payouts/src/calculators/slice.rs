//! SLICE: PPLNS over a fixed time window cut into equal slices.
//!
//! Slice 0 ends at the block. A share in slice `k` weighs `difficulty × decay^k`, so the most
//! recent slice counts in full and each older slice counts a little less.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use super::{
    distribute, eligible_newest_first, total_reward, validate_decay, validate_fee, Payout,
    PayoutMode, WEIGHT_SCALE,
};
use crate::database::{Amount, Percentage, Share, UserId};
use crate::error::{PayoutError, Result};

#[derive(Debug, Clone)]
pub struct SliceCalculator {
    slice_count: u32,
    slice_duration: Duration,
    decay_factor: f64,
    fee: Percentage,
}

impl SliceCalculator {
    pub fn new(
        slice_count: u32,
        slice_duration: Duration,
        decay_factor: f64,
        fee: Percentage,
    ) -> Result<Self> {
        if slice_count == 0 {
            return Err(PayoutError::Configuration("slice count must be positive".into()));
        }
        if slice_duration <= Duration::zero() {
            return Err(PayoutError::Configuration("slice duration must be positive".into()));
        }
        validate_decay("SLICE decay factor", decay_factor)?;
        validate_fee(fee)?;

        Ok(Self { slice_count, slice_duration, decay_factor, fee })
    }

    pub fn fee(&self) -> Percentage {
        self.fee
    }

    pub fn window_duration(&self) -> Duration {
        self.slice_duration * self.slice_count as i32
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

        let slice_weights: Vec<f64> =
            (0..self.slice_count).map(|k| self.decay_factor.powi(k as i32)).collect();

        let mut weights: BTreeMap<UserId, u128> = BTreeMap::new();
        for share in eligible_newest_first(shares, block_time) {
            let Some(slice) = self.slice_index(share.timestamp, block_time) else {
                // Newest first, so everything after this is older still
                break;
            };
            let weight = share.difficulty as f64 * slice_weights[slice];
            *weights.entry(share.user_id).or_insert(0) += (weight * WEIGHT_SCALE).round() as u128;
        }

        Ok(distribute(&weights, total, self.fee, PayoutMode::Slice, block_time))
    }

    /// Age bucket of a share, or `None` once it falls outside the window.
    fn slice_index(&self, submitted: DateTime<Utc>, block_time: DateTime<Utc>) -> Option<usize> {
        let elapsed = (block_time - submitted).num_milliseconds();
        let slice_ms = self.slice_duration.num_milliseconds();
        let index = (elapsed / slice_ms) as usize;
        (elapsed >= 0 && index < self.slice_count as usize).then_some(index)
    }
}
