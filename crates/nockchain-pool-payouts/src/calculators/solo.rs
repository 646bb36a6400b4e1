use chrono::{DateTime, Utc};

use super::{eligible_newest_first, total_reward, validate_fee, Payout, PayoutMode};
use crate::allocation::fee_amount;
use crate::database::{Amount, Percentage, Share};
use crate::error::Result;

/// Block finder takes the whole reward minus the pool fee.
#[derive(Debug, Clone)]
pub struct SoloCalculator {
    fee: Percentage,
}

impl SoloCalculator {
    pub fn new(fee: Percentage) -> Result<Self> {
        validate_fee(fee)?;
        Ok(Self { fee })
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

        let eligible = eligible_newest_first(shares, block_time);
        // The flagged block share wins; without one, the newest valid share is the finder
        let finder = eligible
            .iter()
            .find(|s| s.is_block)
            .or_else(|| eligible.first());

        let Some(finder) = finder else {
            return Ok(Vec::new());
        };

        let amount = total - fee_amount(total, self.fee);
        if amount == 0 {
            return Ok(Vec::new());
        }

        Ok(vec![Payout {
            user_id: finder.user_id,
            amount,
            mode: PayoutMode::Solo,
            timestamp: block_time,
        }])
    }
}
