//! Reward accounting schemes.
//!
//! Each scheme turns a window of shares plus a block reward into per-user credits. They are
//! pure: no calculator holds state between invocations, and the orchestrator picks one per user
//! through [`CalculatorSet`].

mod pplns;
mod pps;
mod score;
mod slice;
mod solo;

pub use pplns::PplnsCalculator;
pub use pps::PpsCalculator;
pub use score::ScoreCalculator;
pub use slice::SliceCalculator;
pub use solo::SoloCalculator;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::allocation::{fee_amount, largest_remainder};
use crate::config::PayoutConfig;
use crate::database::{Amount, Percentage, Share, UserId};
use crate::error::{PayoutError, Result};
use crate::shares::ShareWindow;

/// Fixed-point scale applied to time-decayed weights before integer apportionment.
pub(crate) const WEIGHT_SCALE: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutMode {
    Pps,
    Pplns,
    Slice,
    Score,
    Solo,
}

impl PayoutMode {
    pub const ALL: [PayoutMode; 5] = [
        PayoutMode::Pplns,
        PayoutMode::Pps,
        PayoutMode::Score,
        PayoutMode::Solo,
        PayoutMode::Slice,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PayoutMode::Pps => "pps",
            PayoutMode::Pplns => "pplns",
            PayoutMode::Slice => "slice",
            PayoutMode::Score => "score",
            PayoutMode::Solo => "solo",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            PayoutMode::Pps => "Pay Per Share - fixed payment per share, pool absorbs variance",
            PayoutMode::Pplns => "Pay Per Last N Shares - rewards based on recent share contribution",
            PayoutMode::Slice => "SLICE - PPLNS over time slices, recent slices weigh more",
            PayoutMode::Score => "Score-based - time-weighted shares discourage pool hopping",
            PayoutMode::Solo => "Solo Mining - keep entire block reward minus pool fee",
        }
    }

    pub fn default_fee_percent(self) -> f64 {
        match self {
            PayoutMode::Pps => 2.0,
            PayoutMode::Pplns => 1.0,
            PayoutMode::Slice => 0.8,
            PayoutMode::Score => 1.0,
            PayoutMode::Solo => 0.5,
        }
    }
}

impl fmt::Display for PayoutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayoutMode {
    type Err = PayoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pps" => Ok(PayoutMode::Pps),
            "pplns" => Ok(PayoutMode::Pplns),
            "slice" => Ok(PayoutMode::Slice),
            "score" => Ok(PayoutMode::Score),
            "solo" => Ok(PayoutMode::Solo),
            other => Err(PayoutError::Configuration(format!("unknown payout mode: {}", other))),
        }
    }
}

/// A credit computed for one user from one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub user_id: UserId,
    pub amount: Amount,
    pub mode: PayoutMode,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum RewardCalculator {
    Pps(PpsCalculator),
    Pplns(PplnsCalculator),
    Slice(SliceCalculator),
    Score(ScoreCalculator),
    Solo(SoloCalculator),
}

impl RewardCalculator {
    pub fn mode(&self) -> PayoutMode {
        match self {
            RewardCalculator::Pps(_) => PayoutMode::Pps,
            RewardCalculator::Pplns(_) => PayoutMode::Pplns,
            RewardCalculator::Slice(_) => PayoutMode::Slice,
            RewardCalculator::Score(_) => PayoutMode::Score,
            RewardCalculator::Solo(_) => PayoutMode::Solo,
        }
    }

    pub fn fee(&self) -> Percentage {
        match self {
            RewardCalculator::Pps(c) => c.fee(),
            RewardCalculator::Pplns(c) => c.fee(),
            RewardCalculator::Slice(c) => c.fee(),
            RewardCalculator::Score(c) => c.fee(),
            RewardCalculator::Solo(c) => c.fee(),
        }
    }

    /// Shares this scheme needs to look back over. PPS and SOLO need nothing beyond what the
    /// windowed schemes already fetch.
    pub fn window(&self) -> ShareWindow {
        match self {
            RewardCalculator::Pplns(c) => ShareWindow::difficulty(c.window_size()),
            RewardCalculator::Score(c) => ShareWindow::difficulty(c.window_size()),
            RewardCalculator::Slice(c) => ShareWindow::duration(c.window_duration()),
            RewardCalculator::Pps(_) | RewardCalculator::Solo(_) => ShareWindow::default(),
        }
    }

    pub fn calculate_payouts(
        &self,
        shares: &[Share],
        block_reward: Amount,
        carry: Amount,
        block_time: DateTime<Utc>,
    ) -> Result<Vec<Payout>> {
        match self {
            RewardCalculator::Pps(c) => c.calculate_payouts(shares, block_reward, carry, block_time),
            RewardCalculator::Pplns(c) => c.calculate_payouts(shares, block_reward, carry, block_time),
            RewardCalculator::Slice(c) => c.calculate_payouts(shares, block_reward, carry, block_time),
            RewardCalculator::Score(c) => c.calculate_payouts(shares, block_reward, carry, block_time),
            RewardCalculator::Solo(c) => c.calculate_payouts(shares, block_reward, carry, block_time),
        }
    }
}

/// Immutable mode → calculator table, built once from configuration.
#[derive(Debug, Clone)]
pub struct CalculatorSet {
    calculators: BTreeMap<PayoutMode, RewardCalculator>,
    default_mode: PayoutMode,
}

impl CalculatorSet {
    pub fn from_config(config: &PayoutConfig) -> Result<Self> {
        config.validate()?;

        let mut calculators = BTreeMap::new();
        for mode in config.enabled_modes() {
            let fee = config.fee_for_mode(mode)?;
            let calculator = match mode {
                PayoutMode::Pplns => {
                    RewardCalculator::Pplns(PplnsCalculator::new(config.pplns_window_size, fee)?)
                }
                PayoutMode::Score => RewardCalculator::Score(ScoreCalculator::new(
                    config.pplns_window_size,
                    fee,
                    config.score_decay_factor,
                )?),
                PayoutMode::Slice => RewardCalculator::Slice(SliceCalculator::new(
                    config.slice_count,
                    Duration::seconds(config.slice_duration_secs as i64),
                    config.slice_decay_factor,
                    fee,
                )?),
                PayoutMode::Pps => RewardCalculator::Pps(PpsCalculator::new(
                    fee,
                    config.pps_network_difficulty,
                    config.pps_expected_block_reward,
                )?),
                PayoutMode::Solo => RewardCalculator::Solo(SoloCalculator::new(fee)?),
            };
            calculators.insert(mode, calculator);
        }

        if !calculators.contains_key(&config.default_mode) {
            return Err(PayoutError::Configuration(format!(
                "default mode {} is not enabled",
                config.default_mode
            )));
        }

        Ok(Self { calculators, default_mode: config.default_mode })
    }

    pub fn get(&self, mode: PayoutMode) -> Option<&RewardCalculator> {
        self.calculators.get(&mode)
    }

    pub fn default_mode(&self) -> PayoutMode {
        self.default_mode
    }

    /// The mode a user actually gets: their own if enabled, the default otherwise.
    pub fn resolve(&self, requested: PayoutMode) -> PayoutMode {
        if self.calculators.contains_key(&requested) {
            requested
        } else {
            self.default_mode
        }
    }

    pub fn modes(&self) -> impl Iterator<Item = PayoutMode> + '_ {
        self.calculators.keys().copied()
    }

    /// Union of every enabled calculator's look-back window.
    pub fn share_window(&self) -> ShareWindow {
        self.calculators
            .values()
            .fold(ShareWindow::default(), |acc, c| acc.union(&c.window()))
    }
}

/// Newest first; ties on timestamp go to the lower id so window edges and block finders are
/// deterministic.
pub(crate) fn newest_first(a: &Share, b: &Share) -> Ordering {
    b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id))
}

// Valid shares at or before the block, in `newest_first` order.
pub(crate) fn eligible_newest_first(shares: &[Share], block_time: DateTime<Utc>) -> Vec<&Share> {
    let mut eligible: Vec<&Share> = shares
        .iter()
        .filter(|s| s.is_valid && s.timestamp <= block_time)
        .collect();
    eligible.sort_by(|a, b| newest_first(a, b));
    eligible
}

pub(crate) fn total_reward(block_reward: Amount, carry: Amount) -> Result<Amount> {
    block_reward
        .checked_add(carry)
        .ok_or_else(|| PayoutError::Calculation("block reward plus carry overflows".to_string()))
}

// Takes the fee off `total` and apportions the rest by weight. Users whose share rounds to zero
// are dropped; that never changes the sum.
pub(crate) fn distribute(
    weights: &BTreeMap<UserId, u128>,
    total: Amount,
    fee: Percentage,
    mode: PayoutMode,
    block_time: DateTime<Utc>,
) -> Vec<Payout> {
    let net = total - fee_amount(total, fee);
    let weights: Vec<(UserId, u128)> = weights.iter().map(|(u, w)| (*u, *w)).collect();

    largest_remainder(net, &weights)
        .into_iter()
        .filter(|(_, amount)| *amount > 0)
        .map(|(user_id, amount)| Payout { user_id, amount, mode, timestamp: block_time })
        .collect()
}

pub(crate) fn validate_fee(fee: Percentage) -> Result<()> {
    if fee > Percentage::FULL {
        return Err(PayoutError::Configuration(format!(
            "pool fee must be between 0 and 100%, got {}",
            fee
        )));
    }
    Ok(())
}

pub(crate) fn validate_decay(name: &str, decay: f64) -> Result<()> {
    if !(decay > 0.0 && decay <= 1.0) {
        return Err(PayoutError::Configuration(format!(
            "{} must be in (0, 1], got {}",
            name, decay
        )));
    }
    Ok(())
}
