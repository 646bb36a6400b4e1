use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::calculators::PayoutMode;

pub type UserId = u64;
pub type BlockId = u64;
/// Smallest currency unit.
pub type Amount = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub id: String,
    pub user_id: UserId,
    pub difficulty: u64,
    pub timestamp: DateTime<Utc>,
    pub is_valid: bool,
    /// Set on the share whose solution became the block.
    #[serde(default)]
    pub is_block: bool,
}

impl Share {
    pub fn new(user_id: UserId, difficulty: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            difficulty,
            timestamp,
            is_valid: true,
            is_block: false,
        }
    }

    pub fn block_share(mut self) -> Self {
        self.is_block = true;
        self
    }

    pub fn invalid(mut self) -> Self {
        self.is_valid = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Pending,
    Confirmed,
    Orphaned,
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlockStatus::Pending => "pending",
            BlockStatus::Confirmed => "confirmed",
            BlockStatus::Orphaned => "orphaned",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub hash: String,
    pub reward: Amount,
    pub status: BlockStatus,
    pub timestamp: DateTime<Utc>,
}

impl Block {
    pub fn is_confirmed(&self) -> bool {
        self.status == BlockStatus::Confirmed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPayoutSettings {
    pub user_id: UserId,
    pub payout_mode: PayoutMode,
    pub min_payout_amount: Amount,
    pub auto_payout_enable: bool,
    #[serde(default)]
    pub payout_address: String,
}

impl UserPayoutSettings {
    /// Settings for a user who never configured anything: PPLNS, no automatic payouts.
    pub fn default_for(user_id: UserId, min_payout_amount: Amount) -> Self {
        Self {
            user_id,
            payout_mode: PayoutMode::Pplns,
            min_payout_amount,
            auto_payout_enable: false,
            payout_address: String::new(),
        }
    }
}

/// An exact percentage in basis points (1/100 of a percent).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Percentage(u32);

impl Percentage {
    pub const BASIS_POINTS: u32 = 10_000;
    pub const ZERO: Percentage = Percentage(0);
    pub const FULL: Percentage = Percentage(Self::BASIS_POINTS);

    pub const fn from_basis_points(bp: u32) -> Self {
        Self(bp)
    }

    pub const fn whole(percent: u32) -> Self {
        Self(percent * 100)
    }

    /// Rounds to the nearest basis point. Returns `None` for negative or non-finite input.
    pub fn from_percent(percent: f64) -> Option<Self> {
        if !percent.is_finite() || percent < 0.0 {
            return None;
        }
        let bp = (percent * 100.0).round();
        if bp > u32::MAX as f64 {
            return None;
        }
        Some(Self(bp as u32))
    }

    pub const fn basis_points(self) -> u32 {
        self.0
    }

    pub fn as_percent(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserWallet {
    pub id: u64,
    pub user_id: UserId,
    pub address: String,
    #[serde(default)]
    pub label: String,
    pub percentage: Percentage,
    pub is_primary: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserWallet {
    pub fn new(user_id: UserId, address: impl Into<String>, percentage: Percentage) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            user_id,
            address: address.into(),
            label: String::new(),
            percentage,
            is_primary: false,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutSplit {
    pub wallet_id: u64,
    pub address: String,
    pub percentage: Percentage,
    pub amount: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    Cancelled,
}

impl PayoutStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PayoutStatus::Processed | PayoutStatus::Failed | PayoutStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: PayoutStatus) -> bool {
        use PayoutStatus::*;
        match (self, next) {
            (Pending, Processing) => true,
            (Pending | Processing, Processed | Failed) => true,
            (Pending, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Processing => "processing",
            PayoutStatus::Processed => "processed",
            PayoutStatus::Failed => "failed",
            PayoutStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPayout {
    pub id: Uuid,
    pub user_id: UserId,
    pub amount: Amount,
    pub address: String,
    pub status: PayoutStatus,
    pub payout_mode: PayoutMode,
    pub block_id: BlockId,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub tx_hash: Option<String>,
    pub error_message: Option<String>,
}

impl PendingPayout {
    /// A payout without an id yet; the queue assigns one on enqueue.
    pub fn new(
        user_id: UserId,
        amount: Amount,
        address: impl Into<String>,
        payout_mode: PayoutMode,
        block_id: BlockId,
    ) -> Self {
        Self {
            id: Uuid::nil(),
            user_id,
            amount,
            address: address.into(),
            status: PayoutStatus::Pending,
            payout_mode,
            block_id,
            created_at: Utc::now(),
            processed_at: None,
            tx_hash: None,
            error_message: None,
        }
    }
}
