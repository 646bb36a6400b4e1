use thiserror::Error;
use uuid::Uuid;

use crate::calculators::PayoutMode;
use crate::database::{BlockId, BlockStatus, PayoutStatus, UserId};

#[derive(Error, Debug)]
pub enum PayoutError {
    #[error("Database error: {0}")]
    Database(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Block {id} not confirmed (status: {status})")]
    BlockNotConfirmed { id: BlockId, status: BlockStatus },

    #[error("Insufficient balance for user {user_id}: requested {requested}, available {available}")]
    InsufficientBalance {
        user_id: UserId,
        requested: u64,
        available: u64,
    },

    #[error("Balance overflow for user {0}")]
    BalanceOverflow(UserId),

    #[error("Invalid wallet split: {0}")]
    InvalidSplit(String),

    #[error("Wallet not found: {0}")]
    WalletNotFound(u64),

    #[error("Payout not found: {0}")]
    PayoutNotFound(Uuid),

    #[error("Payout {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: PayoutStatus,
        to: PayoutStatus,
    },

    #[error("Share provider error: {0}")]
    ShareProvider(String),

    #[error("Settings provider error: {0}")]
    Settings(String),

    #[error("Payout queue error: {0}")]
    Queue(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No calculator available for mode {0}")]
    NoCalculator(PayoutMode),

    #[error("Calculation error: {0}")]
    Calculation(String),

    #[error("Orchestrator already running")]
    AlreadyRunning,

    #[error("Shutdown drain timed out with {0} block tasks still running")]
    DrainTimeout(usize),
}

impl PayoutError {
    /// Resource failures abort a single block and may succeed when the block is redelivered.
    /// Input rejections and consistency errors never do.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PayoutError::Database(_)
                | PayoutError::ShareProvider(_)
                | PayoutError::Settings(_)
                | PayoutError::Queue(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PayoutError>;
