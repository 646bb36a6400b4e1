use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::database::BlockId;
use crate::error::Result;

/// Durable bookkeeping that keeps block crediting exactly-once: which blocks have been taken,
/// and up to which share time PPS users have already been paid.
#[async_trait]
pub trait BlockRegistry: Send + Sync {
    /// Marks the block as taken. Returns `false` if it already was.
    async fn claim(&self, block_id: BlockId) -> Result<bool>;

    /// Forgets a claim so a failed block can be processed again.
    async fn release(&self, block_id: BlockId) -> Result<()>;

    async fn is_processed(&self, block_id: BlockId) -> Result<bool>;

    async fn pps_paid_through(&self) -> Result<Option<DateTime<Utc>>>;

    async fn set_pps_paid_through(&self, through: Option<DateTime<Utc>>) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryBlockRegistry {
    claimed: Mutex<HashSet<BlockId>>,
    pps_paid_through: Mutex<Option<DateTime<Utc>>>,
}

impl InMemoryBlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlockRegistry for InMemoryBlockRegistry {
    async fn claim(&self, block_id: BlockId) -> Result<bool> {
        Ok(self.claimed.lock().await.insert(block_id))
    }

    async fn release(&self, block_id: BlockId) -> Result<()> {
        self.claimed.lock().await.remove(&block_id);
        Ok(())
    }

    async fn is_processed(&self, block_id: BlockId) -> Result<bool> {
        Ok(self.claimed.lock().await.contains(&block_id))
    }

    async fn pps_paid_through(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(*self.pps_paid_through.lock().await)
    }

    async fn set_pps_paid_through(&self, through: Option<DateTime<Utc>>) -> Result<()> {
        *self.pps_paid_through.lock().await = through;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claims_once_until_released() {
        let registry = InMemoryBlockRegistry::new();
        assert!(registry.claim(5).await.unwrap());
        assert!(!registry.claim(5).await.unwrap());
        assert!(registry.is_processed(5).await.unwrap());

        registry.release(5).await.unwrap();
        assert!(!registry.is_processed(5).await.unwrap());
        assert!(registry.claim(5).await.unwrap());
    }

    #[tokio::test]
    async fn tracks_pps_cutoff() {
        let registry = InMemoryBlockRegistry::new();
        assert_eq!(registry.pps_paid_through().await.unwrap(), None);

        let now = Utc::now();
        registry.set_pps_paid_through(Some(now)).await.unwrap();
        assert_eq!(registry.pps_paid_through().await.unwrap(), Some(now));
    }
}
