//! Share look-back windows and the source the orchestrator pulls them from.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::database::Share;
use crate::error::Result;

/// How far back from a block to fetch shares. A share is inside the window if it falls within
/// `duration` of the block, or if the valid difficulty newer than it is still below `difficulty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareWindow {
    pub difficulty: u64,
    pub duration: Duration,
}

impl Default for ShareWindow {
    fn default() -> Self {
        Self { difficulty: 0, duration: Duration::zero() }
    }
}

impl ShareWindow {
    pub fn difficulty(difficulty: u64) -> Self {
        Self { difficulty, ..Self::default() }
    }

    pub fn duration(duration: Duration) -> Self {
        Self { duration, ..Self::default() }
    }

    pub fn union(&self, other: &ShareWindow) -> ShareWindow {
        ShareWindow {
            difficulty: self.difficulty.max(other.difficulty),
            duration: self.duration.max(other.duration),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.difficulty == 0 && self.duration <= Duration::zero()
    }

    /// Selects the window from shares sorted newest first, stopping at `end_time`.
    pub fn select<'a>(&self, newest_first: impl IntoIterator<Item = &'a Share>, end_time: DateTime<Utc>) -> Vec<Share> {
        let start_time = end_time - self.duration;
        let mut accumulated: u64 = 0;
        let mut selected = Vec::new();

        for share in newest_first {
            if share.timestamp > end_time {
                continue;
            }
            let in_difficulty = accumulated < self.difficulty;
            let in_duration = share.timestamp >= start_time && self.duration > Duration::zero();
            if !in_difficulty && !in_duration {
                break;
            }
            if share.is_valid {
                accumulated = accumulated.saturating_add(share.difficulty);
            }
            selected.push(share.clone());
        }

        selected
    }
}

#[async_trait]
pub trait ShareProvider: Send + Sync {
    /// Shares submitted at or before `end_time` that fall inside `window`, newest first.
    async fn get_shares_in_window(&self, end_time: DateTime<Utc>, window: &ShareWindow) -> Result<Vec<Share>>;
}

/// Share log kept in memory, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShareStore {
    shares: Arc<RwLock<Vec<Share>>>,
}

impl InMemoryShareStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_share(&self, share: Share) {
        let mut shares = self.shares.write().await;
        // Kept sorted oldest first
        let pos = shares.partition_point(|s| s.timestamp <= share.timestamp);
        shares.insert(pos, share);
    }

    pub async fn add_shares(&self, batch: impl IntoIterator<Item = Share>) {
        for share in batch {
            self.add_share(share).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.shares.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.shares.read().await.is_empty()
    }
}

#[async_trait]
impl ShareProvider for InMemoryShareStore {
    async fn get_shares_in_window(&self, end_time: DateTime<Utc>, window: &ShareWindow) -> Result<Vec<Share>> {
        let shares = self.shares.read().await;
        Ok(window.select(shares.iter().rev(), end_time))
    }
}
