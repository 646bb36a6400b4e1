//! Block-found event sources. Delivery is at least once; the orchestrator deduplicates.

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::database::Block;
use crate::error::Result;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

pub trait BlockNotifier: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<Block>;
}

/// In-process notifier backed by a broadcast channel.
#[derive(Debug, Clone)]
pub struct ChannelBlockNotifier {
    sender: broadcast::Sender<Block>,
}

impl Default for ChannelBlockNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl ChannelBlockNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Returns how many subscribers received the block.
    pub fn publish(&self, block: Block) -> usize {
        let block_id = block.id;
        match self.sender.send(block) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!(block_id, "no subscribers for block");
                0
            }
        }
    }
}

impl BlockNotifier for ChannelBlockNotifier {
    fn subscribe(&self) -> broadcast::Receiver<Block> {
        self.sender.subscribe()
    }
}

/// Forwards JSON-encoded blocks published on a Redis channel to local subscribers.
pub struct RedisBlockNotifier {
    local: ChannelBlockNotifier,
}

impl RedisBlockNotifier {
    /// Subscribes to `channel` and forwards until `shutdown` fires or the connection drops.
    pub async fn connect(redis_url: &str, channel: &str, shutdown: CancellationToken) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let mut pubsub = client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(channel).await?;
        info!("Subscribed to block channel {}", channel);

        let local = ChannelBlockNotifier::default();
        let forward = local.clone();
        let channel = channel.to_string();

        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.on_message());
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    msg = messages.next() => {
                        let Some(msg) = msg else {
                            warn!("Block channel {} closed", channel);
                            break;
                        };
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                warn!("Unreadable block message: {}", e);
                                continue;
                            }
                        };
                        match serde_json::from_str::<Block>(&payload) {
                            Ok(block) => {
                                forward.publish(block);
                            }
                            Err(e) => warn!("Malformed block message: {}", e),
                        }
                    }
                }
            }
        });

        Ok(Self { local })
    }
}

impl BlockNotifier for RedisBlockNotifier {
    fn subscribe(&self) -> broadcast::Receiver<Block> {
        self.local.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::BlockStatus;
    use chrono::Utc;

    fn block(id: u64) -> Block {
        Block {
            id,
            hash: format!("{:064x}", id),
            reward: 1_000,
            status: BlockStatus::Confirmed,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_each_block() {
        let notifier = ChannelBlockNotifier::new(8);
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();

        assert_eq!(notifier.publish(block(1)), 2);
        assert_eq!(a.recv().await.unwrap().id, 1);
        assert_eq!(b.recv().await.unwrap().id, 1);
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        let notifier = ChannelBlockNotifier::new(8);
        assert_eq!(notifier.publish(block(1)), 0);
    }
}
