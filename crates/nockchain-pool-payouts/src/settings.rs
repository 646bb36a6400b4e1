use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::database::{Amount, UserId, UserPayoutSettings};
use crate::error::Result;

#[async_trait]
pub trait UserSettingsProvider: Send + Sync {
    /// A user's payout settings, or the safe default when they never configured any.
    async fn get_user_payout_settings(&self, user_id: UserId) -> Result<UserPayoutSettings>;
}

#[derive(Debug, Clone)]
pub struct InMemorySettingsStore {
    settings: Arc<RwLock<HashMap<UserId, UserPayoutSettings>>>,
    default_min_payout: Amount,
}

impl InMemorySettingsStore {
    pub fn new(default_min_payout: Amount) -> Self {
        Self { settings: Arc::new(RwLock::new(HashMap::new())), default_min_payout }
    }

    pub async fn set(&self, settings: UserPayoutSettings) {
        self.settings.write().await.insert(settings.user_id, settings);
    }
}

#[async_trait]
impl UserSettingsProvider for InMemorySettingsStore {
    async fn get_user_payout_settings(&self, user_id: UserId) -> Result<UserPayoutSettings> {
        Ok(self
            .settings
            .read()
            .await
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| UserPayoutSettings::default_for(user_id, self.default_min_payout)))
    }
}
