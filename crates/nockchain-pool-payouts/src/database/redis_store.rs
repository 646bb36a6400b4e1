use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::schema::*;
use crate::error::{PayoutError, Result};
use crate::ledger::BalanceLedger;
use crate::queue::{prepare_for_enqueue, transition, PayoutQueue, QueueStats};
use crate::registry::BlockRegistry;
use crate::settings::UserSettingsProvider;
use crate::shares::{ShareProvider, ShareWindow};
use crate::splits::WalletRepository;

const SHARES_WINDOW: &str = "shares:window";
const PAYOUTS_PENDING: &str = "payouts:pending";
const PAYOUTS_PROCESSING: &str = "payouts:processing";
const PAYOUTS_STATS: &str = "payouts:stats";
const BLOCKS_PROCESSED: &str = "blocks:processed";
const PPS_PAID_THROUGH: &str = "pps:paid_through";

const SHARE_TTL_SECS: usize = 7 * 24 * 3600;
const SHARE_PAGE: isize = 1_000;

// Returns -1 without touching the balance when it cannot cover the debit.
const DEBIT_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current < tonumber(ARGV[1]) then
    return -1
end
return redis.call('DECRBY', KEYS[1], ARGV[1])
"#;

// Moves a payout out of its current index and stores the new record in one step, crediting
// the amount back to the balance when ARGV[6] is '1'. Returns 0 when the payout was no longer
// in the expected index, i.e. another caller moved it first.
const TRANSITION_SCRIPT: &str = r#"
local removed
if ARGV[1] == 'pending' then
    removed = redis.call('ZREM', KEYS[1], ARGV[2])
else
    removed = redis.call('SREM', KEYS[2], ARGV[2])
end
if removed == 0 then
    return 0
end
redis.call('SET', KEYS[3], ARGV[3])
if ARGV[4] == 'processing' then
    redis.call('SADD', KEYS[2], ARGV[2])
else
    redis.call('HINCRBY', KEYS[4], ARGV[4], 1)
    if ARGV[4] == 'processed' then
        redis.call('HINCRBY', KEYS[4], 'total_paid', ARGV[5])
    end
end
if ARGV[6] == '1' then
    redis.call('INCRBY', KEYS[5], ARGV[5])
end
return 1
"#;

fn balance_key(user_id: UserId) -> String {
    format!("balance:{}", user_id)
}

fn payout_key(id: Uuid) -> String {
    format!("payout:{}", id)
}

fn user_payouts_key(user_id: UserId) -> String {
    format!("user:{}:payouts", user_id)
}

fn wallets_key(user_id: UserId) -> String {
    format!("wallets:{}", user_id)
}

fn settings_key(user_id: UserId) -> String {
    format!("settings:{}", user_id)
}

fn share_key(id: &str) -> String {
    format!("share:{}", id)
}

/// Every payout store behind one Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    default_min_payout: Amount,
}

impl RedisStore {
    pub async fn new(redis_url: &str, default_min_payout: Amount) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn, default_min_payout })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    // Share operations
    pub async fn save_share(&self, share: &Share) -> Result<()> {
        let json = serde_json::to_string(share)?;
        redis::pipe()
            .atomic()
            .set_ex(share_key(&share.id), json, SHARE_TTL_SECS)
            .ignore()
            .zadd(SHARES_WINDOW, &share.id, share.timestamp.timestamp_millis())
            .ignore()
            .query_async::<_, ()>(&mut self.conn())
            .await?;
        Ok(())
    }

    /// Drops shares older than `before` from the window index.
    pub async fn cleanup_old_shares(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.conn();
        let removed: u64 = conn
            .zrembyscore(SHARES_WINDOW, "-inf", before.timestamp_millis())
            .await?;

        debug!("Cleaned up {} old shares", removed);
        Ok(removed)
    }

    // Settings operations
    pub async fn set_user_payout_settings(&self, settings: &UserPayoutSettings) -> Result<()> {
        let json = serde_json::to_string(settings)?;
        self.conn().set::<_, _, ()>(settings_key(settings.user_id), json).await?;
        Ok(())
    }

    async fn load_json<T: serde::de::DeserializeOwned + Send>(&self, keys: &[String]) -> Result<Vec<T>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut self.conn()).await?;
        let mut values = Vec::with_capacity(raw.len());
        for json in raw.into_iter().flatten() {
            values.push(serde_json::from_str(&json)?);
        }
        Ok(values)
    }

    async fn load_payouts(&self, ids: &[String]) -> Result<Vec<PendingPayout>> {
        let keys: Vec<String> = ids.iter().map(|id| format!("payout:{}", id)).collect();
        self.load_json(&keys).await
    }

    async fn move_payout(&self, mut payout: PendingPayout, to: PayoutStatus, refund: bool) -> Result<PendingPayout> {
        let from = payout.status;
        transition(&mut payout, to)?;
        let json = serde_json::to_string(&payout)?;

        let moved: i64 = Script::new(TRANSITION_SCRIPT)
            .key(PAYOUTS_PENDING)
            .key(PAYOUTS_PROCESSING)
            .key(payout_key(payout.id))
            .key(PAYOUTS_STATS)
            .key(balance_key(payout.user_id))
            .arg(from.to_string())
            .arg(payout.id.to_string())
            .arg(json)
            .arg(to.to_string())
            .arg(payout.amount)
            .arg(if refund { "1" } else { "0" })
            .invoke_async(&mut self.conn())
            .await?;

        if moved == 0 {
            let current = self.get(payout.id).await?;
            return Err(PayoutError::InvalidTransition { id: payout.id, from: current.status, to });
        }
        Ok(payout)
    }
}

#[async_trait]
impl ShareProvider for RedisStore {
    async fn get_shares_in_window(&self, end_time: DateTime<Utc>, window: &ShareWindow) -> Result<Vec<Share>> {
        let mut conn = self.conn();
        let mut fetched: Vec<Share> = Vec::new();
        let mut offset: isize = 0;

        loop {
            let ids: Vec<String> = conn
                .zrevrangebyscore_limit(SHARES_WINDOW, end_time.timestamp_millis(), "-inf", offset, SHARE_PAGE)
                .await?;
            let page_len = ids.len() as isize;
            let keys: Vec<String> = ids.iter().map(|id| share_key(id)).collect();
            fetched.extend(self.load_json::<Share>(&keys).await?);

            let selected = window.select(fetched.iter(), end_time);
            // The window closed before the oldest fetched share, or the index ran out
            if selected.len() < fetched.len() || page_len < SHARE_PAGE {
                return Ok(selected);
            }
            offset += page_len;
        }
    }
}

#[async_trait]
impl UserSettingsProvider for RedisStore {
    async fn get_user_payout_settings(&self, user_id: UserId) -> Result<UserPayoutSettings> {
        let data: Option<String> = self
            .conn()
            .get(settings_key(user_id))
            .await
            .map_err(|e| PayoutError::Settings(e.to_string()))?;

        match data {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(UserPayoutSettings::default_for(user_id, self.default_min_payout)),
        }
    }
}

#[async_trait]
impl BalanceLedger for RedisStore {
    async fn get_balance(&self, user_id: UserId) -> Result<Amount> {
        let balance: Option<u64> = self.conn().get(balance_key(user_id)).await?;
        Ok(balance.unwrap_or(0))
    }

    async fn add_to_balance(&self, user_id: UserId, amount: Amount) -> Result<Amount> {
        // Redis integers are signed 64-bit
        let delta = i64::try_from(amount).map_err(|_| PayoutError::BalanceOverflow(user_id))?;
        let balance: i64 = match self.conn().incr(balance_key(user_id), delta).await {
            Ok(balance) => balance,
            Err(e) if e.to_string().contains("overflow") => return Err(PayoutError::BalanceOverflow(user_id)),
            Err(e) => return Err(e.into()),
        };
        debug!(user_id, amount, balance, "credited balance");
        Ok(balance as Amount)
    }

    async fn deduct_from_balance(&self, user_id: UserId, amount: Amount) -> Result<Amount> {
        let result: i64 = Script::new(DEBIT_SCRIPT)
            .key(balance_key(user_id))
            .arg(amount)
            .invoke_async(&mut self.conn())
            .await?;

        if result < 0 {
            let available = self.get_balance(user_id).await?;
            return Err(PayoutError::InsufficientBalance { user_id, requested: amount, available });
        }
        debug!(user_id, amount, balance = result, "debited balance");
        Ok(result as Amount)
    }
}

#[async_trait]
impl PayoutQueue for RedisStore {
    async fn enqueue_batch(&self, payouts: Vec<PendingPayout>) -> Result<Vec<PendingPayout>> {
        let prepared = payouts
            .into_iter()
            .map(prepare_for_enqueue)
            .collect::<Result<Vec<_>>>()?;
        if prepared.is_empty() {
            return Ok(prepared);
        }

        // MULTI/EXEC: the whole batch lands or none of it does
        let mut pipe = redis::pipe();
        pipe.atomic();
        for payout in &prepared {
            let id = payout.id.to_string();
            let score = payout.created_at.timestamp_millis();
            pipe.set(payout_key(payout.id), serde_json::to_string(payout)?)
                .ignore()
                .zadd(PAYOUTS_PENDING, &id, score)
                .ignore()
                .zadd(user_payouts_key(payout.user_id), &id, score)
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut self.conn()).await?;

        Ok(prepared)
    }

    async fn get(&self, id: Uuid) -> Result<PendingPayout> {
        let data: Option<String> = self.conn().get(payout_key(id)).await?;
        match data {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(PayoutError::PayoutNotFound(id)),
        }
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<PendingPayout>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = self.conn().zrange(PAYOUTS_PENDING, 0, limit as isize - 1).await?;
        self.load_payouts(&ids).await
    }

    async fn mark_processing(&self, id: Uuid) -> Result<PendingPayout> {
        let payout = self.get(id).await?;
        self.move_payout(payout, PayoutStatus::Processing, false).await
    }

    async fn mark_processed(&self, id: Uuid, tx_hash: &str) -> Result<PendingPayout> {
        let mut payout = self.get(id).await?;
        payout.tx_hash = Some(tx_hash.to_string());
        let payout = self.move_payout(payout, PayoutStatus::Processed, false).await?;
        info!(payout_id = %id, user_id = payout.user_id, amount = payout.amount, "payout processed");
        Ok(payout)
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<PendingPayout> {
        let mut payout = self.get(id).await?;
        payout.error_message = Some(reason.to_string());
        let payout = self.move_payout(payout, PayoutStatus::Failed, true).await?;
        warn!(payout_id = %id, user_id = payout.user_id, "payout failed, amount returned: {}", reason);
        Ok(payout)
    }

    async fn cancel(&self, id: Uuid) -> Result<PendingPayout> {
        let payout = self.get(id).await?;
        let payout = self.move_payout(payout, PayoutStatus::Cancelled, true).await?;
        info!(payout_id = %id, user_id = payout.user_id, amount = payout.amount, "payout cancelled");
        Ok(payout)
    }

    async fn revoke(&self, id: Uuid) -> Result<PendingPayout> {
        let mut payout = self.get(id).await?;
        payout.error_message = Some("revoked before debit".to_string());
        let payout = self.move_payout(payout, PayoutStatus::Cancelled, false).await?;
        warn!(payout_id = %id, user_id = payout.user_id, amount = payout.amount, "payout revoked");
        Ok(payout)
    }

    async fn history(&self, user_id: UserId, limit: usize) -> Result<Vec<PendingPayout>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = self
            .conn()
            .zrevrange(user_payouts_key(user_id), 0, limit as isize - 1)
            .await?;
        self.load_payouts(&ids).await
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut conn = self.conn();
        let counters: HashMap<String, u64> = conn.hgetall(PAYOUTS_STATS).await?;
        let processing: u64 = conn.scard(PAYOUTS_PROCESSING).await?;
        let pending_ids: Vec<String> = conn.zrange(PAYOUTS_PENDING, 0, -1).await?;
        let pending = self.load_payouts(&pending_ids).await?;

        let counter = |name: &str| counters.get(name).copied().unwrap_or(0);
        Ok(QueueStats {
            pending: pending.len() as u64,
            processing,
            processed: counter("processed"),
            failed: counter("failed"),
            cancelled: counter("cancelled"),
            pending_amount: pending.iter().map(|p| p.amount).fold(0, Amount::saturating_add),
            total_paid: counter("total_paid"),
        })
    }
}

#[async_trait]
impl WalletRepository for RedisStore {
    async fn load_wallets(&self, user_id: UserId) -> Result<Vec<UserWallet>> {
        let data: Option<String> = self.conn().get(wallets_key(user_id)).await?;
        match data {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save_wallets(&self, user_id: UserId, wallets: &[UserWallet]) -> Result<()> {
        let json = serde_json::to_string(wallets)?;
        self.conn().set::<_, _, ()>(wallets_key(user_id), json).await?;
        Ok(())
    }
}

#[async_trait]
impl BlockRegistry for RedisStore {
    async fn claim(&self, block_id: BlockId) -> Result<bool> {
        let added: i64 = self.conn().sadd(BLOCKS_PROCESSED, block_id).await?;
        Ok(added == 1)
    }

    async fn release(&self, block_id: BlockId) -> Result<()> {
        self.conn().srem::<_, _, ()>(BLOCKS_PROCESSED, block_id).await?;
        Ok(())
    }

    async fn is_processed(&self, block_id: BlockId) -> Result<bool> {
        Ok(self.conn().sismember(BLOCKS_PROCESSED, block_id).await?)
    }

    async fn pps_paid_through(&self) -> Result<Option<DateTime<Utc>>> {
        let millis: Option<i64> = self.conn().get(PPS_PAID_THROUGH).await?;
        Ok(millis.and_then(DateTime::from_timestamp_millis))
    }

    async fn set_pps_paid_through(&self, through: Option<DateTime<Utc>>) -> Result<()> {
        let mut conn = self.conn();
        match through {
            Some(t) => conn.set::<_, _, ()>(PPS_PAID_THROUGH, t.timestamp_millis()).await?,
            None => conn.del::<_, ()>(PPS_PAID_THROUGH).await?,
        }
        Ok(())
    }
}
