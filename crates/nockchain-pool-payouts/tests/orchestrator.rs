use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;

use nockchain_pool_payouts::database::{
    Amount, Block, BlockStatus, PayoutStatus, PendingPayout, Percentage, Share, UserId, UserPayoutSettings,
    UserWallet,
};
use nockchain_pool_payouts::ledger::{BalanceLedger, InMemoryLedger};
use nockchain_pool_payouts::notifier::ChannelBlockNotifier;
use nockchain_pool_payouts::queue::{InMemoryPayoutQueue, PayoutQueue, QueueStats};
use nockchain_pool_payouts::registry::InMemoryBlockRegistry;
use nockchain_pool_payouts::settings::InMemorySettingsStore;
use nockchain_pool_payouts::shares::{InMemoryShareStore, ShareProvider, ShareWindow};
use nockchain_pool_payouts::splits::InMemoryWalletRepository;
use nockchain_pool_payouts::{
    Backends, DiscrepancyKind, ExecutorStats, PayoutConfig, PayoutError, PayoutMode, PayoutOrchestrator,
    ProcessOutcome,
};
use uuid::Uuid;

struct Harness {
    orchestrator: Arc<PayoutOrchestrator>,
    shares: InMemoryShareStore,
    settings: InMemorySettingsStore,
    ledger: Arc<InMemoryLedger>,
    queue: Arc<InMemoryPayoutQueue>,
    notifier: ChannelBlockNotifier,
}

fn harness(config: PayoutConfig) -> Harness {
    harness_with_shares(config, None)
}

fn harness_with_shares(config: PayoutConfig, provider: Option<Arc<dyn ShareProvider>>) -> Harness {
    let shares = InMemoryShareStore::new();
    let settings = InMemorySettingsStore::new(config.default_min_payout);
    let ledger = Arc::new(InMemoryLedger::new());
    let queue = Arc::new(InMemoryPayoutQueue::new(ledger.clone()));
    let notifier = ChannelBlockNotifier::new(64);

    let backends = Backends {
        shares: provider.unwrap_or_else(|| Arc::new(shares.clone())),
        settings: Arc::new(settings.clone()),
        ledger: ledger.clone(),
        queue: queue.clone(),
        wallets: Arc::new(InMemoryWalletRepository::new()),
        registry: Arc::new(InMemoryBlockRegistry::new()),
    };
    let orchestrator = Arc::new(PayoutOrchestrator::new(&config, backends, Arc::new(notifier.clone())).unwrap());

    Harness { orchestrator, shares, settings, ledger, queue, notifier }
}

fn orchestrator_with(
    shares: &InMemoryShareStore,
    settings: &InMemorySettingsStore,
    ledger: Arc<dyn BalanceLedger>,
    queue: Arc<dyn PayoutQueue>,
) -> PayoutOrchestrator {
    let backends = Backends {
        shares: Arc::new(shares.clone()),
        settings: Arc::new(settings.clone()),
        ledger,
        queue,
        wallets: Arc::new(InMemoryWalletRepository::new()),
        registry: Arc::new(InMemoryBlockRegistry::new()),
    };
    PayoutOrchestrator::new(&PayoutConfig::default(), backends, Arc::new(ChannelBlockNotifier::default())).unwrap()
}

fn confirmed_block(id: u64, reward: Amount, timestamp: DateTime<Utc>) -> Block {
    Block {
        id,
        hash: format!("{:064x}", id),
        reward,
        status: BlockStatus::Confirmed,
        timestamp,
    }
}

fn share(user_id: UserId, difficulty: u64, block_time: DateTime<Utc>, secs_before: i64) -> Share {
    Share::new(user_id, difficulty, block_time - chrono::Duration::seconds(secs_before))
}

fn auto_payout(user_id: UserId, min_payout_amount: Amount, address: &str) -> UserPayoutSettings {
    UserPayoutSettings {
        user_id,
        payout_mode: PayoutMode::Pplns,
        min_payout_amount,
        auto_payout_enable: true,
        payout_address: address.to_string(),
    }
}

#[tokio::test]
async fn unconfirmed_block_changes_nothing() {
    let h = harness(PayoutConfig::default());
    let now = Utc::now();
    h.shares.add_share(share(1, 500, now, 10)).await;

    for status in [BlockStatus::Pending, BlockStatus::Orphaned] {
        let mut block = confirmed_block(1, 1_000_000_000, now);
        block.status = status;
        let err = h.orchestrator.process_block(&block).await.unwrap_err();
        assert!(matches!(err, PayoutError::BlockNotConfirmed { id: 1, .. }));
    }

    assert_eq!(h.orchestrator.get_stats().await, ExecutorStats::default());
    assert_eq!(h.orchestrator.get_user_balance(1).await.unwrap(), 0);
}

#[tokio::test]
async fn two_equal_miners_split_block_after_fee() {
    let h = harness(PayoutConfig::default());
    let now = Utc::now();
    h.shares.add_shares(vec![share(1, 500, now, 10), share(2, 500, now, 20)]).await;

    let outcome = h.orchestrator.process_block(&confirmed_block(1, 1_000_000_000, now)).await.unwrap();
    let ProcessOutcome::Processed(summary) = outcome else {
        panic!("block was not processed");
    };

    assert_eq!(summary.users_credited, 2);
    assert_eq!(h.orchestrator.get_user_balance(1).await.unwrap(), 495_000_000);
    assert_eq!(h.orchestrator.get_user_balance(2).await.unwrap(), 495_000_000);
    // The remaining 10_000_000 is the pool fee
    assert_eq!(h.ledger.total().await, 990_000_000);

    let stats = h.orchestrator.get_stats().await;
    assert_eq!(stats.blocks_processed, 1);
    assert_eq!(stats.payouts_calculated, 2);
    assert_eq!(stats.total_amount_credited, 990_000_000);
    assert_eq!(stats.last_block_processed, Some(1));
    assert_eq!(stats.error_count, 0);
}

#[tokio::test]
async fn crossing_threshold_queues_full_balance() {
    let h = harness(PayoutConfig::default());
    let now = Utc::now();
    h.settings.set(auto_payout(1, 100_000, "nock1miner")).await;
    h.shares.add_share(share(1, 10, now, 5)).await;

    h.orchestrator.process_block(&confirmed_block(1, 50_000, now)).await.unwrap();
    // 49_500 is below the threshold
    assert!(h.orchestrator.get_pending_payouts(10).await.unwrap().is_empty());
    assert_eq!(h.orchestrator.get_user_balance(1).await.unwrap(), 49_500);

    h.orchestrator
        .process_block(&confirmed_block(2, 60_000, now + chrono::Duration::seconds(1)))
        .await
        .unwrap();

    let pending = h.orchestrator.get_pending_payouts(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].amount, 49_500 + 59_400);
    assert_eq!(pending[0].address, "nock1miner");
    assert_eq!(pending[0].block_id, 2);
    assert_eq!(pending[0].status, PayoutStatus::Pending);
    assert_eq!(h.orchestrator.get_user_balance(1).await.unwrap(), 0);
    assert_eq!(h.orchestrator.get_stats().await.payouts_queued, 1);
}

#[tokio::test]
async fn failed_payout_returns_funds() {
    let h = harness(PayoutConfig::default());
    let now = Utc::now();
    h.settings.set(auto_payout(1, 1_000, "nock1miner")).await;
    h.shares.add_share(share(1, 10, now, 5)).await;

    h.orchestrator.process_block(&confirmed_block(1, 100_000, now)).await.unwrap();
    let payout = h.orchestrator.get_pending_payouts(1).await.unwrap().remove(0);
    assert_eq!(h.orchestrator.get_user_balance(1).await.unwrap(), 0);

    let failed = h.queue.mark_failed(payout.id, "rpc timeout").await.unwrap();
    assert_eq!(failed.status, PayoutStatus::Failed);
    assert_eq!(h.orchestrator.get_user_balance(1).await.unwrap(), 99_000);
    assert!(h.orchestrator.get_pending_payouts(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_delivery_credits_once() {
    let h = harness(PayoutConfig::default());
    let now = Utc::now();
    h.shares.add_share(share(1, 10, now, 5)).await;
    let block = confirmed_block(7, 1_000, now);

    assert!(matches!(h.orchestrator.process_block(&block).await.unwrap(), ProcessOutcome::Processed(_)));
    assert_eq!(h.orchestrator.process_block(&block).await.unwrap(), ProcessOutcome::AlreadyProcessed);

    assert_eq!(h.orchestrator.get_user_balance(1).await.unwrap(), 990);
    assert_eq!(h.orchestrator.get_stats().await.blocks_processed, 1);
}

#[tokio::test]
async fn auto_payout_splits_across_active_wallets() {
    let h = harness(PayoutConfig::default());
    let now = Utc::now();
    h.settings.set(auto_payout(1, 1, "")).await;
    h.orchestrator
        .wallets()
        .set_wallets(
            1,
            vec![
                UserWallet::new(1, "nock1hot", Percentage::whole(60)).primary(),
                UserWallet::new(1, "nock1cold", Percentage::whole(40)),
            ],
        )
        .await
        .unwrap();
    h.shares.add_share(share(1, 10, now, 5)).await;

    h.orchestrator.process_block(&confirmed_block(1, 1_000_001, now)).await.unwrap();

    let pending = h.orchestrator.get_pending_payouts(10).await.unwrap();
    let credited = 1_000_001 - 10_000;
    assert_eq!(pending.len(), 2);
    assert_eq!(pending.iter().map(|p| p.amount).sum::<u64>(), credited);
    let hot = pending.iter().find(|p| p.address == "nock1hot").unwrap();
    assert_eq!(hot.amount, 594_001);
    assert_eq!(h.orchestrator.get_user_balance(1).await.unwrap(), 0);
}

#[tokio::test]
async fn auto_payout_without_destination_keeps_balance() {
    let h = harness(PayoutConfig::default());
    let now = Utc::now();
    h.settings.set(auto_payout(1, 1, "")).await;
    h.shares.add_share(share(1, 10, now, 5)).await;

    h.orchestrator.process_block(&confirmed_block(1, 1_000, now)).await.unwrap();
    assert!(h.orchestrator.get_pending_payouts(10).await.unwrap().is_empty());
    assert_eq!(h.orchestrator.get_user_balance(1).await.unwrap(), 990);
}

#[tokio::test]
async fn concurrent_blocks_conserve_money() {
    let h = harness(PayoutConfig::default());
    let now = Utc::now();
    h.settings.set(auto_payout(1, 25_000, "nock1a")).await;
    h.settings.set(auto_payout(2, 40_000, "nock1b")).await;
    h.shares
        .add_shares(vec![share(1, 300, now, 30), share(2, 700, now, 20), share(3, 100, now, 10)])
        .await;

    let blocks: Vec<Block> = (1..=20)
        .map(|i| confirmed_block(i, 10_000 + i, now + chrono::Duration::seconds(i as i64)))
        .collect();
    let results = join_all(blocks.iter().map(|b| {
        let orchestrator = h.orchestrator.clone();
        async move { orchestrator.process_block(b).await }
    }))
    .await;
    assert!(results.iter().all(|r| matches!(r, Ok(ProcessOutcome::Processed(_)))));

    let stats = h.orchestrator.get_stats().await;
    assert_eq!(stats.blocks_processed, 20);

    let queue_stats = h.queue.stats().await.unwrap();
    assert_eq!(h.ledger.total().await + queue_stats.pending_amount, stats.total_amount_credited);
    for user in [1, 2] {
        for payout in h.queue.history(user, 100).await.unwrap() {
            assert!(payout.amount >= if user == 1 { 25_000 } else { 40_000 });
        }
    }
}

#[tokio::test]
async fn mixed_modes_split_by_group_difficulty() {
    let mut config = PayoutConfig::default();
    config.pps.enabled = true;
    let h = harness(config);
    let now = Utc::now();

    let mut pps_user = UserPayoutSettings::default_for(1, 1_000_000);
    pps_user.payout_mode = PayoutMode::Pps;
    h.settings.set(pps_user).await;
    h.shares.add_shares(vec![share(1, 500, now, 10), share(2, 500, now, 20)]).await;

    h.orchestrator.process_block(&confirmed_block(1, 1_000_000_000, now)).await.unwrap();
    // PPS: 500 × 1e9 × 98% / 1e6. PPLNS group: half the block less 1%.
    assert_eq!(h.orchestrator.get_user_balance(1).await.unwrap(), 490_000);
    assert_eq!(h.orchestrator.get_user_balance(2).await.unwrap(), 495_000_000);

    // Same shares, later block: PPS shares are not paid twice
    h.orchestrator
        .process_block(&confirmed_block(2, 1_000_000_000, now + chrono::Duration::seconds(1)))
        .await
        .unwrap();
    assert_eq!(h.orchestrator.get_user_balance(1).await.unwrap(), 490_000);
    assert_eq!(h.orchestrator.get_user_balance(2).await.unwrap(), 990_000_000);
}

#[tokio::test]
async fn solo_finder_keeps_the_block() {
    let h = harness(PayoutConfig::default());
    let now = Utc::now();
    let mut solo = UserPayoutSettings::default_for(3, 1_000_000);
    solo.payout_mode = PayoutMode::Solo;
    h.settings.set(solo).await;
    h.shares
        .add_shares(vec![share(1, 5_000, now, 30), share(3, 10, now, 1).block_share()])
        .await;

    h.orchestrator.process_block(&confirmed_block(1, 1_000_000, now)).await.unwrap();
    assert_eq!(h.orchestrator.get_user_balance(3).await.unwrap(), 995_000);
    assert_eq!(h.orchestrator.get_user_balance(1).await.unwrap(), 0);

    // A pool-found block leaves the solo miner out
    h.shares
        .add_share(share(1, 1, now + chrono::Duration::seconds(10), 0).block_share())
        .await;
    h.orchestrator
        .process_block(&confirmed_block(2, 1_000_000, now + chrono::Duration::seconds(10)))
        .await
        .unwrap();
    assert_eq!(h.orchestrator.get_user_balance(3).await.unwrap(), 995_000);
    assert_eq!(h.orchestrator.get_user_balance(1).await.unwrap(), 990_000);
}

struct FlakyShares {
    inner: InMemoryShareStore,
    failed_once: AtomicBool,
}

#[async_trait]
impl ShareProvider for FlakyShares {
    async fn get_shares_in_window(
        &self,
        end_time: DateTime<Utc>,
        window: &ShareWindow,
    ) -> nockchain_pool_payouts::Result<Vec<Share>> {
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            return Err(PayoutError::ShareProvider("connection reset".into()));
        }
        self.inner.get_shares_in_window(end_time, window).await
    }
}

#[tokio::test]
async fn failed_block_can_be_redelivered() {
    let inner = InMemoryShareStore::new();
    let now = Utc::now();
    inner.add_share(share(1, 10, now, 5)).await;
    let provider = Arc::new(FlakyShares { inner, failed_once: AtomicBool::new(false) });
    let h = harness_with_shares(PayoutConfig::default(), Some(provider));
    let block = confirmed_block(3, 1_000, now);

    let err = h.orchestrator.process_block(&block).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(h.orchestrator.get_stats().await.error_count, 1);
    assert_eq!(h.orchestrator.get_user_balance(1).await.unwrap(), 0);

    assert!(matches!(h.orchestrator.process_block(&block).await.unwrap(), ProcessOutcome::Processed(_)));
    assert_eq!(h.orchestrator.get_user_balance(1).await.unwrap(), 990);
}

#[tokio::test]
async fn no_shares_is_a_successful_no_op() {
    let h = harness(PayoutConfig::default());
    let outcome = h.orchestrator.process_block(&confirmed_block(1, 1_000, Utc::now())).await.unwrap();

    let ProcessOutcome::Processed(summary) = outcome else {
        panic!("block was not processed");
    };
    assert_eq!(summary.users_credited, 0);
    assert_eq!(h.orchestrator.get_stats().await.blocks_processed, 1);
}

#[tokio::test]
async fn notifier_deliveries_are_drained_on_stop() {
    let h = harness(PayoutConfig::default());
    let now = Utc::now();
    h.shares.add_share(share(1, 10, now, 5)).await;

    h.orchestrator.start().unwrap();
    assert!(matches!(h.orchestrator.start(), Err(PayoutError::AlreadyRunning)));

    for id in 1..=5 {
        h.notifier.publish(confirmed_block(id, 1_000, now));
    }
    // Redelivery of block 5
    h.notifier.publish(confirmed_block(5, 1_000, now));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.orchestrator.get_stats().await.blocks_processed < 5 {
        assert!(tokio::time::Instant::now() < deadline, "blocks were not processed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.orchestrator.stop().await.unwrap();
    assert_eq!(h.orchestrator.get_stats().await.blocks_processed, 5);
    assert_eq!(h.ledger.get_balance(1).await.unwrap(), 5 * 990);
}

#[tokio::test]
async fn restarted_orchestrator_keeps_processing() {
    let h = harness(PayoutConfig::default());
    let now = Utc::now();
    h.shares.add_share(share(1, 10, now, 5)).await;

    h.orchestrator.start().unwrap();
    h.orchestrator.stop().await.unwrap();
    h.orchestrator.start().unwrap();

    h.notifier.publish(confirmed_block(1, 1_000, now));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.ledger.get_balance(1).await.unwrap() < 990 {
        assert!(tokio::time::Instant::now() < deadline, "block published after restart was not processed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.orchestrator.stop().await.unwrap();
    assert_eq!(h.orchestrator.get_stats().await.blocks_processed, 1);
}

/// Refuses every enqueue; everything else goes to the wrapped queue.
struct RejectingQueue {
    inner: InMemoryPayoutQueue,
}

#[async_trait]
impl PayoutQueue for RejectingQueue {
    async fn enqueue_batch(
        &self,
        _payouts: Vec<PendingPayout>,
    ) -> nockchain_pool_payouts::Result<Vec<PendingPayout>> {
        Err(PayoutError::Queue("queue is full".into()))
    }

    async fn get(&self, id: Uuid) -> nockchain_pool_payouts::Result<PendingPayout> {
        self.inner.get(id).await
    }

    async fn get_pending(
        &self,
        limit: usize,
    ) -> nockchain_pool_payouts::Result<Vec<PendingPayout>> {
        self.inner.get_pending(limit).await
    }

    async fn mark_processing(
        &self,
        id: Uuid,
    ) -> nockchain_pool_payouts::Result<PendingPayout> {
        self.inner.mark_processing(id).await
    }

    async fn mark_processed(
        &self,
        id: Uuid,
        tx_hash: &str,
    ) -> nockchain_pool_payouts::Result<PendingPayout> {
        self.inner.mark_processed(id, tx_hash).await
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        reason: &str,
    ) -> nockchain_pool_payouts::Result<PendingPayout> {
        self.inner.mark_failed(id, reason).await
    }

    async fn cancel(&self, id: Uuid) -> nockchain_pool_payouts::Result<PendingPayout> {
        self.inner.cancel(id).await
    }

    async fn revoke(&self, id: Uuid) -> nockchain_pool_payouts::Result<PendingPayout> {
        self.inner.revoke(id).await
    }

    async fn history(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> nockchain_pool_payouts::Result<Vec<PendingPayout>> {
        self.inner.history(user_id, limit).await
    }

    async fn stats(&self) -> nockchain_pool_payouts::Result<QueueStats> {
        self.inner.stats().await
    }
}

#[tokio::test]
async fn rejected_enqueue_leaves_credit_in_balance() {
    let shares = InMemoryShareStore::new();
    let settings = InMemorySettingsStore::new(1_000_000);
    let ledger = Arc::new(InMemoryLedger::new());
    let queue = Arc::new(RejectingQueue { inner: InMemoryPayoutQueue::new(ledger.clone()) });
    let orchestrator = orchestrator_with(&shares, &settings, ledger.clone(), queue.clone());

    let now = Utc::now();
    settings.set(auto_payout(1, 1, "nock1miner")).await;
    shares.add_share(share(1, 10, now, 5)).await;

    let ProcessOutcome::Processed(summary) = orchestrator.process_block(&confirmed_block(1, 1_000, now)).await.unwrap()
    else {
        panic!("block was not processed");
    };
    assert_eq!(summary.users_credited, 1);
    assert_eq!(summary.payouts_queued, 0);
    assert_eq!(summary.failures, 1);

    assert_eq!(ledger.get_balance(1).await.unwrap(), 990);
    assert!(queue.get_pending(10).await.unwrap().is_empty());
    let stats = orchestrator.get_stats().await;
    assert_eq!(stats.error_count, 1);
    assert_eq!(stats.payouts_queued, 0);
    assert_eq!(stats.total_amount_credited, 990);
}

/// Credits and refunds work; debits always fail.
struct NoDebitLedger {
    inner: InMemoryLedger,
}

#[async_trait]
impl BalanceLedger for NoDebitLedger {
    async fn get_balance(&self, user_id: UserId) -> nockchain_pool_payouts::Result<Amount> {
        self.inner.get_balance(user_id).await
    }

    async fn add_to_balance(&self, user_id: UserId, amount: Amount) -> nockchain_pool_payouts::Result<Amount> {
        self.inner.add_to_balance(user_id, amount).await
    }

    async fn deduct_from_balance(&self, _user_id: UserId, _amount: Amount) -> nockchain_pool_payouts::Result<Amount> {
        Err(redis::RedisError::from((redis::ErrorKind::IoError, "ledger unavailable")).into())
    }
}

#[tokio::test]
async fn failed_debit_revokes_queued_payouts() {
    let shares = InMemoryShareStore::new();
    let settings = InMemorySettingsStore::new(1_000_000);
    let ledger = Arc::new(NoDebitLedger { inner: InMemoryLedger::new() });
    let queue = Arc::new(InMemoryPayoutQueue::new(ledger.clone()));
    let orchestrator = orchestrator_with(&shares, &settings, ledger.clone(), queue.clone());

    let now = Utc::now();
    settings.set(auto_payout(1, 1, "nock1miner")).await;
    shares.add_share(share(1, 10, now, 5)).await;

    orchestrator.process_block(&confirmed_block(1, 1_000, now)).await.unwrap();

    // No payout may go out for money still sitting in the balance
    assert_eq!(ledger.get_balance(1).await.unwrap(), 990);
    assert!(queue.get_pending(10).await.unwrap().is_empty());
    let history = queue.history(1, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, PayoutStatus::Cancelled);
    assert_eq!(orchestrator.get_stats().await.error_count, 1);
}

#[tokio::test]
async fn estimate_matches_what_a_block_would_credit() {
    let h = harness(PayoutConfig::default());
    let now = Utc::now();
    let mut solo = UserPayoutSettings::default_for(3, 1_000_000);
    solo.payout_mode = PayoutMode::Solo;
    h.settings.set(solo).await;
    h.shares
        .add_shares(vec![share(1, 500, now, 10), share(2, 500, now, 20), share(3, 1, now, 30)])
        .await;

    assert_eq!(h.orchestrator.estimate_payout(1, 1_000_000_000).await.unwrap(), 495_000_000);
    assert_eq!(h.orchestrator.estimate_payout(2, 1_000_000_000).await.unwrap(), 495_000_000);
    // As if their own share found the block
    assert_eq!(h.orchestrator.estimate_payout(3, 1_000_000).await.unwrap(), 995_000);
    assert_eq!(h.orchestrator.estimate_payout(9, 1_000_000_000).await.unwrap(), 0);
    assert_eq!(h.orchestrator.estimate_payout(1, 0).await.unwrap(), 0);

    // Estimating credits nothing
    assert_eq!(h.ledger.total().await, 0);
    assert_eq!(h.orchestrator.get_stats().await, ExecutorStats::default());
}

#[tokio::test]
async fn credited_block_passes_fairness_check() {
    let h = harness(PayoutConfig::default());
    let now = Utc::now();
    h.shares.add_shares(vec![share(1, 300, now, 10), share(2, 700, now, 20)]).await;
    let block = confirmed_block(1, 1_000_000, now);

    let ProcessOutcome::Processed(summary) = h.orchestrator.process_block(&block).await.unwrap() else {
        panic!("block was not processed");
    };
    let validation = h.orchestrator.validate_payout_fairness(&block, &summary.credited).await.unwrap();
    assert!(validation.is_valid, "{:?}", validation.discrepancies);
    assert_eq!(validation.block_id, 1);
    assert_eq!(validation.expected_payouts.len(), 2);

    let mut skewed = summary.credited.clone();
    skewed[0].amount += 1;
    let validation = h.orchestrator.validate_payout_fairness(&block, &skewed).await.unwrap();
    assert!(!validation.is_valid);
    assert_eq!(validation.discrepancies.len(), 1);
    assert_eq!(validation.discrepancies[0].kind, DiscrepancyKind::AmountMismatch);

    let validation = h.orchestrator.validate_payout_fairness(&block, &summary.credited[1..]).await.unwrap();
    let kinds: Vec<DiscrepancyKind> = validation.discrepancies.iter().map(|d| d.kind).collect();
    assert_eq!(kinds, vec![DiscrepancyKind::CountMismatch, DiscrepancyKind::MissingPayout]);
    assert_eq!(validation.discrepancies[1].user_id, Some(summary.credited[0].user_id));
}

#[tokio::test]
async fn payout_statistics_cover_queued_payouts() {
    let h = harness(PayoutConfig::default());
    let before = Utc::now() - chrono::Duration::seconds(1);
    let now = Utc::now();
    h.settings.set(auto_payout(1, 1, "nock1miner")).await;
    h.shares.add_share(share(1, 10, now, 5)).await;

    h.orchestrator.process_block(&confirmed_block(1, 1_000, now)).await.unwrap();
    h.orchestrator
        .process_block(&confirmed_block(2, 3_000, now + chrono::Duration::seconds(1)))
        .await
        .unwrap();

    let stats = h.orchestrator.get_payout_statistics(1, before).await.unwrap();
    assert_eq!(stats.payout_count, 2);
    assert_eq!(stats.total_payout, 990 + 2_970);
    assert_eq!(stats.average_payout, (990 + 2_970) / 2);
    assert!(stats.last_payout.is_some());
    assert_eq!(h.orchestrator.get_payout_statistics(2, before).await.unwrap().payout_count, 0);
}
