//! Turns confirmed blocks into balance credits and automatic payouts.
//!
//! Per block: validate → fetch shares → calculate every user's credit → credit the ledger →
//! evaluate auto-payout. Calculation for the whole block finishes before the first credit, so a
//! block that fails early leaves no trace and can be redelivered.
//!
//! Users are grouped by the payout mode they resolve to. The block reward is divided between
//! the groups by the valid difficulty each contributed, and each group's calculator then splits
//! its portion among its own members. SOLO users only share in blocks a SOLO user found, and
//! the PPS group's portion stays with the pool, which pays PPS users at the configured rate.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::allocation::largest_remainder;
use crate::calculators::{newest_first, CalculatorSet, Payout, PayoutMode};
use crate::config::PayoutConfig;
use crate::database::{Amount, Block, BlockId, PendingPayout, Share, UserId, UserPayoutSettings};
use crate::error::{PayoutError, Result};
use crate::fairness::{compare_payouts, PayoutValidation};
use crate::ledger::BalanceLedger;
use crate::locks::UserLocks;
use crate::metrics;
use crate::notifier::BlockNotifier;
use crate::queue::{PayoutQueue, PayoutStatistics};
use crate::registry::BlockRegistry;
use crate::settings::UserSettingsProvider;
use crate::shares::{ShareProvider, ShareWindow};
use crate::splits::{calculate_split_payouts, WalletRepository, WalletSplitResolver};

/// Storage the orchestrator works against.
#[derive(Clone)]
pub struct Backends {
    pub shares: Arc<dyn ShareProvider>,
    pub settings: Arc<dyn UserSettingsProvider>,
    pub ledger: Arc<dyn BalanceLedger>,
    pub queue: Arc<dyn PayoutQueue>,
    pub wallets: Arc<dyn WalletRepository>,
    pub registry: Arc<dyn BlockRegistry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStats {
    pub blocks_processed: u64,
    pub payouts_calculated: u64,
    pub payouts_queued: u64,
    pub total_amount_credited: Amount,
    pub error_count: u64,
    pub last_block_processed: Option<BlockId>,
    pub last_processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub block_id: BlockId,
    pub payouts_calculated: u64,
    pub users_credited: u64,
    pub amount_credited: Amount,
    pub payouts_queued: u64,
    pub failures: u64,
    /// Credits that reached the ledger, in order.
    pub credited: Vec<Payout>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed(BlockSummary),
    /// The block id was credited before; nothing was touched.
    AlreadyProcessed,
}

struct BlockPlan {
    payouts: Vec<Payout>,
    settings: HashMap<UserId, UserPayoutSettings>,
}

struct CreditResult {
    queued: u64,
    auto_payout_failed: bool,
}

pub struct PayoutOrchestrator {
    calculators: CalculatorSet,
    share_window: ShareWindow,
    default_min_payout: Amount,
    drain_timeout: Duration,

    backends: Backends,
    wallets: WalletSplitResolver,
    notifier: Arc<dyn BlockNotifier>,

    stats: RwLock<ExecutorStats>,
    user_locks: UserLocks,
    pps_lock: Mutex<()>,

    running: AtomicBool,
    tasks: TaskTracker,
    shutdown: StdMutex<CancellationToken>,
}

impl PayoutOrchestrator {
    pub fn new(config: &PayoutConfig, backends: Backends, notifier: Arc<dyn BlockNotifier>) -> Result<Self> {
        let calculators = CalculatorSet::from_config(config)?;

        let mut share_window = calculators.share_window();
        if share_window.is_empty() {
            // Only PPS/SOLO enabled; they still need recent shares
            share_window = ShareWindow::difficulty(config.pplns_window_size);
        }

        info!(
            "Payout orchestrator ready: default mode {}, modes [{}]",
            calculators.default_mode(),
            calculators.modes().map(|m| m.as_str()).collect::<Vec<_>>().join(", ")
        );

        Ok(Self {
            calculators,
            share_window,
            default_min_payout: config.default_min_payout,
            drain_timeout: config.drain_timeout(),
            wallets: WalletSplitResolver::new(backends.wallets.clone()),
            backends,
            notifier,
            stats: RwLock::new(ExecutorStats::default()),
            user_locks: UserLocks::new(),
            pps_lock: Mutex::new(()),
            running: AtomicBool::new(false),
            tasks: TaskTracker::new(),
            shutdown: StdMutex::new(CancellationToken::new()),
        })
    }

    pub fn calculators(&self) -> &CalculatorSet {
        &self.calculators
    }

    pub fn wallets(&self) -> &WalletSplitResolver {
        &self.wallets
    }

    pub fn queue(&self) -> &Arc<dyn PayoutQueue> {
        &self.backends.queue
    }

    pub async fn get_stats(&self) -> ExecutorStats {
        self.stats.read().await.clone()
    }

    pub async fn get_pending_payouts(&self, limit: usize) -> Result<Vec<PendingPayout>> {
        self.backends.queue.get_pending(limit).await
    }

    pub async fn get_user_balance(&self, user_id: UserId) -> Result<Amount> {
        self.backends.ledger.get_balance(user_id).await
    }

    pub async fn get_payout_statistics(&self, user_id: UserId, since: DateTime<Utc>) -> Result<PayoutStatistics> {
        self.backends.queue.statistics(user_id, since).await
    }

    /// What the user would be credited if a block of `estimated_reward` were found now.
    ///
    /// SOLO users are estimated as the finder. PPS users get their rate for the shares not yet
    /// paid for, whatever the reward. Nothing is credited and the PPS mark does not move.
    pub async fn estimate_payout(&self, user_id: UserId, estimated_reward: Amount) -> Result<Amount> {
        if estimated_reward == 0 {
            return Ok(0);
        }
        let now = Utc::now();
        let shares = self.backends.shares.get_shares_in_window(now, &self.share_window).await?;
        let mode = self.calculators.resolve(self.user_settings(user_id).await.payout_mode);

        let payouts = match mode {
            PayoutMode::Pps | PayoutMode::Solo => {
                let calculator = self.calculators.get(mode).ok_or(PayoutError::NoCalculator(mode))?;
                let paid_through = if mode == PayoutMode::Pps {
                    self.backends.registry.pps_paid_through().await?
                } else {
                    None
                };
                let own: Vec<Share> = shares
                    .into_iter()
                    .filter(|s| s.user_id == user_id && paid_through.map_or(true, |p| s.timestamp > p))
                    .collect();
                calculator.calculate_payouts(&own, estimated_reward, 0, now)?
            }
            _ => {
                let (_, groups) = self.group_by_mode(shares).await;
                self.pooled_payouts(&groups, estimated_reward, now, None)?
            }
        };

        Ok(payouts.iter().filter(|p| p.user_id == user_id).map(|p| p.amount).sum())
    }

    /// Recomputes a block's non-PPS credits from the share store and compares them with
    /// `credited`, usually [`BlockSummary::credited`].
    ///
    /// PPS credits are left out on both sides: they depend on the paid-through mark at the time
    /// the block was processed. Settings are read as they are now, so a user who changed mode
    /// since shows up as a discrepancy.
    pub async fn validate_payout_fairness(&self, block: &Block, credited: &[Payout]) -> Result<PayoutValidation> {
        let shares = self
            .backends
            .shares
            .get_shares_in_window(block.timestamp, &self.share_window)
            .await?;

        let expected = if shares.is_empty() || block.reward == 0 {
            Vec::new()
        } else {
            let (_, groups) = self.group_by_mode(shares).await;
            let finder_mode = block_finder_mode(&groups, block.timestamp);
            self.pooled_payouts(&groups, block.reward, block.timestamp, finder_mode)?
        };
        let actual: Vec<Payout> = credited.iter().filter(|p| p.mode != PayoutMode::Pps).cloned().collect();

        let validation = compare_payouts(block.id, expected, actual);
        if !validation.is_valid {
            warn!(
                block_id = block.id,
                discrepancies = validation.discrepancies.len(),
                "Block payouts do not match recomputation"
            );
        }
        Ok(validation)
    }

    /// Credits one block. Redelivery of an already credited block returns
    /// [`ProcessOutcome::AlreadyProcessed`]; a block that fails is released so it can be retried.
    pub async fn process_block(&self, block: &Block) -> Result<ProcessOutcome> {
        if !block.is_confirmed() {
            warn!(block_id = block.id, status = %block.status, "Ignoring unconfirmed block");
            return Err(PayoutError::BlockNotConfirmed { id: block.id, status: block.status });
        }

        let claimed = match self.backends.registry.claim(block.id).await {
            Ok(claimed) => claimed,
            Err(e) => {
                self.record_failure().await;
                return Err(e);
            }
        };
        if !claimed {
            metrics::DUPLICATE_BLOCKS.inc();
            info!(block_id = block.id, "Block already credited, skipping");
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        let _timer = metrics::BLOCK_PROCESSING_TIME.start_timer();
        metrics::BLOCKS_IN_FLIGHT.inc();
        info!(block_id = block.id, reward = block.reward, hash = %block.hash, "Processing block");

        let result = match self.plan_block(block).await {
            Ok(plan) => Ok(self.apply_plan(block, plan).await),
            Err(e) => Err(e),
        };
        metrics::BLOCKS_IN_FLIGHT.dec();

        match result {
            Ok(summary) => {
                self.record_success(&summary).await;
                info!(
                    block_id = block.id,
                    users = summary.users_credited,
                    amount = summary.amount_credited,
                    queued = summary.payouts_queued,
                    failures = summary.failures,
                    "Block credited"
                );
                Ok(ProcessOutcome::Processed(summary))
            }
            Err(e) => {
                if let Err(release_err) = self.backends.registry.release(block.id).await {
                    error!(block_id = block.id, "Failed to release block claim: {}", release_err);
                }
                self.record_failure().await;
                error!(block_id = block.id, retryable = e.is_retryable(), "Block processing failed: {}", e);
                Err(e)
            }
        }
    }

    // Everything that can fail for the block as a whole happens here, before any credit.
    async fn plan_block(&self, block: &Block) -> Result<BlockPlan> {
        let shares = self
            .backends
            .shares
            .get_shares_in_window(block.timestamp, &self.share_window)
            .await?;

        if shares.is_empty() || block.reward == 0 {
            debug!(block_id = block.id, "No shares or no reward, nothing to credit");
            return Ok(BlockPlan { payouts: Vec::new(), settings: HashMap::new() });
        }

        let (settings, groups) = self.group_by_mode(shares).await;
        let finder_mode = block_finder_mode(&groups, block.timestamp);
        let mut payouts = self.pooled_payouts(&groups, block.reward, block.timestamp, finder_mode)?;

        // Last, so nothing after the PPS claim can fail the block
        if let Some(pps_shares) = groups.get(&PayoutMode::Pps) {
            payouts.extend(self.plan_pps(block, pps_shares).await?);
        }

        Ok(BlockPlan { payouts, settings })
    }

    async fn group_by_mode(
        &self,
        shares: Vec<Share>,
    ) -> (HashMap<UserId, UserPayoutSettings>, BTreeMap<PayoutMode, Vec<Share>>) {
        let mut by_user: BTreeMap<UserId, Vec<Share>> = BTreeMap::new();
        for share in shares {
            by_user.entry(share.user_id).or_default().push(share);
        }

        let mut settings = HashMap::with_capacity(by_user.len());
        let mut groups: BTreeMap<PayoutMode, Vec<Share>> = BTreeMap::new();
        for (user_id, user_shares) in by_user {
            let user_settings = self.user_settings(user_id).await;
            let mode = self.calculators.resolve(user_settings.payout_mode);
            groups.entry(mode).or_default().extend(user_shares);
            settings.insert(user_id, user_settings);
        }
        (settings, groups)
    }

    // Credits for every group except PPS, whose portion stays with the pool.
    fn pooled_payouts(
        &self,
        groups: &BTreeMap<PayoutMode, Vec<Share>>,
        reward: Amount,
        block_time: DateTime<Utc>,
        finder_mode: Option<PayoutMode>,
    ) -> Result<Vec<Payout>> {
        let mut payouts = Vec::new();
        for (mode, portion) in group_portions(groups, reward, block_time, finder_mode) {
            if mode == PayoutMode::Pps {
                debug!(retained = portion, "PPS portion retained by pool");
                continue;
            }
            let calculator = self.calculators.get(mode).ok_or(PayoutError::NoCalculator(mode))?;
            payouts.extend(calculator.calculate_payouts(&groups[&mode], portion, 0, block_time)?);
        }
        Ok(payouts)
    }

    // Pays PPS shares submitted since the last paid-through mark, then moves the mark to this
    // block. The mark only moves once the payouts are computed.
    async fn plan_pps(&self, block: &Block, shares: &[Share]) -> Result<Vec<Payout>> {
        let calculator = self
            .calculators
            .get(PayoutMode::Pps)
            .ok_or(PayoutError::NoCalculator(PayoutMode::Pps))?;

        let _guard = self.pps_lock.lock().await;
        let previous = self.backends.registry.pps_paid_through().await?;
        let unpaid: Vec<Share> = shares
            .iter()
            .filter(|s| previous.map_or(true, |p| s.timestamp > p))
            .cloned()
            .collect();

        let payouts = calculator.calculate_payouts(&unpaid, block.reward, 0, block.timestamp)?;
        if previous.map_or(true, |p| p < block.timestamp) {
            self.backends.registry.set_pps_paid_through(Some(block.timestamp)).await?;
        }
        Ok(payouts)
    }

    async fn apply_plan(&self, block: &Block, plan: BlockPlan) -> BlockSummary {
        let mut summary = BlockSummary {
            block_id: block.id,
            payouts_calculated: plan.payouts.len() as u64,
            ..BlockSummary::default()
        };

        for payout in &plan.payouts {
            let settings = plan
                .settings
                .get(&payout.user_id)
                .cloned()
                .unwrap_or_else(|| UserPayoutSettings::default_for(payout.user_id, self.default_min_payout));

            match self.credit_user(block, payout, &settings).await {
                Ok(result) => {
                    summary.users_credited += 1;
                    summary.amount_credited = summary.amount_credited.saturating_add(payout.amount);
                    summary.payouts_queued += result.queued;
                    if result.auto_payout_failed {
                        summary.failures += 1;
                    }
                    summary.credited.push(payout.clone());
                }
                Err(e) => {
                    summary.failures += 1;
                    metrics::PROCESSING_ERRORS.inc();
                    warn!(
                        block_id = block.id,
                        user_id = payout.user_id,
                        amount = payout.amount,
                        "Failed to credit user: {}", e
                    );
                }
            }
        }

        summary
    }

    // credit → read balance → enqueue → debit, under the user's lock so two blocks cannot both
    // pass the threshold check on the same balance.
    async fn credit_user(&self, block: &Block, payout: &Payout, settings: &UserPayoutSettings) -> Result<CreditResult> {
        let _guard = self.user_locks.lock(payout.user_id).await;

        let balance = self.backends.ledger.add_to_balance(payout.user_id, payout.amount).await?;
        metrics::AMOUNT_CREDITED.inc_by(payout.amount as f64);
        debug!(block_id = block.id, user_id = payout.user_id, amount = payout.amount, balance, "Credited user");

        match self.auto_payout(block, payout.mode, settings, balance).await {
            Ok(queued) => Ok(CreditResult { queued, auto_payout_failed: false }),
            Err(e) => {
                metrics::PROCESSING_ERRORS.inc();
                warn!(block_id = block.id, user_id = payout.user_id, balance, "Auto-payout skipped: {}", e);
                Ok(CreditResult { queued: 0, auto_payout_failed: true })
            }
        }
    }

    async fn auto_payout(
        &self,
        block: &Block,
        mode: PayoutMode,
        settings: &UserPayoutSettings,
        balance: Amount,
    ) -> Result<u64> {
        if !settings.auto_payout_enable || balance == 0 || balance < settings.min_payout_amount {
            return Ok(0);
        }

        let user_id = settings.user_id;
        let destinations = self.payout_destinations(settings, balance).await?;
        if destinations.is_empty() {
            debug!(user_id, balance, "Auto-payout enabled but no destination configured");
            return Ok(0);
        }

        let batch: Vec<PendingPayout> = destinations
            .into_iter()
            .map(|(address, amount)| PendingPayout::new(user_id, amount, address, mode, block.id))
            .collect();
        let queued = self.backends.queue.enqueue_batch(batch).await?;
        let total: Amount = queued.iter().map(|p| p.amount).sum();

        // Enqueue first: if it fails the balance is still whole
        if let Err(e) = self.backends.ledger.deduct_from_balance(user_id, total).await {
            warn!(user_id, total, "Balance debit failed, revoking queued payouts: {}", e);
            for payout in &queued {
                if let Err(revoke_err) = self.backends.queue.revoke(payout.id).await {
                    error!(
                        user_id,
                        payout_id = %payout.id,
                        amount = payout.amount,
                        "Payout queued without debit could not be revoked: {}", revoke_err
                    );
                }
            }
            return Err(e);
        }

        metrics::PAYOUTS_QUEUED.inc_by(queued.len() as u64);
        info!(user_id, amount = total, payouts = queued.len(), block_id = block.id, "Queued automatic payout");
        Ok(queued.len() as u64)
    }

    // Active wallets take precedence over the single payout address.
    async fn payout_destinations(&self, settings: &UserPayoutSettings, balance: Amount) -> Result<Vec<(String, Amount)>> {
        let wallets = self.wallets.get_active_wallets(settings.user_id).await?;
        if !wallets.is_empty() {
            return Ok(calculate_split_payouts(&wallets, balance)?
                .into_iter()
                .map(|split| (split.address, split.amount))
                .collect());
        }
        if !settings.payout_address.trim().is_empty() {
            return Ok(vec![(settings.payout_address.clone(), balance)]);
        }
        Ok(Vec::new())
    }

    async fn user_settings(&self, user_id: UserId) -> UserPayoutSettings {
        match self.backends.settings.get_user_payout_settings(user_id).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(user_id, "Settings lookup failed, using defaults: {}", e);
                UserPayoutSettings::default_for(user_id, self.default_min_payout)
            }
        }
    }

    async fn record_success(&self, summary: &BlockSummary) {
        metrics::BLOCKS_PROCESSED.inc();
        let mut stats = self.stats.write().await;
        stats.blocks_processed += 1;
        stats.payouts_calculated += summary.payouts_calculated;
        stats.payouts_queued += summary.payouts_queued;
        stats.total_amount_credited = stats.total_amount_credited.saturating_add(summary.amount_credited);
        stats.error_count += summary.failures;
        stats.last_block_processed = Some(summary.block_id);
        stats.last_processed_at = Some(Utc::now());
    }

    async fn record_failure(&self) {
        metrics::PROCESSING_ERRORS.inc();
        self.stats.write().await.error_count += 1;
    }

    fn shutdown_token(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.shutdown.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribes to the block notifier and processes every delivered block in its own task.
    /// Can be called again after [`stop`](Self::stop) returns.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PayoutError::AlreadyRunning);
        }
        let shutdown = CancellationToken::new();
        *self.shutdown_token() = shutdown.clone();
        self.tasks.reopen();

        let blocks = self.notifier.subscribe();
        let this = self.clone();
        self.tasks.spawn(this.listen(blocks, shutdown));
        info!("Payout orchestrator started");
        Ok(())
    }

    /// Stops taking new blocks and waits for in-flight ones to finish.
    pub async fn stop(&self) -> Result<()> {
        self.shutdown_token().cancel();
        self.tasks.close();

        if tokio::time::timeout(self.drain_timeout, self.tasks.wait()).await.is_err() {
            let remaining = self.tasks.len();
            error!("Drain timed out with {} block tasks still running", remaining);
            return Err(PayoutError::DrainTimeout(remaining));
        }
        self.running.store(false, Ordering::SeqCst);
        info!("Payout orchestrator stopped");
        Ok(())
    }

    async fn listen(self: Arc<Self>, mut blocks: broadcast::Receiver<Block>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = blocks.recv() => match received {
                    Ok(block) => {
                        let this = self.clone();
                        // Outcomes and failures are logged inside process_block
                        self.tasks.spawn(async move {
                            let _ = this.process_block(&block).await;
                        });
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Block listener lagged, {} notifications dropped", skipped);
                    }
                    Err(RecvError::Closed) => {
                        info!("Block notifier closed");
                        break;
                    }
                },
            }
        }
    }
}

// The newest solution at or before the block is the one that found it. Same order the SOLO
// calculator uses to pick its winner.
fn block_finder_mode(groups: &BTreeMap<PayoutMode, Vec<Share>>, block_time: DateTime<Utc>) -> Option<PayoutMode> {
    groups
        .iter()
        .flat_map(|(mode, shares)| shares.iter().map(move |s| (*mode, s)))
        .filter(|(_, s)| s.is_block && s.is_valid && s.timestamp <= block_time)
        .min_by(|(_, a), (_, b)| newest_first(a, b))
        .map(|(mode, _)| mode)
}

// Splits the block reward between mode groups by each group's valid difficulty at or before
// the block. SOLO users take part only when one of them found the block, or when nobody else
// contributed anything.
fn group_portions(
    groups: &BTreeMap<PayoutMode, Vec<Share>>,
    reward: Amount,
    block_time: DateTime<Utc>,
    finder_mode: Option<PayoutMode>,
) -> Vec<(PayoutMode, Amount)> {
    let weight = |shares: &[Share]| -> u128 {
        shares
            .iter()
            .filter(|s| s.is_valid && s.timestamp <= block_time)
            .map(|s| s.difficulty as u128)
            .sum()
    };

    let solo_found = finder_mode == Some(PayoutMode::Solo);
    let mut weights: Vec<(PayoutMode, u128)> = groups
        .iter()
        .filter(|(mode, _)| (**mode == PayoutMode::Solo) == solo_found)
        .map(|(mode, shares)| (*mode, weight(shares)))
        .filter(|(_, w)| *w > 0)
        .collect();

    if weights.is_empty() && !solo_found {
        if let Some(solo) = groups.get(&PayoutMode::Solo) {
            weights.push((PayoutMode::Solo, weight(solo)));
        }
    }

    largest_remainder(reward, &weights)
        .into_iter()
        .filter(|(_, amount)| *amount > 0)
        .collect()
}
