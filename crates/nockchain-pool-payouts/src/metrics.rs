use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, TextEncoder};

lazy_static! {
    pub static ref BLOCKS_PROCESSED: IntCounter = IntCounter::new(
        "pool_payout_blocks_processed_total",
        "Confirmed blocks whose rewards were credited"
    ).unwrap();

    pub static ref DUPLICATE_BLOCKS: IntCounter = IntCounter::new(
        "pool_payout_duplicate_blocks_total",
        "Block deliveries skipped because the block was already credited"
    ).unwrap();

    pub static ref PAYOUTS_QUEUED: IntCounter = IntCounter::new(
        "pool_payouts_queued_total",
        "Automatic payouts placed on the payout queue"
    ).unwrap();

    pub static ref AMOUNT_CREDITED: Counter = Counter::new(
        "pool_payout_amount_credited_total",
        "Total amount credited to user balances, in smallest units"
    ).unwrap();

    pub static ref PROCESSING_ERRORS: IntCounter = IntCounter::new(
        "pool_payout_errors_total",
        "Block and per-user credit failures"
    ).unwrap();

    pub static ref BLOCKS_IN_FLIGHT: IntGauge = IntGauge::new(
        "pool_payout_blocks_in_flight",
        "Blocks currently being processed"
    ).unwrap();

    pub static ref BLOCK_PROCESSING_TIME: Histogram = Histogram::with_opts(
        HistogramOpts::new("pool_payout_block_processing_seconds", "Time to credit one block")
    ).unwrap();
}

pub fn register_metrics() -> prometheus::Result<()> {
    prometheus::register(Box::new(BLOCKS_PROCESSED.clone()))?;
    prometheus::register(Box::new(DUPLICATE_BLOCKS.clone()))?;
    prometheus::register(Box::new(PAYOUTS_QUEUED.clone()))?;
    prometheus::register(Box::new(AMOUNT_CREDITED.clone()))?;
    prometheus::register(Box::new(PROCESSING_ERRORS.clone()))?;
    prometheus::register(Box::new(BLOCKS_IN_FLIGHT.clone()))?;
    prometheus::register(Box::new(BLOCK_PROCESSING_TIME.clone()))?;
    Ok(())
}

pub fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
