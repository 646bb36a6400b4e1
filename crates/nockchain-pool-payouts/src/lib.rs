pub mod allocation;
pub mod calculators;
pub mod config;
pub mod database;
pub mod error;
pub mod fairness;
pub mod ledger;
pub mod locks;
pub mod metrics;
pub mod notifier;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod settings;
pub mod shares;
pub mod splits;

pub use calculators::{CalculatorSet, Payout, PayoutMode, RewardCalculator};
pub use config::PayoutConfig;
pub use error::{PayoutError, Result};
pub use fairness::{DiscrepancyKind, PayoutDiscrepancy, PayoutValidation};
pub use orchestrator::{Backends, ExecutorStats, PayoutOrchestrator, ProcessOutcome};
