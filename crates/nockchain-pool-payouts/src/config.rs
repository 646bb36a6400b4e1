use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::calculators::PayoutMode;
use crate::database::{Amount, Percentage};
use crate::error::{PayoutError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModeConfig {
    pub enabled: bool,
    pub fee_percent: f64,
}

impl ModeConfig {
    fn defaults_for(mode: PayoutMode, enabled: bool) -> Self {
        Self { enabled, fee_percent: mode.default_fee_percent() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PayoutConfig {
    pub default_mode: PayoutMode,

    pub pps: ModeConfig,
    pub pplns: ModeConfig,
    pub slice: ModeConfig,
    pub score: ModeConfig,
    pub solo: ModeConfig,

    /// Total share difficulty covered by the PPLNS and SCORE windows.
    pub pplns_window_size: u64,
    pub score_decay_factor: f64,
    pub slice_count: u32,
    pub slice_duration_secs: u64,
    pub slice_decay_factor: f64,

    pub pps_network_difficulty: u64,
    pub pps_expected_block_reward: Amount,

    /// Threshold used for users without stored settings.
    pub default_min_payout: Amount,
    pub drain_timeout_secs: u64,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            default_mode: PayoutMode::Pplns,
            // PPS puts the variance on the pool, so it has to be switched on deliberately
            pps: ModeConfig::defaults_for(PayoutMode::Pps, false),
            pplns: ModeConfig::defaults_for(PayoutMode::Pplns, true),
            slice: ModeConfig::defaults_for(PayoutMode::Slice, true),
            score: ModeConfig::defaults_for(PayoutMode::Score, true),
            solo: ModeConfig::defaults_for(PayoutMode::Solo, true),
            pplns_window_size: 200_000,
            score_decay_factor: 0.5,
            slice_count: 10,
            slice_duration_secs: 600,
            slice_decay_factor: 0.7,
            pps_network_difficulty: 1_000_000,
            pps_expected_block_reward: 1_000_000_000,
            default_min_payout: 1_000_000,
            drain_timeout_secs: 30,
        }
    }
}

impl PayoutConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PayoutError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: PayoutConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn mode(&self, mode: PayoutMode) -> &ModeConfig {
        match mode {
            PayoutMode::Pps => &self.pps,
            PayoutMode::Pplns => &self.pplns,
            PayoutMode::Slice => &self.slice,
            PayoutMode::Score => &self.score,
            PayoutMode::Solo => &self.solo,
        }
    }

    pub fn enabled_modes(&self) -> Vec<PayoutMode> {
        PayoutMode::ALL.into_iter().filter(|m| self.mode(*m).enabled).collect()
    }

    pub fn fee_for_mode(&self, mode: PayoutMode) -> Result<Percentage> {
        let percent = self.mode(mode).fee_percent;
        match Percentage::from_percent(percent) {
            Some(fee) if fee <= Percentage::FULL => Ok(fee),
            _ => Err(PayoutError::Configuration(format!(
                "{} fee must be between 0 and 100, got {}",
                mode, percent
            ))),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.enabled_modes().is_empty() {
            return Err(PayoutError::Configuration("no payout mode enabled".into()));
        }
        if !self.mode(self.default_mode).enabled {
            return Err(PayoutError::Configuration(format!(
                "default mode {} is not enabled",
                self.default_mode
            )));
        }
        for mode in PayoutMode::ALL {
            self.fee_for_mode(mode)?;
        }
        if self.pplns_window_size == 0 {
            return Err(PayoutError::Configuration("pplns_window_size must be positive".into()));
        }
        if self.slice_count == 0 || self.slice_duration_secs == 0 {
            return Err(PayoutError::Configuration(
                "slice_count and slice_duration_secs must be positive".into(),
            ));
        }
        for (name, decay) in [
            ("score_decay_factor", self.score_decay_factor),
            ("slice_decay_factor", self.slice_decay_factor),
        ] {
            if !(decay > 0.0 && decay <= 1.0) {
                return Err(PayoutError::Configuration(format!(
                    "{} must be in (0, 1], got {}",
                    name, decay
                )));
            }
        }
        if self.pps.enabled && self.pps_network_difficulty == 0 {
            return Err(PayoutError::Configuration(
                "pps_network_difficulty must be positive when PPS is enabled".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PayoutConfig::default();
        config.validate().unwrap();
        assert_eq!(
            config.enabled_modes(),
            vec![PayoutMode::Pplns, PayoutMode::Score, PayoutMode::Solo, PayoutMode::Slice]
        );
        assert_eq!(config.fee_for_mode(PayoutMode::Slice).unwrap(), Percentage::from_basis_points(80));
        assert_eq!(config.fee_for_mode(PayoutMode::Pps).unwrap(), Percentage::whole(2));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = PayoutConfig::default();
        config.solo.fee_percent = 100.5;
        assert!(config.validate().is_err());

        let mut config = PayoutConfig::default();
        config.score_decay_factor = 0.0;
        assert!(config.validate().is_err());

        let mut config = PayoutConfig::default();
        config.pplns.enabled = false;
        assert!(config.validate().is_err());

        let mut config = PayoutConfig::default();
        config.pps.enabled = true;
        config.pps_network_difficulty = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: PayoutConfig = serde_json::from_str(
            r#"{"default_mode":"solo","pplns_window_size":5000,"pps":{"enabled":true,"fee_percent":3.0}}"#,
        )
        .unwrap();

        assert_eq!(config.default_mode, PayoutMode::Solo);
        assert_eq!(config.pplns_window_size, 5_000);
        assert!(config.pps.enabled);
        assert_eq!(config.fee_for_mode(PayoutMode::Pps).unwrap(), Percentage::whole(3));
        assert_eq!(config.slice_count, 10);
        config.validate().unwrap();
    }

    #[test]
    fn reads_config_file() {
        let path = std::env::temp_dir().join(format!("payout-config-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{"drain_timeout_secs": 5}"#).unwrap();
        let config = PayoutConfig::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.drain_timeout(), Duration::from_secs(5));
        assert!(PayoutConfig::from_json_file("/nonexistent/payouts.json").is_err());
    }
}
