//! Pipeline configuration
//!
//! Values only; loading mechanism is the binary's concern (dotenv + env).

use crate::error::PipelineError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Full configuration surface consumed by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// API keys for the inference service, rotated by the credential pool.
    pub credential_keys: Vec<String>,

    /// Max concurrent Stage1 document extractions (light tier).
    pub stage1_concurrency: usize,
    /// Global cap on in-flight advanced-tier calls, shared across runs.
    pub advanced_concurrency: usize,

    /// Max attempts per invocation (first try included).
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_cap_ms: u64,

    /// Credential cooldown after a rate-limit failure.
    pub cooldown_base_ms: u64,
    pub cooldown_cap_ms: u64,
    /// Consecutive failures after which a credential is retired for good.
    pub max_consecutive_failures: u32,

    /// Corrective re-prompts allowed when model output fails schema checks.
    pub max_schema_retries: u32,

    /// Per-attempt network timeout.
    pub invocation_timeout_secs: u64,
    /// Overall wall-clock budget for one pipeline run.
    pub pipeline_deadline_secs: u64,

    /// 1 = January. Periods are normalized onto this fiscal convention.
    pub fiscal_year_start_month: u32,
    pub tax_rate: f64,
    pub dividend_payout_ratio: f64,

    /// Below this completeness the result is force-marked degraded.
    pub min_completeness: f64,
    /// Tolerance for floating-point balance checks, in currency units.
    pub reconciliation_epsilon: f64,
    /// Relative seasonal amplitude above which seasonality is flagged.
    pub seasonality_threshold: f64,
    /// A value is anomalous when it deviates from the neighbor median by
    /// more than this multiple of that median.
    pub anomaly_band: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            credential_keys: Vec::new(),
            stage1_concurrency: 4,
            advanced_concurrency: 3,
            max_attempts: 4,
            backoff_base_ms: 500,
            backoff_multiplier: 2.0,
            backoff_cap_ms: 30_000,
            cooldown_base_ms: 2_000,
            cooldown_cap_ms: 120_000,
            max_consecutive_failures: 5,
            max_schema_retries: 2,
            invocation_timeout_secs: 60,
            pipeline_deadline_secs: 600,
            fiscal_year_start_month: 1,
            tax_rate: 0.25,
            dividend_payout_ratio: 0.0,
            min_completeness: 0.6,
            reconciliation_epsilon: 0.01,
            seasonality_threshold: 0.15,
            anomaly_band: 3.0,
        }
    }
}

impl PipelineConfig {
    /// Read overrides from the environment on top of defaults.
    ///
    /// `GEMINI_API_KEYS` is comma-separated; numeric knobs fall back to
    /// defaults when unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(keys) = std::env::var("GEMINI_API_KEYS") {
            config.credential_keys = keys
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
        }

        fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
            if let Ok(raw) = std::env::var(name) {
                if let Ok(value) = raw.parse() {
                    *target = value;
                }
            }
        }

        env_parse("STAGE1_CONCURRENCY", &mut config.stage1_concurrency);
        env_parse("ADVANCED_CONCURRENCY", &mut config.advanced_concurrency);
        env_parse("MAX_ATTEMPTS", &mut config.max_attempts);
        env_parse("PIPELINE_DEADLINE_SECS", &mut config.pipeline_deadline_secs);
        env_parse("FISCAL_YEAR_START_MONTH", &mut config.fiscal_year_start_month);
        env_parse("TAX_RATE", &mut config.tax_rate);
        env_parse("DIVIDEND_PAYOUT_RATIO", &mut config.dividend_payout_ratio);
        env_parse("MIN_COMPLETENESS", &mut config.min_completeness);

        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.credential_keys.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "at least one credential key is required".to_string(),
            ));
        }
        if self.advanced_concurrency == 0 || self.stage1_concurrency == 0 {
            return Err(PipelineError::InvalidConfig(
                "concurrency limits must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !(1..=12).contains(&self.fiscal_year_start_month) {
            return Err(PipelineError::InvalidConfig(format!(
                "fiscal_year_start_month must be 1..=12, got {}",
                self.fiscal_year_start_month
            )));
        }
        if !(0.0..=1.0).contains(&self.tax_rate) {
            return Err(PipelineError::InvalidConfig(format!(
                "tax_rate must be within [0, 1], got {}",
                self.tax_rate
            )));
        }
        Ok(())
    }

    pub fn pipeline_deadline(&self) -> Duration {
        Duration::from_secs(self.pipeline_deadline_secs)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }

    /// Backoff before retry attempt `n` (1-based), exponential and capped.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let exp = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let ms = (self.backoff_base_ms as f64 * exp) as u64;
        Duration::from_millis(ms.min(self.backoff_cap_ms))
    }

    /// Cooldown after the n-th consecutive failure of one credential.
    pub fn cooldown(&self, consecutive_failures: u32) -> Duration {
        let exp = 2.0_f64.powi(consecutive_failures.saturating_sub(1) as i32);
        let ms = (self.cooldown_base_ms as f64 * exp) as u64;
        Duration::from_millis(ms.min(self.cooldown_cap_ms))
    }
}
