//! Stage2: business-context analysis & methodology selection
//!
//! Classification comes from the advanced tier (behind the global
//! semaphore) and is schema-validated with bounded corrective
//! re-prompts. Pattern statistics and methodology scoring are computed
//! locally so the selection is deterministic for a given dataset.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::invoker::ModelInvoker;
use crate::models::{
    AggregatedDataset, Analysis, BusinessContext, CompetitivePosition, DegradedSection,
    ForecastMethod, MaturityStage, MethodScore, MethodologySelection, MetricSeries, ModelTier,
    StageOutcome, VolatilityLevel,
};
use crate::periods;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

pub struct Stage2Analyst {
    invoker: Arc<ModelInvoker>,
    config: PipelineConfig,
}

/// Local statistics driving methodology selection.
#[derive(Debug, Clone, Copy)]
pub struct SeriesStats {
    pub months: usize,
    pub annual_growth: f64,
    pub trend_r2: f64,
    pub volatility: f64,
    pub seasonal_amplitude: f64,
}

impl Stage2Analyst {
    pub fn new(invoker: Arc<ModelInvoker>, config: PipelineConfig) -> Self {
        Self { invoker, config }
    }

    pub async fn analyze(
        &self,
        dataset: &AggregatedDataset,
        deadline: Instant,
    ) -> crate::Result<StageOutcome<Analysis>> {
        let Some(stats) = revenue_stats(&dataset.series) else {
            return Ok(StageOutcome::Failed {
                reason: "dataset has no revenue series to analyze".to_string(),
            });
        };

        let base_prompt = build_analysis_prompt(dataset, &stats);
        let mut prompt = base_prompt.clone();
        let mut markers: Vec<DegradedSection> = Vec::new();
        let mut last_violations: Vec<String> = Vec::new();

        for round in 0..=self.config.max_schema_retries {
            let invocation = match self
                .invoker
                .invoke(ModelTier::Advanced, &prompt, deadline)
                .await
            {
                Ok(invocation) => invocation,
                // Pool/deadline conditions abort the run; anything else is
                // a stage-level failure for the orchestrator to weigh.
                Err(e @ PipelineError::CredentialExhausted(_))
                | Err(e @ PipelineError::PipelineTimeout(_)) => return Err(e),
                Err(e) => {
                    return Ok(StageOutcome::Failed {
                        reason: format!("analysis invocation failed: {}", e),
                    })
                }
            };

            if !invocation.notes.is_empty() {
                markers.push(DegradedSection {
                    section: "analysis".to_string(),
                    reason: format!("response partially parsed: {}", invocation.notes.join("; ")),
                });
            }

            match validate_classification(&invocation.value) {
                Ok((industry, maturity, position)) => {
                    let context = BusinessContext {
                        industry,
                        maturity_stage: maturity,
                        competitive_position: position,
                        growth_rate: stats.annual_growth,
                        seasonal: stats.seasonal_amplitude >= self.config.seasonality_threshold,
                        seasonal_amplitude: stats.seasonal_amplitude,
                        volatility: volatility_level(stats.volatility),
                    };
                    let methodology = select_methodology(&stats, &self.config);

                    info!(
                        industry = %context.industry,
                        method = %methodology.method,
                        growth = stats.annual_growth,
                        "Stage2 analysis complete"
                    );

                    let analysis = Analysis {
                        context,
                        methodology,
                    };
                    return Ok(if markers.is_empty() {
                        StageOutcome::Success { value: analysis }
                    } else {
                        StageOutcome::Degraded {
                            value: analysis,
                            markers,
                        }
                    });
                }
                Err(violations) => {
                    warn!(round, ?violations, "Classification failed schema validation");
                    last_violations = violations;
                    prompt = corrective_prompt(&base_prompt, &last_violations);
                }
            }
        }

        Ok(StageOutcome::Failed {
            reason: format!(
                "schema validation failed after {} corrective attempts: {}",
                self.config.max_schema_retries,
                last_violations.join("; ")
            ),
        })
    }
}

fn build_analysis_prompt(dataset: &AggregatedDataset, stats: &SeriesStats) -> String {
    let metrics: Vec<&str> = dataset.series.keys().map(String::as_str).collect();
    let period_range = dataset
        .series
        .values()
        .flat_map(|points| points.keys())
        .min()
        .zip(
            dataset
                .series
                .values()
                .flat_map(|points| points.keys())
                .max(),
        )
        .map(|(a, b)| format!("{} to {}", a, b))
        .unwrap_or_else(|| "unknown".to_string());

    format!(
        r#"You are a business analyst classifying a company from its financials.

DATASET:
- Metrics: {metrics}
- Period range: {range}
- Data completeness: {completeness:.2}
- Observed annualized revenue growth: {growth:.1}%
- Month-over-month volatility: {volatility:.3}

Classify the business.

Rules:
- maturity_stage must be one of: startup, growth, mature, declining
- competitive_position must be one of: leader, challenger, follower, niche
- industry is a short lowercase label
- Return ONLY valid JSON
- No explanation text
- JSON format:

{{"industry": "saas", "maturity_stage": "growth", "competitive_position": "challenger"}}
"#,
        metrics = metrics.join(", "),
        range = period_range,
        completeness = dataset.quality.completeness,
        growth = stats.annual_growth * 100.0,
        volatility = stats.volatility,
    )
}

fn corrective_prompt(base: &str, violations: &[String]) -> String {
    format!(
        "Your previous response failed schema validation:\n- {}\n\nReturn corrected JSON only.\n\n{}",
        violations.join("\n- "),
        base
    )
}

/// Required fields present, enumeration values within allowed sets.
fn validate_classification(
    value: &Value,
) -> std::result::Result<(String, MaturityStage, CompetitivePosition), Vec<String>> {
    let mut violations = Vec::new();

    let industry = match value.get("industry").and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Some(s.trim().to_lowercase()),
        _ => {
            violations.push("missing or empty field: industry".to_string());
            None
        }
    };

    let maturity = match value.get("maturity_stage").and_then(Value::as_str) {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "startup" => Some(MaturityStage::Startup),
            "growth" => Some(MaturityStage::Growth),
            "mature" => Some(MaturityStage::Mature),
            "declining" => Some(MaturityStage::Declining),
            other => {
                violations.push(format!(
                    "maturity_stage '{}' not in {{startup, growth, mature, declining}}",
                    other
                ));
                None
            }
        },
        None => {
            violations.push("missing field: maturity_stage".to_string());
            None
        }
    };

    let position = match value.get("competitive_position").and_then(Value::as_str) {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "leader" => Some(CompetitivePosition::Leader),
            "challenger" => Some(CompetitivePosition::Challenger),
            "follower" => Some(CompetitivePosition::Follower),
            "niche" => Some(CompetitivePosition::Niche),
            other => {
                violations.push(format!(
                    "competitive_position '{}' not in {{leader, challenger, follower, niche}}",
                    other
                ));
                None
            }
        },
        None => {
            violations.push("missing field: competitive_position".to_string());
            None
        }
    };

    match (industry, maturity, position) {
        (Some(i), Some(m), Some(p)) if violations.is_empty() => Ok((i, m, p)),
        _ => Err(violations),
    }
}

/// Growth, trend fit, volatility and seasonal amplitude of the revenue
/// series. None when there is no usable revenue data.
pub fn revenue_stats(series: &MetricSeries) -> Option<SeriesStats> {
    let revenue = series.get("revenue")?;
    if revenue.len() < 2 {
        return None;
    }

    let values: Vec<f64> = revenue.values().copied().collect();
    let n = values.len();

    // Annualized growth from endpoints.
    let first = values[0];
    let last = values[n - 1];
    let annual_growth = if first > 0.0 && last > 0.0 {
        (last / first).powf(12.0 / (n - 1) as f64) - 1.0
    } else {
        0.0
    }
    .clamp(-0.9, 9.0);

    // Least-squares linear trend and its r².
    let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = values.iter().sum::<f64>() / n as f64;
    let ss_xy: f64 = xs
        .iter()
        .zip(&values)
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    let ss_xx: f64 = xs.iter().map(|x| (x - mean_x).powi(2)).sum();
    let ss_yy: f64 = values.iter().map(|y| (y - mean_y).powi(2)).sum();
    let slope = if ss_xx > 0.0 { ss_xy / ss_xx } else { 0.0 };
    let intercept = mean_y - slope * mean_x;
    let trend_r2 = if ss_xx > 0.0 && ss_yy > 0.0 {
        (ss_xy * ss_xy) / (ss_xx * ss_yy)
    } else {
        0.0
    };

    // Volatility: stddev of month-over-month relative changes.
    let changes: Vec<f64> = values
        .windows(2)
        .filter(|w| w[0].abs() > f64::EPSILON)
        .map(|w| w[1] / w[0] - 1.0)
        .collect();
    let volatility = if changes.len() >= 2 {
        let mean = changes.iter().sum::<f64>() / changes.len() as f64;
        (changes.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / changes.len() as f64).sqrt()
    } else {
        0.0
    };

    // Seasonal amplitude: detrend, then spread of per-calendar-month
    // average ratios.
    let mut month_ratios: [Vec<f64>; 12] = Default::default();
    for (i, (label, value)) in revenue.iter().enumerate() {
        let Some((_, month)) = periods::parse_month_label(label) else {
            continue;
        };
        let trend = intercept + slope * xs[i];
        if trend > f64::EPSILON {
            month_ratios[(month - 1) as usize].push(value / trend);
        }
    }
    let month_means: Vec<f64> = month_ratios
        .iter()
        .filter(|r| !r.is_empty())
        .map(|r| r.iter().sum::<f64>() / r.len() as f64)
        .collect();
    let seasonal_amplitude = if month_means.len() >= 4 && n >= 12 {
        let max = month_means.iter().cloned().fold(f64::MIN, f64::max);
        let min = month_means.iter().cloned().fold(f64::MAX, f64::min);
        (max - min).max(0.0)
    } else {
        0.0
    };

    Some(SeriesStats {
        months: n,
        annual_growth,
        trend_r2,
        volatility,
        seasonal_amplitude,
    })
}

fn volatility_level(volatility: f64) -> VolatilityLevel {
    if volatility < 0.05 {
        VolatilityLevel::Low
    } else if volatility < 0.15 {
        VolatilityLevel::Moderate
    } else {
        VolatilityLevel::High
    }
}

/// Score the candidate methods by suitability and pick the best plus a
/// documented fallback.
pub fn select_methodology(stats: &SeriesStats, config: &PipelineConfig) -> MethodologySelection {
    let seasonal_score = if stats.seasonal_amplitude >= config.seasonality_threshold {
        0.6 + stats.seasonal_amplitude.min(1.0) * 0.35
    } else if config.seasonality_threshold > 0.0 {
        (stats.seasonal_amplitude / config.seasonality_threshold) * 0.4
    } else {
        0.0
    };
    let trend_score = stats.trend_r2 * 0.9;
    let smoothing_score = (0.5 + (1.0 - stats.trend_r2) * 0.3).min(0.95);

    let mut scores = vec![
        MethodScore {
            method: ForecastMethod::TrendLinear,
            score: trend_score,
        },
        MethodScore {
            method: ForecastMethod::ExponentialSmoothing,
            score: smoothing_score,
        },
        MethodScore {
            method: ForecastMethod::SeasonalDecomposition,
            score: seasonal_score,
        },
    ];
    scores.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let method = scores[0].method;
    let fallback = scores[1].method;
    let rationale = format!(
        "{} scored {:.2} over {} months (trend r²={:.2}, seasonal amplitude={:.2}, volatility={:.3}); fallback {}",
        method, scores[0].score, stats.months, stats.trend_r2, stats.seasonal_amplitude,
        stats.volatility, fallback
    );

    MethodologySelection {
        method,
        fallback,
        rationale,
        scores,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialPool;
    use crate::extract::assess_quality;
    use crate::invoker::{InferenceBackend, ScriptedBackend};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn dataset_with_growth() -> AggregatedDataset {
        let mut series: MetricSeries = BTreeMap::new();
        let mut revenue = BTreeMap::new();
        let mut cogs = BTreeMap::new();
        let mut opex = BTreeMap::new();
        let (mut year, mut month) = (2023, 1);
        for i in 0..24u32 {
            let label = periods::month_label(year, month);
            revenue.insert(label.clone(), 100_000.0 + 2_000.0 * i as f64);
            cogs.insert(label.clone(), 40_000.0 + 800.0 * i as f64);
            opex.insert(label, 30_000.0);
            let next = periods::next_month(year, month);
            year = next.0;
            month = next.1;
        }
        series.insert("revenue".to_string(), revenue);
        series.insert("cost_of_sales".to_string(), cogs);
        series.insert("operating_expenses".to_string(), opex);

        let quality = assess_quality(&series, &PipelineConfig::default());
        AggregatedDataset {
            series,
            quality,
            documents: Vec::new(),
        }
    }

    fn analyst_with(backend: Arc<ScriptedBackend>, config: PipelineConfig) -> Stage2Analyst {
        let pool = Arc::new(CredentialPool::new(vec!["k".to_string()], &config));
        let invoker = Arc::new(ModelInvoker::new(
            backend as Arc<dyn InferenceBackend>,
            pool,
            config.clone(),
        ));
        Stage2Analyst::new(invoker, config)
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    const VALID_CLASSIFICATION: &str =
        r#"{"industry": "saas", "maturity_stage": "growth", "competitive_position": "challenger"}"#;

    #[tokio::test]
    async fn test_valid_classification_succeeds() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(ModelTier::Advanced, Ok(VALID_CLASSIFICATION.to_string()));
        let analyst = analyst_with(Arc::clone(&backend), PipelineConfig::default());

        let outcome = analyst.analyze(&dataset_with_growth(), deadline()).await.unwrap();
        let (analysis, markers) = outcome.into_value().expect("analysis succeeded");

        assert!(markers.is_empty());
        assert_eq!(analysis.context.industry, "saas");
        assert_eq!(analysis.context.maturity_stage, MaturityStage::Growth);
        assert!(analysis.context.growth_rate > 0.0);
        assert_ne!(analysis.methodology.method, analysis.methodology.fallback);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_enum_triggers_corrective_reprompt() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(
            ModelTier::Advanced,
            Ok(r#"{"industry": "saas", "maturity_stage": "hypergrowth", "competitive_position": "challenger"}"#.to_string()),
        );
        backend.script(ModelTier::Advanced, Ok(VALID_CLASSIFICATION.to_string()));
        let analyst = analyst_with(Arc::clone(&backend), PipelineConfig::default());

        let outcome = analyst.analyze(&dataset_with_growth(), deadline()).await.unwrap();
        assert!(outcome.value().is_some());
        assert_eq!(backend.calls(), 2, "one corrective re-prompt");
    }

    #[tokio::test]
    async fn test_persistent_schema_failure_surfaces() {
        let config = PipelineConfig {
            max_schema_retries: 2,
            ..Default::default()
        };
        let backend = Arc::new(
            ScriptedBackend::new().with_fallback(|_, _| Ok(r#"{"industry": ""}"#.to_string())),
        );
        let analyst = analyst_with(Arc::clone(&backend), config);

        let outcome = analyst.analyze(&dataset_with_growth(), deadline()).await.unwrap();
        match outcome {
            StageOutcome::Failed { reason } => assert!(reason.contains("schema validation")),
            other => panic!("expected Failed, got {:?}", other),
        }
        assert_eq!(backend.calls(), 3, "initial attempt plus two retries");
    }

    #[tokio::test]
    async fn test_five_concurrent_analyses_respect_semaphore() {
        let config = PipelineConfig {
            advanced_concurrency: 3,
            ..Default::default()
        };
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_delay(Duration::from_millis(40))
                .with_fallback(|_, _| Ok(VALID_CLASSIFICATION.to_string())),
        );
        let pool = Arc::new(CredentialPool::new(
            (0..8).map(|i| format!("k{}", i)).collect(),
            &config,
        ));
        let invoker = Arc::new(ModelInvoker::new(
            Arc::clone(&backend) as Arc<dyn InferenceBackend>,
            pool,
            config.clone(),
        ));
        let analyst = Arc::new(Stage2Analyst::new(invoker, config));

        let dataset = Arc::new(dataset_with_growth());
        let mut handles = Vec::new();
        for _ in 0..5 {
            let analyst = Arc::clone(&analyst);
            let dataset = Arc::clone(&dataset);
            handles.push(tokio::spawn(async move {
                analyst.analyze(&dataset, deadline()).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().value().is_some());
        }

        assert_eq!(backend.calls(), 5);
        assert!(backend.peak_in_flight() <= 3);
    }

    #[test]
    fn test_linear_series_prefers_trend() {
        let dataset = dataset_with_growth();
        let stats = revenue_stats(&dataset.series).unwrap();
        assert!(stats.trend_r2 > 0.95);

        let selection = select_methodology(&stats, &PipelineConfig::default());
        assert_eq!(selection.method, ForecastMethod::TrendLinear);
    }

    #[test]
    fn test_seasonal_series_prefers_decomposition() {
        let mut series: MetricSeries = BTreeMap::new();
        let mut revenue = BTreeMap::new();
        let (mut year, mut month) = (2022, 1);
        for i in 0..36u32 {
            // Strong December peak, flat otherwise.
            let seasonal = if month == 12 { 1.8 } else { 0.95 };
            let label = periods::month_label(year, month);
            revenue.insert(label, (100_000.0 + 100.0 * i as f64) * seasonal);
            let next = periods::next_month(year, month);
            year = next.0;
            month = next.1;
        }
        series.insert("revenue".to_string(), revenue);

        let stats = revenue_stats(&series).unwrap();
        assert!(stats.seasonal_amplitude > 0.15);

        let selection = select_methodology(&stats, &PipelineConfig::default());
        assert_eq!(selection.method, ForecastMethod::SeasonalDecomposition);
    }

    #[test]
    fn test_validate_classification_collects_all_violations() {
        let value = serde_json::json!({
            "maturity_stage": "sideways",
            "competitive_position": "leader"
        });
        let violations = validate_classification(&value).unwrap_err();
        assert_eq!(violations.len(), 2);
    }
}
