//! Stage1: document extraction & normalization
//!
//! Each document is converted independently on the light tier into a
//! normalized monthly time series plus a locally computed quality
//! assessment. Per-document failures never abort sibling extractions.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::invoker::ModelInvoker;
use crate::models::{
    AggregatedDataset, Anomaly, DegradedSection, Document, DocumentOutcome, DocumentStatus,
    ExtractionResult, Gap, MetricSeries, ModelTier, QualityAssessment, StageOutcome,
};
use crate::periods;
use crate::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Metrics a complete P&L document is expected to carry; completeness is
/// measured against these.
pub const EXPECTED_METRICS: [&str; 3] = ["revenue", "cost_of_sales", "operating_expenses"];

/// Documents are truncated to this many characters in the prompt.
const MAX_PROMPT_CHARS: usize = 20_000;

pub struct Stage1Extractor {
    invoker: Arc<ModelInvoker>,
    limit: Arc<Semaphore>,
    config: PipelineConfig,
}

impl Stage1Extractor {
    pub fn new(invoker: Arc<ModelInvoker>, config: PipelineConfig) -> Self {
        let limit = Arc::new(Semaphore::new(config.stage1_concurrency));
        Self {
            invoker,
            limit,
            config,
        }
    }

    /// Extract all documents concurrently, bounded by the light-tier
    /// worker limit, and merge the results by period union.
    ///
    /// `Err` is reserved for pipeline-fatal conditions (pool exhausted,
    /// deadline); content-level failure is a `StageOutcome::Failed`.
    pub async fn extract(
        &self,
        documents: &[Document],
        deadline: Instant,
    ) -> Result<StageOutcome<AggregatedDataset>> {
        if documents.is_empty() {
            return Err(PipelineError::InvalidInput(
                "no documents supplied".to_string(),
            ));
        }

        let mut tasks: JoinSet<(usize, Result<(ExtractionResult, Vec<String>)>)> = JoinSet::new();

        for (index, document) in documents.iter().enumerate() {
            let invoker = Arc::clone(&self.invoker);
            let limit = Arc::clone(&self.limit);
            let config = self.config.clone();
            let document = document.clone();

            tasks.spawn(async move {
                let _permit = match limit.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            index,
                            Err(PipelineError::TransientApi(
                                "extraction semaphore closed".to_string(),
                            )),
                        )
                    }
                };
                let outcome = extract_document(&invoker, &config, &document, deadline).await;
                (index, outcome)
            });
        }

        let mut slots: Vec<Option<Result<(ExtractionResult, Vec<String>)>>> =
            (0..documents.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => warn!(error = %e, "Extraction task panicked"),
            }
        }

        let mut successes: Vec<(String, ExtractionResult, Vec<String>)> = Vec::new();
        let mut failures: Vec<(String, PipelineError)> = Vec::new();

        for (document, slot) in documents.iter().zip(slots) {
            match slot {
                Some(Ok((result, notes))) => {
                    successes.push((document.name.clone(), result, notes))
                }
                Some(Err(e)) => failures.push((document.name.clone(), e)),
                None => failures.push((
                    document.name.clone(),
                    PipelineError::TransientApi("extraction task lost".to_string()),
                )),
            }
        }

        if successes.is_empty() {
            // A pool/deadline condition affects every sibling; surface it
            // as the run-level error rather than a content failure.
            for (_, error) in &failures {
                if matches!(error, PipelineError::CredentialExhausted(_)) {
                    return Err(PipelineError::CredentialExhausted(
                        "credential pool exhausted during extraction".to_string(),
                    ));
                }
            }
            for (_, error) in &failures {
                if matches!(error, PipelineError::PipelineTimeout(_)) {
                    return Err(PipelineError::PipelineTimeout(
                        "deadline expired during extraction".to_string(),
                    ));
                }
            }
            let reason = failures
                .first()
                .map(|(name, e)| format!("{}: {}", name, e))
                .unwrap_or_else(|| "no documents produced data".to_string());
            return Ok(StageOutcome::Failed { reason });
        }

        let (series, conflicts) = merge_series(&successes);
        let mut quality = assess_quality(&series, &self.config);
        quality.conflicts = conflicts;

        let mut outcomes = Vec::with_capacity(documents.len());
        let mut markers = Vec::new();

        for document in documents {
            if let Some((_, _, notes)) = successes.iter().find(|(n, _, _)| *n == document.name) {
                outcomes.push(DocumentOutcome {
                    document: document.name.clone(),
                    status: DocumentStatus::Extracted,
                });
                if !notes.is_empty() {
                    markers.push(DegradedSection {
                        section: format!("document:{}", document.name),
                        reason: format!("response partially parsed: {}", notes.join("; ")),
                    });
                }
            } else if let Some((_, error)) = failures.iter().find(|(n, _)| *n == document.name) {
                outcomes.push(DocumentOutcome {
                    document: document.name.clone(),
                    status: DocumentStatus::Failed {
                        reason: error.to_string(),
                    },
                });
                markers.push(DegradedSection {
                    section: format!("document:{}", document.name),
                    reason: error.to_string(),
                });
            }
        }

        if quality.completeness < self.config.min_completeness {
            markers.push(DegradedSection {
                section: "dataset".to_string(),
                reason: format!(
                    "completeness {:.2} below minimum {:.2}",
                    quality.completeness, self.config.min_completeness
                ),
            });
        }

        info!(
            documents = documents.len(),
            extracted = successes.len(),
            completeness = quality.completeness,
            "Stage1 extraction complete"
        );

        let dataset = AggregatedDataset {
            series,
            quality,
            documents: outcomes,
        };

        if markers.is_empty() {
            Ok(StageOutcome::Success { value: dataset })
        } else {
            Ok(StageOutcome::Degraded {
                value: dataset,
                markers,
            })
        }
    }
}

async fn extract_document(
    invoker: &ModelInvoker,
    config: &PipelineConfig,
    document: &Document,
    deadline: Instant,
) -> Result<(ExtractionResult, Vec<String>)> {
    debug!(document = %document.name, "Extracting document");

    let prompt = build_extraction_prompt(document);
    let invocation = invoker.invoke(ModelTier::Light, &prompt, deadline).await?;

    let series = interpret_series(&invocation.value)?;
    let quality = assess_quality(&series, config);

    Ok((
        ExtractionResult {
            document: document.name.clone(),
            series,
            quality,
        },
        invocation.notes,
    ))
}

fn build_extraction_prompt(document: &Document) -> String {
    let text = document.text();
    let truncated: String = text.chars().take(MAX_PROMPT_CHARS).collect();

    format!(
        r#"You are a financial data extraction engine.

Convert the document below into a normalized monthly time series.

DOCUMENT ({name}, {media_type}):
{body}

Rules:
- Metric names: {metrics}
- Period labels: YYYY-MM
- Plain numbers, no currency symbols or thousands separators
- Omit metrics the document does not contain; never invent values
- Return ONLY valid JSON
- No explanation text
- JSON format:

{{"metrics": {{"revenue": {{"2024-01": 125000.0}}}}}}
"#,
        name = document.name,
        media_type = document.media_type,
        body = truncated,
        metrics = EXPECTED_METRICS.join(", "),
    )
}

/// Map the model's JSON into a normalized metric series. Metric names
/// are canonicalized and period labels re-validated locally.
fn interpret_series(value: &Value) -> Result<MetricSeries> {
    let metrics = value
        .get("metrics")
        .and_then(Value::as_object)
        .or_else(|| value.as_object())
        .ok_or_else(|| {
            PipelineError::SchemaValidation("extraction output has no metrics object".to_string())
        })?;

    let mut series: MetricSeries = BTreeMap::new();

    for (raw_name, periods_value) in metrics {
        let Some(periods_obj) = periods_value.as_object() else {
            continue;
        };
        let metric = canonical_metric(raw_name);
        let entry = series.entry(metric).or_default();

        for (raw_period, raw_value) in periods_obj {
            let Some((year, month)) = periods::parse_month_label(raw_period) else {
                continue;
            };
            let Some(number) = numeric(raw_value) else {
                continue;
            };
            entry.insert(periods::month_label(year, month), number);
        }
    }

    series.retain(|_, points| !points.is_empty());

    if series.is_empty() {
        return Err(PipelineError::SchemaValidation(
            "extraction output contained no usable data points".to_string(),
        ));
    }
    Ok(series)
}

fn numeric(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().replace(',', "").parse().ok()))
}

fn canonical_metric(raw: &str) -> String {
    let name = raw.trim().to_lowercase().replace([' ', '-'], "_");
    match name.as_str() {
        "sales" | "turnover" | "total_revenue" => "revenue".to_string(),
        "cogs" | "cost_of_goods_sold" | "cost_of_revenue" => "cost_of_sales".to_string(),
        "opex" | "operating_costs" | "operating_expense" => "operating_expenses".to_string(),
        _ => name,
    }
}

/// Completeness, anomalies and gaps, computed locally (never trusted
/// from the model response).
pub fn assess_quality(series: &MetricSeries, config: &PipelineConfig) -> QualityAssessment {
    let mut all_periods: std::collections::BTreeSet<&str> = std::collections::BTreeSet::new();
    for points in series.values() {
        for period in points.keys() {
            all_periods.insert(period);
        }
    }

    let expected_cells = EXPECTED_METRICS.len() * all_periods.len();
    let present_cells: usize = EXPECTED_METRICS
        .iter()
        .filter_map(|m| series.get(*m))
        .map(|points| {
            all_periods
                .iter()
                .filter(|p| points.contains_key(**p))
                .count()
        })
        .sum();
    let completeness = if expected_cells == 0 {
        0.0
    } else {
        present_cells as f64 / expected_cells as f64
    };

    let mut anomalies = Vec::new();
    let mut gaps = Vec::new();

    for (metric, points) in series {
        let ordered: Vec<(&String, &f64)> = points.iter().collect();

        for i in 0..ordered.len() {
            let mut neighbors = Vec::new();
            if i > 0 {
                neighbors.push(*ordered[i - 1].1);
            }
            if i + 1 < ordered.len() {
                neighbors.push(*ordered[i + 1].1);
            }
            if neighbors.is_empty() {
                continue;
            }
            let median = neighbors.iter().sum::<f64>() / neighbors.len() as f64;
            let value = *ordered[i].1;
            if median.abs() > f64::EPSILON
                && (value - median).abs() > config.anomaly_band * median.abs()
            {
                anomalies.push(Anomaly {
                    metric: metric.clone(),
                    period: ordered[i].0.clone(),
                    value,
                    neighbor_median: median,
                });
            }
        }

        for window in ordered.windows(2) {
            let (Some(a), Some(b)) = (
                periods::parse_month_label(window[0].0),
                periods::parse_month_label(window[1].0),
            ) else {
                continue;
            };
            let distance = periods::months_between(a, b);
            if distance > 1 {
                gaps.push(Gap {
                    metric: metric.clone(),
                    from_period: window[0].0.clone(),
                    to_period: window[1].0.clone(),
                    missing_periods: (distance - 1) as u32,
                });
            }
        }
    }

    QualityAssessment {
        completeness,
        anomalies,
        gaps,
        conflicts: Vec::new(),
    }
}

/// Merge by period union, preferring the higher-completeness source on
/// metric/period conflicts and noting every conflict.
fn merge_series(results: &[(String, ExtractionResult, Vec<String>)]) -> (MetricSeries, Vec<String>) {
    let mut order: Vec<usize> = (0..results.len()).collect();
    order.sort_by(|&a, &b| {
        results[b]
            .1
            .quality
            .completeness
            .partial_cmp(&results[a].1.quality.completeness)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut merged: MetricSeries = BTreeMap::new();
    let mut conflicts = Vec::new();

    for idx in order {
        let (name, result, _) = &results[idx];
        for (metric, points) in &result.series {
            let entry = merged.entry(metric.clone()).or_default();
            for (period, value) in points {
                match entry.get(period) {
                    None => {
                        entry.insert(period.clone(), *value);
                    }
                    Some(existing) => {
                        let scale = existing.abs().max(value.abs()).max(1.0);
                        if (existing - value).abs() / scale > 1e-6 {
                            conflicts.push(format!(
                                "{} {}: kept {} (higher-quality source), ignored {} from {}",
                                metric, period, existing, value, name
                            ));
                        }
                    }
                }
            }
        }
    }

    (merged, conflicts)
}
