//! Stage3: multi-horizon projection
//!
//! The model is asked only for top-line drivers and assumption
//! parameters; every derived financial line is computed locally so the
//! core arithmetic invariants hold even when the model's own arithmetic
//! is wrong.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::invoker::ModelInvoker;
use crate::models::{
    AggregatedDataset, Analysis, BalanceSheetPoint, CashFlowPoint, ConfidenceLevel,
    DegradedSection, DriverAssumptions, ForecastMethod, Granularity, Horizon, HorizonProjection,
    HorizonStatus, ModelTier, ProjectionPoint, ProjectionSet, StageOutcome, Statement,
};
use crate::periods;
use chrono::{Datelike, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

/// Year-over-year growth decays toward the terminal rate by this factor.
const GROWTH_DECAY: f64 = 0.85;
/// Opening equity as a fraction of trailing annual revenue.
const BASE_EQUITY_RATIO: f64 = 0.4;
/// Confidence penalty per horizon, indexed by `Horizon::rank()`.
const HORIZON_PENALTY: [u8; 5] = [0, 1, 1, 2, 3];

pub struct Stage3Projector {
    invoker: Arc<ModelInvoker>,
    config: PipelineConfig,
}

impl Stage3Projector {
    pub fn new(invoker: Arc<ModelInvoker>, config: PipelineConfig) -> Self {
        Self { invoker, config }
    }

    pub async fn project(
        &self,
        analysis: &Analysis,
        dataset: &AggregatedDataset,
        deadline: Instant,
    ) -> crate::Result<StageOutcome<ProjectionSet>> {
        let Some(base) = BaselineFigures::from_dataset(dataset) else {
            return Ok(StageOutcome::Failed {
                reason: "dataset has no revenue baseline to project from".to_string(),
            });
        };

        let base_prompt = build_driver_prompt(analysis, &base);
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
                Err(e @ PipelineError::CredentialExhausted(_))
                | Err(e @ PipelineError::PipelineTimeout(_)) => return Err(e),
                Err(e) => {
                    return Ok(StageOutcome::Failed {
                        reason: format!("driver invocation failed: {}", e),
                    })
                }
            };

            if !invocation.notes.is_empty() {
                markers.push(DegradedSection {
                    section: "projection".to_string(),
                    reason: format!("response partially parsed: {}", invocation.notes.join("; ")),
                });
            }

            match validate_drivers(&invocation.value) {
                Ok(assumptions) => {
                    let set = self.build_projection_set(analysis, &base, assumptions, dataset);
                    info!(
                        method = %analysis.methodology.method,
                        horizons = set.horizons.len(),
                        "Stage3 projection complete"
                    );
                    return Ok(if markers.is_empty() {
                        StageOutcome::Success { value: set }
                    } else {
                        StageOutcome::Degraded {
                            value: set,
                            markers,
                        }
                    });
                }
                Err(violations) => {
                    warn!(round, ?violations, "Driver assumptions failed schema validation");
                    last_violations = violations;
                    prompt = format!(
                        "Your previous response failed schema validation:\n- {}\n\nReturn corrected JSON only.\n\n{}",
                        last_violations.join("\n- "),
                        base_prompt
                    );
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

    fn build_projection_set(
        &self,
        analysis: &Analysis,
        base: &BaselineFigures,
        assumptions: DriverAssumptions,
        dataset: &AggregatedDataset,
    ) -> ProjectionSet {
        let completeness = dataset.quality.completeness;
        let monthly = project_monthly_revenue(
            analysis.methodology.method,
            base,
            &assumptions,
            Horizon::FifteenYears.years() * 12,
        );

        let mut horizons = Vec::with_capacity(Horizon::ALL.len());
        for horizon in Horizon::ALL {
            horizons.push(self.build_horizon(horizon, base, &assumptions, &monthly, completeness));
        }

        let yearly_nets: Vec<(String, f64)> = horizons
            .iter()
            .find(|h| h.horizon == Horizon::FifteenYears)
            .map(|h| {
                h.points
                    .iter()
                    .map(|p| (p.period.clone(), p.net_profit))
                    .collect()
            })
            .unwrap_or_default();

        let base_equity = base.annual_revenue * BASE_EQUITY_RATIO;
        let balance_sheet =
            build_balance_sheet(&yearly_nets, base_equity, &assumptions, &self.config);
        let cash_flow = build_cash_flow(&yearly_nets, &self.config);

        ProjectionSet {
            horizons,
            balance_sheet,
            cash_flow,
            base_equity,
            assumptions,
        }
    }

    fn build_horizon(
        &self,
        horizon: Horizon,
        base: &BaselineFigures,
        assumptions: &DriverAssumptions,
        monthly: &[MonthlyRevenue],
        completeness: f64,
    ) -> HorizonProjection {
        let months_needed = (horizon.years() * 12) as usize;
        if monthly.len() < months_needed {
            return HorizonProjection {
                horizon,
                granularity: horizon.granularity(),
                points: Vec::new(),
                status: HorizonStatus::Failed {
                    reason: format!(
                        "revenue path covers {} months, horizon needs {}",
                        monthly.len(),
                        months_needed
                    ),
                },
            };
        }

        let confidence = confidence_for(horizon, completeness, self.config.min_completeness);
        let window = &monthly[..months_needed];

        let points: Vec<ProjectionPoint> = match horizon.granularity() {
            Granularity::Monthly => window
                .iter()
                .map(|m| self.pnl_point(m.label.clone(), m.revenue, assumptions, confidence))
                .collect(),
            Granularity::Quarterly => window
                .chunks(3)
                .filter_map(|chunk| {
                    let first = chunk.first()?;
                    let revenue: f64 = chunk.iter().map(|m| m.revenue).sum();
                    let fy_start = self.config.fiscal_year_start_month;
                    let fy = periods::fiscal_year(first.year, first.month, fy_start);
                    let quarter = periods::fiscal_quarter(first.month, fy_start);
                    Some(self.pnl_point(
                        periods::fiscal_quarter_label(fy, quarter),
                        revenue,
                        assumptions,
                        confidence,
                    ))
                })
                .collect(),
            Granularity::Yearly => window
                .chunks(12)
                .filter_map(|chunk| {
                    let last = chunk.last()?;
                    let revenue: f64 = chunk.iter().map(|m| m.revenue).sum();
                    let fy = periods::fiscal_year(
                        last.year,
                        last.month,
                        self.config.fiscal_year_start_month,
                    );
                    Some(self.pnl_point(
                        periods::fiscal_year_label(fy),
                        revenue,
                        assumptions,
                        confidence,
                    ))
                })
                .collect(),
        };

        let status = if completeness < self.config.min_completeness {
            HorizonStatus::Degraded {
                reason: format!(
                    "upstream completeness {:.2} below minimum {:.2}",
                    completeness, self.config.min_completeness
                ),
            }
        } else {
            HorizonStatus::Projected
        };

        HorizonProjection {
            horizon,
            granularity: horizon.granularity(),
            points,
            status,
        }
    }

    /// Derive every P&L line from revenue and the driver assumptions.
    /// This is the arithmetic the validator re-verifies.
    fn pnl_point(
        &self,
        period: String,
        revenue: f64,
        assumptions: &DriverAssumptions,
        confidence: ConfidenceLevel,
    ) -> ProjectionPoint {
        let cost_of_sales = revenue * (1.0 - assumptions.gross_margin);
        let gross_profit = revenue - cost_of_sales;
        let operating_expenses = revenue * assumptions.opex_ratio;
        let pre_tax = gross_profit - operating_expenses;
        let tax = pre_tax.max(0.0) * self.config.tax_rate;
        let net_profit = gross_profit - operating_expenses - tax;

        ProjectionPoint {
            period,
            revenue,
            cost_of_sales,
            gross_profit,
            operating_expenses,
            tax,
            net_profit,
            confidence,
        }
    }

    /// Rebuild only the named statement from the existing P&L data.
    /// Used for targeted regeneration after a reconciliation failure.
    pub fn regenerate_statement(&self, set: &mut ProjectionSet, statement: Statement) {
        info!(?statement, "Regenerating statement");
        match statement {
            Statement::CashFlow | Statement::BalanceSheet => {
                let yearly_nets: Vec<(String, f64)> = set
                    .horizons
                    .iter()
                    .find(|h| h.horizon == Horizon::FifteenYears)
                    .map(|h| {
                        h.points
                            .iter()
                            .map(|p| (p.period.clone(), p.net_profit))
                            .collect()
                    })
                    .unwrap_or_default();

                if statement == Statement::CashFlow {
                    set.cash_flow = build_cash_flow(&yearly_nets, &self.config);
                } else {
                    set.balance_sheet = build_balance_sheet(
                        &yearly_nets,
                        set.base_equity,
                        &set.assumptions,
                        &self.config,
                    );
                }
            }
            Statement::ProfitAndLoss => {
                let assumptions = set.assumptions.clone();
                for horizon in &mut set.horizons {
                    for point in &mut horizon.points {
                        *point = self.pnl_point(
                            point.period.clone(),
                            point.revenue,
                            &assumptions,
                            point.confidence,
                        );
                    }
                }
            }
        }
    }
}

//
// ================= Baseline =================
//

/// Observed figures the projection anchors on.
#[derive(Debug, Clone)]
struct BaselineFigures {
    /// Trailing-twelve-month revenue (or scaled-up shorter history).
    annual_revenue: f64,
    monthly_revenue: f64,
    observed_gross_margin: f64,
    observed_opex_ratio: f64,
    /// Calendar month following the last observed period.
    start_year: i32,
    start_month: u32,
}

impl BaselineFigures {
    fn from_dataset(dataset: &AggregatedDataset) -> Option<Self> {
        let revenue = dataset.series.get("revenue")?;
        if revenue.is_empty() {
            return None;
        }

        let trailing: Vec<f64> = revenue.values().rev().take(12).copied().collect();
        let monthly_revenue = trailing.iter().sum::<f64>() / trailing.len() as f64;
        if monthly_revenue <= 0.0 {
            return None;
        }
        let annual_revenue = monthly_revenue * 12.0;

        let total_revenue: f64 = revenue.values().sum();
        let observed_gross_margin = dataset
            .series
            .get("cost_of_sales")
            .map(|cogs| {
                let total_cogs: f64 = cogs.values().sum();
                (1.0 - total_cogs / total_revenue).clamp(0.0, 1.0)
            })
            .unwrap_or(0.5);
        let observed_opex_ratio = dataset
            .series
            .get("operating_expenses")
            .map(|opex| {
                let total_opex: f64 = opex.values().sum();
                (total_opex / total_revenue).clamp(0.0, 0.95)
            })
            .unwrap_or(0.3);

        let (start_year, start_month) = revenue
            .keys()
            .last()
            .and_then(|label| periods::parse_month_label(label))
            .map(|(y, m)| periods::next_month(y, m))
            .unwrap_or_else(|| {
                let now = Utc::now();
                (now.year(), now.month())
            });

        Some(Self {
            annual_revenue,
            monthly_revenue,
            observed_gross_margin,
            observed_opex_ratio,
            start_year,
            start_month,
        })
    }
}

//
// ================= Revenue engine =================
//

#[derive(Debug, Clone)]
struct MonthlyRevenue {
    label: String,
    year: i32,
    month: u32,
    revenue: f64,
}

/// Project the monthly top line for `months` months under the selected
/// methodology. Growth decays from the assumed annual rate toward the
/// terminal rate as the horizon extends.
fn project_monthly_revenue(
    method: ForecastMethod,
    base: &BaselineFigures,
    assumptions: &DriverAssumptions,
    months: u32,
) -> Vec<MonthlyRevenue> {
    let mut out = Vec::with_capacity(months as usize);
    let mut underlying = base.monthly_revenue;
    let (mut year, mut month) = (base.start_year, base.start_month);

    for i in 0..months {
        let year_index = (i / 12) as i32;
        let yearly_growth = assumptions.terminal_growth_rate
            + (assumptions.annual_growth_rate - assumptions.terminal_growth_rate)
                * GROWTH_DECAY.powi(year_index);

        underlying = match method {
            // Arithmetic increments: a straight line within each year.
            ForecastMethod::TrendLinear => {
                underlying + base.monthly_revenue * yearly_growth / 12.0
            }
            // Multiplicative path from the smoothed baseline.
            ForecastMethod::ExponentialSmoothing | ForecastMethod::SeasonalDecomposition => {
                underlying * (1.0 + yearly_growth).max(0.01).powf(1.0 / 12.0)
            }
        };

        let seasonal = if method == ForecastMethod::SeasonalDecomposition {
            assumptions.seasonal_multipliers[(month - 1) as usize]
        } else {
            1.0
        };

        out.push(MonthlyRevenue {
            label: periods::month_label(year, month),
            year,
            month,
            revenue: (underlying * seasonal).max(0.0),
        });

        let next = periods::next_month(year, month);
        year = next.0;
        month = next.1;
    }

    out
}

//
// ================= Derived statements =================
//

fn build_balance_sheet(
    yearly_nets: &[(String, f64)],
    base_equity: f64,
    assumptions: &DriverAssumptions,
    config: &PipelineConfig,
) -> Vec<BalanceSheetPoint> {
    let mut equity = base_equity;
    yearly_nets
        .iter()
        .map(|(period, net)| {
            let retained = net * (1.0 - config.dividend_payout_ratio);
            equity += retained;
            let liabilities = equity.max(0.0) * assumptions.leverage_ratio;
            // Assets balance by construction.
            let assets = liabilities + equity;
            BalanceSheetPoint {
                period: period.clone(),
                assets,
                liabilities,
                equity,
            }
        })
        .collect()
}

fn build_cash_flow(yearly_nets: &[(String, f64)], config: &PipelineConfig) -> Vec<CashFlowPoint> {
    yearly_nets
        .iter()
        .map(|(period, net)| {
            let operating_cash_flow = *net;
            let financing_cash_flow = -net.max(0.0) * config.dividend_payout_ratio;
            CashFlowPoint {
                period: period.clone(),
                operating_cash_flow,
                financing_cash_flow,
                net_cash_flow: operating_cash_flow + financing_cash_flow,
            }
        })
        .collect()
}

//
// ================= Confidence =================
//

/// Deterministic function of horizon distance and upstream completeness;
/// non-increasing as the horizon extends.
pub fn confidence_for(horizon: Horizon, completeness: f64, min_completeness: f64) -> ConfidenceLevel {
    let mut level = if completeness >= 0.85 {
        ConfidenceLevel::High
    } else if completeness >= 0.7 {
        ConfidenceLevel::Medium
    } else if completeness >= 0.5 {
        ConfidenceLevel::Low
    } else {
        ConfidenceLevel::VeryLow
    };

    if completeness < min_completeness {
        level = level.demoted();
    }
    for _ in 0..HORIZON_PENALTY[horizon.rank() as usize] {
        level = level.demoted();
    }
    level
}

//
// ================= Driver prompt & schema =================
//

fn build_driver_prompt(analysis: &Analysis, base: &BaselineFigures) -> String {
    format!(
        r#"You are a financial forecasting engine supplying driver assumptions.

BUSINESS CONTEXT:
- Industry: {industry}
- Maturity: {maturity:?}
- Competitive position: {position:?}
- Observed annualized growth: {growth:.1}%
- Seasonal: {seasonal}
- Selected methodology: {method}

BASELINE:
- Trailing annual revenue: {annual:.0}
- Observed gross margin: {margin:.2}
- Observed opex ratio: {opex:.2}

Provide forward assumptions only; do not compute any financial statements.

Rules:
- annual_growth_rate within [-0.5, 3.0]
- terminal_growth_rate within [-0.2, 0.2]
- gross_margin within (0.0, 1.0)
- opex_ratio within [0.0, 0.95]
- seasonal_multipliers: exactly 12 positive numbers averaging 1.0
- leverage_ratio >= 0.0
- Return ONLY valid JSON
- No explanation text
- JSON format:

{{"annual_growth_rate": 0.12, "terminal_growth_rate": 0.03, "gross_margin": 0.55, "opex_ratio": 0.30, "seasonal_multipliers": [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0], "leverage_ratio": 0.8}}
"#,
        industry = analysis.context.industry,
        maturity = analysis.context.maturity_stage,
        position = analysis.context.competitive_position,
        growth = analysis.context.growth_rate * 100.0,
        seasonal = analysis.context.seasonal,
        method = analysis.methodology.method,
        annual = base.annual_revenue,
        margin = base.observed_gross_margin,
        opex = base.observed_opex_ratio,
    )
}

/// Required fields present and within their allowed ranges. Seasonal
/// multipliers default to flat and are renormalized to average 1.0.
fn validate_drivers(value: &Value) -> std::result::Result<DriverAssumptions, Vec<String>> {
    let mut violations = Vec::new();

    fn number_in(
        value: &Value,
        field: &str,
        range: std::ops::RangeInclusive<f64>,
        violations: &mut Vec<String>,
    ) -> Option<f64> {
        match value.get(field).and_then(Value::as_f64) {
            Some(v) if range.contains(&v) => Some(v),
            Some(v) => {
                violations.push(format!(
                    "{} = {} outside [{}, {}]",
                    field,
                    v,
                    range.start(),
                    range.end()
                ));
                None
            }
            None => {
                violations.push(format!("missing numeric field: {}", field));
                None
            }
        }
    }

    let annual_growth_rate = number_in(value, "annual_growth_rate", -0.5..=3.0, &mut violations);
    let terminal_growth_rate =
        number_in(value, "terminal_growth_rate", -0.2..=0.2, &mut violations);
    let gross_margin = number_in(value, "gross_margin", 0.01..=0.99, &mut violations);
    let opex_ratio = number_in(value, "opex_ratio", 0.0..=0.95, &mut violations);
    let leverage_ratio = match value.get("leverage_ratio") {
        None => Some(1.0),
        Some(_) => number_in(value, "leverage_ratio", 0.0..=20.0, &mut violations),
    };

    let seasonal_multipliers = match value.get("seasonal_multipliers") {
        None => Some(vec![1.0; 12]),
        Some(raw) => match raw.as_array() {
            Some(items) if items.len() == 12 => {
                let parsed: Vec<f64> = items.iter().filter_map(Value::as_f64).collect();
                if parsed.len() == 12 && parsed.iter().all(|m| *m > 0.0) {
                    // Renormalize so seasonality never changes annual totals.
                    let mean = parsed.iter().sum::<f64>() / 12.0;
                    Some(parsed.iter().map(|m| m / mean).collect())
                } else {
                    violations
                        .push("seasonal_multipliers must be 12 positive numbers".to_string());
                    None
                }
            }
            _ => {
                violations.push("seasonal_multipliers must be an array of 12 numbers".to_string());
                None
            }
        },
    };

    match (
        annual_growth_rate,
        terminal_growth_rate,
        gross_margin,
        opex_ratio,
        leverage_ratio,
        seasonal_multipliers,
    ) {
        (Some(ag), Some(tg), Some(gm), Some(or), Some(lr), Some(sm)) if violations.is_empty() => {
            Ok(DriverAssumptions {
                annual_growth_rate: ag,
                terminal_growth_rate: tg,
                gross_margin: gm,
                opex_ratio: or,
                seasonal_multipliers: sm,
                leverage_ratio: lr,
            })
        }
        _ => Err(violations),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialPool;
    use crate::extract::assess_quality;
    use crate::invoker::{InferenceBackend, ScriptedBackend};
    use crate::models::{
        CompetitivePosition, MaturityStage, MethodScore, MethodologySelection, MetricSeries,
        VolatilityLevel,
    };
    use std::collections::BTreeMap;
    use std::time::Duration;

    const EPSILON: f64 = 0.01;

    pub(crate) const VALID_DRIVERS: &str = r#"{"annual_growth_rate": 0.12, "terminal_growth_rate": 0.03, "gross_margin": 0.6, "opex_ratio": 0.3, "seasonal_multipliers": [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0], "leverage_ratio": 0.8}"#;

    fn test_dataset() -> AggregatedDataset {
        let mut series: MetricSeries = BTreeMap::new();
        let mut revenue = BTreeMap::new();
        let mut cogs = BTreeMap::new();
        let mut opex = BTreeMap::new();
        let (mut year, mut month) = (2023, 1);
        for i in 0..24u32 {
            let label = periods::month_label(year, month);
            revenue.insert(label.clone(), 100_000.0 + 1_000.0 * i as f64);
            cogs.insert(label.clone(), 40_000.0);
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

    fn test_analysis(method: ForecastMethod) -> Analysis {
        Analysis {
            context: crate::models::BusinessContext {
                industry: "saas".to_string(),
                maturity_stage: MaturityStage::Growth,
                competitive_position: CompetitivePosition::Challenger,
                growth_rate: 0.12,
                seasonal: method == ForecastMethod::SeasonalDecomposition,
                seasonal_amplitude: 0.0,
                volatility: VolatilityLevel::Low,
            },
            methodology: MethodologySelection {
                method,
                fallback: ForecastMethod::ExponentialSmoothing,
                rationale: "test".to_string(),
                scores: vec![MethodScore {
                    method,
                    score: 0.9,
                }],
            },
        }
    }

    fn projector_with(backend: Arc<ScriptedBackend>, config: PipelineConfig) -> Stage3Projector {
        let pool = Arc::new(CredentialPool::new(vec!["k".to_string()], &config));
        let invoker = Arc::new(ModelInvoker::new(
            backend as Arc<dyn InferenceBackend>,
            pool,
            config.clone(),
        ));
        Stage3Projector::new(invoker, config)
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    async fn projected_set(method: ForecastMethod) -> ProjectionSet {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(ModelTier::Advanced, Ok(VALID_DRIVERS.to_string()));
        let projector = projector_with(backend, PipelineConfig::default());

        let outcome = projector
            .project(&test_analysis(method), &test_dataset(), deadline())
            .await
            .unwrap();
        outcome.into_value().expect("projection succeeded").0
    }

    #[tokio::test]
    async fn test_five_horizons_with_expected_point_counts() {
        let set = projected_set(ForecastMethod::TrendLinear).await;

        assert_eq!(set.horizons.len(), 5);
        for projection in &set.horizons {
            assert_eq!(projection.points.len(), projection.horizon.period_count());
            assert_eq!(projection.status, HorizonStatus::Projected);
        }
        // The 1-year horizon is exactly 12 monthly points.
        let one_year = &set.horizons[0];
        assert_eq!(one_year.horizon, Horizon::OneYear);
        assert_eq!(one_year.points.len(), 12);
        assert_eq!(one_year.granularity, Granularity::Monthly);
        // Projection starts the month after the 24-month history ends.
        assert_eq!(one_year.points[0].period, "2025-01");
    }

    #[tokio::test]
    async fn test_pnl_arithmetic_invariants_hold() {
        let set = projected_set(ForecastMethod::SeasonalDecomposition).await;

        for projection in &set.horizons {
            for point in &projection.points {
                assert!(
                    (point.gross_profit - (point.revenue - point.cost_of_sales)).abs() < EPSILON,
                    "gross profit identity violated at {}",
                    point.period
                );
                assert!(
                    (point.net_profit
                        - (point.gross_profit - point.operating_expenses - point.tax))
                        .abs()
                        < EPSILON,
                    "net profit identity violated at {}",
                    point.period
                );
            }
        }
    }

    #[tokio::test]
    async fn test_balance_sheet_balances() {
        let set = projected_set(ForecastMethod::ExponentialSmoothing).await;

        assert_eq!(set.balance_sheet.len(), 15);
        for point in &set.balance_sheet {
            assert!(
                (point.assets - (point.liabilities + point.equity)).abs() < EPSILON,
                "balance sheet does not balance at {}",
                point.period
            );
        }
    }

    #[tokio::test]
    async fn test_confidence_non_increasing_with_horizon() {
        let set = projected_set(ForecastMethod::TrendLinear).await;

        let per_horizon: Vec<ConfidenceLevel> = set
            .horizons
            .iter()
            .map(|h| h.points[0].confidence)
            .collect();
        for pair in per_horizon.windows(2) {
            assert!(pair[0] >= pair[1], "confidence increased with distance");
        }
        // Complete upstream data keeps the 1-year horizon at High.
        assert_eq!(per_horizon[0], ConfidenceLevel::High);
    }

    #[tokio::test]
    async fn test_quarterly_points_aggregate_monthly_revenue() {
        let set = projected_set(ForecastMethod::TrendLinear).await;

        let monthly = &set.horizons[0].points;
        let quarterly = &set.horizons[1].points;
        let first_quarter: f64 = monthly[..3].iter().map(|p| p.revenue).sum();
        assert!((quarterly[0].revenue - first_quarter).abs() < EPSILON);
    }

    #[tokio::test]
    async fn test_quarterly_labels_follow_fiscal_convention() {
        let set = projected_set(ForecastMethod::TrendLinear).await;

        let quarterly = &set.horizons[1].points;
        assert_eq!(quarterly.len(), 12);
        // Calendar fiscal year, forecast opens 2025-01.
        assert_eq!(quarterly[0].period, "FY2025-Q1");
        assert_eq!(quarterly[4].period, "FY2026-Q1");
        assert_eq!(quarterly[11].period, "FY2027-Q4");

        let unique: std::collections::BTreeSet<_> =
            quarterly.iter().map(|p| p.period.as_str()).collect();
        assert_eq!(unique.len(), quarterly.len());
    }

    #[tokio::test]
    async fn test_quarterly_labels_respect_fiscal_year_start() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(ModelTier::Advanced, Ok(VALID_DRIVERS.to_string()));
        let config = PipelineConfig {
            fiscal_year_start_month: 4,
            ..Default::default()
        };
        let projector = projector_with(backend, config);

        let outcome = projector
            .project(
                &test_analysis(ForecastMethod::TrendLinear),
                &test_dataset(),
                deadline(),
            )
            .await
            .unwrap();
        let set = outcome.into_value().unwrap().0;

        // January 2025 falls in the last quarter of the FY ending March 2025.
        let quarterly = &set.horizons[1].points;
        assert_eq!(quarterly[0].period, "FY2025-Q4");
        assert_eq!(quarterly[1].period, "FY2026-Q1");
    }

    #[tokio::test]
    async fn test_regenerate_rebuilds_only_cash_flow() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(ModelTier::Advanced, Ok(VALID_DRIVERS.to_string()));
        let projector = projector_with(backend, PipelineConfig::default());

        let outcome = projector
            .project(
                &test_analysis(ForecastMethod::TrendLinear),
                &test_dataset(),
                deadline(),
            )
            .await
            .unwrap();
        let mut set = outcome.into_value().unwrap().0;

        let pristine_balance = set.balance_sheet.clone();
        let pristine_cash = set.cash_flow.clone();

        // Corrupt the cash flow, then regenerate just that statement.
        set.cash_flow[0].operating_cash_flow += 1_000_000.0;
        projector.regenerate_statement(&mut set, Statement::CashFlow);

        assert!(
            (set.cash_flow[0].operating_cash_flow - pristine_cash[0].operating_cash_flow).abs()
                < EPSILON
        );
        // The balance sheet was untouched.
        assert_eq!(set.balance_sheet.len(), pristine_balance.len());
        assert!(
            (set.balance_sheet[0].equity - pristine_balance[0].equity).abs() < f64::EPSILON
        );
    }

    #[tokio::test]
    async fn test_invalid_drivers_trigger_corrective_reprompt() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(
            ModelTier::Advanced,
            Ok(r#"{"annual_growth_rate": 9.9, "terminal_growth_rate": 0.03, "gross_margin": 0.6, "opex_ratio": 0.3}"#.to_string()),
        );
        backend.script(ModelTier::Advanced, Ok(VALID_DRIVERS.to_string()));
        let projector = projector_with(Arc::clone(&backend), PipelineConfig::default());

        let outcome = projector
            .project(
                &test_analysis(ForecastMethod::TrendLinear),
                &test_dataset(),
                deadline(),
            )
            .await
            .unwrap();
        assert!(outcome.value().is_some());
        assert_eq!(backend.calls(), 2);
    }

    #[test]
    fn test_seasonal_multipliers_renormalized() {
        let mut raw: Vec<f64> = vec![2.0; 12];
        raw[0] = 4.0;
        let value = serde_json::json!({
            "annual_growth_rate": 0.1,
            "terminal_growth_rate": 0.02,
            "gross_margin": 0.5,
            "opex_ratio": 0.3,
            "seasonal_multipliers": raw,
        });
        let drivers = validate_drivers(&value).unwrap();
        let mean: f64 = drivers.seasonal_multipliers.iter().sum::<f64>() / 12.0;
        assert!((mean - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_low_completeness_demotes_confidence() {
        let full = confidence_for(Horizon::OneYear, 0.95, 0.6);
        let sparse = confidence_for(Horizon::OneYear, 0.55, 0.6);
        assert_eq!(full, ConfidenceLevel::High);
        assert!(sparse < full);
    }
}
