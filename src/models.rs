//! Core data models for the forecast pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Metric name → (period label → value). `BTreeMap` keeps periods in
/// chronological order because labels are zero-padded `YYYY-MM`.
pub type MetricSeries = BTreeMap<String, BTreeMap<String, f64>>;

//
// ================= Enums =================
//

/// Capability tier of the external inference service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Faster, higher-quota tier used for document extraction.
    Light,
    /// More capable, sustained-capacity-limited tier used for analysis
    /// and projection.
    Advanced,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MaturityStage {
    Startup,
    Growth,
    Mature,
    Declining,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompetitivePosition {
    Leader,
    Challenger,
    Follower,
    Niche,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VolatilityLevel {
    Low,
    Moderate,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ForecastMethod {
    TrendLinear,
    ExponentialSmoothing,
    SeasonalDecomposition,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
    VeryLow,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Horizon {
    OneYear,
    ThreeYears,
    FiveYears,
    TenYears,
    FifteenYears,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Monthly,
    Quarterly,
    Yearly,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Statement {
    ProfitAndLoss,
    BalanceSheet,
    CashFlow,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

//
// ================= Input =================
//

/// A raw input document: byte content plus a declared media type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub name: String,
    pub media_type: String,
    pub content: Vec<u8>,
}

impl Document {
    pub fn new(name: impl Into<String>, media_type: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.into(),
            content,
        }
    }

    /// Lossy text view used when building extraction prompts.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }
}

//
// ================= Stage1: extraction =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub metric: String,
    pub period: String,
    pub value: f64,
    pub neighbor_median: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gap {
    pub metric: String,
    pub from_period: String,
    pub to_period: String,
    pub missing_periods: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityAssessment {
    /// Fraction of expected metric×period cells present, in [0, 1].
    pub completeness: f64,
    pub anomalies: Vec<Anomaly>,
    pub gaps: Vec<Gap>,
    /// Cross-document metric conflicts noted during merge.
    #[serde(default)]
    pub conflicts: Vec<String>,
}

/// Immutable per-document extraction output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub document: String,
    pub series: MetricSeries,
    pub quality: QualityAssessment,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DocumentStatus {
    Extracted,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentOutcome {
    pub document: String,
    #[serde(flatten)]
    pub status: DocumentStatus,
}

/// Merged view over all successfully extracted documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedDataset {
    pub series: MetricSeries,
    pub quality: QualityAssessment,
    pub documents: Vec<DocumentOutcome>,
}

//
// ================= Stage2: analysis =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessContext {
    pub industry: String,
    pub maturity_stage: MaturityStage,
    pub competitive_position: CompetitivePosition,
    /// Annualized revenue growth observed in the source data.
    pub growth_rate: f64,
    pub seasonal: bool,
    pub seasonal_amplitude: f64,
    pub volatility: VolatilityLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodScore {
    pub method: ForecastMethod,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodologySelection {
    pub method: ForecastMethod,
    pub fallback: ForecastMethod,
    pub rationale: String,
    pub scores: Vec<MethodScore>,
}

/// Stage2's combined output, consumed read-only by Stage3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub context: BusinessContext,
    pub methodology: MethodologySelection,
}

//
// ================= Stage3: projection =================
//

/// Top-line drivers requested from the model. Every derived financial
/// line is recomputed locally from these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverAssumptions {
    pub annual_growth_rate: f64,
    /// Growth decays toward this rate over long horizons.
    pub terminal_growth_rate: f64,
    pub gross_margin: f64,
    pub opex_ratio: f64,
    /// 12 monthly multipliers, averaging 1.0.
    pub seasonal_multipliers: Vec<f64>,
    /// Liabilities as a multiple of equity.
    pub leverage_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionPoint {
    pub period: String,
    pub revenue: f64,
    pub cost_of_sales: f64,
    pub gross_profit: f64,
    pub operating_expenses: f64,
    pub tax: f64,
    pub net_profit: f64,
    pub confidence: ConfidenceLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSheetPoint {
    pub period: String,
    pub assets: f64,
    pub liabilities: f64,
    pub equity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashFlowPoint {
    pub period: String,
    pub operating_cash_flow: f64,
    pub financing_cash_flow: f64,
    pub net_cash_flow: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum HorizonStatus {
    Projected,
    Degraded { reason: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HorizonProjection {
    pub horizon: Horizon,
    pub granularity: Granularity,
    pub points: Vec<ProjectionPoint>,
    pub status: HorizonStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionSet {
    pub horizons: Vec<HorizonProjection>,
    /// Yearly balance sheet over the longest horizon.
    pub balance_sheet: Vec<BalanceSheetPoint>,
    /// Yearly cash flow over the longest horizon.
    pub cash_flow: Vec<CashFlowPoint>,
    /// Opening equity the balance-sheet roll-forward starts from.
    pub base_equity: f64,
    pub assumptions: DriverAssumptions,
}

//
// ================= Validation =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub name: String,
    pub passed: bool,
    pub severity: Severity,
    pub detail: String,
    /// Statement/period implicated on failure, for targeted regeneration.
    pub statement: Option<Statement>,
    pub period: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub checks: Vec<ValidationCheck>,
    pub passed: bool,
    pub validated_at: DateTime<Utc>,
}

impl ValidationReport {
    pub fn failed_checks(&self) -> impl Iterator<Item = &ValidationCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

//
// ================= Stage outcomes =================
//

/// Machine-readable marker for a section returned below full quality.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DegradedSection {
    pub section: String,
    pub reason: String,
}

/// Tagged per-stage outcome; stage errors never cross a stage boundary
/// as bare errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum StageOutcome<T> {
    Success { value: T },
    Degraded { value: T, markers: Vec<DegradedSection> },
    Failed { reason: String },
}

impl<T> StageOutcome<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            StageOutcome::Success { value } | StageOutcome::Degraded { value, .. } => Some(value),
            StageOutcome::Failed { .. } => None,
        }
    }

    pub fn into_value(self) -> Option<(T, Vec<DegradedSection>)> {
        match self {
            StageOutcome::Success { value } => Some((value, Vec::new())),
            StageOutcome::Degraded { value, markers } => Some((value, markers)),
            StageOutcome::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StageOutcome::Failed { .. })
    }
}

//
// ================= Final result =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Complete,
    Degraded,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTimings {
    pub extraction_ms: u64,
    pub analysis_ms: u64,
    pub projection_ms: u64,
    pub validation_ms: u64,
}

/// Assembled once at the end of a run; immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub status: PipelineStatus,
    pub dataset: AggregatedDataset,
    pub context: BusinessContext,
    pub methodology: MethodologySelection,
    pub projections: ProjectionSet,
    pub validation: ValidationReport,
    pub degraded_sections: Vec<DegradedSection>,
    pub timings: StageTimings,
    pub created_at: DateTime<Utc>,
}

//
// ================= Impl details =================
//

impl Horizon {
    pub const ALL: [Horizon; 5] = [
        Horizon::OneYear,
        Horizon::ThreeYears,
        Horizon::FiveYears,
        Horizon::TenYears,
        Horizon::FifteenYears,
    ];

    pub fn years(&self) -> u32 {
        match self {
            Horizon::OneYear => 1,
            Horizon::ThreeYears => 3,
            Horizon::FiveYears => 5,
            Horizon::TenYears => 10,
            Horizon::FifteenYears => 15,
        }
    }

    pub fn granularity(&self) -> Granularity {
        match self {
            Horizon::OneYear => Granularity::Monthly,
            Horizon::ThreeYears => Granularity::Quarterly,
            _ => Granularity::Yearly,
        }
    }

    pub fn period_count(&self) -> usize {
        match self.granularity() {
            Granularity::Monthly => (self.years() * 12) as usize,
            Granularity::Quarterly => (self.years() * 4) as usize,
            Granularity::Yearly => self.years() as usize,
        }
    }

    /// 0 for the nearest horizon, 4 for the farthest.
    pub fn rank(&self) -> u8 {
        match self {
            Horizon::OneYear => 0,
            Horizon::ThreeYears => 1,
            Horizon::FiveYears => 2,
            Horizon::TenYears => 3,
            Horizon::FifteenYears => 4,
        }
    }
}

impl ConfidenceLevel {
    pub fn rank(&self) -> u8 {
        match self {
            ConfidenceLevel::High => 3,
            ConfidenceLevel::Medium => 2,
            ConfidenceLevel::Low => 1,
            ConfidenceLevel::VeryLow => 0,
        }
    }

    /// One level lower, saturating at `VeryLow`.
    pub fn demoted(&self) -> ConfidenceLevel {
        match self {
            ConfidenceLevel::High => ConfidenceLevel::Medium,
            ConfidenceLevel::Medium => ConfidenceLevel::Low,
            _ => ConfidenceLevel::VeryLow,
        }
    }
}

impl PartialOrd for ConfidenceLevel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ConfidenceLevel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl Severity {
    fn rank(&self) -> u8 {
        match self {
            Severity::Low => 0,
            Severity::Medium => 1,
            Severity::High => 2,
            Severity::Critical => 3,
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelTier::Light => "light",
            ModelTier::Advanced => "advanced",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Horizon::OneYear => "1y",
            Horizon::ThreeYears => "3y",
            Horizon::FiveYears => "5y",
            Horizon::TenYears => "10y",
            Horizon::FifteenYears => "15y",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for ForecastMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ForecastMethod::TrendLinear => "trend-linear",
            ForecastMethod::ExponentialSmoothing => "exponential-smoothing",
            ForecastMethod::SeasonalDecomposition => "seasonal-decomposition",
        };
        write!(f, "{}", s)
    }
}
