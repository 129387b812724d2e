//! Cross-statement reconciliation
//!
//! Pure arithmetic over a finished `ProjectionSet`. The validator never
//! repairs numbers; it reports which identities fail and where, and the
//! orchestrator decides whether to regenerate a statement.

use crate::models::{
    Granularity, Horizon, ProjectionSet, Severity, Statement, ValidationCheck, ValidationReport,
};
use chrono::Utc;
use tracing::{debug, info};

/// A single reconciliation rule.
pub trait ReconciliationCheck: Send + Sync {
    fn name(&self) -> &'static str;
    fn severity(&self) -> Severity;
    fn run(&self, set: &ProjectionSet, epsilon: f64) -> CheckResult;
}

pub struct CheckResult {
    pub passed: bool,
    pub detail: String,
    /// Statement to regenerate when the check fails.
    pub statement: Option<Statement>,
    /// First offending period, when one exists.
    pub period: Option<String>,
}

impl CheckResult {
    fn pass(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            detail: detail.into(),
            statement: None,
            period: None,
        }
    }

    fn fail(detail: impl Into<String>, statement: Statement, period: Option<String>) -> Self {
        Self {
            passed: false,
            detail: detail.into(),
            statement: Some(statement),
            period,
        }
    }
}

//
// ================= Checks =================
//

/// gross_profit = revenue - cost_of_sales and
/// net_profit = gross_profit - operating_expenses - tax, every point,
/// every horizon.
pub struct PnlConsistencyCheck;

impl ReconciliationCheck for PnlConsistencyCheck {
    fn name(&self) -> &'static str {
        "pnl_consistency"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn run(&self, set: &ProjectionSet, epsilon: f64) -> CheckResult {
        let mut points = 0usize;
        for horizon in &set.horizons {
            for point in &horizon.points {
                points += 1;
                let gross_gap = point.gross_profit - (point.revenue - point.cost_of_sales);
                if gross_gap.abs() > epsilon {
                    return CheckResult::fail(
                        format!(
                            "gross profit off by {:.4} at {} ({})",
                            gross_gap, point.period, horizon.horizon
                        ),
                        Statement::ProfitAndLoss,
                        Some(point.period.clone()),
                    );
                }
                let net_gap = point.net_profit
                    - (point.gross_profit - point.operating_expenses - point.tax);
                if net_gap.abs() > epsilon {
                    return CheckResult::fail(
                        format!(
                            "net profit off by {:.4} at {} ({})",
                            net_gap, point.period, horizon.horizon
                        ),
                        Statement::ProfitAndLoss,
                        Some(point.period.clone()),
                    );
                }
            }
        }
        CheckResult::pass(format!("{} points consistent", points))
    }
}

/// assets = liabilities + equity for every balance-sheet period.
pub struct BalanceSheetEqualityCheck;

impl ReconciliationCheck for BalanceSheetEqualityCheck {
    fn name(&self) -> &'static str {
        "balance_sheet_equality"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn run(&self, set: &ProjectionSet, epsilon: f64) -> CheckResult {
        for point in &set.balance_sheet {
            let gap = point.assets - (point.liabilities + point.equity);
            if gap.abs() > epsilon {
                return CheckResult::fail(
                    format!("assets off by {:.4} at {}", gap, point.period),
                    Statement::BalanceSheet,
                    Some(point.period.clone()),
                );
            }
        }
        CheckResult::pass(format!("{} periods balance", set.balance_sheet.len()))
    }
}

/// Operating cash flow ties back to the yearly net profit of the longest
/// horizon, and net cash flow sums its components.
pub struct CashFlowLinkageCheck;

impl ReconciliationCheck for CashFlowLinkageCheck {
    fn name(&self) -> &'static str {
        "cash_flow_linkage"
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn run(&self, set: &ProjectionSet, epsilon: f64) -> CheckResult {
        if set.cash_flow.is_empty() {
            return CheckResult::pass("no cash flow statement to reconcile");
        }

        let yearly = set
            .horizons
            .iter()
            .find(|h| h.horizon == Horizon::FifteenYears && h.granularity == Granularity::Yearly);
        let Some(yearly) = yearly else {
            return CheckResult::pass("no yearly horizon to reconcile against");
        };

        for point in &set.cash_flow {
            let sum_gap =
                point.net_cash_flow - (point.operating_cash_flow + point.financing_cash_flow);
            if sum_gap.abs() > epsilon {
                return CheckResult::fail(
                    format!("net cash flow off by {:.4} at {}", sum_gap, point.period),
                    Statement::CashFlow,
                    Some(point.period.clone()),
                );
            }
            if let Some(pnl) = yearly.points.iter().find(|p| p.period == point.period) {
                let link_gap = point.operating_cash_flow - pnl.net_profit;
                if link_gap.abs() > epsilon {
                    return CheckResult::fail(
                        format!(
                            "operating cash flow diverges from net profit by {:.4} at {}",
                            link_gap, point.period
                        ),
                        Statement::CashFlow,
                        Some(point.period.clone()),
                    );
                }
            }
        }
        CheckResult::pass(format!("{} periods linked", set.cash_flow.len()))
    }
}

/// Confidence must not increase as the horizon extends.
pub struct MonotonicConfidenceCheck;

impl ReconciliationCheck for MonotonicConfidenceCheck {
    fn name(&self) -> &'static str {
        "monotonic_confidence"
    }

    fn severity(&self) -> Severity {
        Severity::Medium
    }

    fn run(&self, set: &ProjectionSet, _epsilon: f64) -> CheckResult {
        let mut previous: Option<(Horizon, crate::models::ConfidenceLevel)> = None;
        let mut ordered: Vec<&crate::models::HorizonProjection> = set.horizons.iter().collect();
        ordered.sort_by_key(|h| h.horizon.rank());

        for horizon in ordered {
            let Some(point) = horizon.points.first() else {
                continue;
            };
            if let Some((prev_horizon, prev_conf)) = previous {
                if point.confidence > prev_conf {
                    return CheckResult::fail(
                        format!(
                            "confidence rises from {:?} at {} to {:?} at {}",
                            prev_conf, prev_horizon, point.confidence, horizon.horizon
                        ),
                        Statement::ProfitAndLoss,
                        Some(point.period.clone()),
                    );
                }
            }
            previous = Some((horizon.horizon, point.confidence));
        }
        CheckResult::pass("confidence non-increasing across horizons")
    }
}

//
// ================= Validator =================
//

pub struct ReconciliationValidator {
    checks: Vec<Box<dyn ReconciliationCheck>>,
    epsilon: f64,
}

impl ReconciliationValidator {
    pub fn new(checks: Vec<Box<dyn ReconciliationCheck>>, epsilon: f64) -> Self {
        Self { checks, epsilon }
    }

    pub fn validate(&self, set: &ProjectionSet) -> ValidationReport {
        let mut checks = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            let result = check.run(set, self.epsilon);
            debug!(check = check.name(), passed = result.passed, detail = %result.detail, "Reconciliation check");
            checks.push(ValidationCheck {
                name: check.name().to_string(),
                passed: result.passed,
                severity: check.severity(),
                detail: result.detail,
                statement: result.statement,
                period: result.period,
            });
        }
        let passed = checks.iter().all(|c| c.passed);
        info!(passed, checks = checks.len(), "Reconciliation complete");
        ValidationReport {
            checks,
            passed,
            validated_at: Utc::now(),
        }
    }
}

/// The standard check suite, in severity order.
pub fn create_default_validator(epsilon: f64) -> ReconciliationValidator {
    ReconciliationValidator::new(
        vec![
            Box::new(PnlConsistencyCheck),
            Box::new(BalanceSheetEqualityCheck),
            Box::new(CashFlowLinkageCheck),
            Box::new(MonotonicConfidenceCheck),
        ],
        epsilon,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        BalanceSheetPoint, CashFlowPoint, ConfidenceLevel, DriverAssumptions, Granularity,
        HorizonProjection, HorizonStatus, ProjectionPoint,
    };

    fn point(period: &str, revenue: f64, confidence: ConfidenceLevel) -> ProjectionPoint {
        let cost_of_sales = revenue * 0.4;
        let gross_profit = revenue - cost_of_sales;
        let operating_expenses = revenue * 0.3;
        let tax = (gross_profit - operating_expenses).max(0.0) * 0.25;
        ProjectionPoint {
            period: period.to_string(),
            revenue,
            cost_of_sales,
            gross_profit,
            operating_expenses,
            tax,
            net_profit: gross_profit - operating_expenses - tax,
            confidence,
        }
    }

    fn consistent_set() -> ProjectionSet {
        let horizons = Horizon::ALL
            .into_iter()
            .map(|horizon| {
                let confidence = match horizon {
                    Horizon::OneYear => ConfidenceLevel::High,
                    Horizon::ThreeYears | Horizon::FiveYears => ConfidenceLevel::Medium,
                    Horizon::TenYears => ConfidenceLevel::Low,
                    Horizon::FifteenYears => ConfidenceLevel::VeryLow,
                };
                let points = (0..horizon.period_count())
                    .map(|i| {
                        let label = match horizon.granularity() {
                            Granularity::Yearly => format!("FY{}", 2026 + i),
                            _ => format!("P{:02}", i + 1),
                        };
                        point(&label, 1_200_000.0, confidence)
                    })
                    .collect();
                HorizonProjection {
                    horizon,
                    granularity: horizon.granularity(),
                    points,
                    status: HorizonStatus::Projected,
                }
            })
            .collect::<Vec<_>>();

        let yearly = horizons
            .iter()
            .find(|h| h.horizon == Horizon::FifteenYears)
            .unwrap();
        let mut equity = 500_000.0;
        let balance_sheet = yearly
            .points
            .iter()
            .map(|p| {
                equity += p.net_profit;
                let liabilities = equity * 0.8;
                BalanceSheetPoint {
                    period: p.period.clone(),
                    assets: liabilities + equity,
                    liabilities,
                    equity,
                }
            })
            .collect();
        let cash_flow = yearly
            .points
            .iter()
            .map(|p| CashFlowPoint {
                period: p.period.clone(),
                operating_cash_flow: p.net_profit,
                financing_cash_flow: 0.0,
                net_cash_flow: p.net_profit,
            })
            .collect();

        ProjectionSet {
            horizons,
            balance_sheet,
            cash_flow,
            base_equity: 500_000.0,
            assumptions: DriverAssumptions {
                annual_growth_rate: 0.1,
                terminal_growth_rate: 0.02,
                gross_margin: 0.6,
                opex_ratio: 0.3,
                seasonal_multipliers: vec![1.0; 12],
                leverage_ratio: 0.8,
            },
        }
    }

    #[test]
    fn test_consistent_set_passes_all_checks() {
        let report = create_default_validator(0.01).validate(&consistent_set());
        assert!(
            report.passed,
            "failures: {:?}",
            report.failed_checks().collect::<Vec<_>>()
        );
        assert_eq!(report.checks.len(), 4);
    }

    #[test]
    fn test_broken_net_profit_names_statement_and_period() {
        let mut set = consistent_set();
        set.horizons[0].points[3].net_profit += 50.0;

        let report = create_default_validator(0.01).validate(&set);
        assert!(!report.passed);
        let failed: Vec<_> = report.failed_checks().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].name, "pnl_consistency");
        assert_eq!(failed[0].statement, Some(Statement::ProfitAndLoss));
        assert_eq!(failed[0].period.as_deref(), Some("P04"));
        assert_eq!(failed[0].severity, Severity::Critical);
    }

    #[test]
    fn test_unbalanced_sheet_flagged_for_regeneration() {
        let mut set = consistent_set();
        set.balance_sheet[2].assets += 1_000.0;

        let report = create_default_validator(0.01).validate(&set);
        let failed: Vec<_> = report.failed_checks().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].statement, Some(Statement::BalanceSheet));
    }

    #[test]
    fn test_cash_flow_must_tie_to_net_profit() {
        let mut set = consistent_set();
        set.cash_flow[0].operating_cash_flow += 10_000.0;
        set.cash_flow[0].net_cash_flow += 10_000.0;

        let report = create_default_validator(0.01).validate(&set);
        let failed: Vec<_> = report.failed_checks().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].name, "cash_flow_linkage");
        assert_eq!(failed[0].statement, Some(Statement::CashFlow));
    }

    #[test]
    fn test_rising_confidence_rejected() {
        let mut set = consistent_set();
        for point in &mut set.horizons[4].points {
            point.confidence = ConfidenceLevel::High;
        }

        let report = create_default_validator(0.01).validate(&set);
        let failed: Vec<_> = report.failed_checks().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].name, "monotonic_confidence");
    }

    #[test]
    fn test_epsilon_tolerates_float_noise() {
        let mut set = consistent_set();
        set.horizons[0].points[0].gross_profit += 0.004;

        let report = create_default_validator(0.01).validate(&set);
        assert!(report.passed);
    }
}
