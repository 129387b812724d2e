//! Pipeline orchestration
//!
//! Drives the three model stages and the local reconciliation pass as a
//! strict state machine. Stage boundaries are the only places where
//! degradation markers accumulate; a failed required stage aborts the
//! run with a structured error rather than a partial result.

use crate::analyze::Stage2Analyst;
use crate::config::PipelineConfig;
use crate::credentials::CredentialPool;
use crate::error::PipelineError;
use crate::extract::Stage1Extractor;
use crate::invoker::{InferenceBackend, ModelInvoker};
use crate::models::{
    DegradedSection, Document, PipelineResult, PipelineStatus, ProjectionSet, StageTimings,
    Statement, ValidationReport,
};
use crate::project::Stage3Projector;
use crate::validate::{create_default_validator, ReconciliationValidator};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Run lifecycle, held for the duration of a run and logged on every
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Extracting,
    Analyzing,
    Projecting,
    Validating,
    Done,
    Aborted,
}

impl RunState {
    /// Stages advance strictly forward; any non-terminal state may
    /// abort. `Done` and `Aborted` are terminal.
    fn can_advance(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Extracting, Analyzing)
                | (Analyzing, Projecting)
                | (Projecting, Validating)
                | (Validating, Done)
                | (Extracting | Analyzing | Projecting | Validating, Aborted)
        )
    }
}

pub struct PipelineOrchestrator {
    extractor: Stage1Extractor,
    analyst: Stage2Analyst,
    projector: Stage3Projector,
    validator: ReconciliationValidator,
    config: PipelineConfig,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    /// Wire the stages onto one shared invoker so credential state and
    /// the sustained-capacity limit are global across stages.
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        config: PipelineConfig,
    ) -> crate::Result<Self> {
        config.validate()?;

        let pool = Arc::new(CredentialPool::new(config.credential_keys.clone(), &config));
        let invoker = Arc::new(ModelInvoker::new(backend, pool, config.clone()));

        Ok(Self {
            extractor: Stage1Extractor::new(Arc::clone(&invoker), config.clone()),
            analyst: Stage2Analyst::new(Arc::clone(&invoker), config.clone()),
            projector: Stage3Projector::new(invoker, config.clone()),
            validator: create_default_validator(config.reconciliation_epsilon),
            config,
        })
    }

    pub async fn run(&self, documents: Vec<Document>) -> crate::Result<PipelineResult> {
        if documents.is_empty() {
            return Err(PipelineError::InvalidInput(
                "at least one document is required".to_string(),
            ));
        }

        let run_id = Uuid::new_v4();
        let deadline = Instant::now() + self.config.pipeline_deadline();
        let mut timings = StageTimings::default();
        let mut degraded: Vec<DegradedSection> = Vec::new();

        info!(%run_id, documents = documents.len(), "Pipeline run starting");

        // ---- Stage1: extraction ----
        let mut state = RunState::Extracting;
        info!(%run_id, ?state, "Pipeline state");
        let started = std::time::Instant::now();
        let outcome = self.extractor.extract(&documents, deadline).await;
        timings.extraction_ms = started.elapsed().as_millis() as u64;
        let dataset = self.required(run_id, "extraction", outcome, &mut degraded, &mut state)?;

        // ---- Stage2: analysis ----
        self.advance(run_id, &mut state, RunState::Analyzing);
        let started = std::time::Instant::now();
        let outcome = self.analyst.analyze(&dataset, deadline).await;
        timings.analysis_ms = started.elapsed().as_millis() as u64;
        let analysis = self.required(run_id, "analysis", outcome, &mut degraded, &mut state)?;

        // ---- Stage3: projection ----
        self.advance(run_id, &mut state, RunState::Projecting);
        let started = std::time::Instant::now();
        let outcome = self.projector.project(&analysis, &dataset, deadline).await;
        timings.projection_ms = started.elapsed().as_millis() as u64;
        let mut projections =
            self.required(run_id, "projection", outcome, &mut degraded, &mut state)?;

        // ---- Local reconciliation ----
        self.advance(run_id, &mut state, RunState::Validating);
        let started = std::time::Instant::now();
        let validation = self.reconcile(run_id, &mut projections, &mut degraded);
        timings.validation_ms = started.elapsed().as_millis() as u64;

        self.advance(run_id, &mut state, RunState::Done);
        let status = if degraded.is_empty() {
            PipelineStatus::Complete
        } else {
            PipelineStatus::Degraded
        };
        info!(%run_id, ?status, markers = degraded.len(), "Pipeline run finished");

        Ok(PipelineResult {
            run_id,
            status,
            dataset,
            context: analysis.context,
            methodology: analysis.methodology,
            projections,
            validation,
            degraded_sections: degraded,
            timings,
            created_at: Utc::now(),
        })
    }

    /// Validate, regenerate each implicated statement at most once, then
    /// validate again. Checks still failing after regeneration become
    /// degradation markers; numbers are never silently patched.
    fn reconcile(
        &self,
        run_id: Uuid,
        projections: &mut ProjectionSet,
        degraded: &mut Vec<DegradedSection>,
    ) -> ValidationReport {
        let report = self.validator.validate(projections);
        if report.passed {
            return report;
        }

        let mut statements: Vec<Statement> = Vec::new();
        for check in report.failed_checks() {
            if let Some(statement) = check.statement {
                if !statements.contains(&statement) {
                    statements.push(statement);
                }
            }
        }
        for statement in statements {
            warn!(%run_id, ?statement, "Reconciliation failed, regenerating statement");
            self.projector.regenerate_statement(projections, statement);
        }

        let report = self.validator.validate(projections);
        for check in report.failed_checks() {
            warn!(%run_id, check = %check.name, detail = %check.detail, "Check still failing after regeneration");
            degraded.push(DegradedSection {
                section: format!("validation:{}", check.name),
                reason: check.detail.clone(),
            });
        }
        report
    }

    /// Unwrap a required stage outcome, folding markers into the run and
    /// aborting on stage failure.
    fn required<T>(
        &self,
        run_id: Uuid,
        stage: &'static str,
        outcome: crate::Result<crate::models::StageOutcome<T>>,
        degraded: &mut Vec<DegradedSection>,
        state: &mut RunState,
    ) -> crate::Result<T> {
        match outcome {
            Ok(crate::models::StageOutcome::Success { value }) => Ok(value),
            Ok(crate::models::StageOutcome::Degraded { value, markers }) => {
                for marker in &markers {
                    warn!(%run_id, stage, section = %marker.section, reason = %marker.reason, "Stage degraded");
                }
                degraded.extend(markers);
                Ok(value)
            }
            Ok(crate::models::StageOutcome::Failed { reason }) => {
                self.advance(run_id, state, RunState::Aborted);
                error!(%run_id, stage, %reason, "Stage failed, aborting run");
                let detail = format!("{} stage failed: {}", stage, reason);
                Err(if stage == "extraction" {
                    PipelineError::InvalidInput(detail)
                } else {
                    PipelineError::SchemaValidation(detail)
                })
            }
            Err(e) => {
                self.advance(run_id, state, RunState::Aborted);
                error!(%run_id, stage, error = %e, "Stage error, aborting run");
                Err(e)
            }
        }
    }

    fn advance(&self, run_id: Uuid, state: &mut RunState, next: RunState) {
        debug_assert!(
            state.can_advance(next),
            "illegal run-state transition {:?} -> {:?}",
            state,
            next
        );
        *state = next;
        info!(%run_id, state = ?next, "Pipeline state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::{BackendError, ScriptedBackend};
    use crate::models::ModelTier;
    use crate::periods;

    const CLASSIFICATION: &str =
        r#"{"industry": "saas", "maturity_stage": "growth", "competitive_position": "challenger"}"#;
    const DRIVERS: &str = r#"{"annual_growth_rate": 0.12, "terminal_growth_rate": 0.03, "gross_margin": 0.6, "opex_ratio": 0.3, "seasonal_multipliers": [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0], "leverage_ratio": 0.8}"#;

    fn extraction_json() -> String {
        let mut revenue = serde_json::Map::new();
        let mut cogs = serde_json::Map::new();
        let mut opex = serde_json::Map::new();
        let (mut year, mut month) = (2023, 1);
        for i in 0..24u32 {
            let label = periods::month_label(year, month);
            revenue.insert(label.clone(), serde_json::json!(100_000.0 + 1_000.0 * i as f64));
            cogs.insert(label.clone(), serde_json::json!(40_000.0));
            opex.insert(label, serde_json::json!(30_000.0));
            let next = periods::next_month(year, month);
            year = next.0;
            month = next.1;
        }
        serde_json::json!({
            "revenue": revenue,
            "cost_of_sales": cogs,
            "operating_expenses": opex,
        })
        .to_string()
    }

    /// Routes each stage's prompt to a canned response, the way a live
    /// backend would answer.
    fn scripted_backend() -> Arc<ScriptedBackend> {
        let extraction = extraction_json();
        Arc::new(ScriptedBackend::new().with_fallback(move |_, prompt| {
            if prompt.contains("data extraction engine") {
                Ok(extraction.clone())
            } else if prompt.contains("business analyst") {
                Ok(CLASSIFICATION.to_string())
            } else if prompt.contains("forecasting engine") {
                Ok(DRIVERS.to_string())
            } else {
                Err(BackendError::Permanent("unrecognized prompt".to_string()))
            }
        }))
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            credential_keys: vec!["k1".to_string(), "k2".to_string()],
            ..Default::default()
        }
    }

    fn sample_documents(count: usize) -> Vec<Document> {
        (0..count)
            .map(|i| {
                Document::new(
                    format!("statements-{}.csv", i + 1),
                    "text/csv",
                    b"period,revenue\n2023-01,100000\n".to_vec(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_full_run_completes_with_consistent_result() {
        let orchestrator =
            PipelineOrchestrator::new(scripted_backend(), test_config()).unwrap();

        let result = orchestrator.run(sample_documents(1)).await.unwrap();

        assert_eq!(result.status, PipelineStatus::Complete);
        assert!(result.degraded_sections.is_empty());
        assert!(result.validation.passed);
        assert_eq!(result.projections.horizons.len(), 5);
        assert!(result.dataset.quality.completeness > 0.9);
        // Timings are recorded per stage.
        assert!(result.timings.extraction_ms < 10_000);
    }

    #[tokio::test]
    async fn test_empty_document_list_rejected() {
        let orchestrator =
            PipelineOrchestrator::new(scripted_backend(), test_config()).unwrap();

        let err = orchestrator.run(Vec::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_unusable_extraction_aborts_run() {
        let backend = Arc::new(ScriptedBackend::new().with_fallback(|tier, _| {
            match tier {
                // Extraction replies are prose with no recoverable JSON.
                ModelTier::Light => Ok("I could not find any figures.".to_string()),
                ModelTier::Advanced => Ok(CLASSIFICATION.to_string()),
            }
        }));
        let config = PipelineConfig {
            max_attempts: 1,
            ..test_config()
        };
        let orchestrator = PipelineOrchestrator::new(backend, config).unwrap();

        let err = orchestrator.run(sample_documents(2)).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_auth_failure_on_every_key_surfaces_exhaustion() {
        let backend = Arc::new(ScriptedBackend::new().with_fallback(|_, _| {
            Err(BackendError::Auth("key revoked".to_string()))
        }));
        let orchestrator = PipelineOrchestrator::new(backend, test_config()).unwrap();

        let err = orchestrator.run(sample_documents(1)).await.unwrap_err();
        assert!(
            matches!(
                err,
                PipelineError::CredentialExhausted(_) | PipelineError::InvalidInput(_)
            ),
            "unexpected error: {}",
            err
        );
    }

    #[tokio::test]
    async fn test_failed_document_degrades_but_run_finishes() {
        let backend = scripted_backend();
        // First Light call fails permanently; the sibling still extracts.
        backend.script(
            ModelTier::Light,
            Err(BackendError::Permanent("unreadable scan".to_string())),
        );
        let orchestrator = PipelineOrchestrator::new(backend, test_config()).unwrap();

        let result = orchestrator.run(sample_documents(2)).await.unwrap();

        assert_eq!(result.status, PipelineStatus::Degraded);
        assert!(result
            .degraded_sections
            .iter()
            .any(|m| m.section.starts_with("document:")));
        // The merged dataset still feeds a full projection.
        assert_eq!(result.projections.horizons.len(), 5);
    }

    #[tokio::test]
    async fn test_reconcile_regenerates_tampered_balance_sheet() {
        let orchestrator =
            PipelineOrchestrator::new(scripted_backend(), test_config()).unwrap();
        let result = orchestrator.run(sample_documents(1)).await.unwrap();

        let mut projections = result.projections.clone();
        projections.balance_sheet[0].assets += 5_000.0;
        let mut degraded = Vec::new();

        let report = orchestrator.reconcile(result.run_id, &mut projections, &mut degraded);

        assert!(report.passed, "regeneration did not restore balance");
        assert!(degraded.is_empty());
        let point = &projections.balance_sheet[0];
        assert!((point.assets - (point.liabilities + point.equity)).abs() < 0.01);
    }

    #[test]
    fn test_run_states_advance_forward_and_abort_from_any_stage() {
        use RunState::*;

        let chain = [Extracting, Analyzing, Projecting, Validating, Done];
        for pair in chain.windows(2) {
            assert!(pair[0].can_advance(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
        for stage in [Extracting, Analyzing, Projecting, Validating] {
            assert!(stage.can_advance(Aborted), "{:?} cannot abort", stage);
        }

        // Terminal states go nowhere; stages never skip or move backward.
        assert!(!Done.can_advance(Aborted));
        assert!(!Aborted.can_advance(Extracting));
        assert!(!Extracting.can_advance(Projecting));
        assert!(!Analyzing.can_advance(Extracting));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_construction() {
        let config = PipelineConfig {
            credential_keys: Vec::new(),
            ..Default::default()
        };
        let err = PipelineOrchestrator::new(scripted_backend(), config).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }
}
