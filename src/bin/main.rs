use financial_forecast_pipeline::{
    config::PipelineConfig,
    invoker::{BackendError, GeminiBackend, InferenceBackend, ScriptedBackend},
    models::Document,
    pipeline::PipelineOrchestrator,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let mut config = PipelineConfig::from_env();

    let backend: Arc<dyn InferenceBackend> = if config.credential_keys.is_empty() {
        eprintln!("⚠️  GEMINI_API_KEYS not set in .env, running against the offline demo backend");
        config.credential_keys = vec!["demo-key".to_string()];
        Arc::new(demo_backend())
    } else {
        info!(keys = config.credential_keys.len(), "Using Gemini backend");
        Arc::new(GeminiBackend::new()?)
    };

    let documents = load_documents(std::env::args().skip(1))?;
    info!(documents = documents.len(), "Financial Forecast Pipeline starting");

    let orchestrator = PipelineOrchestrator::new(backend, config)?;
    match orchestrator.run(documents).await {
        Ok(result) => {
            info!(run_id = %result.run_id, status = ?result.status, "Forecast complete");
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Forecast failed: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}

fn load_documents(
    paths: impl Iterator<Item = String>,
) -> financial_forecast_pipeline::Result<Vec<Document>> {
    let mut documents = Vec::new();
    for path in paths {
        // Unreadable paths surface as PipelineError::IoError.
        let content = std::fs::read(&path)?;
        let media_type = match path.rsplit('.').next() {
            Some("csv") => "text/csv",
            Some("json") => "application/json",
            Some("pdf") => "application/pdf",
            _ => "text/plain",
        };
        documents.push(Document::new(path, media_type, content));
    }
    if documents.is_empty() {
        // Built-in 24-month sample so the binary runs out of the box.
        documents.push(Document::new(
            "sample-pnl.csv",
            "text/csv",
            sample_pnl_csv().into_bytes(),
        ));
    }
    Ok(documents)
}

fn sample_pnl_csv() -> String {
    let mut csv = String::from("period,revenue,cost_of_sales,operating_expenses\n");
    for i in 0..24u32 {
        let year = 2023 + (i / 12) as i32;
        let month = i % 12 + 1;
        let revenue = 100_000.0 + 1_500.0 * i as f64;
        csv.push_str(&format!(
            "{:04}-{:02},{:.0},{:.0},{:.0}\n",
            year,
            month,
            revenue,
            revenue * 0.4,
            revenue * 0.3,
        ));
    }
    csv
}

/// Offline stand-in that answers each stage's prompt with plausible
/// JSON, so the full pipeline can be exercised without an API key.
fn demo_backend() -> ScriptedBackend {
    ScriptedBackend::new().with_fallback(|tier, prompt| {
        if prompt.contains("data extraction engine") {
            Ok(demo_extraction_json())
        } else if prompt.contains("business analyst") {
            Ok(r#"{"industry": "software", "maturity_stage": "growth", "competitive_position": "challenger"}"#.to_string())
        } else if prompt.contains("forecasting engine") {
            Ok(r#"{"annual_growth_rate": 0.15, "terminal_growth_rate": 0.03, "gross_margin": 0.6, "opex_ratio": 0.3, "seasonal_multipliers": [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0], "leverage_ratio": 0.7}"#.to_string())
        } else {
            Err(BackendError::Permanent(format!(
                "demo backend has no canned answer for a {} prompt",
                tier
            )))
        }
    })
}

fn demo_extraction_json() -> String {
    let mut revenue = serde_json::Map::new();
    let mut cogs = serde_json::Map::new();
    let mut opex = serde_json::Map::new();
    for i in 0..24u32 {
        let label = format!("{:04}-{:02}", 2023 + (i / 12) as i32, i % 12 + 1);
        let value = 100_000.0 + 1_500.0 * i as f64;
        revenue.insert(label.clone(), serde_json::json!(value));
        cogs.insert(label.clone(), serde_json::json!(value * 0.4));
        opex.insert(label, serde_json::json!(value * 0.3));
    }
    serde_json::json!({
        "revenue": revenue,
        "cost_of_sales": cogs,
        "operating_expenses": opex,
    })
    .to_string()
}
