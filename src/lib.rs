//! Financial Forecast Pipeline
//!
//! A three-stage LLM forecasting pipeline that:
//! - Extracts metric series from raw financial documents (light tier)
//! - Classifies the business and selects a forecast methodology
//! - Projects P&L, balance sheet and cash flow over five horizons
//! - Computes every derived financial line locally (LLM supplies
//!   drivers only, never arithmetic)
//! - Reconciles the statements and regenerates any that fail
//! - Rotates API credentials and bounds sustained-tier concurrency
//!
//! PIPELINE:
//! DOCUMENTS → EXTRACT → ANALYZE → PROJECT → RECONCILE → RESULT

pub mod analyze;
pub mod config;
pub mod credentials;
pub mod error;
pub mod extract;
pub mod invoker;
pub mod models;
pub mod periods;
pub mod pipeline;
pub mod project;
pub mod validate;

pub use error::{PipelineError, Result};

// Re-export common types
pub use models::*;
pub use pipeline::PipelineOrchestrator;
