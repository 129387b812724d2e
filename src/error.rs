//! Error types for the forecast pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {

    // =============================
    // Credential / capacity errors
    // =============================

    #[error("No healthy credential available: {0}")]
    CredentialExhausted(String),

    // =============================
    // Invocation errors
    // =============================

    #[error("Invocation timed out: {0}")]
    InvocationTimeout(String),

    #[error("Transient API error: {0}")]
    TransientApi(String),

    #[error("Permanent API error: {0}")]
    PermanentApi(String),

    #[error("Response unparsable after all strategies: {0}")]
    ParseFailure(String),

    // =============================
    // Stage errors
    // =============================

    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("Pipeline deadline exceeded: {0}")]
    PipelineTimeout(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
