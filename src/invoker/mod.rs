//! Model invocation layer
//!
//! Wraps a single call to the inference service for a given capability
//! tier: credential acquisition, retry with exponential backoff, the
//! advanced-tier concurrency cap, and layered response parsing.
//! Uses a long-lived reqwest::Client for connection pooling.

pub mod parser;

use crate::config::PipelineConfig;
use crate::credentials::{Acquire, CredentialLease, CredentialPool, FailureKind};
use crate::error::PipelineError;
use crate::models::ModelTier;
use crate::Result;
use async_trait::async_trait;
use parser::ParseOutcome;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Failure classes reported by a backend implementation.
#[derive(Debug, Clone)]
pub enum BackendError {
    Timeout,
    RateLimited(String),
    Transient(String),
    /// Authentication rejected outright; retires the credential.
    Auth(String),
    Permanent(String),
}

/// Seam to the external inference service. Production uses
/// [`GeminiBackend`]; tests and offline runs use [`ScriptedBackend`].
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn generate(
        &self,
        tier: ModelTier,
        prompt: &str,
        api_key: &str,
        timeout: Duration,
    ) -> std::result::Result<String, BackendError>;
}

/// Resolved invocation: the parsed payload plus any repair notes
/// (non-empty notes mean the response was partially parsed).
#[derive(Debug, Clone)]
pub struct Invocation {
    pub value: Value,
    pub notes: Vec<String>,
    pub attempts: u32,
}

/// Per-invocation retry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptState {
    Pending,
    Retrying(u32),
}

impl AttemptState {
    fn attempt(&self) -> u32 {
        match self {
            AttemptState::Pending => 1,
            AttemptState::Retrying(n) => *n,
        }
    }
}

pub struct ModelInvoker {
    backend: Arc<dyn InferenceBackend>,
    pool: Arc<CredentialPool>,
    /// Process-wide cap on in-flight advanced-tier calls, shared across
    /// concurrent pipeline runs. tokio's semaphore is FIFO-fair, which
    /// gives queued callers submission-order service.
    advanced_limit: Arc<Semaphore>,
    config: PipelineConfig,
}

impl ModelInvoker {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        pool: Arc<CredentialPool>,
        config: PipelineConfig,
    ) -> Self {
        let advanced_limit = Arc::new(Semaphore::new(config.advanced_concurrency));
        Self {
            backend,
            pool,
            advanced_limit,
            config,
        }
    }

    /// Invoke the service at `tier`, retrying transient failures with
    /// exponential backoff up to the configured attempt bound. The error
    /// surfaced after exhausting retries is the last one observed, never
    /// a generic timeout.
    pub async fn invoke(
        &self,
        tier: ModelTier,
        prompt: &str,
        deadline: Instant,
    ) -> Result<Invocation> {
        // Advanced-tier calls queue on the global semaphore, each with
        // its own remaining-deadline budget so a queued call is cancelled
        // rather than served arbitrarily late.
        let _permit = if tier == ModelTier::Advanced {
            match tokio::time::timeout_at(deadline, self.advanced_limit.clone().acquire_owned())
                .await
            {
                Ok(Ok(permit)) => Some(permit),
                Ok(Err(_)) => {
                    return Err(PipelineError::TransientApi(
                        "advanced-tier semaphore closed".to_string(),
                    ))
                }
                Err(_) => {
                    return Err(PipelineError::PipelineTimeout(
                        "deadline expired while queued for advanced tier".to_string(),
                    ))
                }
            }
        } else {
            None
        };

        let mut state = AttemptState::Pending;
        let mut last_error: Option<PipelineError> = None;

        loop {
            let attempt = state.attempt();
            if attempt > self.config.max_attempts {
                // Exhausted retries: surface the last observed error.
                return Err(last_error.unwrap_or_else(|| {
                    PipelineError::TransientApi("retry budget exhausted".to_string())
                }));
            }

            let lease = self.acquire_credential(deadline).await?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.pool.release(&lease);
                return Err(last_error.unwrap_or_else(|| {
                    PipelineError::PipelineTimeout("deadline expired before attempt".to_string())
                }));
            }
            let attempt_timeout = self.config.invocation_timeout().min(remaining);

            debug!(%tier, attempt, state = ?state, "Invoking inference service");

            match self
                .backend
                .generate(tier, prompt, &lease.key, attempt_timeout)
                .await
            {
                Ok(raw) => {
                    self.pool.mark_success(&lease);
                    self.pool.release(&lease);

                    match parser::parse_response(&raw) {
                        ParseOutcome::Parsed(value) => {
                            info!(%tier, attempt, "Invocation parsed");
                            return Ok(Invocation {
                                value,
                                notes: Vec::new(),
                                attempts: attempt,
                            });
                        }
                        ParseOutcome::PartiallyParsed(value, notes) => {
                            warn!(%tier, attempt, ?notes, "Invocation partially parsed");
                            return Ok(Invocation {
                                value,
                                notes,
                                attempts: attempt,
                            });
                        }
                        ParseOutcome::Failed(reason) => {
                            // Unparsable output is retried like any other
                            // transient fault, up to the attempt bound.
                            warn!(%tier, attempt, %reason, "Response unparsable");
                            last_error = Some(PipelineError::ParseFailure(reason));
                        }
                    }
                }
                Err(BackendError::RateLimited(detail)) => {
                    self.pool.mark_failure(&lease, FailureKind::RateLimit);
                    last_error = Some(PipelineError::TransientApi(format!(
                        "rate limited: {}",
                        detail
                    )));
                }
                Err(BackendError::Timeout) => {
                    self.pool.mark_failure(&lease, FailureKind::Other);
                    last_error = Some(PipelineError::InvocationTimeout(format!(
                        "attempt {} exceeded {:?}",
                        attempt, attempt_timeout
                    )));
                }
                Err(BackendError::Transient(detail)) => {
                    self.pool.mark_failure(&lease, FailureKind::Other);
                    last_error = Some(PipelineError::TransientApi(detail));
                }
                Err(BackendError::Auth(detail)) => {
                    self.pool.mark_failure(&lease, FailureKind::Auth);
                    return Err(PipelineError::PermanentApi(format!(
                        "authentication rejected: {}",
                        detail
                    )));
                }
                Err(BackendError::Permanent(detail)) => {
                    self.pool.release(&lease);
                    return Err(PipelineError::PermanentApi(detail));
                }
            }

            // Transient failure path: back off, then transition the state
            // machine to the next attempt.
            let backoff = self.config.retry_backoff(attempt);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(last_error.expect("transient path always records an error"));
            }
            tokio::time::sleep(backoff.min(remaining)).await;
            state = AttemptState::Retrying(attempt + 1);
        }
    }

    /// Claim a credential, sleeping through cooldowns only while the
    /// deadline allows. Never blocks indefinitely.
    async fn acquire_credential(&self, deadline: Instant) -> Result<CredentialLease> {
        loop {
            match self.pool.acquire() {
                Acquire::Ready(lease) => return Ok(lease),
                Acquire::Wait(wait) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if wait >= remaining {
                        return Err(PipelineError::CredentialExhausted(format!(
                            "next credential available in {:?}, but only {:?} remain",
                            wait, remaining
                        )));
                    }
                    tokio::time::sleep(wait).await;
                }
                Acquire::Exhausted => {
                    return Err(PipelineError::CredentialExhausted(
                        "all credentials exhausted".to_string(),
                    ))
                }
            }
        }
    }
}

//
// ================= Gemini backend =================
//

/// Production backend speaking the Gemini generateContent protocol.
pub struct GeminiBackend {
    client: Client,
    base_url: String,
}

impl GeminiBackend {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            base_url: "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
        })
    }

    fn model_for(tier: ModelTier) -> &'static str {
        match tier {
            ModelTier::Light => "gemini-2.0-flash",
            ModelTier::Advanced => "gemini-1.5-pro",
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    max_output_tokens: i32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[async_trait]
impl InferenceBackend for GeminiBackend {
    async fn generate(
        &self,
        tier: ModelTier,
        prompt: &str,
        api_key: &str,
        timeout: Duration,
    ) -> std::result::Result<String, BackendError> {
        let url = format!(
            "{}/{}:generateContent?key={}",
            self.base_url,
            Self::model_for(tier),
            api_key
        );

        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.2,
                top_p: 0.9,
                max_output_tokens: 8192,
            },
        };

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout
                } else {
                    BackendError::Transient(format!("request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => BackendError::RateLimited(body),
                401 | 403 => BackendError::Auth(body),
                s if s >= 500 => BackendError::Transient(format!("status {}: {}", s, body)),
                s => BackendError::Permanent(format!("status {}: {}", s, body)),
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Transient(format!("response body unreadable: {}", e)))?;

        parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| BackendError::Transient("empty candidate list".to_string()))
    }
}

//
// ================= Scripted backend =================
//

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type FallbackFn = dyn Fn(ModelTier, &str) -> std::result::Result<String, BackendError> + Send + Sync;

/// Deterministic backend for tests and offline runs. Serves scripted
/// responses per tier in FIFO order, falling back to a routing closure
/// when the queue is empty. Tracks peak in-flight concurrency.
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<ModelTier, VecDeque<std::result::Result<String, BackendError>>>>,
    fallback: Option<Box<FallbackFn>>,
    delay: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback: None,
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(ModelTier, &str) -> std::result::Result<String, BackendError>
            + Send
            + Sync
            + 'static,
    {
        self.fallback = Some(Box::new(fallback));
        self
    }

    /// Artificial per-call latency, for concurrency assertions.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(&self, tier: ModelTier, response: std::result::Result<String, BackendError>) {
        self.scripts
            .lock()
            .expect("script lock poisoned")
            .entry(tier)
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn generate(
        &self,
        tier: ModelTier,
        prompt: &str,
        _api_key: &str,
        _timeout: Duration,
    ) -> std::result::Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight
            .fetch_max(now_in_flight, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self
            .scripts
            .lock()
            .expect("script lock poisoned")
            .get_mut(&tier)
            .and_then(|queue| queue.pop_front());

        let result = match scripted {
            Some(response) => response,
            None => match &self.fallback {
                Some(fallback) => fallback(tier, prompt),
                None => Err(BackendError::Permanent(format!(
                    "no scripted response for tier {}",
                    tier
                ))),
            },
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
