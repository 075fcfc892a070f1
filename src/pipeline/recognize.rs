//! Remote recognition: drive the vision-OCR call with retry and backoff.
//!
//! The [`RecognitionClient`] is the only place in the crate that talks to
//! the network. It wraps any [`RecognitionProvider`] with:
//!
//! * a hard per-call timeout (`tokio::time::timeout`) — exceeding it is a
//!   retryable failure, never a hang;
//! * an explicit bounded retry loop with classified outcomes — the backoff
//!   policy is a visible, testable state machine, not exception-driven
//!   control flow;
//! * exponential backoff `base · 2^n` capped at `backoff_cap` — avoids the
//!   thundering-herd problem where N workers retry simultaneously and
//!   immediately re-overwhelm a recovering endpoint;
//! * a global semaphore capping in-flight remote calls independently of
//!   the worker-pool width, to respect remote-service limits;
//! * usage counters incremented once per successful logical page request,
//!   regardless of how many attempts it took.
//!
//! Error classification happens at the provider boundary (see
//! [`crate::error::RecognitionError`]); the loop here only asks
//! `is_retryable()`. Unclassified errors are logged with full context and
//! escalated to permanent so an unexpected failure mode can never loop
//! forever.

use crate::error::RecognitionError;
use crate::pipeline::extract::RawPageContent;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Instruction sent with every recognition request.
///
/// Kept as a single constant so prompt changes happen in exactly one place
/// and unit tests can inspect it without a live call.
pub const RECOGNITION_PROMPT: &str = "You are a professional OCR assistant. Transcribe all text \
visible in this page image completely and accurately, preserving the original line structure \
and reading order. Output only the transcription, with no commentary.";

/// The request payload for one logical page.
#[derive(Debug, Clone)]
pub struct PagePayload {
    pub page_index: usize,
    /// Base64-encoded page image, ready for a data-URI request body.
    pub image_base64: String,
    pub mime_type: &'static str,
}

impl PagePayload {
    /// Encode a page's raw content for the remote call.
    pub fn from_content(content: &RawPageContent) -> Self {
        let mime_type = if content.image.starts_with(&[0xFF, 0xD8]) {
            "image/jpeg"
        } else {
            "image/png"
        };
        Self {
            page_index: content.page_index,
            image_base64: STANDARD.encode(&content.image),
            mime_type,
        }
    }

    fn payload_bytes(&self) -> usize {
        self.image_base64.len()
    }
}

/// A successful recognition result.
#[derive(Debug, Clone)]
pub struct Recognition {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A remote recognition backend.
///
/// Implementations classify their own failures into [`RecognitionError`]
/// variants; the retry loop never inspects backend-specific detail.
/// `async_trait` keeps the trait object-safe for `Arc<dyn …>` injection.
#[async_trait]
pub trait RecognitionProvider: Send + Sync {
    /// Identifier used in logs (endpoint host, provider name).
    fn name(&self) -> &str;

    /// Perform one recognition attempt. No retries at this level.
    async fn recognize(&self, payload: &PagePayload) -> Result<Recognition, RecognitionError>;
}

/// Terminal failure of a logical page request, after classification and
/// (for retryable errors) exhausted retries.
#[derive(Debug, Clone)]
pub enum RecognitionFailure {
    /// Every allowed attempt failed with a retryable error.
    Exhausted {
        attempts: u32,
        last: RecognitionError,
    },
    /// A permanent error aborted the request on its first occurrence.
    Permanent(RecognitionError),
}

impl RecognitionFailure {
    /// Whether this failure should halt the whole job (auth/quota class).
    pub fn is_job_fatal(&self) -> bool {
        match self {
            RecognitionFailure::Permanent(e) => e.is_job_fatal(),
            RecognitionFailure::Exhausted { .. } => false,
        }
    }
}

/// Cumulative usage across all successful calls made through one client.
#[derive(Debug, Default)]
pub struct UsageMeter {
    calls: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl UsageMeter {
    fn record(&self, recognition: &Recognition) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.input_tokens
            .fetch_add(recognition.input_tokens as u64, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(recognition.output_tokens as u64, Ordering::Relaxed);
    }

    /// `(calls, input_tokens, output_tokens)` so far.
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.calls.load(Ordering::Relaxed),
            self.input_tokens.load(Ordering::Relaxed),
            self.output_tokens.load(Ordering::Relaxed),
        )
    }
}

/// Fault-tolerant wrapper around a [`RecognitionProvider`].
pub struct RecognitionClient {
    provider: Arc<dyn RecognitionProvider>,
    limiter: Arc<Semaphore>,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    call_timeout: Duration,
    usage: UsageMeter,
}

impl RecognitionClient {
    /// Build a client. `max_attempts` is the total number of attempts per
    /// logical page request (first try included); it is clamped to ≥ 1.
    pub fn new(
        provider: Arc<dyn RecognitionProvider>,
        remote_concurrency: usize,
        max_attempts: u32,
        backoff_base: Duration,
        backoff_cap: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            limiter: Arc::new(Semaphore::new(remote_concurrency.max(1))),
            max_attempts: max_attempts.max(1),
            backoff_base,
            backoff_cap,
            call_timeout,
            usage: UsageMeter::default(),
        }
    }

    /// Usage accumulated across all successful calls.
    pub fn usage(&self) -> &UsageMeter {
        &self.usage
    }

    /// Recognise one page, retrying retryable failures with capped
    /// exponential backoff.
    pub async fn recognize(
        &self,
        payload: &PagePayload,
    ) -> Result<Recognition, RecognitionFailure> {
        let mut last_err: Option<RecognitionError> = None;

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let delay = self.backoff_delay(attempt, last_err.as_ref());
                warn!(
                    "page {}: retry {}/{} after {}ms",
                    payload.page_index,
                    attempt,
                    self.max_attempts,
                    delay.as_millis()
                );
                sleep(delay).await;
            }

            let outcome = {
                // The permit bounds concurrent remote calls only; it is
                // released before any backoff sleep.
                let _permit = self
                    .limiter
                    .acquire()
                    .await
                    .map_err(|_| RecognitionFailure::Permanent(RecognitionError::Unknown {
                        detail: "recognition limiter closed".into(),
                    }))?;
                let started = Instant::now();
                match tokio::time::timeout(self.call_timeout, self.provider.recognize(payload))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(RecognitionError::Timeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    }),
                }
            };

            match outcome {
                Ok(recognition) => {
                    debug!(
                        "page {}: recognised on attempt {} ({} in / {} out tokens)",
                        payload.page_index,
                        attempt,
                        recognition.input_tokens,
                        recognition.output_tokens
                    );
                    self.usage.record(&recognition);
                    return Ok(recognition);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        "page {}: attempt {}/{} failed ({})",
                        payload.page_index, attempt, self.max_attempts, e
                    );
                    last_err = Some(e);
                }
                Err(e @ RecognitionError::Unknown { .. }) => {
                    // Full context before escalating: without it an
                    // unclassified failure is undiagnosable after the fact.
                    error!(
                        endpoint = self.provider.name(),
                        page = payload.page_index,
                        attempt,
                        payload_bytes = payload.payload_bytes(),
                        "unclassified recognition failure escalated to permanent: {e}"
                    );
                    return Err(RecognitionFailure::Permanent(e));
                }
                Err(e) => {
                    warn!(
                        "page {}: permanent recognition failure ({})",
                        payload.page_index, e
                    );
                    return Err(RecognitionFailure::Permanent(e));
                }
            }
        }

        Err(RecognitionFailure::Exhausted {
            attempts: self.max_attempts,
            last: last_err.unwrap_or(RecognitionError::Unknown {
                detail: "retries exhausted with no recorded error".into(),
            }),
        })
    }

    /// Delay before `attempt` (2-based): `base · 2^(attempt-2)`, capped.
    /// A server-specified Retry-After can raise (never lower) the delay,
    /// still subject to the cap.
    fn backoff_delay(&self, attempt: u32, last_err: Option<&RecognitionError>) -> Duration {
        let doublings = attempt.saturating_sub(2);
        let backoff = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(doublings));
        let delay = match last_err {
            Some(RecognitionError::RateLimited {
                retry_after_secs: Some(secs),
            }) => backoff.max(Duration::from_secs(*secs)),
            _ => backoff,
        };
        delay.min(self.backoff_cap)
    }
}

// ── Bundled OpenAI-compatible HTTP provider ──────────────────────────────

/// Vision-OCR provider speaking the OpenAI chat-completions protocol, which
/// most hosted vision models expose (DashScope, OpenRouter, vLLM, Ollama).
///
/// The page image travels as a base64 data-URI inside the user message.
/// All HTTP status handling lives in [`classify_status`]; everything above
/// this type sees only [`RecognitionError`] variants.
pub struct HttpVisionProvider {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    name: String,
}

impl HttpVisionProvider {
    /// `endpoint` is the API base URL (e.g. `https://host/v1`); the
    /// chat-completions path is appended.
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        let name = endpoint
            .strip_prefix("https://")
            .or_else(|| endpoint.strip_prefix("http://"))
            .unwrap_or(&endpoint)
            .split('/')
            .next()
            .unwrap_or("recognition")
            .to_string();
        Self {
            http: reqwest::Client::new(),
            endpoint,
            api_key: api_key.into(),
            model: model.into(),
            name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[async_trait]
impl RecognitionProvider for HttpVisionProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recognize(&self, payload: &PagePayload) -> Result<Recognition, RecognitionError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": [{ "type": "text", "text": RECOGNITION_PROMPT }]
                },
                {
                    "role": "user",
                    "content": [
                        {
                            "type": "image_url",
                            "image_url": {
                                "url": format!(
                                    "data:{};base64,{}",
                                    payload.mime_type, payload.image_base64
                                )
                            }
                        },
                        { "type": "text", "text": "Transcribe this page." }
                    ]
                }
            ]
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), retry_after, &detail));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            RecognitionError::Unknown {
                detail: format!("unparseable response body: {e}"),
            }
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(RecognitionError::Unknown {
                detail: "response contained no choices".into(),
            })?;
        let usage = parsed.usage.unwrap_or_default();

        Ok(Recognition {
            text,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
    }
}

/// Map transport-level reqwest failures onto the taxonomy.
fn classify_transport(e: reqwest::Error) -> RecognitionError {
    if e.is_timeout() {
        RecognitionError::Timeout { elapsed_ms: 0 }
    } else if e.is_connect() || e.is_request() {
        RecognitionError::Connection {
            detail: e.to_string(),
        }
    } else {
        RecognitionError::Unknown {
            detail: e.to_string(),
        }
    }
}

/// Map an HTTP error status onto the taxonomy.
///
/// Quota exhaustion arrives inconsistently across providers: some use 402,
/// some 429 with an `insufficient_quota` body. Both must be permanent —
/// backing off cannot refill a quota.
fn classify_status(status: u16, retry_after: Option<u64>, detail: &str) -> RecognitionError {
    let quota_marker = detail.contains("insufficient_quota") || detail.contains("quota");
    match status {
        401 | 403 => RecognitionError::AuthFailed {
            detail: truncate(detail, 200),
        },
        402 => RecognitionError::QuotaExhausted {
            detail: truncate(detail, 200),
        },
        429 if quota_marker => RecognitionError::QuotaExhausted {
            detail: truncate(detail, 200),
        },
        429 => RecognitionError::RateLimited {
            retry_after_secs: retry_after,
        },
        400 | 413 | 422 => RecognitionError::MalformedRequest {
            detail: truncate(detail, 200),
        },
        500..=599 => RecognitionError::ServerError { status },
        _ => RecognitionError::Unknown {
            detail: format!("HTTP {status}: {}", truncate(detail, 200)),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &s[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Provider that plays back a scripted sequence of outcomes.
    struct ScriptedProvider {
        script: Mutex<Vec<Result<Recognition, RecognitionError>>>,
        attempts: AtomicU64,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<Recognition, RecognitionError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                attempts: AtomicU64::new(0),
            })
        }

        fn attempts(&self) -> u64 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RecognitionProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn recognize(&self, _: &PagePayload) -> Result<Recognition, RecognitionError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Err(RecognitionError::Unknown {
                    detail: "script exhausted".into(),
                });
            }
            script.remove(0)
        }
    }

    fn ok(text: &str) -> Result<Recognition, RecognitionError> {
        Ok(Recognition {
            text: text.into(),
            input_tokens: 100,
            output_tokens: 50,
        })
    }

    fn payload() -> PagePayload {
        PagePayload {
            page_index: 0,
            image_base64: STANDARD.encode(b"image"),
            mime_type: "image/png",
        }
    }

    fn client(provider: Arc<dyn RecognitionProvider>, attempts: u32) -> RecognitionClient {
        RecognitionClient::new(
            provider,
            2,
            attempts,
            Duration::from_millis(500),
            Duration::from_millis(8000),
            Duration::from_secs(60),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn two_timeouts_then_success_counts_usage_once() {
        let provider = ScriptedProvider::new(vec![
            Err(RecognitionError::Timeout { elapsed_ms: 1000 }),
            Err(RecognitionError::Timeout { elapsed_ms: 1000 }),
            ok("page text"),
        ]);
        let client = client(provider.clone(), 3);

        let result = client.recognize(&payload()).await.unwrap();
        assert_eq!(result.text, "page text");
        assert_eq!(provider.attempts(), 3);

        let (calls, input, output) = client.usage().snapshot();
        assert_eq!(calls, 1);
        assert_eq!(input, 100);
        assert_eq!(output, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_after_exactly_max_attempts() {
        let provider = ScriptedProvider::new(vec![
            Err(RecognitionError::ServerError { status: 503 }),
            Err(RecognitionError::ServerError { status: 503 }),
            Err(RecognitionError::ServerError { status: 503 }),
            ok("never reached"),
        ]);
        let client = client(provider.clone(), 3);

        match client.recognize(&payload()).await {
            Err(RecognitionFailure::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(last, RecognitionError::ServerError { status: 503 }));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(provider.attempts(), 3);
        assert_eq!(client.usage().snapshot().0, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_short_circuits_after_one_attempt() {
        let provider = ScriptedProvider::new(vec![
            Err(RecognitionError::AuthFailed {
                detail: "bad key".into(),
            }),
            ok("never reached"),
        ]);
        let client = client(provider.clone(), 3);

        match client.recognize(&payload()).await {
            Err(RecognitionFailure::Permanent(RecognitionError::AuthFailed { .. })) => {}
            other => panic!("expected permanent auth failure, got {other:?}"),
        }
        assert_eq!(provider.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_error_escalates_to_permanent() {
        let provider = ScriptedProvider::new(vec![Err(RecognitionError::Unknown {
            detail: "mystery".into(),
        })]);
        let client = client(provider.clone(), 3);

        let failure = client.recognize(&payload()).await.unwrap_err();
        assert!(matches!(
            failure,
            RecognitionFailure::Permanent(RecognitionError::Unknown { .. })
        ));
        assert!(!failure.is_job_fatal());
        assert_eq!(provider.attempts(), 1);
    }

    #[test]
    fn backoff_delays_double_and_cap() {
        let provider = ScriptedProvider::new(vec![]);
        let client = RecognitionClient::new(
            provider,
            1,
            6,
            Duration::from_millis(500),
            Duration::from_millis(3000),
            Duration::from_secs(60),
        );

        let delays: Vec<u64> = (2..=6)
            .map(|attempt| client.backoff_delay(attempt, None).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000]);
        // Non-decreasing, capped.
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn retry_after_raises_but_never_exceeds_cap() {
        let provider = ScriptedProvider::new(vec![]);
        let client = RecognitionClient::new(
            provider,
            1,
            3,
            Duration::from_millis(500),
            Duration::from_millis(4000),
            Duration::from_secs(60),
        );

        let rate_limited = RecognitionError::RateLimited {
            retry_after_secs: Some(2),
        };
        assert_eq!(
            client.backoff_delay(2, Some(&rate_limited)),
            Duration::from_secs(2)
        );

        let huge = RecognitionError::RateLimited {
            retry_after_secs: Some(600),
        };
        assert_eq!(
            client.backoff_delay(2, Some(&huge)),
            Duration::from_millis(4000)
        );
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(401, None, "nope"),
            RecognitionError::AuthFailed { .. }
        ));
        assert!(matches!(
            classify_status(429, Some(30), ""),
            RecognitionError::RateLimited {
                retry_after_secs: Some(30)
            }
        ));
        assert!(matches!(
            classify_status(429, None, r#"{"error":{"code":"insufficient_quota"}}"#),
            RecognitionError::QuotaExhausted { .. }
        ));
        assert!(matches!(
            classify_status(503, None, ""),
            RecognitionError::ServerError { status: 503 }
        ));
        assert!(matches!(
            classify_status(413, None, "too large"),
            RecognitionError::MalformedRequest { .. }
        ));
        assert!(matches!(
            classify_status(418, None, "teapot"),
            RecognitionError::Unknown { .. }
        ));
    }

    #[test]
    fn payload_detects_jpeg_magic() {
        let jpeg = RawPageContent {
            page_index: 0,
            image: vec![0xFF, 0xD8, 0xFF, 0xE0],
            text_layer: None,
        };
        assert_eq!(PagePayload::from_content(&jpeg).mime_type, "image/jpeg");

        let png = RawPageContent {
            page_index: 0,
            image: b"\x89PNG".to_vec(),
            text_layer: None,
        };
        assert_eq!(PagePayload::from_content(&png).mime_type, "image/png");
    }
}
