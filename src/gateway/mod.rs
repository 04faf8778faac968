//! Provider gateway: chat completions behind a bounded retry loop.

pub mod chat_completions;
pub mod error;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::warn;

use chat_completions::{ChatCompletionsAdapter, ChatProvider};
use usage::{CallStatus, ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, InvocationError, ProviderError};
pub use types::*;
pub use usage::{LogUsageSink, NoopUsageSink, UsageSink};

/// A chat endpoint that already handles retries.
#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, InvocationError>;

    /// Single-prompt completion; returns the trimmed content.
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParams,
        attribution: Attribution,
    ) -> Result<String, InvocationError> {
        let req = ChatRequest::prompt(model, prompt, attribution)
            .temperature(params.temperature)
            .max_tokens(params.max_tokens);
        Ok(self.chat(req).await?.content)
    }
}

/// Sampling parameters shared by every call of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.7,
        }
    }
}

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter is drawn uniformly from `[0, jitter_ratio * delay]`.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_ratio: 0.0,
        }
    }

    /// Capped exponential delay after `failures` failed attempts (1-based).
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(20);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Delay with jitter; `unit` is a uniform draw in `[0, 1)`.
    pub fn delay_with_unit(&self, failures: u32, unit: f64) -> Duration {
        let base = self.base_delay(failures);
        let jitter = base.as_secs_f64() * self.jitter_ratio.max(0.0) * unit.clamp(0.0, 1.0);
        base + Duration::from_secs_f64(jitter)
    }

    pub fn delay<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        self.delay_with_unit(failures, rng.gen::<f64>())
    }
}

/// Resilient invoker over a [`ChatProvider`].
///
/// Every provider failure counts as transient; only `max_attempts` stops the loop.
pub struct ProviderGateway<P: ChatProvider, U: UsageSinkTrait> {
    provider: P,
    usage_sink: Arc<U>,
    policy: RetryPolicy,
}

#[async_trait::async_trait]
impl<P: ChatProvider, U: UsageSinkTrait> ChatGateway for ProviderGateway<P, U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, InvocationError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<ChatCompletionsAdapter, U> {
    pub fn from_env(usage_sink: Arc<U>, policy: RetryPolicy) -> Result<Self, ProviderError> {
        let provider = ChatCompletionsAdapter::from_env()?;
        Ok(Self::with_config(provider, usage_sink, policy))
    }
}

impl<P: ChatProvider, U: UsageSinkTrait> ProviderGateway<P, U> {
    pub fn with_config(provider: P, usage_sink: Arc<U>, policy: RetryPolicy) -> Self {
        Self {
            provider,
            usage_sink,
            policy,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, InvocationError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.provider.chat(&req).await {
                Ok(resp) => {
                    self.record_usage(&req, attempt, &resp, CallStatus::Success, None)
                        .await;
                    return Ok(resp);
                }
                Err(err) => {
                    self.record_usage(
                        &req,
                        attempt,
                        &ChatResponse::empty(),
                        CallStatus::Error,
                        Some(&err),
                    )
                    .await;

                    if attempt >= max_attempts {
                        warn!(
                            model = %req.model,
                            attempts = attempt,
                            error = %err,
                            "giving up on provider call"
                        );
                        return Err(InvocationError::Exhausted {
                            attempts: attempt,
                            last: err,
                        });
                    }

                    let delay = self.policy.delay(attempt, &mut rand::thread_rng());
                    warn!(
                        model = %req.model,
                        attempt,
                        max_attempts,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "provider call failed; retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        attempt: u32,
        resp: &ChatResponse,
        status: CallStatus,
        error: Option<&ProviderError>,
    ) {
        let record = ProviderCallRecord::new(&req.model, attempt, req.attribution.caller)
            .tokens(resp.input_tokens, resp.output_tokens)
            .run(req.attribution.run_id)
            .latency(resp.latency.as_millis() as u64);

        let record = match (status, error) {
            (CallStatus::Error, Some(err)) => record
                .error(err.code())
                .request_id(err.request_id().map(str::to_string)),
            (CallStatus::Error, None) => record.error("provider_error"),
            _ => record,
        };

        self.usage_sink.record(record).await;
    }
}
