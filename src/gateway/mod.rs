//! Provider gateway for judge chat completions.

pub mod error;
pub mod openrouter;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use openrouter::{ChatProvider, OpenRouterAdapter};
use usage::{CallStatus, ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ProviderError};
pub use types::*;
pub use usage::{NoopUsageSink, StderrUsageSink, UsageSink};

/// Object-safe judge call surface; the pipeline and tests depend on this,
/// not on any concrete transport.
#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Transport-level retry settings. Retries here cover transient provider
/// failures (5xx, rate limits, timeouts); malformed judge JSON is retried
/// one level up, in the judge layer.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

pub struct ProviderGateway<U: UsageSinkTrait> {
    openrouter: OpenRouterAdapter,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    pub fn from_env(usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        let openrouter = OpenRouterAdapter::from_env()?;
        Ok(Self {
            openrouter,
            usage_sink,
            config: GatewayConfig::default(),
        })
    }

    pub fn with_config(
        openrouter: OpenRouterAdapter,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            openrouter,
            usage_sink,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            let result = self.openrouter.chat(&req).await;
            match result {
                Ok(resp) => {
                    self.record_usage(&req, &resp, CallStatus::Success, None)
                        .await;
                    return Ok(resp);
                }
                Err(err) => {
                    let code = err.code().to_string();
                    self.record_usage(&req, &ChatResponse::empty(), CallStatus::Error, Some(code))
                        .await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::provider("openrouter", "unknown error", false)))
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: &ChatResponse,
        status: CallStatus,
        error_code: Option<String>,
    ) {
        let record = ProviderCallRecord::new(
            req.model.provider(),
            "chat/completions",
            req.model.model_id(),
            req.attribution.caller,
        )
        .tokens(resp.input_tokens as i32, resp.output_tokens as i32)
        .job(req.attribution.job_id)
        .latency(resp.latency.as_millis() as i32);

        let record = if status == CallStatus::Error {
            record.error(error_code.unwrap_or_else(|| "provider_error".to_string()))
        } else {
            record
        };

        self.usage_sink.record(record).await;
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(800));
        // Capped exponent.
        assert_eq!(backoff_delay(base, 9), Duration::from_millis(3200));
    }
}
