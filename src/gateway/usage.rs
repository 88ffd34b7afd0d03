//! Usage tracking via the UsageSink trait.
//!
//! The gateway logs every judge call through a UsageSink. This decouples
//! the gateway from any specific destination:
//! - CLI runs use StderrUsageSink or NoopUsageSink
//! - Tests use NoopUsageSink

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Status of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// Record of one provider API call.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    pub provider: &'static str,
    pub endpoint: &'static str,
    pub model: String,
    pub input_tokens: i32,
    pub output_tokens: i32,
    /// Job / row this call belonged to.
    pub job_id: Option<Uuid>,
    pub latency_ms: i32,
    pub status: CallStatus,
    pub error_code: Option<String>,
    /// Which code path made this call.
    pub caller: &'static str,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn new(
        provider: &'static str,
        endpoint: &'static str,
        model: impl Into<String>,
        caller: &'static str,
    ) -> Self {
        Self {
            provider,
            endpoint,
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            job_id: None,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            caller,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: i32, output: i32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn job(mut self, job_id: Option<Uuid>) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn latency(mut self, ms: i32) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }
}

/// Trait for recording provider call usage.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record a provider call. Fire-and-forget: failures should be logged
    /// but not propagated.
    async fn record(&self, record: ProviderCallRecord);
}

/// No-op usage sink that discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {
        // Discard
    }
}

/// Usage sink that writes JSON lines to stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrUsageSink;

#[async_trait]
impl UsageSink for StderrUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        eprintln!(
            r#"{{"provider":"{}","endpoint":"{}","model":"{}","tokens":{},"latency_ms":{},"status":"{}","caller":"{}"}}"#,
            record.provider,
            record.endpoint,
            record.model,
            record.input_tokens + record.output_tokens,
            record.latency_ms,
            record.status.as_str(),
            record.caller,
        );
    }
}
