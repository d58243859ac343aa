//! Single choke-point for all LLM calls.
//!
//! Every model call in the system goes through [`LlmGateway::generate`]:
//! admission against the global minute/day windows, a slot in the
//! priority-ordered reservation queue, bounded retries with backoff for
//! transient backend failures, and usage accounting after the call was
//! issued. Accounting failures never fail the call (see `limits`).

use crate::config::{RuntimeConfig, LIMIT_LLM_CALLS_PER_DAY, LIMIT_LLM_CALLS_PER_MINUTE};
use crate::contracts::{EngineError, EngineResult};
use crate::limits::{LlmQuota, RateLimiter};
use crate::utils::logger::log_llm_call;
use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const GLOBAL_IDENTIFIER: &str = "global";

#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Short tag naming the call site (e.g. `dropdown_batch`).
    pub purpose: String,
    pub prompt: String,
    /// When set, the backend is asked for JSON conforming to this schema.
    pub json_schema: Option<Value>,
    pub user_id: String,
    /// Lower numeric priority is served sooner.
    pub priority: u8,
    pub max_output_tokens: u32,
}

impl LlmRequest {
    pub fn new(purpose: &str, prompt: impl Into<String>, user_id: &str) -> Self {
        Self {
            purpose: purpose.to_string(),
            prompt: prompt.into(),
            json_schema: None,
            user_id: user_id.to_string(),
            priority: 5,
            max_output_tokens: 1024,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.json_schema = Some(schema);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
}

/// Seam for everything that needs generated text; the gateway is the only
/// production implementation.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: LlmRequest) -> EngineResult<LlmResponse>;
}

/// # NDOC
/// component: `llm::gateway`
/// purpose: The one place model calls leave the process.
/// invariants:
///   - No call is issued past a denied admission check.
///   - The quota reservation is released on every path (RAII permit).
///   - Usage of an issued call is always accounted or logged `unbilled`.
pub struct LlmGateway {
    client: reqwest::Client,
    config: RuntimeConfig,
    limiter: Arc<RateLimiter>,
    quota: Arc<LlmQuota>,
}

impl LlmGateway {
    pub fn new(config: RuntimeConfig, limiter: Arc<RateLimiter>, quota: Arc<LlmQuota>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.llm_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            config,
            limiter,
            quota,
        }
    }

    pub fn quota(&self) -> Arc<LlmQuota> {
        Arc::clone(&self.quota)
    }

    fn check_admission(&self) -> EngineResult<()> {
        for limit_type in [LIMIT_LLM_CALLS_PER_MINUTE, LIMIT_LLM_CALLS_PER_DAY] {
            let decision = self.limiter.check(limit_type, GLOBAL_IDENTIFIER);
            if !decision.allowed {
                return Err(EngineError::admission(format!(
                    "llm budget '{limit_type}' exhausted"
                ))
                .with_details(json!({
                    "limit": decision.limit,
                    "retry_after_seconds": decision.retry_after_seconds,
                    "reset_at": decision.reset_at.to_rfc3339(),
                })));
            }
        }
        Ok(())
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.llm_api_base.trim_end_matches('/'),
            self.config.llm_model
        )
    }

    fn request_body(&self, request: &LlmRequest) -> Value {
        let mut generation_config = json!({
            "temperature": 0.2,
            "candidateCount": 1,
            "maxOutputTokens": request.max_output_tokens,
        });
        if let Some(schema) = &request.json_schema {
            generation_config["responseMimeType"] = json!("application/json");
            generation_config["responseSchema"] = schema.clone();
        }
        json!({
            "contents": [
                { "parts": [ { "text": request.prompt } ] }
            ],
            "generationConfig": generation_config,
        })
    }

    async fn issue_once(&self, api_key: &str, body: &Value) -> EngineResult<String> {
        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", api_key)])
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::timeout(format!("llm backend timed out: {e}"))
                } else {
                    EngineError::provider(format!("llm request failed: {e}"), true)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retryable = status.as_u16() == 429 || status.as_u16() >= 500;
            return Err(EngineError::provider(
                format!("llm backend returned status {status}"),
                retryable,
            ));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| EngineError::provider(format!("llm response body unreadable: {e}"), true))?;

        payload["candidates"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|candidate| candidate["content"]["parts"].as_array())
            .and_then(|parts| parts.first())
            .and_then(|part| part["text"].as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                EngineError::provider("llm response had no candidate text", false)
            })
    }
}

#[async_trait]
impl TextGenerator for LlmGateway {
    async fn generate(&self, request: LlmRequest) -> EngineResult<LlmResponse> {
        let api_key = self
            .config
            .llm_api_key
            .clone()
            .ok_or_else(|| EngineError::configuration("llm credentials are not configured"))?;

        self.check_admission()?;

        // Reservation is held for the duration of the call and released on
        // every path when the permit drops.
        let _permit = self.quota.acquire(&request.user_id, request.priority).await;
        self.check_admission()?;

        let body = self.request_body(&request);
        let mut attempt: u32 = 0;
        let text = loop {
            attempt += 1;
            match self.issue_once(&api_key, &body).await {
                Ok(text) => break text,
                Err(err) if err.retryable && attempt < self.config.llm_max_attempts => {
                    let base_ms = 500u64.saturating_mul(1 << (attempt - 1).min(6));
                    let jitter = rand::thread_rng().gen_range(0..250);
                    log::warn!(
                        purpose = request.purpose.as_str(),
                        attempt = attempt,
                        error = err.message.as_str();
                        "retrying llm call after transient failure"
                    );
                    tokio::time::sleep(Duration::from_millis(base_ms + jitter)).await;
                }
                Err(err) => {
                    log_llm_call(
                        &request.purpose,
                        &self.config.llm_model,
                        request.prompt.len(),
                        false,
                    );
                    return Err(err);
                }
            }
        };

        for limit_type in [LIMIT_LLM_CALLS_PER_MINUTE, LIMIT_LLM_CALLS_PER_DAY] {
            self.limiter.account_issued_call(limit_type, GLOBAL_IDENTIFIER);
        }
        log_llm_call(
            &request.purpose,
            &self.config.llm_model,
            request.prompt.len(),
            true,
        );

        Ok(LlmResponse { text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitRule;
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use tempfile::tempdir;

    fn gateway_against(server: &Server, dir: &std::path::Path, minute_cap: u64) -> LlmGateway {
        let mut config = RuntimeConfig::default();
        config.llm_api_key = Some("test-key".to_string());
        config.llm_api_base = server.url_str("").trim_end_matches('/').to_string();
        config.llm_max_attempts = 3;
        config.limit_rules.insert(
            LIMIT_LLM_CALLS_PER_MINUTE.to_string(),
            LimitRule { window_secs: 60, max_count: minute_cap },
        );
        let limiter = Arc::new(
            RateLimiter::new(&config).with_store_path(dir.join("windows.json")),
        );
        let quota = Arc::new(LlmQuota::new(config.llm_max_in_flight));
        LlmGateway::new(config, limiter, quota)
    }

    fn candidate_payload(text: &str) -> serde_json::Value {
        json!({
            "candidates": [
                { "content": { "parts": [ { "text": text } ] } }
            ]
        })
    }

    #[tokio::test]
    async fn successful_call_returns_candidate_text_and_accounts_usage() {
        let server = Server::run();
        let dir = tempdir().expect("tempdir");
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/models/gemini-2.0-flash:generateContent",
            ))
            .respond_with(json_encoded(candidate_payload("Yes"))),
        );

        let gateway = gateway_against(&server, dir.path(), 10);
        let response = gateway
            .generate(LlmRequest::new("check_batch", "Is the sky blue?", "u1"))
            .await
            .expect("generate");
        assert_eq!(response.text, "Yes");

        // One call consumed from the minute window.
        let decision = gateway
            .limiter
            .check(LIMIT_LLM_CALLS_PER_MINUTE, GLOBAL_IDENTIFIER);
        assert_eq!(decision.remaining, 9);
    }

    #[tokio::test]
    async fn transient_backend_failure_is_retried() {
        let server = Server::run();
        let dir = tempdir().expect("tempdir");
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/models/gemini-2.0-flash:generateContent",
            ))
            .times(2)
            .respond_with(cycle![
                status_code(503),
                json_encoded(candidate_payload("recovered")),
            ]),
        );

        let gateway = gateway_against(&server, dir.path(), 10);
        let response = gateway
            .generate(LlmRequest::new("simple_text_batch", "prompt", "u1"))
            .await
            .expect("generate after retry");
        assert_eq!(response.text, "recovered");
    }

    #[tokio::test]
    async fn exhausted_minute_window_denies_before_any_network_call() {
        let server = Server::run();
        let dir = tempdir().expect("tempdir");
        // No expectation registered: any request to the server would fail the test.
        let gateway = gateway_against(&server, dir.path(), 0);

        let err = gateway
            .generate(LlmRequest::new("dropdown_batch", "prompt", "u1"))
            .await
            .expect_err("must deny");
        assert_eq!(err.kind, crate::contracts::EngineErrorKind::AdmissionError);
        let details = err.details.expect("details");
        assert!(details["retry_after_seconds"].is_number());
    }

    #[tokio::test]
    async fn missing_credentials_is_a_configuration_error() {
        let server = Server::run();
        let dir = tempdir().expect("tempdir");
        let mut gateway = gateway_against(&server, dir.path(), 10);
        gateway.config.llm_api_key = None;

        let err = gateway
            .generate(LlmRequest::new("check_batch", "prompt", "u1"))
            .await
            .expect_err("must fail");
        assert_eq!(err.kind, crate::contracts::EngineErrorKind::ConfigurationError);
    }

    #[tokio::test]
    async fn schema_requests_ask_for_json_output() {
        let server = Server::run();
        let dir = tempdir().expect("tempdir");
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/models/gemini-2.0-flash:generateContent",
            ))
            .respond_with(json_encoded(candidate_payload("{\"a\":1}"))),
        );

        let gateway = gateway_against(&server, dir.path(), 10);
        let request = LlmRequest::new("dropdown_batch", "prompt", "u1")
            .with_schema(json!({"type": "object"}));
        // The body carries the JSON response mode.
        let body = gateway.request_body(&request);
        assert_eq!(
            body["generationConfig"]["responseMimeType"],
            "application/json"
        );
        let response = gateway.generate(request).await.expect("generate");
        assert_eq!(response.text, "{\"a\":1}");
    }
}
