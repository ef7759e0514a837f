// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! LLM client abstraction for judge-based metrics

use agentbench_core::{
    is_retryable_message, retry_with_backoff, RateLimiter, RetryPolicy, Retryable, UnlimitedRateLimiter,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const JUDGE_SYSTEM_PROMPT: &str = "You are an expert evaluator. Respond only with valid JSON.";

/// Trait for LLM clients used as judges
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Send a prompt and get the raw response
    async fn evaluate(&self, prompt: String) -> Result<LLMResponse, LLMError>;

    /// Get model name
    fn model_name(&self) -> &str;

    /// Get cost per token (input, output)
    fn cost_per_token(&self) -> (f64, f64);

    /// Prompt the judge and price the call.
    ///
    /// `schema` describes the JSON shape wanted back. Clients without native
    /// structured output get it appended to the prompt; callers must still
    /// extract JSON from whatever text comes back.
    async fn generate(&self, prompt: &str, schema: Option<&Value>) -> Result<JudgeOutput, LLMError> {
        let prompt = match schema {
            Some(schema) => format!(
                "{}\n\nRespond with a JSON object matching this schema:\n{}",
                prompt, schema
            ),
            None => prompt.to_string(),
        };
        let response = self.evaluate(prompt).await?;
        let (input, output) = self.cost_per_token();
        Ok(JudgeOutput {
            cost: response.usage.calculate_cost(input, output),
            text: response.content,
        })
    }
}

/// Response from LLM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
}

impl LLMResponse {
    /// Parse response as JSON
    pub fn as_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.content)
    }
}

/// Judge text plus what producing it cost in USD
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeOutput {
    pub text: String,
    pub cost: f64,
}

/// Token usage information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Calculate cost based on per-token pricing
    pub fn calculate_cost(&self, cost_per_input: f64, cost_per_output: f64) -> f64 {
        (self.prompt_tokens as f64 * cost_per_input)
            + (self.completion_tokens as f64 * cost_per_output)
    }
}

/// Errors from LLM clients
#[derive(Debug, Error)]
pub enum LLMError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LLMError {
    /// Classify a non-success HTTP status
    pub fn from_status(status: StatusCode, body: String) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => LLMError::RateLimitExceeded,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LLMError::Unauthorized(body),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => LLMError::BadRequest(body),
            StatusCode::NOT_FOUND => LLMError::NotFound(body),
            _ => LLMError::ApiError(format!("{}: {}", status, body)),
        }
    }
}

impl Retryable for LLMError {
    fn is_retryable(&self) -> bool {
        match self {
            LLMError::Unauthorized(_) | LLMError::BadRequest(_) | LLMError::NotFound(_) => false,
            LLMError::ApiError(message) => is_retryable_message(message),
            LLMError::RateLimitExceeded
            | LLMError::InvalidResponse(_)
            | LLMError::Http(_)
            | LLMError::Json(_) => true,
        }
    }
}

fn usage_count(usage: &Value, key: &str) -> u32 {
    usage[key].as_u64().unwrap_or(0) as u32
}

/// OpenAI-compatible chat completions client
pub struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl LLMClient for OpenAIClient {
    async fn evaluate(&self, prompt: String) -> Result<LLMResponse, LLMError> {
        let request = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": JUDGE_SYSTEM_PROMPT },
                { "role": "user", "content": prompt }
            ],
            "temperature": 0.0,
            "response_format": { "type": "json_object" }
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await?;
            return Err(LLMError::from_status(status, error_text));
        }

        let response_data: Value = response.json().await?;
        let content = response_data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LLMError::InvalidResponse("Missing content".to_string()))?
            .to_string();

        let usage_data = &response_data["usage"];
        let usage = TokenUsage {
            prompt_tokens: usage_count(usage_data, "prompt_tokens"),
            completion_tokens: usage_count(usage_data, "completion_tokens"),
            total_tokens: usage_count(usage_data, "total_tokens"),
        };

        Ok(LLMResponse {
            content,
            usage,
            model: self.model.clone(),
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn cost_per_token(&self) -> (f64, f64) {
        match self.model.as_str() {
            "gpt-4o" => (0.0000025, 0.000010),        // $2.50/$10 per 1M
            "gpt-4o-mini" => (0.00000015, 0.0000006), // $0.15/$0.60 per 1M
            "gpt-4-turbo" => (0.000010, 0.000030),    // $10/$30 per 1M
            _ => (0.00000015, 0.0000006),
        }
    }
}

/// Anthropic messages API client
pub struct AnthropicClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            base_url: "https://api.anthropic.com/v1".to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl LLMClient for AnthropicClient {
    async fn evaluate(&self, prompt: String) -> Result<LLMResponse, LLMError> {
        let request = serde_json::json!({
            "model": self.model,
            "max_tokens": 4096,
            "messages": [{ "role": "user", "content": prompt }],
            "system": JUDGE_SYSTEM_PROMPT,
            "temperature": 0.0
        });

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await?;
            return Err(LLMError::from_status(status, error_text));
        }

        let response_data: Value = response.json().await?;
        let content = response_data["content"][0]["text"]
            .as_str()
            .ok_or_else(|| LLMError::InvalidResponse("Missing content".to_string()))?
            .to_string();

        let usage_data = &response_data["usage"];
        let input = usage_count(usage_data, "input_tokens");
        let output = usage_count(usage_data, "output_tokens");
        let usage = TokenUsage {
            prompt_tokens: input,
            completion_tokens: output,
            total_tokens: input + output,
        };

        Ok(LLMResponse {
            content,
            usage,
            model: self.model.clone(),
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn cost_per_token(&self) -> (f64, f64) {
        match self.model.as_str() {
            "claude-3-5-haiku-20241022" => (0.0000008, 0.000004), // $0.80/$4 per 1M
            _ => (0.000003, 0.000015),                            // $3/$15 per 1M
        }
    }
}

/// Wraps a client with an outbound rate governor and transport retries.
///
/// Non-retryable errors (auth, bad request, not found) fail on the first
/// attempt.
pub struct GovernedClient {
    inner: Arc<dyn LLMClient>,
    limiter: Arc<dyn RateLimiter>,
    policy: RetryPolicy,
}

impl GovernedClient {
    pub fn new(inner: Arc<dyn LLMClient>) -> Self {
        Self {
            inner,
            limiter: Arc::new(UnlimitedRateLimiter),
            policy: RetryPolicy::exponential(),
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl LLMClient for GovernedClient {
    async fn evaluate(&self, prompt: String) -> Result<LLMResponse, LLMError> {
        let result = retry_with_backoff(&self.policy, |attempt| {
            let prompt = prompt.clone();
            async move {
                self.limiter.acquire().await;
                if attempt > 0 {
                    debug!("Judge request attempt {} for {}", attempt + 1, self.inner.model_name());
                }
                self.inner.evaluate(prompt).await
            }
        })
        .await;
        result.map_err(|e| e.into_inner())
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn cost_per_token(&self) -> (f64, f64) {
        self.inner.cost_per_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn test_token_usage_cost() {
        let usage = TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
            total_tokens: 150,
        };

        // 100 * 0.00000015 + 50 * 0.0000006 = 0.000045
        let cost = usage.calculate_cost(0.00000015, 0.0000006);
        assert!((cost - 0.000045).abs() < 0.0000001);
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            LLMError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            LLMError::RateLimitExceeded
        ));
        let unauthorized = LLMError::from_status(StatusCode::UNAUTHORIZED, "bad key".into());
        assert!(!unauthorized.is_retryable());
        assert!(!LLMError::from_status(StatusCode::NOT_FOUND, String::new()).is_retryable());
        assert!(LLMError::from_status(StatusCode::BAD_GATEWAY, String::new()).is_retryable());
        assert!(!LLMError::ApiError("validation failed".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_openai_generate_prices_call() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"choices":[{"message":{"content":"{\"ok\":true}"}}],
                    "usage":{"prompt_tokens":100,"completion_tokens":50,"total_tokens":150}}"#,
            )
            .create_async()
            .await;

        let client = OpenAIClient::new("test-key".into(), "gpt-4o-mini".into()).with_base_url(server.url());
        let output = client.generate("judge this", None).await.unwrap();
        assert_eq!(output.text, r#"{"ok":true}"#);
        assert!((output.cost - 0.000045).abs() < 1e-9);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_anthropic_error_mapping() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/messages")
            .with_status(401)
            .with_body("invalid x-api-key")
            .create_async()
            .await;

        let client = AnthropicClient::new("nope".into(), "claude-3-5-haiku-20241022".into())
            .with_base_url(server.url());
        let err = client.evaluate("hi".into()).await.unwrap_err();
        assert!(matches!(err, LLMError::Unauthorized(_)));
    }

    struct Flaky {
        calls: AtomicU32,
        fail_times: u32,
        error: fn() -> LLMError,
    }

    #[async_trait]
    impl LLMClient for Flaky {
        async fn evaluate(&self, _prompt: String) -> Result<LLMResponse, LLMError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err((self.error)());
            }
            Ok(LLMResponse {
                content: "{}".into(),
                usage: TokenUsage::default(),
                model: "flaky".into(),
            })
        }

        fn model_name(&self) -> &str {
            "flaky"
        }

        fn cost_per_token(&self) -> (f64, f64) {
            (0.0, 0.0)
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::judge().with_initial_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_governed_client_retries_transient_errors() {
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_times: 2,
            error: || LLMError::RateLimitExceeded,
        });
        let client = GovernedClient::new(flaky.clone()).with_retry_policy(fast_policy());
        assert!(client.evaluate("x".into()).await.is_ok());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_governed_client_fails_fast_on_auth() {
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_times: 10,
            error: || LLMError::Unauthorized("bad key".into()),
        });
        let client = GovernedClient::new(flaky.clone()).with_retry_policy(fast_policy());
        let err = client.evaluate("x".into()).await.unwrap_err();
        assert!(matches!(err, LLMError::Unauthorized(_)));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }
}
