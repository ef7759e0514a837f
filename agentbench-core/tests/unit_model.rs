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

//! Integration tests for evaluation units and the resilience primitives

use agentbench_core::{
    is_retryable_message, retry_with_backoff, AvailableTool, EvaluationUnit, RateLimiter, RetryError,
    RetryPolicy, Retryable, TokenBucketLimiter, ToolCallRecord,
};
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[derive(Debug)]
struct ServiceError(&'static str);

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl Retryable for ServiceError {
    fn is_retryable(&self) -> bool {
        is_retryable_message(self.0)
    }
}

fn weather_unit() -> EvaluationUnit {
    let mut unit = EvaluationUnit::new("row-0", "weather in Beijing?");
    unit.actual_output = "Sunny".into();
    unit.available_tools.insert(
        "get_weather".into(),
        AvailableTool::new("get_weather", "Current weather", json!({"type": "object"})),
    );
    let mut params = serde_json::Map::new();
    params.insert("location".into(), json!("Beijing"));
    let mut ok = ToolCallRecord::new("get_weather")
        .with_parameters(params)
        .with_output(json!({"temp": 21}), true)
        .with_server("weather");
    ok.execution_time = Some(0.5);
    let mut failed = ToolCallRecord::new("send_email").with_output(json!({"error": "denied"}), false);
    failed.execution_time = Some(1.5);
    unit.tools_called = vec![ok, failed];
    unit
}

#[test]
fn test_unit_helpers() {
    let mut unit = weather_unit();

    assert_eq!(
        unit.execution_summary(),
        "Total rounds: 1; Tools executed: 2; Successful: 1; Failed: 1; \
         Successful tools: get_weather; Failed tools: send_email"
    );

    let stats = unit.tool_execution_stats();
    assert_eq!(stats.total_executions, 2);
    assert_eq!(stats.successful_executions, 1);
    assert_eq!(stats.unique_tools, 2);
    assert!((stats.average_execution_time - 1.0).abs() < 1e-9);

    let problems = unit.validate();
    assert_eq!(problems, vec!["Tool 'send_email' not found in available_tools".to_string()]);

    unit.add_conversation_turn("user", "weather in Beijing?");
    unit.add_conversation_turn("assistant", "Sunny");
    assert_eq!(unit.conversation_context(), "USER: weather in Beijing?\nASSISTANT: Sunny");
}

#[test]
fn test_unit_json_defaults() {
    let unit: EvaluationUnit = serde_json::from_value(json!({"id": "u", "input": "q"})).unwrap();
    assert_eq!(unit.total_rounds, 1);
    assert!(unit.tools_called.is_empty());
    assert_eq!(unit.validate(), vec!["Actual output cannot be empty".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_retry_gives_up_after_policy() {
    let attempts = AtomicU32::new(0);
    let policy = RetryPolicy::judge().with_max_retries(2);

    let result: Result<(), _> = retry_with_backoff(&policy, |_| {
        attempts.fetch_add(1, Ordering::SeqCst);
        async { Err(ServiceError("503 service unavailable")) }
    })
    .await;

    assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_stops_on_auth_failure() {
    let attempts = AtomicU32::new(0);

    let result: Result<(), _> = retry_with_backoff(&RetryPolicy::judge(), |_| {
        attempts.fetch_add(1, Ordering::SeqCst);
        async { Err(ServiceError("401 Unauthorized")) }
    })
    .await;

    assert!(matches!(result, Err(RetryError::NonRetryable(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_token_bucket_delays_excess_requests() {
    let limiter = TokenBucketLimiter::per_second(2);
    let start = std::time::Instant::now();

    limiter.acquire().await;
    limiter.acquire().await;
    assert!(start.elapsed() < Duration::from_millis(100));

    limiter.acquire().await;
    assert!(start.elapsed() >= Duration::from_millis(400));
}
