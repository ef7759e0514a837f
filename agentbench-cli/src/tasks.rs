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

//! Task execution: units from a dataset, then the batch evaluator

use crate::config::{BenchConfig, JudgeConfig, TaskConfig, TaskMode};
use crate::report::{TaskResult, TaskStatus};
use agentbench_core::{EvaluationUnit, RetryPolicy, TokenBucketLimiter};
use agentbench_evals::dataset::{load_rows, DatasetRow};
use agentbench_evals::llm_client::{AnthropicClient, OpenAIClient};
use agentbench_evals::metrics::build_metric;
use agentbench_evals::{
    AgentError, AgentInvoker, AgentOutput, BatchEvaluator, GenerationRunner, GovernedClient, LLMClient,
    UnitBuilder,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Judge client from the `[judge]` section, rate-limited and retried
pub fn build_judge(config: Option<&JudgeConfig>) -> Result<Option<Arc<dyn LLMClient>>> {
    let Some(judge) = config else {
        return Ok(None);
    };
    let api_key = judge
        .api_key
        .clone()
        .with_context(|| format!("No API key for judge provider {}", judge.provider))?;

    let inner: Arc<dyn LLMClient> = match judge.provider.as_str() {
        "anthropic" => {
            let client = AnthropicClient::new(api_key, judge.model.clone());
            match &judge.base_url {
                Some(url) => Arc::new(client.with_base_url(url.clone())),
                None => Arc::new(client),
            }
        }
        "openai" => {
            let client = OpenAIClient::new(api_key, judge.model.clone());
            match &judge.base_url {
                Some(url) => Arc::new(client.with_base_url(url.clone())),
                None => Arc::new(client),
            }
        }
        other => anyhow::bail!("Unsupported judge provider: {}", other),
    };

    let mut governed = GovernedClient::new(inner).with_retry_policy(RetryPolicy::judge());
    if let Some(rps) = judge.requests_per_second {
        governed = governed.with_rate_limiter(Arc::new(TokenBucketLimiter::per_second(rps)));
    }
    Ok(Some(Arc::new(governed)))
}

/// Serves recorded responses keyed by input
struct ReplayAgent {
    id: String,
    recorded: HashMap<String, AgentOutput>,
}

#[async_trait]
impl AgentInvoker for ReplayAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, input: &str) -> Result<AgentOutput, AgentError> {
        self.recorded
            .get(input)
            .cloned()
            .ok_or_else(|| AgentError::new("no recorded response for input"))
    }
}

fn load_trace(root: &Path, row: &DatasetRow) -> Value {
    let Some(file) = &row.trace_file else {
        return Value::Null;
    };
    let path = root.join(file);
    match std::fs::read_to_string(&path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!("Trace file {:?} is not valid JSON: {}", path, e);
            Value::Null
        }),
        Err(e) => {
            warn!("Trace file {:?} unreadable: {}", path, e);
            Value::Null
        }
    }
}

fn recorded_output(root: &Path, row: &DatasetRow) -> AgentOutput {
    AgentOutput {
        success: row.actual_output.is_some(),
        response: row.actual_output.clone(),
        trace_data: load_trace(root, row),
    }
}

async fn build_units(config: &BenchConfig, task: &TaskConfig, rows: Vec<DatasetRow>) -> Vec<EvaluationUnit> {
    let root = task.traces_root();
    match task.mode {
        TaskMode::Offline => {
            let builder = UnitBuilder::new();
            rows.iter()
                .map(|row| builder.from_output(row, &recorded_output(&root, row)))
                .collect()
        }
        TaskMode::Replay => {
            let recorded = rows
                .iter()
                .map(|row| (row.input.clone(), recorded_output(&root, row)))
                .collect();
            let agent = Arc::new(ReplayAgent {
                id: format!("replay-{}", task.name),
                recorded,
            });
            GenerationRunner::new(agent, config.runner_config(task)).run(rows).await
        }
    }
}

async fn try_run_task(
    config: &BenchConfig,
    task: &TaskConfig,
    judge: Option<Arc<dyn LLMClient>>,
) -> Result<TaskResult> {
    let start = Instant::now();
    let rows = load_rows(&task.dataset).with_context(|| format!("Failed to load dataset {:?}", task.dataset))?;
    info!("Task {}: {} rows ({:?} mode)", task.name, rows.len(), task.mode);

    let evaluator = BatchEvaluator::new(config.eval_config());
    for name in &task.metrics {
        let metric = build_metric(name, &task.options_for(name), judge.clone())
            .with_context(|| format!("Failed to build metric {}", name))?;
        evaluator.register(metric)?;
    }

    let units = build_units(config, task, rows).await;
    let total_units = units.len();
    let (scorable, failed): (Vec<_>, Vec<_>) = units.into_iter().partition(|u| u.error.is_none());
    for unit in &failed {
        warn!("Task {}: unit {} not scored: {}", task.name, unit.id, unit.error.as_deref().unwrap_or_default());
    }

    let report = evaluator.evaluate(scorable).await?;
    Ok(TaskResult {
        name: task.name.clone(),
        status: TaskStatus::Success,
        error: None,
        total_units,
        generation_failures: failed.len(),
        pass_rate: report.pass_rate(),
        total_cost: report.total_cost(),
        duration_ms: start.elapsed().as_millis() as u64,
        metrics: report.metric_summaries(),
        units: report.units,
    })
}

/// Run one task; any error becomes a failed result
pub async fn run_task(config: &BenchConfig, task: &TaskConfig, judge: Option<Arc<dyn LLMClient>>) -> TaskResult {
    match try_run_task(config, task, judge).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("Task {} failed: {:#}", task.name, e);
            TaskResult::failed(task.name.clone(), format!("{:#}", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use tempfile::tempdir;

    const TRACE: &str = r#"[
        {"name": "call_llm", "trace_id": "t", "span_id": "l", "start_time": 0, "end_time": 10,
         "attributes": {"gen_ai.request.model": "m", "gen_ai.request.functions.0.name": "get_weather"}},
        {"name": "execute_tool get_weather", "trace_id": "t", "span_id": "s1", "start_time": 10, "end_time": 20,
         "attributes": {"tool.name": "get_weather", "tool.input": "{\"location\": \"Beijing\"}", "tool.output": "{\"temp\": 21}"}}
    ]"#;

    fn task(dir: &Path, mode: TaskMode) -> TaskConfig {
        std::fs::write(dir.join("trace.json"), TRACE).unwrap();
        std::fs::write(
            dir.join("data.jsonl"),
            concat!(
                "{\"input\": \"weather in Beijing?\", \"answer\": \"sunny\", \"response\": \"Sunny\", ",
                "\"expected_tool_calls\": \"1. get_weather: location=\\\"Beijing\\\"\", \"trace_file\": \"trace.json\"}\n",
                "{\"input\": \"no response\", \"answer\": \"x\"}\n"
            ),
        )
        .unwrap();

        TaskConfig {
            name: "weather".into(),
            dataset: dir.join("data.jsonl"),
            traces_dir: None,
            mode,
            metrics: vec!["tool_accuracy".into(), "f1".into()],
            metric_options: BTreeMap::new(),
        }
    }

    fn config(dir: &Path) -> BenchConfig {
        BenchConfig {
            execution: ExecutionConfig {
                cache_dir: Some(dir.join("cache")),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_offline_task() {
        let dir = tempdir().unwrap();
        let task = task(dir.path(), TaskMode::Offline);
        let result = run_task(&config(dir.path()), &task, None).await;

        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.total_units, 2);
        assert_eq!(result.units.len(), 2);
        let first = &result.units[0];
        assert!(first.verdict("tool_accuracy").unwrap().success);
        assert_eq!(first.verdict("f1").unwrap().score, 1.0);
    }

    #[tokio::test]
    async fn test_replay_task_skips_missing_responses() {
        let dir = tempdir().unwrap();
        let task = task(dir.path(), TaskMode::Replay);
        let result = run_task(&config(dir.path()), &task, None).await;

        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.total_units, 2);
        assert_eq!(result.generation_failures, 0);
        assert!(dir.path().join("cache/generations").exists());
    }

    #[tokio::test]
    async fn test_missing_dataset_fails_task() {
        let task = TaskConfig {
            name: "missing".into(),
            dataset: PathBuf::from("/nonexistent/data.jsonl"),
            traces_dir: None,
            mode: TaskMode::Offline,
            metrics: vec!["f1".into()],
            metric_options: BTreeMap::new(),
        };
        let result = run_task(&BenchConfig::default(), &task, None).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error.unwrap().contains("Failed to load dataset"));
    }

    #[test]
    fn test_judge_requires_key() {
        let judge = JudgeConfig {
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            base_url: None,
            api_key: None,
            requests_per_second: Some(2),
        };
        assert!(build_judge(Some(&judge)).is_err());
        assert!(build_judge(None).unwrap().is_none());

        let keyed = JudgeConfig {
            api_key: Some("sk-test".into()),
            ..judge
        };
        assert!(build_judge(Some(&keyed)).unwrap().is_some());
    }
}
