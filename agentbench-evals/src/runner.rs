// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Agent-response generation
//!
//! [`GenerationRunner`] calls an [`AgentInvoker`] once per dataset row (and
//! per trial), bounded by its own semaphore, and turns each response into
//! an [`EvaluationUnit`] through [`UnitBuilder`]. A failed call is logged
//! and recorded on the unit; it is never retried here.

use crate::cache::{GenerationCache, GenerationRecord};
use crate::dataset::DatasetRow;
use crate::trace::{
    context_from_trace, parse_json_if_string, FunctionSchemaRecoverer, SpanExtractor,
    ToolCallReconstructor, ToolUniverse, MERGED_TOOLS_SPAN,
};
use agentbench_core::{EvaluationUnit, TrialRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Tool names that never count as agent tool use
const EXCLUDED_TOOLS: &[&str] = &["load_knowledgebase", MERGED_TOOLS_SPAN];

/// Result of one agent call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOutput {
    pub success: bool,
    pub response: Option<String>,
    /// Raw trace, in any shape the span extractor accepts
    #[serde(default)]
    pub trace_data: Value,
}

#[derive(Debug, Clone, Error)]
#[error("Agent invocation failed: {message}")]
pub struct AgentError {
    pub message: String,
}

impl AgentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The agent under test
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Identifier used in cache keys
    fn id(&self) -> &str;

    async fn generate(&self, input: &str) -> Result<AgentOutput, AgentError>;
}

/// Configuration for the generation pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum concurrent agent calls
    pub max_concurrency: usize,
    pub cache_enabled: bool,
    pub cache_dir: PathBuf,
    pub task_name: String,
    /// Agent calls per row; trials feed the pass@k metrics
    pub trials_per_task: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            cache_enabled: true,
            cache_dir: PathBuf::from(".cache/agentbench"),
            task_name: "default".to_string(),
            trials_per_task: 1,
        }
    }
}

impl RunnerConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("AGENTBENCH_MAX_CONCURRENCY") {
            match value.parse() {
                Ok(n) if n > 0 => self.max_concurrency = n,
                _ => warn!("Ignoring invalid AGENTBENCH_MAX_CONCURRENCY: {}", value),
            }
        }

        if let Ok(dir) = std::env::var("AGENTBENCH_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }

        self
    }

    pub fn with_task_name(mut self, task_name: impl Into<String>) -> Self {
        self.task_name = task_name.into();
        self
    }
}

/// Builds evaluation units from raw traces and dataset rows
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitBuilder {
    extractor: SpanExtractor,
    reconstructor: ToolCallReconstructor,
    recoverer: FunctionSchemaRecoverer,
}

fn is_excluded(name: &str) -> bool {
    EXCLUDED_TOOLS.contains(&name)
}

impl UnitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tool calls, available tools, retrieval context and rounds from a raw trace
    pub fn from_trace(&self, id: impl Into<String>, input: impl Into<String>, trace: &Value) -> EvaluationUnit {
        let mut unit = EvaluationUnit::new(id, input);
        let trace = parse_json_if_string(trace);

        for turn in self.extractor.extract_turns(&trace) {
            unit.push_turn(turn);
        }

        unit.tools_called = self
            .reconstructor
            .reconstruct_turns(&unit.trace_data)
            .into_iter()
            .filter(|call| !is_excluded(&call.name))
            .collect();

        let index = self.recoverer.recover(unit.all_spans());
        if !index.is_empty() {
            // schemas are attributed through the traces the tool calls ran in
            let mut trace_ids = self.reconstructor.tool_trace_ids(unit.all_spans());
            if trace_ids.is_empty() {
                trace_ids = unit.all_spans().filter_map(|s| s.trace_id.as_deref()).collect();
            }
            let (tools, source) = index.available_tools_for_all(trace_ids);
            if source.is_low_confidence() {
                warn!("Unit {}: available tools attributed from another trace", unit.id);
            }
            unit.available_tools_low_confidence = source.is_low_confidence();
            unit.available_tools = without_excluded(tools);
        }

        unit.retrieval_context = context_from_trace(unit.all_spans());
        debug!(
            "Built unit {}: {} rounds, {} tool calls, {} available tools",
            unit.id,
            unit.total_rounds,
            unit.tools_called.len(),
            unit.available_tools.len()
        );
        unit
    }

    /// Unit for one agent response
    pub fn from_output(&self, row: &DatasetRow, output: &AgentOutput) -> EvaluationUnit {
        let mut unit = self.from_trace(row.unit_id(), row.input.clone(), &output.trace_data);
        unit.actual_output = output.response.clone().unwrap_or_default();
        unit.success = output.success;
        self.apply_row(&mut unit, row);
        unit
    }

    /// Expected values and dataset-declared tools.
    ///
    /// Declared tools only fill in when the trace offered none.
    pub fn apply_row(&self, unit: &mut EvaluationUnit, row: &DatasetRow) {
        unit.expected_output = row.expected_output.clone();
        unit.expected_tools = row.expected_tools();
        if unit.available_tools.is_empty() {
            unit.available_tools = without_excluded(row.declared_tools());
            unit.available_tools_low_confidence = false;
        }
        for turn in &row.input_list {
            unit.add_conversation_turn("user", turn.clone());
        }
    }
}

fn without_excluded(tools: ToolUniverse) -> ToolUniverse {
    tools.into_iter().filter(|(name, _)| !is_excluded(name)).collect()
}

/// Runs the agent over a dataset
pub struct GenerationRunner {
    invoker: Arc<dyn AgentInvoker>,
    config: RunnerConfig,
    cache: Option<Arc<GenerationCache>>,
    builder: UnitBuilder,
}

impl GenerationRunner {
    pub fn new(invoker: Arc<dyn AgentInvoker>, config: RunnerConfig) -> Self {
        let cache = config
            .cache_enabled
            .then(|| Arc::new(GenerationCache::new(config.cache_dir.clone())));
        Self {
            invoker,
            config,
            cache,
            builder: UnitBuilder::new(),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// One unit per row, in row order.
    ///
    /// The first trial becomes the unit; with more than one trial every
    /// trial is also recorded in `unit.trials`. A unit whose first trial
    /// failed carries `success = false` and the error.
    pub async fn run(&self, rows: Vec<DatasetRow>) -> Vec<EvaluationUnit> {
        let trials = self.config.trials_per_task.max(1);
        info!(
            "Generating responses for task {}: {} rows, {} trials each, concurrency {}",
            self.config.task_name,
            rows.len(),
            trials,
            self.config.max_concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = Vec::with_capacity(rows.len());

        for row in rows {
            let worker = Worker {
                invoker: Arc::clone(&self.invoker),
                cache: self.cache.clone(),
                builder: self.builder,
                task_name: self.config.task_name.clone(),
                semaphore: Arc::clone(&semaphore),
            };
            tasks.push(tokio::spawn(async move { worker.unit_for(row, trials).await }));
        }

        let mut units = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(unit) => units.push(unit),
                Err(e) => error!("Generation task panicked: {}", e),
            }
        }

        let failed = units.iter().filter(|u| u.error.is_some()).count();
        info!(
            "Generation finished for task {}: {} units, {} failed",
            self.config.task_name,
            units.len(),
            failed
        );
        units
    }
}

struct Worker {
    invoker: Arc<dyn AgentInvoker>,
    cache: Option<Arc<GenerationCache>>,
    builder: UnitBuilder,
    task_name: String,
    semaphore: Arc<Semaphore>,
}

impl Worker {
    async fn unit_for(&self, row: DatasetRow, trials: usize) -> EvaluationUnit {
        let mut outcomes = Vec::with_capacity(trials);
        for trial in 0..trials {
            outcomes.push(self.generate(&row, trial).await);
        }

        let mut records = Vec::with_capacity(trials);
        let mut first = None;
        for outcome in outcomes {
            let (unit, record) = match outcome {
                Ok(output) => {
                    let unit = self.builder.from_output(&row, &output);
                    let record = TrialRecord {
                        success: unit.success,
                        tools_called: unit.tools_called.clone(),
                        actual_output: output.response.clone(),
                    };
                    (unit, record)
                }
                Err(e) => (failed_unit(&self.builder, &row, &e), TrialRecord::default()),
            };
            records.push(record);
            first.get_or_insert(unit);
        }

        let mut unit = first.unwrap_or_else(|| EvaluationUnit::new(row.unit_id(), row.input.clone()));
        if trials > 1 {
            unit.trials = records;
        }
        unit
    }

    async fn generate(&self, row: &DatasetRow, trial: usize) -> Result<AgentOutput, AgentError> {
        let agent_id = if trial == 0 {
            self.invoker.id().to_string()
        } else {
            format!("{}-trial{}", self.invoker.id(), trial)
        };
        let key = GenerationCache::key(&self.task_name, &agent_id, &row.input);

        if let Some(cache) = &self.cache {
            if let Some(record) = cache.load(&key).await {
                return Ok(AgentOutput {
                    success: record.success,
                    response: record.response,
                    trace_data: record.trace_data,
                });
            }
        }

        let output = {
            let _permit = self
                .semaphore
                .acquire()
                .await
                .map_err(|e| AgentError::new(e.to_string()))?;
            self.invoker.generate(&row.input).await
        };

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                error!("Agent generation failed for {} (trial {}): {}", row.unit_id(), trial, e);
                return Err(e);
            }
        };

        if let Some(cache) = &self.cache {
            let record = self.record(&agent_id, row, &output);
            if let Err(e) = cache.store(&key, &record).await {
                warn!("Failed to write generation cache {}: {}", key, e);
            }
        }
        Ok(output)
    }

    fn record(&self, agent_id: &str, row: &DatasetRow, output: &AgentOutput) -> GenerationRecord {
        let unit = self.builder.from_trace(row.unit_id(), row.input.clone(), &output.trace_data);
        let mut record = GenerationRecord::new(&self.task_name, agent_id, &row.input);
        record.success = output.success;
        record.response = output.response.clone();
        record.trace_data = output.trace_data.clone();
        record.tools_called = unit.tools_called;
        record.available_tools = unit.available_tools;
        record
    }
}

fn failed_unit(builder: &UnitBuilder, row: &DatasetRow, error: &AgentError) -> EvaluationUnit {
    let mut unit = EvaluationUnit::new(row.unit_id(), row.input.clone());
    builder.apply_row(&mut unit, row);
    unit.success = false;
    unit.error = Some(error.message.clone());
    unit
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn weather_trace() -> Value {
        json!([
            {
                "name": "call_llm",
                "trace_id": "t1",
                "span_id": "llm1",
                "start_time": 0,
                "end_time": 1_000_000_000u64,
                "attributes": {
                    "gen_ai.request.model": "gpt-4o",
                    "gen_ai.request.functions": [
                        {"name": "get_weather", "description": "Weather", "parameters": {"type": "object", "properties": {"location": {"type": "string"}}}},
                        {"name": "load_knowledgebase", "description": "KB"}
                    ]
                }
            },
            {
                "name": "execute_tool get_weather",
                "trace_id": "t1",
                "span_id": "s1",
                "start_time": 1_000_000_000u64,
                "end_time": 2_000_000_000u64,
                "attributes": {
                    "tool.name": "get_weather",
                    "tool.input": "{\"location\": \"Beijing\"}",
                    "tool.output": "{\"temperature\": 21}"
                }
            },
            {
                "name": "execute_tool load_knowledgebase",
                "trace_id": "t1",
                "span_id": "s2",
                "start_time": 2_000_000_000u64,
                "end_time": 3_000_000_000u64,
                "attributes": {
                    "tool.name": "load_knowledgebase",
                    "tool.output": "{\"response\": {\"result\": {\"knowledges\": [{\"content\": \"Beijing is in China\"}]}}}"
                }
            }
        ])
    }

    struct Scripted {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AgentInvoker for Scripted {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, input: &str) -> Result<AgentOutput, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AgentError::new("backend unavailable"));
            }
            Ok(AgentOutput {
                success: true,
                response: Some(format!("answer to {}", input)),
                trace_data: weather_trace(),
            })
        }
    }

    fn row(input: &str) -> DatasetRow {
        DatasetRow {
            input: input.to_string(),
            expected_tool_calls: Some("1. get_weather: location=\"Beijing\"".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_unit_from_trace_excludes_knowledge_tools() {
        let unit = UnitBuilder::new().from_trace("u1", "weather?", &weather_trace());

        let names: Vec<&str> = unit.tools_called.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["get_weather"]);
        assert_eq!(unit.tools_called[0].execution_order, 1);
        assert!(unit.available_tools.contains_key("get_weather"));
        assert!(!unit.available_tools.contains_key("load_knowledgebase"));
        assert!(!unit.available_tools_low_confidence);
        assert_eq!(unit.retrieval_context, vec!["Beijing is in China".to_string()]);
    }

    #[test]
    fn test_tools_from_another_trace_are_low_confidence() {
        let mut trace = weather_trace();
        for span in trace.as_array_mut().unwrap().iter_mut().skip(1) {
            span["trace_id"] = json!("t2");
        }

        let unit = UnitBuilder::new().from_trace("u1", "weather?", &trace);

        assert!(unit.available_tools.contains_key("get_weather"));
        assert!(unit.available_tools_low_confidence);
    }

    #[test]
    fn test_declared_tools_fill_in() {
        let builder = UnitBuilder::new();
        let mut unit = builder.from_trace("u1", "q", &Value::Null);
        let row = DatasetRow {
            input: "q".into(),
            available_tools: Some(json!([{"name": "send_email", "description": "Mail"}])),
            input_list: vec!["first".into()],
            ..Default::default()
        };
        builder.apply_row(&mut unit, &row);
        assert!(unit.available_tools.contains_key("send_email"));
        assert_eq!(unit.conversation_history.len(), 1);
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("AGENTBENCH_MAX_CONCURRENCY", "not-a-number");
        let config = RunnerConfig::default().with_env_overrides();
        assert_eq!(config.max_concurrency, 5);
        std::env::remove_var("AGENTBENCH_MAX_CONCURRENCY");
    }

    #[tokio::test]
    async fn test_generation_cache_skips_agent() {
        let dir = tempdir().unwrap();
        let config = RunnerConfig {
            cache_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let agent = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let runner = GenerationRunner::new(agent.clone(), config);

        let first = runner.run(vec![row("weather in Beijing")]).await;
        let second = runner.run(vec![row("weather in Beijing")]).await;

        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first[0].actual_output, second[0].actual_output);
        assert_eq!(second[0].tools_called.len(), 1);
        assert_eq!(second[0].expected_tools[0].name, "get_weather");
    }

    #[tokio::test]
    async fn test_failed_generation_is_recorded_not_retried() {
        let config = RunnerConfig {
            cache_enabled: false,
            ..Default::default()
        };
        let agent = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let runner = GenerationRunner::new(agent.clone(), config);

        let units = runner.run(vec![row("a"), row("b")]).await;
        assert_eq!(units.len(), 2);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
        assert!(units.iter().all(|u| !u.success));
        assert_eq!(units[0].error.as_deref(), Some("backend unavailable"));
    }

    #[tokio::test]
    async fn test_trials_are_recorded() {
        struct Alternating(Mutex<usize>);

        #[async_trait]
        impl AgentInvoker for Alternating {
            fn id(&self) -> &str {
                "alternating"
            }

            async fn generate(&self, _input: &str) -> Result<AgentOutput, AgentError> {
                let mut n = self.0.lock();
                *n += 1;
                Ok(AgentOutput {
                    success: *n % 2 == 1,
                    response: Some("r".into()),
                    trace_data: Value::Null,
                })
            }
        }

        let config = RunnerConfig {
            cache_enabled: false,
            trials_per_task: 3,
            ..Default::default()
        };
        let runner = GenerationRunner::new(Arc::new(Alternating(Mutex::new(0))), config);
        let units = runner.run(vec![row("q")]).await;

        let flags: Vec<bool> = units[0].trials.iter().map(|t| t.success).collect();
        assert_eq!(flags, vec![true, false, true]);
        assert!(units[0].success);
    }
}
