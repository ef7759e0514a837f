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

//! Six-dimension LLM-as-judge metric for tool-using agents
//!
//! The judge scores task fulfillment, grounding, tool appropriateness,
//! parameter accuracy, dependency awareness and parallelism/efficiency on a
//! 1-10 scale. The final score blends the judge (60%) with the
//! deterministic tool-accuracy rates (40%).
//!
//! A judge that keeps returning unparseable text, or fails outright, degrades
//! to empty scores instead of failing the unit.

use super::tool_accuracy::{SchemaValidatorCache, ToolAccuracyReport};
use crate::llm_client::LLMClient;
use crate::trace::pyliteral::parse_python_literal;
use crate::{BaseMetric, EvalError, MetricMetadata, Scorable};
use agentbench_core::{AvailableTool, EvaluationUnit, RetryPolicy, Retryable, ToolCallExpected, Verdict};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

const DESCRIPTION_LIMIT: usize = 500;
const PARAM_VALUE_LIMIT: usize = 100;

/// (score key, reasoning key, reason label)
pub const DIMENSIONS: [(&str, &str, &str); 6] = [
    ("task_fulfillment", "task_fulfillment_reasoning", "Task Fulfillment"),
    ("grounding", "grounding_reasoning", "Grounding"),
    ("tool_appropriateness", "tool_appropriateness_reasoning", "Tool Appropriateness"),
    ("parameter_accuracy", "parameter_accuracy_reasoning", "Parameter Accuracy"),
    ("dependency_awareness", "dependency_awareness_reasoning", "Dependency Awareness"),
    ("parallelism_and_efficiency", "parallelism_efficiency_reasoning", "Parallelism & Efficiency"),
];

/// Parsed judge answer; dimensions the judge skipped are absent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JudgeScores {
    pub scores: BTreeMap<String, f64>,
    pub reasoning: BTreeMap<String, String>,
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl JudgeScores {
    pub fn from_value(value: &Value) -> Self {
        let mut out = Self::default();
        for (score_key, reasoning_key, _) in DIMENSIONS {
            if let Some(score) = value.get(score_key).and_then(number_of) {
                out.scores.insert(score_key.to_string(), score);
            }
            if let Some(text) = value.get(reasoning_key).and_then(Value::as_str) {
                if !text.trim().is_empty() {
                    out.reasoning.insert(reasoning_key.to_string(), text.to_string());
                }
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty() && self.reasoning.is_empty()
    }

    fn score(&self, key: &str) -> f64 {
        self.scores.get(key).copied().unwrap_or(0.0)
    }

    /// Mean of the three paired averages, mapped from 1-10 onto 0-1
    pub fn llm_score(&self) -> f64 {
        let completion = (self.score("task_fulfillment") + self.score("grounding")) / 2.0;
        let selection = (self.score("tool_appropriateness") + self.score("parameter_accuracy")) / 2.0;
        let planning = (self.score("dependency_awareness") + self.score("parallelism_and_efficiency")) / 2.0;
        (completion + selection + planning) / 30.0
    }

    /// Labelled reasoning paragraphs in dimension order
    pub fn reason(&self) -> String {
        let parts: Vec<String> = DIMENSIONS
            .iter()
            .filter_map(|(_, key, label)| self.reasoning.get(*key).map(|text| format!("{}: {}", label, text)))
            .collect();
        if parts.is_empty() {
            "No detailed reasoning provided".to_string()
        } else {
            parts.join("\n\n")
        }
    }
}

/// The outermost `{...}` of a judge reply, parsed as JSON or as an
/// allow-listed Python literal
pub fn extract_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let candidate = &text[start..=end];
    serde_json::from_str::<Value>(candidate)
        .ok()
        .or_else(|| parse_python_literal(candidate))
        .filter(Value::is_object)
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Available tools grouped by server, descriptions truncated
pub fn format_available_tools(tools: &BTreeMap<String, AvailableTool>) -> String {
    if tools.is_empty() {
        return "No tools available".to_string();
    }
    let mut by_server: BTreeMap<&str, Vec<(&str, String)>> = BTreeMap::new();
    for (name, tool) in tools {
        let server = tool.server.as_deref().unwrap_or("Unknown");
        let description = if tool.description.is_empty() {
            "No description available".to_string()
        } else {
            truncate(&tool.description, DESCRIPTION_LIMIT)
        };
        by_server.entry(server).or_default().push((name.as_str(), description));
    }

    let mut lines = Vec::new();
    for (server, entries) in by_server {
        lines.push(format!("[{}] ({} tools)", server, entries.len()));
        for (name, description) in entries {
            lines.push(format!("  - {}: {}", name, description));
        }
        lines.push(String::new());
    }
    lines.join("\n").trim().to_string()
}

fn param_text(value: &Value) -> String {
    match value {
        Value::String(s) => truncate(s, PARAM_VALUE_LIMIT),
        other => other.to_string(),
    }
}

/// Numbered expected calls with purpose and parameters
pub fn format_expected_calls(calls: &[ToolCallExpected]) -> String {
    if calls.is_empty() {
        return "No expected tool calls provided".to_string();
    }
    let mut lines = Vec::new();
    for (i, call) in calls.iter().enumerate() {
        let server = if call.server.is_empty() { "Unknown" } else { call.server.as_str() };
        lines.push(format!("{}. **{}** (Server: {})", i + 1, call.name, server));
        if let Some(description) = call.description.as_deref().filter(|d| !d.is_empty()) {
            lines.push(format!("   Purpose: {}", description));
        }
        if call.input_parameters.is_empty() {
            lines.push("   Expected Parameters: None".to_string());
        } else {
            lines.push("   Expected Parameters:".to_string());
            for (key, value) in &call.input_parameters {
                lines.push(format!("     - {}: {}", key, param_text(value)));
            }
        }
        lines.push(String::new());
    }
    lines.join("\n").trim().to_string()
}

/// Execution summary followed by the accumulated per-call information
pub fn execution_context(unit: &EvaluationUnit) -> String {
    let summary = unit.execution_summary();
    let accumulated = unit.accumulated_information();
    if accumulated.is_empty() {
        summary
    } else {
        format!(
            "{}\n\n--- ACCUMULATED INFORMATION FROM EXECUTION ---\n{}",
            summary, accumulated
        )
    }
}

const RUBRIC: &str = r#"### Evaluation Guidance using EXPECTED TOOL CALLS
If the "EXPECTED TOOL CALLS" section is provided above, use it as the ideal plan:
- Tool Appropriateness: compare the agent's tools against the expected tools. Penalize missing expected tools, wrong or irrelevant tools, and unnecessary extra tools.
- Parameter Accuracy: verify the agent's parameter keys and values against the expected ones. Where an expected call lists no parameters, judge the agent's parameters against the task and the available tools.
- Dependency and Order: penalize incorrect ordering or ignored dependencies implied by the expected sequence.
- Redundancy: penalize repeated calls that deviate from the expected minimal plan.

Reference mismatches with the expected calls in "tool_appropriateness_reasoning" and "parameter_accuracy_reasoning".

### Task Completion (1-10 each)
1. **Task Fulfillment**: 1-3 perfectly completes 10-30% of requirements; 4-6: 40-60%; 7-8: 70-80%; 9-10: 90-100%.
2. **Grounding**: 1-3 when 10-30% of claims are perfectly grounded in tool outputs; 4-6: 40-60%; 7-8: 70-80%; 9-10: 90-100%.

### Tool Usage (1-10 each)
1. **Tool Appropriateness**: share of tools perfectly selected for their subtasks, on the same 10-30/40-60/70-80/90-100% scale.
2. **Parameter Accuracy**: share of tool calls with perfectly accurate and complete parameters, on the same scale.

### Planning Effectiveness and Efficiency (1-10 each)
1. **Dependency Awareness**: share of dependency chains perfectly executed, on the same scale.
2. **Parallelism and Efficiency**: 1-3 for more than 70% redundant calls or under 30% of parallelizable work run in parallel; 4-6 for 40-60%; 7-8 for 20-30% redundancy and 70-80% parallel; 9-10 for under 10% redundancy and 90-100% parallel.

### Scoring
For each dimension compute the defect rate (issues / opportunities) and map it:
0-10% → 9-10, 10-30% → 7-9, 30-50% → 5-7, 50-70% → 3-5, 70-100% → 0-3.
Only perfectly executed work counts: optimal tool choice, ideal parameters, no redundancy, graceful error handling, efficient execution and concise output.
Score proportions, not absolute counts. Most real executions score 4-6; scores above 7 must be exceptional. Server count is irrelevant.
Text output when the task did not require JSON carries no penalty; missing JSON the task required counts as a failed requirement.

Return your evaluation in this exact JSON format:
{
  "task_fulfillment_reasoning": "...",
  "grounding_reasoning": "...",
  "tool_appropriateness_reasoning": "...",
  "parameter_accuracy_reasoning": "...",
  "dependency_awareness_reasoning": "...",
  "parallelism_efficiency_reasoning": "...",
  "task_fulfillment": X,
  "grounding": X,
  "tool_appropriateness": X,
  "parameter_accuracy": X,
  "dependency_awareness": X,
  "parallelism_and_efficiency": X
}

Return **only** the JSON object."#;

/// Full judge prompt for one unit
pub fn build_prompt(unit: &EvaluationUnit) -> String {
    let task_section = match unit.concrete_task_description.as_deref().filter(|d| !d.is_empty()) {
        Some(concrete) => format!(
            "**TASK PRESENTED TO AGENT**: \"{}\"\n\n\
             **CONCRETE TASK REFERENCE (For evaluation context only)**:\n\
             Note: The agent did NOT see this concrete version. It only saw the task above.\n\
             The agent's interpretation of the fuzzy task may differ but still be valid.\n\"{}\"",
            unit.input, concrete
        ),
        None => format!("**ORIGINAL TASK**: \"{}\"", unit.input),
    };

    let mut sections = vec![
        "You are an expert AI task execution evaluator. Score each dimension objectively based on evidence.".to_string(),
        task_section,
        format!("**EXECUTION SUMMARY**:\n{}", execution_context(unit)),
        format!("**FINAL SOLUTION**: \"{}\"", unit.actual_output),
        format!("**TOTAL ROUNDS**: {}", unit.total_rounds),
        format!(
            "**AVAILABLE TOOLS** ({} tools):\n{}",
            unit.available_tools.len(),
            format_available_tools(&unit.available_tools)
        ),
    ];
    if let Some(analysis) = unit.dependency_analysis.as_deref().filter(|d| !d.is_empty()) {
        sections.push(format!(
            "**DEPENDENCY ANALYSIS (Reference Only)**:\n\
             Note: The agent did NOT see this analysis. It is provided for evaluation purposes.\n{}",
            analysis
        ));
    }
    if !unit.expected_tools.is_empty() {
        sections.push(format!(
            "**EXPECTED TOOL CALLS (Reference Only)**:\n\
             Note: The agent did NOT see these expectations.\n\n{}",
            format_expected_calls(&unit.expected_tools)
        ));
    }
    sections.push(RUBRIC.to_string());
    sections.join("\n\n")
}

/// JSON schema of the judge answer, offered to clients that take one
pub fn answer_schema() -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for (score_key, reasoning_key, _) in DIMENSIONS {
        properties.insert(reasoning_key.to_string(), json!({"type": "string"}));
        properties.insert(score_key.to_string(), json!({"type": "number", "minimum": 1, "maximum": 10}));
        required.push(json!(score_key));
    }
    json!({"type": "object", "properties": properties, "required": required})
}

pub struct McpToolJudge {
    client: Arc<dyn LLMClient>,
    base: BaseMetric,
    parse_retry: RetryPolicy,
    validators: SchemaValidatorCache,
}

impl McpToolJudge {
    pub const DEFAULT_THRESHOLD: f64 = 0.7;

    pub fn new(client: Arc<dyn LLMClient>) -> Self {
        Self {
            client,
            base: BaseMetric::new(Self::DEFAULT_THRESHOLD),
            parse_retry: RetryPolicy::judge(),
            validators: SchemaValidatorCache::new(),
        }
    }

    pub fn with_base(mut self, base: BaseMetric) -> Self {
        self.base = base;
        self
    }

    /// Retries spent on unparseable judge replies
    pub fn with_parse_retry(mut self, policy: RetryPolicy) -> Self {
        self.parse_retry = policy;
        self
    }

    /// Ask the judge until a reply parses. Returns the scores (empty when
    /// every attempt failed) and the cost summed over all attempts.
    pub async fn judge(&self, unit: &EvaluationUnit) -> (JudgeScores, f64) {
        let prompt = build_prompt(unit);
        let schema = answer_schema();
        let mut cost = 0.0;
        let mut last_text: Option<String> = None;

        for attempt in 0..=self.parse_retry.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.parse_retry.delay_for_attempt(attempt - 1)).await;
            }
            match self.client.generate(&prompt, Some(&schema)).await {
                Ok(output) => {
                    cost += output.cost;
                    if let Some(value) = extract_json_object(&output.text) {
                        debug!("Judge reply for unit {} parsed on attempt {}", unit.id, attempt + 1);
                        return (JudgeScores::from_value(&value), cost);
                    }
                    warn!(
                        "Judge reply for unit {} is not JSON (attempt {}/{})",
                        unit.id,
                        attempt + 1,
                        self.parse_retry.max_retries + 1
                    );
                    last_text = Some(output.text);
                }
                Err(err) => {
                    warn!(
                        "Judge call for unit {} failed (attempt {}/{}): {}",
                        unit.id,
                        attempt + 1,
                        self.parse_retry.max_retries + 1,
                        err
                    );
                    if !err.is_retryable() {
                        break;
                    }
                }
            }
        }

        let fallback = last_text
            .as_deref()
            .and_then(|text| serde_json::from_str::<Value>(text.trim()).ok())
            .map(|value| JudgeScores::from_value(&value))
            .unwrap_or_default();
        if fallback.is_empty() {
            warn!("Judge gave no usable scores for unit {}", unit.id);
        }
        (fallback, cost)
    }
}

#[async_trait]
impl Scorable for McpToolJudge {
    fn id(&self) -> &str {
        "mcp_tool_judge"
    }

    async fn measure(&self, unit: &EvaluationUnit) -> Result<Verdict, EvalError> {
        let tools = ToolAccuracyReport::compute(&unit.tools_called, &unit.available_tools, &self.validators);
        let (scores, cost) = self.judge(unit).await;

        let tool_score = tools.tool_score().unwrap_or(0.0);
        let score = 0.6 * scores.llm_score() + 0.4 * tool_score;

        let mut breakdown: BTreeMap<String, f64> = DIMENSIONS
            .iter()
            .map(|(key, _, _)| (key.to_string(), scores.score(key)))
            .collect();
        for (key, value) in [
            ("input_schema_compliance", tools.input_schema_compliance),
            ("valid_tool_name_rate", tools.valid_tool_name_rate),
            ("execution_success_rate", tools.execution_success_rate),
        ] {
            if let Some(v) = value {
                breakdown.insert(key.to_string(), v);
            }
        }

        let verdict = self.base.verdict(self.id(), score, |_| scores.reason());
        Ok(verdict.with_breakdown(breakdown).with_cost(cost))
    }

    fn base(&self) -> &BaseMetric {
        &self.base
    }

    fn metadata(&self) -> MetricMetadata {
        MetricMetadata {
            name: "MCP Tool Judge".to_string(),
            version: "1.0.0".to_string(),
            description: "LLM-judged task, tool and planning quality blended with tool accuracy".to_string(),
            cost_per_eval: Some(0.003),
            avg_latency_ms: Some(8000),
            tags: vec!["llm-as-judge".to_string(), "tools".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::{LLMError, LLMResponse, TokenUsage};
    use agentbench_core::ToolCallRecord;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct Scripted {
        replies: Mutex<VecDeque<Result<String, LLMError>>>,
        calls: Mutex<usize>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String, LLMError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl LLMClient for Scripted {
        async fn evaluate(&self, _prompt: String) -> Result<LLMResponse, LLMError> {
            *self.calls.lock() += 1;
            let reply = self
                .replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok("still not json".to_string()))?;
            Ok(LLMResponse {
                content: reply,
                usage: TokenUsage {
                    prompt_tokens: 1000,
                    completion_tokens: 0,
                    total_tokens: 1000,
                },
                model: "scripted".into(),
            })
        }

        fn model_name(&self) -> &str {
            "scripted"
        }

        fn cost_per_token(&self) -> (f64, f64) {
            (0.001, 0.0)
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::judge().with_initial_delay(Duration::from_millis(1))
    }

    fn perfect_reply() -> String {
        let mut body = serde_json::Map::new();
        for (score_key, reasoning_key, _) in DIMENSIONS {
            body.insert(score_key.into(), json!(10));
            body.insert(reasoning_key.into(), json!(format!("{} ok", score_key)));
        }
        format!("Here you go:\n```json\n{}\n```", Value::Object(body))
    }

    fn unit() -> EvaluationUnit {
        let mut unit = EvaluationUnit::new("u1", "What is the weather in Beijing?");
        unit.actual_output = "Sunny, 20C".into();
        let mut tool = AvailableTool::new("get_weather", "Weather lookup", Value::Null);
        tool.server = Some("weather".into());
        unit.available_tools.insert("get_weather".into(), tool);
        unit.tools_called = vec![ToolCallRecord::new("get_weather").with_output(json!({"temp": 20}), true)];
        unit.expected_tools = vec![ToolCallExpected::new("get_weather").with_param("location", "Beijing")];
        unit
    }

    #[test]
    fn test_extract_json_object() {
        assert_eq!(extract_json_object("noise {\"a\": 1} tail"), Some(json!({"a": 1})));
        assert_eq!(extract_json_object("{'a': True}"), Some(json!({"a": true})));
        assert_eq!(extract_json_object("} backwards {"), None);
        assert_eq!(extract_json_object("no braces"), None);
    }

    #[test]
    fn test_scores_and_reason() {
        let scores = JudgeScores::from_value(&json!({
            "task_fulfillment": 8, "grounding": "6",
            "tool_appropriateness": 7, "parameter_accuracy": 5,
            "dependency_awareness": 4, "parallelism_and_efficiency": 6,
            "grounding_reasoning": "mostly cited",
            "parallelism_efficiency_reasoning": "one redundant call"
        }));
        // (7 + 6 + 5) / 30
        assert!((scores.llm_score() - 0.6).abs() < 1e-12);
        assert_eq!(
            scores.reason(),
            "Grounding: mostly cited\n\nParallelism & Efficiency: one redundant call"
        );
        assert_eq!(JudgeScores::default().reason(), "No detailed reasoning provided");
    }

    #[test]
    fn test_prompt_sections() {
        let mut u = unit();
        u.dependency_analysis = Some("weather first".into());
        let prompt = build_prompt(&u);
        assert!(prompt.contains("**ORIGINAL TASK**: \"What is the weather in Beijing?\""));
        assert!(prompt.contains("[weather] (1 tools)\n  - get_weather: Weather lookup"));
        assert!(prompt.contains("**DEPENDENCY ANALYSIS (Reference Only)**"));
        assert!(prompt.contains("1. **get_weather** (Server: default)\n   Expected Parameters:\n     - location: Beijing"));
        assert!(prompt.ends_with("Return **only** the JSON object."));
    }

    #[test]
    fn test_description_truncation() {
        let mut tools = BTreeMap::new();
        tools.insert("t".to_string(), AvailableTool::new("t", "x".repeat(600), Value::Null));
        let text = format_available_tools(&tools);
        assert!(text.starts_with("[Unknown] (1 tools)"));
        assert!(text.ends_with(&format!("{}...", "x".repeat(500))));
    }

    #[tokio::test]
    async fn test_retry_until_parseable_and_accumulate_cost() {
        let client = Scripted::new(vec![Ok("I think it went well".into()), Ok(perfect_reply())]);
        let judge = McpToolJudge::new(client.clone()).with_parse_retry(fast());
        let verdict = judge.measure(&unit()).await.unwrap();

        assert_eq!(*client.calls.lock(), 2);
        assert!((verdict.cost.unwrap() - 2.0).abs() < 1e-9);
        assert!((verdict.score - 1.0).abs() < 1e-9);
        assert!(verdict.success);
        assert!(verdict.reason.unwrap().starts_with("Task Fulfillment: task_fulfillment ok"));
    }

    #[tokio::test]
    async fn test_exhausted_judge_degrades_to_tool_score() {
        let client = Scripted::new(vec![]);
        let judge = McpToolJudge::new(client.clone()).with_parse_retry(fast());
        let verdict = judge.measure(&unit()).await.unwrap();

        assert_eq!(*client.calls.lock(), 4);
        assert!((verdict.score - 0.4).abs() < 1e-9);
        assert!(!verdict.success);
        assert_eq!(verdict.reason.as_deref(), Some("No detailed reasoning provided"));
        assert_eq!(verdict.score_breakdown.unwrap()["task_fulfillment"], 0.0);
    }

    #[tokio::test]
    async fn test_non_retryable_client_error_stops_early() {
        let client = Scripted::new(vec![Err(LLMError::Unauthorized("bad key".into()))]);
        let judge = McpToolJudge::new(client.clone()).with_parse_retry(fast());
        let verdict = judge.measure(&unit()).await.unwrap();
        assert_eq!(*client.calls.lock(), 1);
        assert_eq!(verdict.cost, Some(0.0));
    }
}
