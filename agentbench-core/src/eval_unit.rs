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

//! Evaluation units (test cases)
//!
//! A unit is created per dataset row, filled turn by turn while the agent
//! runs, then handed to the metrics by value. Nothing else holds it while
//! it is being populated.

use crate::span::SpanRecord;
use crate::tool::{AvailableTool, ToolCallExpected, ToolCallRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

const RESULT_INLINE_LIMIT: usize = 2000;
const RESULT_TRUNCATE_AT: usize = 1500;
const ERROR_INLINE_LIMIT: usize = 1000;
const ERROR_TRUNCATE_AT: usize = 800;

fn default_rounds() -> u32 {
    1
}

/// One prior execution of the agent on the same input, used by pass@k metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrialRecord {
    pub success: bool,
    #[serde(default)]
    pub tools_called: Vec<ToolCallRecord>,
    #[serde(default)]
    pub actual_output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

/// Aggregated execution statistics over a unit's tool calls
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolExecutionStats {
    pub total_executions: usize,
    pub successful_executions: usize,
    pub failed_executions: usize,
    pub success_rate: f64,
    pub unique_tools: usize,
    pub servers_used: usize,
    pub total_execution_time: f64,
    pub average_execution_time: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationUnit {
    pub id: String,
    pub input: String,
    #[serde(default)]
    pub actual_output: String,
    #[serde(default)]
    pub expected_output: Option<String>,
    #[serde(default)]
    pub tools_called: Vec<ToolCallRecord>,
    #[serde(default)]
    pub expected_tools: Vec<ToolCallExpected>,
    #[serde(default)]
    pub available_tools: BTreeMap<String, AvailableTool>,
    /// Set when `available_tools` came from another trace's schema
    #[serde(default)]
    pub available_tools_low_confidence: bool,
    /// One span sequence per conversational turn
    #[serde(default)]
    pub trace_data: Vec<Vec<SpanRecord>>,
    #[serde(default = "default_rounds")]
    pub total_rounds: u32,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub trials: Vec<TrialRecord>,
    #[serde(default)]
    pub retrieval_context: Vec<String>,
    #[serde(default)]
    pub dependency_analysis: Option<String>,
    #[serde(default)]
    pub concrete_task_description: Option<String>,
    #[serde(default)]
    pub conversation_history: Vec<ConversationTurn>,
}

impl EvaluationUnit {
    pub fn new(id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            input: input.into(),
            total_rounds: 1,
            ..Default::default()
        }
    }

    /// Append one turn's spans and bump the round counter
    pub fn push_turn(&mut self, spans: Vec<SpanRecord>) {
        self.trace_data.push(spans);
        self.total_rounds = self.trace_data.len().max(1) as u32;
    }

    /// All spans across turns, in turn order
    pub fn all_spans(&self) -> impl Iterator<Item = &SpanRecord> {
        self.trace_data.iter().flatten()
    }

    pub fn add_conversation_turn(&mut self, role: impl Into<String>, content: impl Into<String>) {
        self.conversation_history.push(ConversationTurn {
            role: role.into(),
            content: content.into(),
        });
    }

    pub fn conversation_context(&self) -> String {
        self.conversation_history
            .iter()
            .map(|turn| format!("{}: {}", turn.role.to_uppercase(), turn.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// One-line summary of tool execution outcomes
    pub fn execution_summary(&self) -> String {
        if self.tools_called.is_empty() {
            return "No tools were executed.".to_string();
        }

        let (ok, failed): (Vec<_>, Vec<_>) = self.tools_called.iter().partition(|c| c.success);
        let mut parts = vec![
            format!("Total rounds: {}", self.total_rounds),
            format!("Tools executed: {}", self.tools_called.len()),
            format!("Successful: {}", ok.len()),
            format!("Failed: {}", failed.len()),
        ];
        if !ok.is_empty() {
            let names: Vec<&str> = ok.iter().map(|c| c.name.as_str()).collect();
            parts.push(format!("Successful tools: {}", names.join(", ")));
        }
        if !failed.is_empty() {
            let names: Vec<&str> = failed.iter().map(|c| c.name.as_str()).collect();
            parts.push(format!("Failed tools: {}", names.join(", ")));
        }
        parts.join("; ")
    }

    /// Per-call lines describing what each tool returned, long payloads truncated
    pub fn accumulated_information(&self) -> String {
        self.tools_called
            .iter()
            .map(describe_call)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_execution_stats(&self) -> ToolExecutionStats {
        let calls = &self.tools_called;
        if calls.is_empty() {
            return ToolExecutionStats::default();
        }

        let successful = calls.iter().filter(|c| c.success).count();
        let unique: BTreeSet<&str> = calls.iter().map(|c| c.name.as_str()).collect();
        let servers: BTreeSet<&str> = calls
            .iter()
            .map(|c| c.server.as_str())
            .filter(|s| !s.is_empty())
            .collect();
        let times: Vec<f64> = calls.iter().filter_map(|c| c.execution_time).collect();
        let total_time: f64 = times.iter().sum();

        ToolExecutionStats {
            total_executions: calls.len(),
            successful_executions: successful,
            failed_executions: calls.len() - successful,
            success_rate: successful as f64 / calls.len() as f64,
            unique_tools: unique.len(),
            servers_used: servers.len(),
            total_execution_time: total_time,
            average_execution_time: if times.is_empty() {
                0.0
            } else {
                total_time / times.len() as f64
            },
        }
    }

    /// Problems that make the unit unfit for scoring; empty when valid
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.input.trim().is_empty() {
            errors.push("Input cannot be empty".to_string());
        }
        if self.actual_output.trim().is_empty() {
            errors.push("Actual output cannot be empty".to_string());
        }
        if self.total_rounds < 1 {
            errors.push("total_rounds must be >= 1".to_string());
        }
        if !self.available_tools.is_empty() {
            for call in &self.tools_called {
                if !self.available_tools.contains_key(&call.name) {
                    errors.push(format!("Tool '{}' not found in available_tools", call.name));
                }
            }
        }
        errors
    }
}

fn describe_call(call: &ToolCallRecord) -> String {
    let params = if call.input_parameters.is_empty() {
        "{}".to_string()
    } else {
        serde_json::Value::Object(call.input_parameters.clone()).to_string()
    };
    let head = format!(
        "Tool `{}` with Parameter {} on {}",
        call.name, params, call.server
    );

    if call.success {
        let content = render_value(&call.output);
        if content.chars().count() <= RESULT_INLINE_LIMIT {
            format!("{head} succeeded. Result: {content}")
        } else {
            format!(
                "{head} succeeded. Result (truncated): {}...",
                truncate_chars(&content, RESULT_TRUNCATE_AT)
            )
        }
    } else {
        let error = call
            .error_message
            .clone()
            .unwrap_or_else(|| "Unknown error".to_string());
        if error.chars().count() <= ERROR_INLINE_LIMIT {
            format!("{head} failed. Error: {error}")
        } else {
            format!(
                "{head} failed. Error (truncated): {}...",
                truncate_chars(&error, ERROR_TRUNCATE_AT)
            )
        }
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
