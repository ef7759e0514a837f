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

//! Span classification
//!
//! Classification is conservative. The LLM predicate is evaluated first and
//! is authoritative, and `(merged tools)` rollups are never tool calls since
//! they would double-count every execution.

use super::attributes::{KeyPattern, SpanAttributeView};
use agentbench_core::SpanRecord;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub const MERGED_TOOLS_SPAN: &str = "(merged tools)";
pub const TOOL_SPAN_MARKER: &str = "execute_tool";

const LLM_NAME_MARKERS: &[&str] = &["call_llm", "llm_call"];
const LLM_OPERATIONS: &[&str] = &["chat", "completion"];
const BROAD_TOOL_PATTERNS: &[&str] = &[
    "execute_tool",
    "function_call",
    "execute_command",
    "read_file",
    "write_to_file",
    "replace_in_file",
    "list_files",
    "search_files",
    "use_mcp_tool",
    "puppeteer_",
    "vesearch",
];

/// Span role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Llm,
    Tool,
    AgentRun,
    Other,
}

/// Which tool patterns a classifier accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierProfile {
    /// `execute_tool` spans only; used for tool-call reconstruction
    Strict,
    /// Every known tool-like span; used for timing analysis
    Broad,
}

/// Pure span classifier
#[derive(Debug, Clone, Copy)]
pub struct SpanClassifier {
    profile: ClassifierProfile,
}

impl Default for SpanClassifier {
    fn default() -> Self {
        Self::strict()
    }
}

impl SpanClassifier {
    pub fn strict() -> Self {
        Self {
            profile: ClassifierProfile::Strict,
        }
    }

    pub fn performance() -> Self {
        Self {
            profile: ClassifierProfile::Broad,
        }
    }

    pub fn profile(&self) -> ClassifierProfile {
        self.profile
    }

    pub fn classify(&self, span: &SpanRecord) -> SpanKind {
        if self.is_llm_call_span(span) {
            SpanKind::Llm
        } else if self.is_tool_call_span(span) {
            SpanKind::Tool
        } else if self.is_agent_run_span(span) {
            SpanKind::AgentRun
        } else {
            SpanKind::Other
        }
    }

    pub fn is_llm_call_span(&self, span: &SpanRecord) -> bool {
        let name = span.name.to_lowercase();
        if LLM_NAME_MARKERS.iter().any(|m| name.contains(m)) {
            return true;
        }

        let view = SpanAttributeView::new(span);
        let has_model = view.has_key(KeyPattern::Contains("gen_ai.request.model"));
        if !has_model {
            return false;
        }
        let chat_operation = view
            .try_get_operation_name()
            .map(|op| LLM_OPERATIONS.contains(&op.as_str()))
            .unwrap_or(false);
        chat_operation || view.has_key(KeyPattern::Contains("gen_ai.system"))
    }

    pub fn is_tool_call_span(&self, span: &SpanRecord) -> bool {
        if span.name == MERGED_TOOLS_SPAN || self.is_llm_call_span(span) {
            return false;
        }
        let name = span.name.to_lowercase();
        match self.profile {
            ClassifierProfile::Strict => name.contains(TOOL_SPAN_MARKER),
            ClassifierProfile::Broad => {
                BROAD_TOOL_PATTERNS.iter().any(|p| name.contains(p))
                    || span.attributes.keys().any(|k| {
                        let k = k.to_lowercase();
                        k.contains("tool.name")
                            || (k.contains("tool") && k.contains("call") && !k.contains("llm"))
                    })
            }
        }
    }

    /// Only a name of exactly `agent_run`/`agent.run` or an `agent_run [name]`
    /// suffix counts; agent-name attributes alone do not mark a run boundary.
    pub fn is_agent_run_span(&self, span: &SpanRecord) -> bool {
        let name = span.name.to_lowercase();
        name.contains("agent_run [") || name == "agent_run" || name == "agent.run"
    }
}

fn agent_bracket() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)agent_run \[(.*?)\]").expect("agent name pattern is valid"))
}

/// Agent name of a run span: attribute, then bracket suffix, then span name
pub fn agent_name_of(span: &SpanRecord) -> String {
    if let Some(name) = SpanAttributeView::new(span).try_get_agent_name() {
        return name;
    }
    agent_bracket()
        .captures(&span.name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| span.name.clone())
}
