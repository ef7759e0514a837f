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

//! Tool-call reconstruction from classified spans

use super::attributes::{value_text, KeyPattern, SpanAttributeView};
use super::classifier::{SpanClassifier, MERGED_TOOLS_SPAN, TOOL_SPAN_MARKER};
use super::success::{error_message_of, is_tool_execution_success};
use agentbench_core::{SpanRecord, ToolCallRecord, DEFAULT_SERVER};
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashSet};
use std::hash::{Hash, Hasher};
use tracing::debug;

const NAME_PREFIXES: &[&str] = &["span:", "trace:", "operation:", "call:", "execute:"];
const SERVER_KEYS: &[KeyPattern] = &[
    KeyPattern::Exact("gen_ai.tool.server"),
    KeyPattern::Contains("mcp.server"),
    KeyPattern::Contains("server.name"),
];
const DEDUP_INPUT_CHARS: usize = 100;
const NANOS_PER_SECOND: f64 = 1e9;

/// Strip one known prefix (case-insensitive) and the tool-span marker
pub fn normalize_tool_name(raw: &str) -> String {
    let trimmed = raw.trim();
    let name = NAME_PREFIXES
        .iter()
        .find_map(|prefix| {
            let head = trimmed.get(..prefix.len())?;
            head.eq_ignore_ascii_case(prefix)
                .then(|| &trimmed[prefix.len()..])
        })
        .unwrap_or(trimmed)
        .trim();
    match name.strip_prefix(TOOL_SPAN_MARKER) {
        Some(rest) if rest.starts_with(' ') => rest.trim().to_string(),
        _ => name.to_string(),
    }
}

/// Builds ordered, deduplicated [`ToolCallRecord`]s from spans
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolCallReconstructor {
    classifier: SpanClassifier,
}

struct Candidate {
    timestamp: u64,
    record: ToolCallRecord,
}

impl ToolCallReconstructor {
    pub fn new() -> Self {
        Self {
            classifier: SpanClassifier::strict(),
        }
    }

    /// Records for one flat span list, ordered 1..n by start time
    pub fn reconstruct(&self, spans: &[SpanRecord]) -> Vec<ToolCallRecord> {
        self.reconstruct_iter(spans.iter())
    }

    /// Records across every turn of a unit; ordering is unit-wide
    pub fn reconstruct_turns(&self, turns: &[Vec<SpanRecord>]) -> Vec<ToolCallRecord> {
        self.reconstruct_iter(turns.iter().flatten())
    }

    /// Trace ids carried by the spans this reconstructor reads as tool calls
    pub fn tool_trace_ids<'a>(&self, spans: impl Iterator<Item = &'a SpanRecord>) -> BTreeSet<&'a str> {
        spans
            .filter(|s| self.classifier.is_tool_call_span(s))
            .filter_map(|s| s.trace_id.as_deref())
            .collect()
    }

    fn reconstruct_iter<'a>(&self, spans: impl Iterator<Item = &'a SpanRecord>) -> Vec<ToolCallRecord> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for span in spans.filter(|s| self.classifier.is_tool_call_span(s)) {
            let Some(candidate) = self.build(span) else {
                continue;
            };
            if !seen.insert(dedup_key(span, &candidate.record)) {
                debug!("Skipping duplicate tool span {}", candidate.record.name);
                continue;
            }
            candidates.push(candidate);
        }

        // stable: equal timestamps keep discovery order
        candidates.sort_by_key(|c| c.timestamp);
        candidates
            .into_iter()
            .enumerate()
            .map(|(i, c)| {
                let mut record = c.record;
                record.execution_order = i as u32 + 1;
                record
            })
            .collect()
    }

    fn build(&self, span: &SpanRecord) -> Option<Candidate> {
        let view = SpanAttributeView::new(span);
        let raw_name = view.try_get_tool_name().unwrap_or_else(|| span.name.clone());
        let name = normalize_tool_name(&raw_name);
        if name.is_empty() || name == MERGED_TOOLS_SPAN {
            return None;
        }

        let input = view.try_get_tool_input().or_else(|| view.try_get_event_input());
        let output = view
            .try_get_tool_output()
            .or_else(|| view.try_get_event_output())
            .map(unwrap_output)
            .unwrap_or(Value::Null);

        let success = is_tool_execution_success(&output);
        let server = view
            .find(SERVER_KEYS)
            .map(|(_, v)| value_text(v))
            .unwrap_or_else(|| DEFAULT_SERVER.to_string());

        let mut record = ToolCallRecord::new(name)
            .with_parameters(input.map(input_parameters).unwrap_or_default())
            .with_output(output, success)
            .with_server(server);
        record.execution_time = span.duration().map(|d| d as f64 / NANOS_PER_SECOND);
        if !success {
            record.error_message = error_message_of(&record.output);
        }

        Some(Candidate {
            timestamp: span.start_time.unwrap_or(0),
            record,
        })
    }
}

fn dedup_key(span: &SpanRecord, record: &ToolCallRecord) -> String {
    match span.span_id.as_deref() {
        Some(span_id) => format!("{}_{}", record.name, span_id),
        None => {
            let input = Value::Object(record.input_parameters.clone()).to_string();
            let truncated: String = input.chars().take(DEDUP_INPUT_CHARS).collect();
            let mut hasher = DefaultHasher::new();
            truncated.hash(&mut hasher);
            format!(
                "{}_{}_{:x}",
                record.name,
                span.start_time.unwrap_or(0),
                hasher.finish()
            )
        }
    }
}

/// Tool input as a parameter map. `{parameters: {...}}` wrappers unwrap.
fn input_parameters(input: Value) -> Map<String, Value> {
    match input {
        Value::Object(mut map) => match map.remove("parameters") {
            Some(Value::Object(params)) => params,
            Some(other) => {
                map.insert("parameters".to_string(), other);
                map
            }
            None => map,
        },
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("input".to_string(), other);
            map
        }
    }
}

/// MCP-style `{response: {result: ...}}` envelopes unwrap to the result
fn unwrap_output(output: Value) -> Value {
    if let Some(result) = output
        .get("response")
        .filter(|r| r.is_object())
        .and_then(|r| r.get("result"))
    {
        return result.clone();
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentbench_core::SpanEvent;

    fn tool_span(name: &str, span_id: &str, start: u64) -> SpanRecord {
        SpanRecord::new(format!("execute_tool {}", name))
            .with_ids("t1", span_id)
            .with_times(start, start + 2_000_000_000)
            .with_attribute("gen_ai.tool.name", name)
    }

    #[test]
    fn test_name_normalization() {
        assert_eq!(normalize_tool_name("Span: get_weather "), "get_weather");
        assert_eq!(normalize_tool_name("call:span:x"), "span:x");
        assert_eq!(normalize_tool_name("execute_tool send_email"), "send_email");
        assert_eq!(normalize_tool_name("execute_tools"), "execute_tools");
    }

    #[test]
    fn test_ordering_by_timestamp() {
        let spans = vec![
            tool_span("b", "s2", 300),
            tool_span("a", "s1", 100),
            SpanRecord::new("call_llm").with_times(0, 50),
        ];
        let records = ToolCallReconstructor::new().reconstruct(&spans);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "a");
        assert_eq!(records[0].execution_order, 1);
        assert_eq!(records[1].execution_order, 2);
        assert_eq!(records[0].execution_time, Some(2.0));
    }

    #[test]
    fn test_duplicate_span_id_yields_one_record() {
        let span = tool_span("get_weather", "s1", 10);
        let records = ToolCallReconstructor::new().reconstruct(&[span.clone(), span]);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_dedup_without_span_id() {
        let span = SpanRecord::new("execute_tool lookup")
            .with_times(5, 6)
            .with_attribute("tool.input", r#"{"q": "x"}"#);
        let other = SpanRecord::new("execute_tool lookup")
            .with_times(5, 6)
            .with_attribute("tool.input", r#"{"q": "y"}"#);
        let records = ToolCallReconstructor::new().reconstruct(&[span.clone(), span, other]);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_io_and_success() {
        let span = tool_span("query", "s1", 0)
            .with_attribute("tool.input", r#"{"parameters": {"sql": "select 1"}}"#)
            .with_attribute("tool.output", r#"{"response": {"result": {"error": "syntax"}}}"#);
        let record = &ToolCallReconstructor::new().reconstruct(&[span])[0];
        assert_eq!(record.input_parameters["sql"], "select 1");
        assert!(!record.success);
        assert_eq!(record.error_message.as_deref(), Some("syntax"));
    }

    #[test]
    fn test_event_fallback() {
        let span = tool_span("fetch", "s1", 0)
            .with_event(SpanEvent::new("start").with_attribute("input", r#"{"url": "a"}"#))
            .with_event(SpanEvent::new("complete").with_attribute("output", r#"{"data": [1]}"#));
        let record = &ToolCallReconstructor::new().reconstruct(&[span])[0];
        assert_eq!(record.input_parameters["url"], "a");
        assert!(record.success);
    }

    #[test]
    fn test_drops_nameless_and_merged() {
        let merged = SpanRecord::new("execute_tool x").with_attribute("tool.name", "(merged tools)");
        let blank = SpanRecord::new("execute_tool x").with_attribute("tool.name", "  ");
        assert!(ToolCallReconstructor::new().reconstruct(&[merged, blank]).is_empty());
    }

    #[test]
    fn test_turn_wide_ordering() {
        let turns = vec![vec![tool_span("a", "s1", 500)], vec![tool_span("b", "s2", 100)]];
        let records = ToolCallReconstructor::new().reconstruct_turns(&turns);
        assert_eq!(records[0].name, "b");
        assert_eq!(records[1].execution_order, 2);
        assert!(records[1].input_parameters.is_empty());
    }
}
