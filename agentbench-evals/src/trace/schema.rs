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

//! Function-schema recovery
//!
//! Finds the tool list offered to the model on LLM spans and keys it by
//! trace id. When a trace has no schema of its own, the most recently
//! recovered non-empty schema is returned instead and tagged
//! [`SchemaSource::CrossTraceFallback`] so callers can treat the
//! attribution as low confidence.

use super::attributes::{value_text, FunctionSource, SpanAttributeView};
use super::pyliteral::parse_python_literal;
use agentbench_core::{AvailableTool, SpanRecord};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const LLM_INDICATORS: &[&str] = &[
    "llm",
    "chat",
    "completion",
    "openai",
    "anthropic",
    "claude",
    "generate",
    "model",
    "inference",
    "ai_model",
    "assistant",
    "agent",
];

const DESCRIPTION_KEYS: &[&str] = &["description", "desc", "summary", "doc"];
const PARAMETER_KEYS: &[&str] = &["parameters", "params", "arguments", "args", "schema"];

pub type ToolUniverse = BTreeMap<String, AvailableTool>;

/// Where a trace's tool universe came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaSource {
    TraceMatch,
    CrossTraceFallback,
    None,
}

impl SchemaSource {
    pub fn is_low_confidence(&self) -> bool {
        matches!(self, SchemaSource::CrossTraceFallback)
    }
}

/// Recovered tool universes keyed by trace id
#[derive(Debug, Clone, Default)]
pub struct SchemaIndex {
    by_trace: BTreeMap<String, ToolUniverse>,
    latest: Option<String>,
}

impl SchemaIndex {
    pub fn is_empty(&self) -> bool {
        self.by_trace.is_empty()
    }

    pub fn trace_ids(&self) -> impl Iterator<Item = &str> {
        self.by_trace.keys().map(String::as_str)
    }

    /// Tool universe for a trace, falling back to the latest recovered one
    pub fn available_tools_for(&self, trace_id: Option<&str>) -> (ToolUniverse, SchemaSource) {
        if let Some(tools) = trace_id.and_then(|id| self.by_trace.get(id)) {
            return (tools.clone(), SchemaSource::TraceMatch);
        }
        match self.latest.as_ref().and_then(|id| self.by_trace.get(id)) {
            Some(tools) => {
                warn!(
                    "No tool schema for trace {:?}; reusing schema recovered from trace {:?}",
                    trace_id, self.latest
                );
                (tools.clone(), SchemaSource::CrossTraceFallback)
            }
            None => (ToolUniverse::new(), SchemaSource::None),
        }
    }

    /// Union of the universes of several traces.
    ///
    /// Falls back like [`Self::available_tools_for`] only when none of the
    /// given traces matched.
    pub fn available_tools_for_all<'a>(
        &self,
        trace_ids: impl IntoIterator<Item = &'a str>,
    ) -> (ToolUniverse, SchemaSource) {
        let mut merged = ToolUniverse::new();
        let mut matched = false;
        for id in trace_ids {
            if let Some(tools) = self.by_trace.get(id) {
                matched = true;
                merged.extend(tools.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        if matched {
            (merged, SchemaSource::TraceMatch)
        } else {
            self.available_tools_for(None)
        }
    }
}

/// Scans LLM-call spans for the tool schema offered to the model
#[derive(Debug, Clone, Copy, Default)]
pub struct FunctionSchemaRecoverer;

impl FunctionSchemaRecoverer {
    pub fn new() -> Self {
        Self
    }

    /// Whether a span may carry a function list: it looks like an LLM call
    /// or mentions functions, and it belongs to a trace
    pub fn qualifies(&self, span: &SpanRecord) -> bool {
        span.trace_id.is_some() && (looks_like_llm(span) || SpanAttributeView::new(span).has_function_hints())
    }

    /// Raw function list and where it was found
    pub fn functions_on(&self, span: &SpanRecord) -> Option<(Value, FunctionSource)> {
        SpanAttributeView::new(span).try_get_functions()
    }

    pub fn recover<'a>(&self, spans: impl IntoIterator<Item = &'a SpanRecord>) -> SchemaIndex {
        let mut index = SchemaIndex::default();
        for span in spans {
            if !self.qualifies(span) {
                continue;
            }
            let Some(trace_id) = span.trace_id.clone() else {
                continue;
            };
            let Some((raw, source)) = self.functions_on(span) else {
                continue;
            };
            let tools = parse_functions_details(&raw);
            if tools.is_empty() {
                continue;
            }
            debug!(
                "Recovered {} tool definitions from span '{}' ({:?})",
                tools.len(),
                span.name,
                source
            );
            let universe = index.by_trace.entry(trace_id.clone()).or_default();
            for tool in tools {
                universe.insert(tool.name.clone(), tool);
            }
            index.latest = Some(trace_id);
        }
        index
    }
}

/// LLM indicators in the span name, attribute keys, or attribute string values
pub fn looks_like_llm(span: &SpanRecord) -> bool {
    let hit = |s: &str| {
        let s = s.to_lowercase();
        LLM_INDICATORS.iter().any(|i| s.contains(i))
    };
    hit(&span.name)
        || span
            .attributes
            .iter()
            .any(|(k, v)| hit(k) || v.as_str().map(hit).unwrap_or(false))
}

/// Normalize a raw function list into [`AvailableTool`]s; nameless entries are dropped
pub fn parse_functions_details(raw: &Value) -> Vec<AvailableTool> {
    let raw = match raw {
        Value::String(text) => match coerce_text(text) {
            Some(parsed) => parsed,
            None => return Vec::new(),
        },
        other => other.clone(),
    };

    let entries: Vec<Value> = match raw {
        Value::Array(items) => items,
        Value::Object(ref map) => {
            if map.contains_key("name") {
                vec![raw.clone()]
            } else if let Some(Value::Array(functions)) = map.get("functions") {
                functions.clone()
            } else if let Some(Value::Array(tools)) = map.get("tools") {
                tools.clone()
            } else {
                vec![raw.clone()]
            }
        }
        _ => Vec::new(),
    };

    entries
        .iter()
        .filter_map(Value::as_object)
        .filter_map(parse_function_entry)
        .collect()
}

fn parse_function_entry(entry: &Map<String, Value>) -> Option<AvailableTool> {
    let wrapped = entry.get("function").and_then(Value::as_object);

    let name = entry
        .get("name")
        .or_else(|| wrapped.and_then(|f| f.get("name")))
        .map(value_text)
        .filter(|n| !n.trim().is_empty())?;

    let description = first_present(entry, DESCRIPTION_KEYS)
        .or_else(|| wrapped.and_then(|f| first_present(f, DESCRIPTION_KEYS)))
        .map(value_text)
        .unwrap_or_default();

    let schema = first_present(entry, PARAMETER_KEYS)
        .and_then(coerce_parameters)
        .or_else(|| {
            entry.get("properties").map(|properties| {
                json!({
                    "type": "object",
                    "properties": properties,
                    "required": entry.get("required").cloned().unwrap_or_else(|| json!([])),
                })
            })
        })
        .or_else(|| {
            wrapped
                .and_then(|f| first_present(f, PARAMETER_KEYS))
                .and_then(coerce_parameters)
        })
        .unwrap_or_else(|| json!({}));

    Some(AvailableTool::new(name, description, schema))
}

fn first_present<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().filter_map(|k| map.get(*k)).find(|v| !v.is_null())
}

fn coerce_parameters(value: &Value) -> Option<Value> {
    match value {
        Value::Object(_) => Some(value.clone()),
        Value::String(text) => coerce_text(text).filter(Value::is_object),
        _ => None,
    }
}

fn coerce_text(text: &str) -> Option<Value> {
    serde_json::from_str(text)
        .ok()
        .or_else(|| parse_python_literal(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn llm_span(trace: &str) -> SpanRecord {
        SpanRecord::new("call_llm").with_ids(trace, format!("{}-llm", trace))
    }

    #[test]
    fn test_parse_openai_wrapper() {
        let raw = json!([
            {"type": "function", "function": {"name": "get_weather", "description": "Weather", "parameters": {"type": "object"}}},
            {"type": "function", "function": {"description": "nameless"}}
        ]);
        let tools = parse_functions_details(&raw);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "get_weather");
        assert_eq!(tools[0].description, "Weather");
        assert_eq!(tools[0].input_schema, json!({"type": "object"}));
    }

    #[test]
    fn test_parse_properties_and_literal_params() {
        let raw = json!({"tools": [
            {"name": "a", "properties": {"x": {"type": "string"}}},
            {"name": "b", "desc": "B", "params": "{'type': <Type.OBJECT: 'OBJECT'>, 'required': ['q']}"}
        ]});
        let tools = parse_functions_details(&raw);
        assert_eq!(tools[0].input_schema["required"], json!([]));
        assert_eq!(tools[0].input_schema["type"], "object");
        assert_eq!(tools[1].description, "B");
        assert_eq!(tools[1].input_schema, json!({"type": "object", "required": ["q"]}));
    }

    #[test]
    fn test_recover_by_trace() {
        let span = llm_span("t1")
            .with_attribute("gen_ai.request.functions.0.name", "get_weather")
            .with_attribute("gen_ai.request.functions.1.name", "send_email");
        let index = FunctionSchemaRecoverer::new().recover([&span]);
        let (tools, source) = index.available_tools_for(Some("t1"));
        assert_eq!(source, SchemaSource::TraceMatch);
        assert_eq!(tools.keys().cloned().collect::<Vec<_>>(), vec!["get_weather", "send_email"]);
    }

    #[test]
    fn test_cross_trace_fallback_is_flagged() {
        let span = llm_span("t1").with_attribute("gen_ai.request.functions.0.name", "lookup");
        let index = FunctionSchemaRecoverer::new().recover([&span]);
        let (tools, source) = index.available_tools_for(Some("t2"));
        assert!(source.is_low_confidence());
        assert!(tools.contains_key("lookup"));

        let empty = FunctionSchemaRecoverer::new().recover(std::iter::empty());
        assert_eq!(empty.available_tools_for(Some("t2")).1, SchemaSource::None);
    }

    #[test]
    fn test_span_without_trace_id_is_ignored() {
        let span = SpanRecord::new("call_llm").with_attribute("gen_ai.request.functions.0.name", "x");
        assert!(FunctionSchemaRecoverer::new().recover([&span]).is_empty());
    }
}
