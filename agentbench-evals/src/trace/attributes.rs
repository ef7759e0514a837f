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

//! Typed accessors over loosely structured span attributes
//!
//! Every accessor walks an ordered list of [`KeyPattern`]s; the first pattern
//! with a matching key wins. The attribute key conventions
//! (`gen_ai.tool.name`, `gen_ai.request.functions.<i>.<field>`, ...) are an
//! external contract with the tracing SDKs.

use super::parse_json_if_string;
use agentbench_core::SpanRecord;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// How an attribute key is matched. Keys are compared lowercased.
#[derive(Debug, Clone, Copy)]
pub enum KeyPattern {
    Exact(&'static str),
    Contains(&'static str),
    /// Contains the anchor and at least one of the qualifiers
    ContainsWithAny(&'static str, &'static [&'static str]),
}

impl KeyPattern {
    pub fn matches(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        match self {
            KeyPattern::Exact(k) => key == *k,
            KeyPattern::Contains(k) => key.contains(k),
            KeyPattern::ContainsWithAny(anchor, any) => {
                key.contains(anchor) && any.iter().any(|q| key.contains(q))
            }
        }
    }
}

pub const INPUT_QUALIFIERS: &[&str] = &["input", "params", "arguments", "args", "request", "command"];
pub const OUTPUT_QUALIFIERS: &[&str] = &["output", "result", "response", "return", "stdout"];

pub const TOOL_NAME_KEYS: &[KeyPattern] = &[
    KeyPattern::Exact("gen_ai.tool.name"),
    KeyPattern::Exact("tool.name"),
    KeyPattern::Contains("tool.name"),
];

pub const TOOL_INPUT_KEYS: &[KeyPattern] = &[
    KeyPattern::Exact("gen_ai.tool.input"),
    KeyPattern::Exact("tool.input"),
    KeyPattern::Exact("gen_ai.tool.call.arguments"),
    KeyPattern::ContainsWithAny("tool", INPUT_QUALIFIERS),
    KeyPattern::Exact("input.value"),
    KeyPattern::Exact("input"),
];

pub const TOOL_OUTPUT_KEYS: &[KeyPattern] = &[
    KeyPattern::Exact("gen_ai.tool.output"),
    KeyPattern::Exact("tool.output"),
    KeyPattern::Exact("gen_ai.tool.call.result"),
    KeyPattern::ContainsWithAny("tool", OUTPUT_QUALIFIERS),
    KeyPattern::Exact("output.value"),
    KeyPattern::Exact("output"),
    KeyPattern::Exact("result"),
];

pub const MODEL_NAME_KEYS: &[KeyPattern] = &[
    KeyPattern::Exact("gen_ai.request.model"),
    KeyPattern::Exact("gen_ai.response.model"),
    KeyPattern::Exact("llm.model_name"),
    KeyPattern::Contains("model_name"),
];

pub const AGENT_NAME_KEYS: &[KeyPattern] = &[
    KeyPattern::Exact("gen_ai.agent.name"),
    KeyPattern::Contains("agent.name"),
];

/// Keys that may hold a serialized function list
pub const FUNCTION_KEYWORDS: &[&str] = &["function", "tool", "schema", "available", "definition"];
/// Keys and event names that hint a span carries function information
pub const FUNCTION_HINTS: &[&str] = &["function", "tool", "schema"];
/// Keys that may hold a serialized request body
pub const REQUEST_KEYWORDS: &[&str] = &["request", "body", "payload", "input", "message"];

const INDEXED_FUNCTIONS_PREFIX: &str = "gen_ai.request.functions.";
const EVENT_FUNCTION_KEYWORDS: &[&str] = &["function", "tool", "schema", "available"];
const REQUEST_FUNCTION_FIELDS: &[&str] = &["tools", "function_call", "tool_choice", "available_functions"];
const NESTED_FUNCTION_FIELDS: &[&str] = &[
    "functions",
    "tools",
    "available_functions",
    "tool_schemas",
    "function_definitions",
];
pub const NESTED_SEARCH_DEPTH: usize = 3;

/// Where a function list was found on a span
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionSource {
    IndexedAttributes,
    EmbeddedAttribute,
    EventAttribute,
    RequestBody,
}

/// Read-only view over one span's attributes and events
#[derive(Debug, Clone, Copy)]
pub struct SpanAttributeView<'a> {
    span: &'a SpanRecord,
}

impl<'a> SpanAttributeView<'a> {
    pub fn new(span: &'a SpanRecord) -> Self {
        Self { span }
    }

    pub fn span(&self) -> &'a SpanRecord {
        self.span
    }

    pub fn attributes(&self) -> &'a Map<String, Value> {
        &self.span.attributes
    }

    /// First attribute matching the earliest possible pattern
    pub fn find(&self, patterns: &[KeyPattern]) -> Option<(&'a str, &'a Value)> {
        patterns.iter().find_map(|pattern| {
            self.span
                .attributes
                .iter()
                .find(|(k, v)| pattern.matches(k) && !v.is_null())
                .map(|(k, v)| (k.as_str(), v))
        })
    }

    pub fn has_key(&self, pattern: KeyPattern) -> bool {
        self.span.attributes.keys().any(|k| pattern.matches(k))
    }

    pub fn try_get_tool_name(&self) -> Option<String> {
        self.find(TOOL_NAME_KEYS).map(|(_, v)| value_text(v))
    }

    pub fn try_get_model_name(&self) -> Option<String> {
        self.find(MODEL_NAME_KEYS).map(|(_, v)| value_text(v))
    }

    pub fn try_get_agent_name(&self) -> Option<String> {
        self.find(AGENT_NAME_KEYS).map(|(_, v)| value_text(v))
    }

    pub fn try_get_operation_name(&self) -> Option<String> {
        self.span
            .attr_str("gen_ai.operation.name")
            .map(|s| s.to_lowercase())
    }

    /// Raw tool input, JSON-decoded when it was serialized
    pub fn try_get_tool_input(&self) -> Option<Value> {
        self.find(TOOL_INPUT_KEYS).map(|(_, v)| parse_json_if_string(v))
    }

    /// Raw tool output, JSON-decoded when it was serialized
    pub fn try_get_tool_output(&self) -> Option<Value> {
        self.find(TOOL_OUTPUT_KEYS).map(|(_, v)| parse_json_if_string(v))
    }

    /// Input recorded on a start/begin event
    pub fn try_get_event_input(&self) -> Option<Value> {
        self.span
            .events
            .iter()
            .filter(|e| e.is_start())
            .flat_map(|e| e.attributes.iter())
            .find(|(k, v)| {
                let k = k.to_lowercase();
                !v.is_null() && INPUT_QUALIFIERS.iter().any(|q| k.contains(q))
            })
            .map(|(_, v)| parse_json_if_string(v))
    }

    /// Output recorded on an end/complete/finish event
    pub fn try_get_event_output(&self) -> Option<Value> {
        self.span
            .events
            .iter()
            .filter(|e| !e.is_start() && e.is_end())
            .flat_map(|e| e.attributes.iter())
            .find(|(k, v)| {
                let k = k.to_lowercase();
                !v.is_null() && OUTPUT_QUALIFIERS.iter().any(|q| k.contains(q))
            })
            .map(|(_, v)| parse_json_if_string(v))
    }

    /// Whether attribute keys or events mention functions/tools/schemas
    pub fn has_function_hints(&self) -> bool {
        let hit = |s: &str| {
            let s = s.to_lowercase();
            FUNCTION_HINTS.iter().any(|h| s.contains(h))
        };
        self.span.attributes.keys().any(|k| hit(k))
            || self
                .span
                .events
                .iter()
                .any(|e| hit(&e.name) || e.attributes.keys().any(|k| hit(k)))
    }

    /// The raw function list offered to the model, in order of precedence:
    /// indexed `gen_ai.request.functions.<i>.<field>` keys, embedded JSON
    /// attributes, event attributes, then a bounded search of request bodies.
    pub fn try_get_functions(&self) -> Option<(Value, FunctionSource)> {
        self.indexed_functions()
            .map(|v| (v, FunctionSource::IndexedAttributes))
            .or_else(|| {
                self.embedded_functions()
                    .map(|v| (v, FunctionSource::EmbeddedAttribute))
            })
            .or_else(|| self.event_functions().map(|v| (v, FunctionSource::EventAttribute)))
            .or_else(|| self.request_functions().map(|v| (v, FunctionSource::RequestBody)))
    }

    fn indexed_functions(&self) -> Option<Value> {
        let mut by_index: BTreeMap<u64, Map<String, Value>> = BTreeMap::new();
        for (key, value) in &self.span.attributes {
            if !key.to_lowercase().starts_with(INDEXED_FUNCTIONS_PREFIX) {
                continue;
            }
            let parts: Vec<&str> = key.split('.').collect();
            let Some(index) = parts.get(3).and_then(|p| p.parse::<u64>().ok()) else {
                continue;
            };
            let entry = by_index.entry(index).or_default();
            if parts.len() > 4 {
                entry.insert(parts[4..].join("."), value.clone());
            }
        }

        let functions: Vec<Value> = by_index
            .into_values()
            .filter(|f| f.contains_key("name"))
            .map(Value::Object)
            .collect();
        if functions.is_empty() {
            None
        } else {
            Some(Value::Array(functions))
        }
    }

    fn embedded_functions(&self) -> Option<Value> {
        for (key, value) in &self.span.attributes {
            let key_lower = key.to_lowercase();
            if FUNCTION_KEYWORDS.iter().any(|k| key_lower.contains(k)) {
                let parsed = parse_json_if_string(value);
                if (parsed.is_array() || parsed.is_object()) && is_functions_definition(&parsed) {
                    return Some(parsed);
                }
            }

            let text = value_text(value);
            if text.chars().count() > 50 && (text.contains("\"name\"") || text.contains("\"function\"")) {
                let parsed = parse_json_if_string(value);
                if is_functions_definition(&parsed) {
                    return Some(parsed);
                }
            }
        }
        None
    }

    fn event_functions(&self) -> Option<Value> {
        for event in &self.span.events {
            for (key, value) in &event.attributes {
                let key_lower = key.to_lowercase();
                if EVENT_FUNCTION_KEYWORDS.iter().any(|k| key_lower.contains(k)) {
                    let parsed = parse_json_if_string(value);
                    if is_functions_definition(&parsed) {
                        return Some(parsed);
                    }
                }
                if let Value::String(text) = value {
                    if text.chars().count() > 100
                        && text.contains("\"name\"")
                        && (text.contains("\"function\"") || text.contains("\"parameters\""))
                    {
                        let parsed = parse_json_if_string(value);
                        if is_functions_definition(&parsed) {
                            return Some(parsed);
                        }
                    }
                }
            }
        }
        None
    }

    fn request_functions(&self) -> Option<Value> {
        let candidates = self.span.attributes.iter().filter(|(k, _)| {
            let k = k.to_lowercase();
            REQUEST_KEYWORDS.iter().any(|r| k.contains(r))
        });

        for (_, candidate) in candidates {
            let Value::Object(request) = parse_json_if_string(candidate) else {
                continue;
            };
            if let Some(functions) = request.get("functions") {
                if is_functions_definition(functions) {
                    return Some(functions.clone());
                }
            }
            for field in REQUEST_FUNCTION_FIELDS {
                if let Some(functions) = request.get(*field) {
                    if is_functions_definition(functions) {
                        return Some(functions.clone());
                    }
                }
            }
            if let Some(found) = search_nested_functions(&request, NESTED_SEARCH_DEPTH) {
                return Some(found);
            }
        }
        None
    }
}

/// Bounded-depth search for a function list nested inside a request body
pub fn search_nested_functions(data: &Map<String, Value>, max_depth: usize) -> Option<Value> {
    if max_depth == 0 {
        return None;
    }
    for field in NESTED_FUNCTION_FIELDS {
        if let Some(candidate) = data.get(*field) {
            if is_functions_definition(candidate) {
                return Some(candidate.clone());
            }
        }
    }
    for value in data.values() {
        let found = match value {
            Value::Object(child) => search_nested_functions(child, max_depth - 1),
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_object)
                .find_map(|child| search_nested_functions(child, max_depth - 1)),
            _ => None,
        };
        if found.is_some() {
            return found;
        }
    }
    None
}

const DEFINITION_FIELDS: &[&str] = &["name", "description", "parameters", "function", "type"];
const CONTAINER_FIELDS: &[&str] = &["tools", "functions", "function_call"];

/// Plausibility check for a function list or a single function definition
pub fn is_functions_definition(data: &Value) -> bool {
    match data {
        Value::Array(items) => match items.first() {
            Some(Value::Object(first)) => DEFINITION_FIELDS.iter().any(|f| first.contains_key(*f)),
            _ => false,
        },
        Value::Object(map) => {
            if map.is_empty() {
                return false;
            }
            DEFINITION_FIELDS.iter().any(|f| map.contains_key(*f))
                || CONTAINER_FIELDS
                    .iter()
                    .any(|f| matches!(map.get(*f), Some(Value::Array(_)) | Some(Value::Object(_))))
        }
        _ => false,
    }
}

/// Plain text of a JSON value (strings unquoted)
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentbench_core::SpanEvent;
    use serde_json::json;

    #[test]
    fn test_pattern_precedence() {
        let span = SpanRecord::new("execute_tool x")
            .with_attribute("custom.tool.name", "fallback")
            .with_attribute("gen_ai.tool.name", "get_weather");
        let view = SpanAttributeView::new(&span);
        assert_eq!(view.try_get_tool_name().as_deref(), Some("get_weather"));
    }

    #[test]
    fn test_tool_io_accessors() {
        let span = SpanRecord::new("execute_tool get_weather")
            .with_attribute("gcp.vertex.agent.tool_call_args", r#"{"location": "Beijing"}"#)
            .with_attribute("gcp.vertex.agent.tool_response", r#"{"temp": 21}"#);
        let view = SpanAttributeView::new(&span);
        assert_eq!(view.try_get_tool_input(), Some(json!({"location": "Beijing"})));
        assert_eq!(view.try_get_tool_output(), Some(json!({"temp": 21})));
    }

    #[test]
    fn test_event_accessors() {
        let span = SpanRecord::new("execute_tool a")
            .with_event(SpanEvent::new("tool.start").with_attribute("input", r#"{"q": 1}"#))
            .with_event(SpanEvent::new("tool.end").with_attribute("result", "done"));
        let view = SpanAttributeView::new(&span);
        assert_eq!(view.try_get_event_input(), Some(json!({"q": 1})));
        assert_eq!(view.try_get_event_output(), Some(json!("done")));
    }

    #[test]
    fn test_indexed_functions() {
        let span = SpanRecord::new("call_llm")
            .with_attribute("gen_ai.request.functions.1.name", "send_email")
            .with_attribute("gen_ai.request.functions.0.name", "get_weather")
            .with_attribute("gen_ai.request.functions.0.description", "Weather lookup")
            .with_attribute("gen_ai.request.functions.2.description", "nameless");
        let (functions, source) = SpanAttributeView::new(&span).try_get_functions().unwrap();
        assert_eq!(source, FunctionSource::IndexedAttributes);
        let names: Vec<&str> = functions
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["get_weather", "send_email"]);
    }

    #[test]
    fn test_request_body_nested_search() {
        let body = json!({"config": {"inner": {"tools": [{"name": "lookup", "parameters": {}}]}}});
        let span = SpanRecord::new("call_llm").with_attribute("llm_request", body.to_string());
        let (functions, source) = SpanAttributeView::new(&span).try_get_functions().unwrap();
        assert_eq!(source, FunctionSource::RequestBody);
        assert_eq!(functions[0]["name"], "lookup");
    }

    #[test]
    fn test_is_functions_definition() {
        assert!(is_functions_definition(&json!([{"name": "a"}])));
        assert!(is_functions_definition(&json!({"tools": []})));
        assert!(!is_functions_definition(&json!([1, 2])));
        assert!(!is_functions_definition(&json!({})));
        assert!(!is_functions_definition(&json!("name")));
    }
}
