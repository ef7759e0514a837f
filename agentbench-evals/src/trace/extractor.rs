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

//! Span extraction from raw trace JSON
//!
//! Accepted shapes:
//!
//! - a single span object
//! - a list of span objects (lists may nest, one list per turn)
//! - an OTLP export `{resourceSpans: [{scopeSpans: [{spans: [...]}]}]}`
//! - `{spans: [...]}` and `{trace_data: [...]}` wrappers
//!
//! Output keeps discovery order. Timestamps are not normalized. An
//! unrecognized shape yields an empty list, never an error.

use agentbench_core::{SpanEvent, SpanRecord};
use serde_json::{Map, Value};
use tracing::debug;

const MAX_NESTING: usize = 4;

const START_KEYS: &[&str] = &["startTimeUnixNano", "start_time", "startTime"];
const END_KEYS: &[&str] = &["endTimeUnixNano", "end_time", "endTime"];
const SPAN_ID_KEYS: &[&str] = &["spanId", "span_id"];
const TRACE_ID_KEYS: &[&str] = &["traceId", "trace_id"];
const PARENT_KEYS: &[&str] = &["parentSpanId", "parent_span_id", "parent_id"];

/// Flattens raw trace payloads into [`SpanRecord`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct SpanExtractor;

impl SpanExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract spans from a parsed trace
    pub fn extract(&self, raw: &Value) -> Vec<SpanRecord> {
        let mut spans = Vec::new();
        collect(raw, &mut spans, 0);
        debug!("Extracted {} spans from trace", spans.len());
        spans
    }

    /// Extract spans from trace text; malformed JSON yields no spans
    pub fn extract_str(&self, raw: &str) -> Vec<SpanRecord> {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.extract(&value),
            Err(e) => {
                debug!("Trace text is not JSON: {}", e);
                Vec::new()
            }
        }
    }

    /// Extract one span sequence per turn.
    ///
    /// A top-level list whose elements are themselves containers is treated
    /// as a per-turn list; anything else is one turn.
    pub fn extract_turns(&self, raw: &Value) -> Vec<Vec<SpanRecord>> {
        match raw {
            Value::Array(items) if !items.is_empty() && items.iter().all(is_container) => items
                .iter()
                .map(|turn| self.extract(turn))
                .filter(|spans| !spans.is_empty())
                .collect(),
            other => {
                let spans = self.extract(other);
                if spans.is_empty() {
                    Vec::new()
                } else {
                    vec![spans]
                }
            }
        }
    }
}

fn is_container(value: &Value) -> bool {
    match value {
        Value::Array(_) => true,
        Value::Object(map) => {
            map.contains_key("resourceSpans")
                || matches!(map.get("spans"), Some(Value::Array(_)))
                || matches!(map.get("trace_data"), Some(Value::Array(_)))
        }
        _ => false,
    }
}

fn collect(raw: &Value, out: &mut Vec<SpanRecord>, depth: usize) {
    if depth > MAX_NESTING {
        return;
    }
    match raw {
        Value::Array(items) => {
            for item in items {
                collect(item, out, depth + 1);
            }
        }
        Value::Object(map) => {
            if let Some(Value::Array(resource_spans)) = map.get("resourceSpans") {
                for resource in resource_spans {
                    let scopes = resource
                        .get("scopeSpans")
                        .or_else(|| resource.get("instrumentationLibrarySpans"));
                    for scope in scopes.and_then(Value::as_array).into_iter().flatten() {
                        if let Some(Value::Array(spans)) = scope.get("spans") {
                            out.extend(spans.iter().filter_map(parse_span));
                        }
                    }
                }
            } else if let Some(Value::Array(turns)) = map.get("trace_data") {
                for turn in turns {
                    collect(turn, out, depth + 1);
                }
            } else if let Some(spans @ Value::Array(_)) = map.get("spans") {
                collect(spans, out, depth + 1);
            } else if let Some(span) = parse_span(raw) {
                out.push(span);
            }
        }
        Value::String(text) => {
            // traces are sometimes stored pre-serialized
            if let Ok(inner) = serde_json::from_str::<Value>(text) {
                if inner.is_object() || inner.is_array() {
                    collect(&inner, out, depth + 1);
                }
            }
        }
        _ => {}
    }
}

/// Parse one span object; objects that carry neither a name nor attributes are skipped
pub fn parse_span(raw: &Value) -> Option<SpanRecord> {
    let map = raw.as_object()?;
    let name = map.get("name").and_then(Value::as_str);
    let attributes = map.get("attributes").map(normalize_attributes);
    if name.is_none() && attributes.is_none() {
        return None;
    }

    let events = map
        .get("events")
        .and_then(Value::as_array)
        .map(|events| events.iter().filter_map(parse_event).collect())
        .unwrap_or_default();

    Some(SpanRecord {
        name: name.unwrap_or_default().to_string(),
        start_time: first_of(map, START_KEYS).and_then(parse_timestamp),
        end_time: first_of(map, END_KEYS).and_then(parse_timestamp),
        span_id: first_of(map, SPAN_ID_KEYS).and_then(id_string),
        trace_id: first_of(map, TRACE_ID_KEYS).and_then(id_string),
        parent_span_id: first_of(map, PARENT_KEYS).and_then(id_string),
        attributes: attributes.unwrap_or_default(),
        events,
    })
}

fn parse_event(raw: &Value) -> Option<SpanEvent> {
    let map = raw.as_object()?;
    Some(SpanEvent {
        name: map
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        attributes: map
            .get("attributes")
            .map(normalize_attributes)
            .unwrap_or_default(),
    })
}

fn first_of<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| map.get(*k))
        .find(|v| !v.is_null())
}

/// Integer timestamp from a number or numeric string
pub fn parse_timestamp(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| f as u64)
            })
        }
        _ => None,
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Attributes as a flat map; OTLP `[{key, value: {stringValue: ..}}]` arrays are flattened
pub fn normalize_attributes(raw: &Value) -> Map<String, Value> {
    match raw {
        Value::Object(map) => map.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let key = item.get("key")?.as_str()?;
                let value = item.get("value").map(otlp_any_value).unwrap_or(Value::Null);
                Some((key.to_string(), value))
            })
            .collect(),
        _ => Map::new(),
    }
}

fn otlp_any_value(raw: &Value) -> Value {
    let Some(map) = raw.as_object() else {
        return raw.clone();
    };
    if let Some(v) = map.get("stringValue") {
        return v.clone();
    }
    if let Some(v) = map.get("boolValue") {
        return v.clone();
    }
    if let Some(v) = map.get("intValue") {
        // int64 is serialized as a string in OTLP JSON
        return match v {
            Value::String(s) => s
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| v.clone()),
            other => other.clone(),
        };
    }
    if let Some(v) = map.get("doubleValue") {
        return v.clone();
    }
    if let Some(values) = map
        .get("arrayValue")
        .and_then(|a| a.get("values"))
        .and_then(Value::as_array)
    {
        return Value::Array(values.iter().map(otlp_any_value).collect());
    }
    if let Some(values) = map.get("kvlistValue") {
        if let Some(inner) = values.get("values") {
            return Value::Object(normalize_attributes(inner));
        }
    }
    raw.clone()
}
