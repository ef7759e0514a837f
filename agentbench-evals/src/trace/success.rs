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

//! Tool execution success determination
//!
//! Negative signals always win over a positive payload: a response can carry
//! data and still report a failure.

use serde_json::Value;

const ERROR_KEYS: &[&str] = &["error", "err", "exception", "traceback", "message"];
const NEGATIVE_TOKENS: &[&str] = &[
    "invalid",
    "not found",
    "permission denied",
    "timeout",
    "error",
    "异常",
    "失败",
];
const NEGATIVE_STATUS: &[&str] = &["error", "failed", "fail", "failure"];
const PAYLOAD_KEYS: &[&str] = &["data", "records", "result", "output", "items", "content"];

/// Decide whether a raw tool output represents a successful execution
pub fn is_tool_execution_success(output: &Value) -> bool {
    if has_negative_signal(output) {
        return false;
    }
    if has_real_payload(output) {
        return true;
    }
    is_truthy(output)
}

/// Failure text carried by an output, if it reports one
pub fn error_message_of(output: &Value) -> Option<String> {
    match output {
        Value::Object(map) => ERROR_KEYS
            .iter()
            .filter_map(|k| map.get(*k))
            .find(|v| is_truthy(v))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .or_else(|| Some(output.to_string())),
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn has_negative_signal(output: &Value) -> bool {
    match output {
        Value::Object(map) => {
            if ERROR_KEYS.iter().any(|k| map.get(*k).map(is_truthy).unwrap_or(false)) {
                return true;
            }
            if let Some(Value::String(status)) = map.get("status") {
                if NEGATIVE_STATUS.contains(&status.trim().to_lowercase().as_str()) {
                    return true;
                }
            }
            match map.get("isError") {
                Some(Value::Bool(true)) => return true,
                Some(Value::Bool(false)) => return false,
                _ => {}
            }
            if matches!(map.get("success"), Some(Value::Bool(false))) {
                return true;
            }
            contains_negative_token(&output.to_string())
        }
        Value::Array(items) => {
            let text = items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(" ");
            contains_negative_token(&text)
        }
        Value::String(text) => contains_negative_token(text),
        _ => false,
    }
}

fn contains_negative_token(text: &str) -> bool {
    let lowered = text.to_lowercase();
    NEGATIVE_TOKENS.iter().any(|t| lowered.contains(t))
}

fn has_real_payload(output: &Value) -> bool {
    match output {
        Value::Object(map) => {
            let keyed = PAYLOAD_KEYS.iter().filter_map(|k| map.get(*k)).collect::<Vec<_>>();
            if keyed.is_empty() {
                !map.is_empty()
            } else {
                keyed.into_iter().any(is_truthy)
            }
        }
        Value::Array(items) => !items.is_empty(),
        Value::String(s) => !s.trim().is_empty(),
        _ => false,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(m) => !m.is_empty(),
    }
}
