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

//! Dataset rows
//!
//! A dataset is a JSONL file or a JSON array of objects. Column names vary
//! between datasets, so each field is looked up through a list of aliases.
//! Input and expected output fall back to the first and second non-index
//! columns.

use crate::expected::ExpectedCallParser;
use crate::trace::{parse_functions_details, parse_json_if_string, ToolUniverse};
use crate::trace::attributes::value_text;
use agentbench_core::ToolCallExpected;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

const INPUT_KEYS: &[&str] = &["input", "Input", "INPUT", "prompt", "Prompt", "PROMPT"];
const EXPECTED_OUTPUT_KEYS: &[&str] = &[
    "expect",
    "Expect",
    "EXPECTED",
    "expected",
    "expectation",
    "Expectation",
    "expect_output",
    "expected_output",
    "answer",
    "output",
];
const TOOL_CALL_KEYS: &[&str] = &[
    "expect_tools_calls",
    "expected_tools_calls",
    "expected_tool_calls",
    "tool_calls",
    "ToolCalls",
];
const TOOL_RESULT_KEYS: &[&str] = &["expect_tools_result", "expected_tools_result"];
const AVAILABLE_TOOL_KEYS: &[&str] = &["available_tools", "avalible_tools"];
const INPUT_LIST_KEYS: &[&str] = &["input_list"];
const TRACE_FILE_KEYS: &[&str] = &["trace_file", "trace_id"];
const ACTUAL_OUTPUT_KEYS: &[&str] = &["actual_output", "response"];
const INDEX_KEYS: &[&str] = &["index", "Index", "INDEX", "序号", "id", "ID"];

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Dataset IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dataset JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Row {0} has no input column")]
    MissingInput(usize),
}

/// One test case
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetRow {
    /// Position in the dataset, 0-based
    pub index: usize,
    pub id: Option<String>,
    pub input: String,
    pub expected_output: Option<String>,
    pub expected_tool_calls: Option<String>,
    pub expected_tool_results: Option<String>,
    pub available_tools: Option<Value>,
    pub input_list: Vec<String>,
    pub trace_file: Option<String>,
    pub actual_output: Option<String>,
}

fn lookup<'a>(row: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| row.get(*k))
        .find(|v| !v.is_null())
}

fn text(value: &Value) -> Option<String> {
    let text = value_text(value);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl DatasetRow {
    /// Map one raw row onto the column contract
    pub fn from_object(index: usize, row: &Map<String, Value>) -> Result<Self, DatasetError> {
        let positional: Vec<&Value> = row
            .iter()
            .filter(|(k, _)| !INDEX_KEYS.contains(&k.as_str()))
            .map(|(_, v)| v)
            .collect();

        let input = lookup(row, INPUT_KEYS)
            .or_else(|| positional.first().copied())
            .and_then(text)
            .ok_or(DatasetError::MissingInput(index))?;

        let expected_output = match lookup(row, EXPECTED_OUTPUT_KEYS) {
            Some(value) => text(value),
            None => positional.get(1).and_then(|v| text(v)),
        };

        let input_list = match lookup(row, INPUT_LIST_KEYS).map(parse_json_if_string) {
            Some(Value::Array(items)) => items.iter().filter_map(text).collect(),
            Some(other) => text(&other).into_iter().collect(),
            None => Vec::new(),
        };

        Ok(Self {
            index,
            id: lookup(row, INDEX_KEYS).and_then(text),
            input,
            expected_output,
            expected_tool_calls: lookup(row, TOOL_CALL_KEYS).and_then(text),
            expected_tool_results: lookup(row, TOOL_RESULT_KEYS).and_then(text),
            available_tools: lookup(row, AVAILABLE_TOOL_KEYS).cloned(),
            input_list,
            trace_file: lookup(row, TRACE_FILE_KEYS).and_then(text),
            actual_output: lookup(row, ACTUAL_OUTPUT_KEYS).and_then(text),
        })
    }

    /// Stable unit id: the row's own id column, else its position
    pub fn unit_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| format!("row-{}", self.index))
    }

    pub fn expected_tools(&self) -> Vec<ToolCallExpected> {
        match &self.expected_tool_calls {
            Some(calls) => ExpectedCallParser::new().parse(calls, self.expected_tool_results.as_deref()),
            None => Vec::new(),
        }
    }

    /// Tools declared by the dataset itself, keyed by name
    pub fn declared_tools(&self) -> ToolUniverse {
        self.available_tools
            .as_ref()
            .map(parse_functions_details)
            .unwrap_or_default()
            .into_iter()
            .map(|tool| (tool.name.clone(), tool))
            .collect()
    }
}

/// Parse dataset text: a JSON array of objects, or one object per line
pub fn parse_rows(content: &str) -> Result<Vec<DatasetRow>, DatasetError> {
    let trimmed = content.trim_start();
    let objects: Vec<Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?
    };

    let rows = objects
        .iter()
        .enumerate()
        .map(|(index, value)| match value {
            Value::Object(map) => DatasetRow::from_object(index, map),
            _ => Err(DatasetError::MissingInput(index)),
        })
        .collect::<Result<Vec<_>, _>>()?;
    debug!("Parsed {} dataset rows", rows.len());
    Ok(rows)
}

pub fn load_rows(path: &Path) -> Result<Vec<DatasetRow>, DatasetError> {
    let content = std::fs::read_to_string(path)?;
    parse_rows(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_aliases() {
        let row = DatasetRow::from_object(
            0,
            &object(json!({
                "Prompt": "What is the weather in Beijing?",
                "answer": "Sunny",
                "expected_tool_calls": "1. get_weather: location=\"Beijing\"",
                "avalible_tools": [{"name": "get_weather", "description": "Weather"}],
                "trace_id": "traces/t1.json"
            })),
        )
        .unwrap();

        assert_eq!(row.input, "What is the weather in Beijing?");
        assert_eq!(row.expected_output.as_deref(), Some("Sunny"));
        assert_eq!(row.trace_file.as_deref(), Some("traces/t1.json"));

        let expected = row.expected_tools();
        assert_eq!(expected.len(), 1);
        assert_eq!(expected[0].name, "get_weather");
        assert!(row.declared_tools().contains_key("get_weather"));
    }

    #[test]
    fn test_positional_fallback_skips_index() {
        let row = DatasetRow::from_object(
            3,
            &object(json!({"序号": 7, "question": "q", "gold": "a"})),
        )
        .unwrap();
        assert_eq!(row.input, "q");
        assert_eq!(row.expected_output.as_deref(), Some("a"));
        assert_eq!(row.unit_id(), "7");
    }

    #[test]
    fn test_missing_input() {
        let err = DatasetRow::from_object(2, &object(json!({"id": 1}))).unwrap_err();
        assert!(matches!(err, DatasetError::MissingInput(2)));
    }

    #[test]
    fn test_jsonl_and_array() {
        let jsonl = "{\"input\": \"a\"}\n\n{\"input\": \"b\", \"input_list\": [\"x\", \"y\"]}\n";
        let rows = parse_rows(jsonl).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].input_list, vec!["x", "y"]);
        assert_eq!(rows[1].unit_id(), "row-1");

        let array = r#"[{"input": "a", "expected": "b"}]"#;
        let rows = parse_rows(array).unwrap();
        assert_eq!(rows[0].expected_output.as_deref(), Some("b"));

        assert!(parse_rows("{not json").is_err());
    }
}
