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

//! Expected tool-call annotations
//!
//! Line grammar, one call per line:
//!
//! ```text
//! [N. ]<[server.]tool>(：|:) [key="value"[，, ]...] [free text] [（提取 "hint"）]
//! ```
//!
//! Free text becomes the call's description when key-value parameters are
//! present, and a synthetic `query` parameter otherwise. Lines without a
//! colon are skipped.

use agentbench_core::{ToolCallExpected, DEFAULT_SERVER};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::debug;

const QUERY_PARAM: &str = "query";
const LEFTOVER_TRIM: &[char] = &[' ', '，', ',', ';'];

fn ordinal() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*\d+\.\s*").expect("ordinal pattern is valid"))
}

fn key_value() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(\w+)\s*=\s*"([^"]*)""#).expect("key-value pattern is valid"))
}

fn extraction_hint() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"（\s*提取\s*["']?([^"'）]+)["']?\s*）"#).expect("hint pattern is valid")
    })
}

fn normalize_quotes(text: &str) -> String {
    text.replace(['“', '”'], "\"").replace(['‘', '’'], "'")
}

/// Split on the first full-width colon, else the first ASCII colon
fn split_colon(line: &str) -> Option<(&str, &str)> {
    line.split_once('：').or_else(|| line.split_once(':'))
}

/// Expected-output text keyed by line ordinal and by tool name
#[derive(Debug, Clone, Default)]
pub struct ExpectedOutputs {
    by_index: HashMap<usize, String>,
    by_name: HashMap<String, String>,
}

impl ExpectedOutputs {
    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty() && self.by_name.is_empty()
    }

    /// Lookup by 1-based position first, then by tool name
    pub fn lookup(&self, index: usize, names: &[&str]) -> Option<&str> {
        self.by_index
            .get(&index)
            .or_else(|| names.iter().find_map(|n| self.by_name.get(*n)))
            .map(String::as_str)
    }
}

/// Parser for free-text expected tool calls
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpectedCallParser;

impl ExpectedCallParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse calls and attach expected outputs by index, then by name
    pub fn parse(&self, calls_text: &str, outputs_text: Option<&str>) -> Vec<ToolCallExpected> {
        let mut calls = self.parse_calls(calls_text);
        let outputs = outputs_text.map(|t| self.parse_outputs(t)).unwrap_or_default();
        if outputs.is_empty() {
            return calls;
        }
        for (i, call) in calls.iter_mut().enumerate() {
            let qualified = qualified_name(call);
            let names = [qualified.as_str(), call.name.as_str()];
            if let Some(output) = outputs.lookup(i + 1, &names) {
                call.output = Some(output.to_string());
            }
        }
        calls
    }

    pub fn parse_calls(&self, text: &str) -> Vec<ToolCallExpected> {
        if let Some(calls) = parse_json_calls(text) {
            return calls;
        }
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .filter_map(|l| self.parse_line(l))
            .collect()
    }

    /// One annotation line; `None` when it has no colon or no tool name
    pub fn parse_line(&self, raw: &str) -> Option<ToolCallExpected> {
        let normalized = normalize_quotes(raw);
        let line = ordinal().replace(&normalized, "");
        let Some((name_part, rest)) = split_colon(&line) else {
            debug!("Skipping expected-call line without a colon: {}", raw);
            return None;
        };

        let (server, name) = match name_part.trim().split_once('.') {
            Some((server, tool)) if !server.trim().is_empty() && !tool.trim().is_empty() => {
                (server.trim().to_string(), tool.trim().to_string())
            }
            _ => (DEFAULT_SERVER.to_string(), name_part.trim().to_string()),
        };
        if name.is_empty() {
            return None;
        }

        let mut rest = rest.trim().to_string();
        let hint = extraction_hint()
            .captures(&rest)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string());
        if hint.is_some() {
            rest = extraction_hint().replace_all(&rest, "").trim().to_string();
        }

        let mut parameters = Map::new();
        for caps in key_value().captures_iter(&rest) {
            parameters.insert(caps[1].to_string(), Value::String(caps[2].to_string()));
        }
        let leftover = key_value().replace_all(&rest, "");
        let leftover = leftover.trim_matches(LEFTOVER_TRIM);

        let mut description = None;
        if !leftover.is_empty() {
            if parameters.is_empty() {
                parameters.insert(QUERY_PARAM.to_string(), Value::String(leftover.to_string()));
            } else {
                description = Some(leftover.to_string());
            }
        }

        Some(ToolCallExpected {
            name,
            input_parameters: parameters,
            description,
            output: None,
            server,
            extraction_hint: hint,
        })
    }

    pub fn parse_outputs(&self, text: &str) -> ExpectedOutputs {
        let mut outputs = ExpectedOutputs::default();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (index, rest) = split_ordinal(line);
            let (name, body) = split_colon(rest).unwrap_or((rest, ""));
            let (name, body) = (name.trim(), body.trim());
            if let Some(index) = index {
                outputs.by_index.insert(index, body.to_string());
            }
            if !name.is_empty() {
                outputs.by_name.insert(name.to_string(), body.to_string());
            }
        }
        outputs
    }

    /// Render a call back to the line grammar
    pub fn render_line(&self, index: usize, call: &ToolCallExpected) -> String {
        let params = call
            .input_parameters
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{}=\"{}\"", k, s),
                other => format!("{}=\"{}\"", k, other),
            })
            .collect::<Vec<_>>()
            .join(", ");
        let mut line = format!("{}. {}: {}", index, qualified_name(call), params);
        if let Some(hint) = &call.extraction_hint {
            line.push_str(&format!("（提取 \"{}\"）", hint));
        }
        line
    }

    pub fn render(&self, calls: &[ToolCallExpected]) -> String {
        calls
            .iter()
            .enumerate()
            .map(|(i, c)| self.render_line(i + 1, c))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn qualified_name(call: &ToolCallExpected) -> String {
    if call.server.is_empty() || call.server == DEFAULT_SERVER {
        call.name.clone()
    } else {
        format!("{}.{}", call.server, call.name)
    }
}

/// Leading `N. ` or `N.` ordinal
fn split_ordinal(line: &str) -> (Option<usize>, &str) {
    match line.split_once('.') {
        Some((num, rest)) if !num.is_empty() && num.trim().chars().all(|c| c.is_ascii_digit()) => {
            (num.trim().parse().ok(), rest.trim_start())
        }
        _ => (None, line),
    }
}

/// Calls given as a JSON array of `{name|tool_name, parameters|input_parameters}`
fn parse_json_calls(text: &str) -> Option<Vec<ToolCallExpected>> {
    if !text.trim_start().starts_with('[') {
        return None;
    }
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text) else {
        return None;
    };
    let calls = items
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|item| {
            let name = item
                .get("name")
                .or_else(|| item.get("tool_name"))
                .and_then(Value::as_str)?;
            let mut call = ToolCallExpected::new(name);
            if let Some(Value::Object(params)) =
                item.get("input_parameters").or_else(|| item.get("parameters"))
            {
                call.input_parameters = params.clone();
            }
            call.description = item
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(server) = item.get("server").and_then(Value::as_str) {
                call.server = server.to_string();
            }
            Some(call)
        })
        .collect();
    Some(calls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CALLS: &str = "1. vesearch：2023 年 4 月，查公司名称、股票代码\n\
2. stock_zh_a_hist：symbol=“601360”，period=\"daily\"，adjust=\"\"\n\
3. stock_individual_info_em：symbol=\"601360\"（提取 “行业”）\n\
just prose without separator\n";

    #[test]
    fn test_parse_lines() {
        let calls = ExpectedCallParser::new().parse_calls(CALLS);
        assert_eq!(calls.len(), 3);

        assert_eq!(calls[0].name, "vesearch");
        assert_eq!(calls[0].input_parameters["query"], "2023 年 4 月，查公司名称、股票代码");

        assert_eq!(calls[1].input_parameters["symbol"], "601360");
        assert_eq!(calls[1].input_parameters["adjust"], "");
        assert_eq!(calls[1].description, None);

        assert_eq!(calls[2].extraction_hint.as_deref(), Some("行业"));
        assert_eq!(calls[2].server, DEFAULT_SERVER);
    }

    #[test]
    fn test_description_with_params() {
        let call = ExpectedCallParser::new()
            .parse_line("get_weather: city=\"Beijing\", for tomorrow")
            .unwrap();
        assert_eq!(call.input_parameters["city"], "Beijing");
        assert_eq!(call.description.as_deref(), Some("for tomorrow"));
    }

    #[test]
    fn test_server_prefix() {
        let call = ExpectedCallParser::new()
            .parse_line("2. filesystem.read_file: path=\"/tmp/a\"")
            .unwrap();
        assert_eq!(call.server, "filesystem");
        assert_eq!(call.name, "read_file");
    }

    #[test]
    fn test_merge_outputs_by_index_then_name() {
        let parser = ExpectedCallParser::new();
        let outputs = "1. get_weather: sunny\nsend_email: sent";
        let calls = parser.parse(
            "1. get_weather: location=\"Beijing\"\n2. send_email: to=\"a@b.c\"\n3. other: x=\"1\"",
            Some(outputs),
        );
        assert_eq!(calls[0].output.as_deref(), Some("sunny"));
        assert_eq!(calls[1].output.as_deref(), Some("sent"));
        assert_eq!(calls[2].output, None);
    }

    #[test]
    fn test_ordinal_without_space() {
        let outputs = ExpectedCallParser::new().parse_outputs("2.lookup：[{'a': 1}]");
        assert_eq!(outputs.lookup(2, &[]), Some("[{'a': 1}]"));
        assert_eq!(outputs.lookup(9, &["lookup"]), Some("[{'a': 1}]"));
    }

    #[test]
    fn test_render_round_trip() {
        let parser = ExpectedCallParser::new();
        let text = "1. get_weather: location=\"Beijing\", unit=\"c\"\n2. mail.send_email: to=\"x\"";
        let calls = parser.parse_calls(text);
        let reparsed = parser.parse_calls(&parser.render(&calls));
        let triples = |c: &[ToolCallExpected]| {
            c.iter()
                .map(|c| (c.name.clone(), c.input_parameters.clone(), c.server.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(triples(&calls), triples(&reparsed));
    }

    #[test]
    fn test_json_calls() {
        let text = json!([{"tool_name": "get_weather", "parameters": {"location": "Beijing"}}]).to_string();
        let calls = ExpectedCallParser::new().parse_calls(&text);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].input_parameters["location"], "Beijing");
    }
}
