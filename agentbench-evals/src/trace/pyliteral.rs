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

//! Quasi-JSON coercion for Python-repr payloads
//!
//! Some agent SDKs record tool schemas with `repr()` instead of JSON, e.g.
//! `{'type': <Type.OBJECT: 'OBJECT'>, 'required': ['city'], 'nullable': None}`.
//! This module accepts exactly that literal subset: dicts, lists, quoted
//! strings, numbers, `True`/`False`/`None` and the schema-type enum reprs.
//! Anything else is rejected; nothing is ever evaluated.

use regex::Regex;
use serde_json::{Map, Number, Value};
use std::sync::OnceLock;

fn enum_repr() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<Type\.(STRING|OBJECT|INTEGER|NUMBER|BOOLEAN|ARRAY): '[A-Z]+'>")
            .expect("enum repr pattern is valid")
    })
}

/// Replace schema-type enum reprs with their lowercase quoted names
pub fn substitute_enum_reprs(text: &str) -> String {
    enum_repr()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            format!("'{}'", caps[1].to_lowercase())
        })
        .into_owned()
}

/// Parse a Python-literal string (after enum substitution) into JSON.
/// Returns `None` on anything outside the allow-listed grammar.
pub fn parse_python_literal(text: &str) -> Option<Value> {
    let cleaned = substitute_enum_reprs(text);
    let mut parser = Parser {
        chars: cleaned.chars().collect(),
        pos: 0,
    };
    let value = parser.value(0)?;
    parser.skip_ws();
    if parser.pos == parser.chars.len() {
        Some(value)
    } else {
        None
    }
}

const MAX_DEPTH: usize = 64;

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn value(&mut self, depth: usize) -> Option<Value> {
        if depth > MAX_DEPTH {
            return None;
        }
        self.skip_ws();
        match self.peek()? {
            '{' => self.dict(depth),
            '[' => self.list(depth),
            '\'' | '"' => self.string().map(Value::String),
            c if c == '-' || c.is_ascii_digit() => self.number(),
            c if c.is_ascii_alphabetic() => self.keyword(),
            _ => None,
        }
    }

    fn dict(&mut self, depth: usize) -> Option<Value> {
        self.bump();
        let mut map = Map::new();
        if self.eat('}') {
            return Some(Value::Object(map));
        }
        loop {
            let key = match self.value(depth + 1)? {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => if b { "True" } else { "False" }.to_string(),
                _ => return None,
            };
            if !self.eat(':') {
                return None;
            }
            let value = self.value(depth + 1)?;
            map.insert(key, value);
            if self.eat(',') {
                // trailing comma
                if self.eat('}') {
                    return Some(Value::Object(map));
                }
                continue;
            }
            return if self.eat('}') {
                Some(Value::Object(map))
            } else {
                None
            };
        }
    }

    fn list(&mut self, depth: usize) -> Option<Value> {
        self.bump();
        let mut items = Vec::new();
        if self.eat(']') {
            return Some(Value::Array(items));
        }
        loop {
            items.push(self.value(depth + 1)?);
            if self.eat(',') {
                if self.eat(']') {
                    return Some(Value::Array(items));
                }
                continue;
            }
            return if self.eat(']') {
                Some(Value::Array(items))
            } else {
                None
            };
        }
    }

    fn string(&mut self) -> Option<String> {
        let quote = self.bump()?;
        let mut out = String::new();
        loop {
            match self.bump()? {
                c if c == quote => return Some(out),
                '\\' => match self.bump()? {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    'u' => {
                        let hex: String = (0..4).filter_map(|_| self.bump()).collect();
                        let code = u32::from_str_radix(&hex, 16).ok()?;
                        out.push(char::from_u32(code)?);
                    }
                    other => out.push(other),
                },
                c => out.push(c),
            }
        }
    }

    fn number(&mut self) -> Option<Value> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
        {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if let Ok(i) = text.parse::<i64>() {
            return Some(Value::Number(i.into()));
        }
        let f = text.parse::<f64>().ok()?;
        Number::from_f64(f).map(Value::Number)
    }

    fn keyword(&mut self) -> Option<Value> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        match word.as_str() {
            "True" | "true" => Some(Value::Bool(true)),
            "False" | "false" => Some(Value::Bool(false)),
            "None" | "null" => Some(Value::Null),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_enum_repr_schema() {
        let raw = "{'type': <Type.OBJECT: 'OBJECT'>, 'properties': {'city': {'type': <Type.STRING: 'STRING'>}}, 'required': ['city'], 'nullable': None}";
        let parsed = parse_python_literal(raw).unwrap();
        assert_eq!(
            parsed,
            json!({
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"],
                "nullable": null
            })
        );
    }

    #[test]
    fn test_scalars_and_escapes() {
        assert_eq!(parse_python_literal("[1, -2.5, True, 'it\\'s']").unwrap(), json!([1, -2.5, true, "it's"]));
        assert_eq!(parse_python_literal("{'a': 1,}").unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_rejects_non_literals() {
        assert!(parse_python_literal("__import__('os').system('ls')").is_none());
        assert!(parse_python_literal("{'a': foo}").is_none());
        assert!(parse_python_literal("{'a': 1} trailing").is_none());
        assert!(parse_python_literal("(1, 2)").is_none());
    }
}
