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

//! Span events recorded inside a span's lifecycle
//!
//! Agents emit start/end events on tool spans that sometimes carry the tool
//! input or output when the span attributes do not.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Span event as captured in an execution trace
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SpanEvent {
    /// Event name (e.g., "tool.start", "gen_ai.content.completion")
    pub name: String,

    /// Event attributes, values kept as raw JSON
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl SpanEvent {
    /// Create a new span event without attributes
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Map::new(),
        }
    }

    /// Builder-style attribute insertion
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Whether this event marks the beginning of an operation
    pub fn is_start(&self) -> bool {
        let name = self.name.to_lowercase();
        name.contains("start") || name.contains("begin")
    }

    /// Whether this event marks the end of an operation
    pub fn is_end(&self) -> bool {
        let name = self.name.to_lowercase();
        name.contains("end") || name.contains("complete") || name.contains("finish")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_phase_detection() {
        let start = SpanEvent::new("tool.start").with_attribute("tool.input", "{}");
        assert!(start.is_start());
        assert!(!start.is_end());
        assert_eq!(start.attributes.len(), 1);

        let end = SpanEvent::new("Tool Completed");
        assert!(end.is_end());
        assert!(!end.is_start());
    }
}
