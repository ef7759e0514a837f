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

//! Tool call records: what the agent actually invoked, what a correct run
//! should have invoked, and what the model was offered.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_SERVER: &str = "default";

fn default_server() -> String {
    DEFAULT_SERVER.to_string()
}

/// One actual tool invocation reconstructed from a trace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRecord {
    pub name: String,
    #[serde(default)]
    pub input_parameters: Map<String, Value>,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub success: bool,
    #[serde(default = "default_server")]
    pub server: String,
    /// Seconds
    #[serde(default)]
    pub execution_time: Option<f64>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// 1-based, ascending by span timestamp
    #[serde(default)]
    pub execution_order: u32,
}

impl ToolCallRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_parameters: Map::new(),
            output: Value::Null,
            success: false,
            server: default_server(),
            execution_time: None,
            error_message: None,
            execution_order: 0,
        }
    }

    pub fn with_parameters(mut self, params: Map<String, Value>) -> Self {
        self.input_parameters = params;
        self
    }

    pub fn with_output(mut self, output: Value, success: bool) -> Self {
        self.output = output;
        self.success = success;
        self
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = server.into();
        self
    }
}

/// Ground-truth tool invocation parsed from a test annotation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallExpected {
    pub name: String,
    #[serde(default)]
    pub input_parameters: Map<String, Value>,
    #[serde(default)]
    pub description: Option<String>,
    /// Raw expected-output text, never parsed further
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default)]
    pub extraction_hint: Option<String>,
}

impl ToolCallExpected {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_parameters: Map::new(),
            description: None,
            output: None,
            server: default_server(),
            extraction_hint: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.input_parameters.insert(key.into(), value.into());
        self
    }
}

/// A tool offered to the model at invocation time
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AvailableTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the tool's parameters
    #[serde(default, alias = "parameters")]
    pub input_schema: Value,
    #[serde(default)]
    pub server: Option<String>,
}

impl AvailableTool {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            server: None,
        }
    }

    /// Whether a usable parameter schema was recovered
    pub fn has_schema(&self) -> bool {
        match &self.input_schema {
            Value::Object(map) => !map.is_empty(),
            _ => false,
        }
    }
}
