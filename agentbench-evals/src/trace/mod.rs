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

//! Trace analysis
//!
//! raw trace → [`SpanExtractor`] → [`SpanClassifier`] →
//! {[`ToolCallReconstructor`], [`FunctionSchemaRecoverer`]}
//!
//! Everything here is synchronous and never fails: unrecognized input
//! produces empty or partial results.

pub mod analytics;
pub mod attributes;
pub mod classifier;
pub mod extractor;
pub mod pyliteral;
pub mod reconstructor;
pub mod schema;
pub mod success;

pub use analytics::{
    analyze_tool_usage_summary, context_from_trace, debug_functions_extraction, DurationStats,
    FunctionsDebugReport, PerformanceSummary, ToolUsageSummary,
};
pub use attributes::{FunctionSource, KeyPattern, SpanAttributeView};
pub use classifier::{SpanClassifier, SpanKind, MERGED_TOOLS_SPAN};
pub use extractor::SpanExtractor;
pub use reconstructor::{normalize_tool_name, ToolCallReconstructor};
pub use schema::{parse_functions_details, FunctionSchemaRecoverer, SchemaIndex, SchemaSource, ToolUniverse};
pub use success::is_tool_execution_success;

use serde_json::Value;

/// Decode a JSON string value; anything else (or invalid JSON) is returned as is
pub fn parse_json_if_string(value: &Value) -> Value {
    match value {
        Value::String(text) => {
            let trimmed = text.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                serde_json::from_str(text).unwrap_or_else(|_| value.clone())
            } else {
                value.clone()
            }
        }
        other => other.clone(),
    }
}
