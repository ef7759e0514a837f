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

//! Tool selection and execution accuracy
//!
//! Every rate here is `None` when its denominator is zero, so "no data"
//! stays distinguishable from "everything failed".

use crate::{BaseMetric, EvalError, MetricMetadata, Scorable};
use agentbench_core::{AvailableTool, EvaluationUnit, ToolCallRecord, Verdict};
use async_trait::async_trait;
use dashmap::DashMap;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Compiled input-schema validators keyed by schema text
#[derive(Default)]
pub struct SchemaValidatorCache {
    validators: DashMap<String, Option<JSONSchema>>,
}

impl SchemaValidatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `parameters` satisfy the tool's declared schema.
    ///
    /// Tools without a schema accept anything; a schema that fails to
    /// compile rejects everything.
    pub fn is_compliant(&self, tool: &AvailableTool, parameters: &Map<String, Value>) -> bool {
        if !tool.has_schema() {
            return true;
        }
        let key = tool.input_schema.to_string();
        let entry = self.validators.entry(key).or_insert_with(|| {
            JSONSchema::options()
                .compile(&tool.input_schema)
                .map_err(|e| debug!("Schema for tool {} does not compile: {}", tool.name, e))
                .ok()
        });
        match entry.value() {
            Some(validator) => validator.is_valid(&Value::Object(parameters.clone())),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

/// The four tool-level rates for one unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolAccuracyReport {
    /// Valid-name calls whose parameters validate, over valid-name calls
    pub input_schema_compliance: Option<f64>,
    /// Calls naming an available tool, over all calls
    pub valid_tool_name_rate: Option<f64>,
    /// Successful calls, over all calls
    pub execution_success_rate: Option<f64>,
    /// Failed valid-name calls, over valid-name calls
    pub valid_call_failure_rate: Option<f64>,
}

fn ratio(numerator: usize, denominator: usize) -> Option<f64> {
    if denominator == 0 {
        None
    } else {
        Some(numerator as f64 / denominator as f64)
    }
}

impl ToolAccuracyReport {
    pub fn compute(
        calls: &[ToolCallRecord],
        available: &BTreeMap<String, AvailableTool>,
        validators: &SchemaValidatorCache,
    ) -> Self {
        let mut valid = 0usize;
        let mut compliant = 0usize;
        let mut successful = 0usize;
        let mut valid_failures = 0usize;

        for call in calls {
            if let Some(tool) = available.get(&call.name) {
                valid += 1;
                if validators.is_compliant(tool, &call.input_parameters) {
                    compliant += 1;
                }
                if !call.success {
                    valid_failures += 1;
                }
            }
            if call.success {
                successful += 1;
            }
        }

        Self {
            input_schema_compliance: ratio(compliant, valid),
            valid_tool_name_rate: ratio(valid, calls.len()),
            execution_success_rate: ratio(successful, calls.len()),
            valid_call_failure_rate: ratio(valid_failures, valid),
        }
    }

    /// Mean of the defined rates, with the failure rate inverted
    pub fn tool_score(&self) -> Option<f64> {
        let parts: Vec<f64> = [
            self.input_schema_compliance,
            self.valid_tool_name_rate,
            self.execution_success_rate,
            self.valid_call_failure_rate.map(|r| 1.0 - r),
        ]
        .into_iter()
        .flatten()
        .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.iter().sum::<f64>() / parts.len() as f64)
        }
    }

    /// Defined rates keyed by name
    pub fn breakdown(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        let entries = [
            ("input_schema_compliance", self.input_schema_compliance),
            ("valid_tool_name_rate", self.valid_tool_name_rate),
            ("execution_success_rate", self.execution_success_rate),
            ("valid_call_failure_rate", self.valid_call_failure_rate),
        ];
        for (key, value) in entries {
            if let Some(v) = value {
                out.insert(key.to_string(), v);
            }
        }
        out
    }
}

fn percent(rate: Option<f64>) -> String {
    rate.map(|r| format!("{:.1}%", r * 100.0))
        .unwrap_or_else(|| "n/a".to_string())
}

/// Scores a unit by its tool-level rates alone
pub struct ToolAccuracyMetric {
    base: BaseMetric,
    validators: SchemaValidatorCache,
}

impl ToolAccuracyMetric {
    pub const DEFAULT_THRESHOLD: f64 = 0.7;

    pub fn new(base: BaseMetric) -> Self {
        Self {
            base,
            validators: SchemaValidatorCache::new(),
        }
    }

    pub fn report(&self, unit: &EvaluationUnit) -> ToolAccuracyReport {
        ToolAccuracyReport::compute(&unit.tools_called, &unit.available_tools, &self.validators)
    }
}

impl Default for ToolAccuracyMetric {
    fn default() -> Self {
        Self::new(BaseMetric::new(Self::DEFAULT_THRESHOLD))
    }
}

#[async_trait]
impl Scorable for ToolAccuracyMetric {
    fn id(&self) -> &str {
        "tool_accuracy"
    }

    async fn measure(&self, unit: &EvaluationUnit) -> Result<Verdict, EvalError> {
        let report = self.report(unit);
        let score = report.tool_score().unwrap_or(0.0);
        let calls = unit.tools_called.len();
        let low_confidence = unit.available_tools_low_confidence;

        let verdict = self.base.verdict(self.id(), score, |s| {
            if calls == 0 {
                return "No tool calls to evaluate.".to_string();
            }
            let mut reason = format!(
                "Tool accuracy {:.3} over {} call(s): valid names {}, schema compliance {}, execution success {}, valid-call failures {}.",
                s,
                calls,
                percent(report.valid_tool_name_rate),
                percent(report.input_schema_compliance),
                percent(report.execution_success_rate),
                percent(report.valid_call_failure_rate),
            );
            if low_confidence {
                reason.push_str(" Available tools were borrowed from another trace.");
            }
            reason
        });
        Ok(verdict.with_breakdown(report.breakdown()))
    }

    fn base(&self) -> &BaseMetric {
        &self.base
    }

    fn metadata(&self) -> MetricMetadata {
        MetricMetadata {
            name: "Tool Accuracy".to_string(),
            version: "1.0.0".to_string(),
            description: "Valid tool names, schema compliance and execution success".to_string(),
            cost_per_eval: Some(0.0),
            avg_latency_ms: Some(1),
            tags: vec!["tools".to_string(), "deterministic".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    fn weather_tool() -> AvailableTool {
        AvailableTool::new(
            "get_weather",
            "Weather lookup",
            json!({
                "type": "object",
                "properties": {"location": {"type": "string"}},
                "required": ["location"]
            }),
        )
    }

    fn tools() -> BTreeMap<String, AvailableTool> {
        let mut map = BTreeMap::new();
        map.insert("get_weather".to_string(), weather_tool());
        map.insert(
            "send_email".to_string(),
            AvailableTool::new("send_email", "", Value::Null),
        );
        map
    }

    #[test]
    fn test_no_calls_is_undefined() {
        let report = ToolAccuracyReport::compute(&[], &tools(), &SchemaValidatorCache::new());
        assert_eq!(report, ToolAccuracyReport::default());
        assert_eq!(report.tool_score(), None);
        assert!(report.breakdown().is_empty());
    }

    #[test]
    fn test_rates() {
        let calls = vec![
            ToolCallRecord::new("get_weather")
                .with_parameters(params(json!({"location": "Beijing"})))
                .with_output(json!({"temp": 20}), true),
            ToolCallRecord::new("get_weather")
                .with_parameters(params(json!({"city": "Beijing"})))
                .with_output(json!({"error": "missing location"}), false),
            ToolCallRecord::new("made_up").with_output(json!("ok"), true),
        ];
        let report = ToolAccuracyReport::compute(&calls, &tools(), &SchemaValidatorCache::new());
        assert_eq!(report.valid_tool_name_rate, Some(2.0 / 3.0));
        assert_eq!(report.input_schema_compliance, Some(0.5));
        assert_eq!(report.execution_success_rate, Some(2.0 / 3.0));
        assert_eq!(report.valid_call_failure_rate, Some(0.5));

        let expected = (0.5 + 2.0 / 3.0 + 2.0 / 3.0 + 0.5) / 4.0;
        assert!((report.tool_score().unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_no_valid_names_leaves_valid_rates_undefined() {
        let calls = vec![ToolCallRecord::new("unknown").with_output(json!("x"), true)];
        let report = ToolAccuracyReport::compute(&calls, &tools(), &SchemaValidatorCache::new());
        assert_eq!(report.valid_tool_name_rate, Some(0.0));
        assert_eq!(report.input_schema_compliance, None);
        assert_eq!(report.valid_call_failure_rate, None);
        assert_eq!(report.tool_score(), Some(0.5));
    }

    #[test]
    fn test_validator_cache() {
        let cache = SchemaValidatorCache::new();
        let tool = weather_tool();
        assert!(cache.is_compliant(&tool, &params(json!({"location": "x"}))));
        assert!(!cache.is_compliant(&tool, &params(json!({"location": 3}))));
        assert_eq!(cache.len(), 1);

        let schemaless = AvailableTool::new("free", "", Value::Null);
        assert!(cache.is_compliant(&schemaless, &params(json!({"anything": true}))));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_metric_verdict() {
        let mut unit = EvaluationUnit::new("u1", "weather?");
        unit.available_tools = tools();
        unit.tools_called = vec![ToolCallRecord::new("get_weather")
            .with_parameters(params(json!({"location": "Beijing"})))
            .with_output(json!({"temp": 20}), true)];

        let verdict = ToolAccuracyMetric::default().measure(&unit).await.unwrap();
        assert_eq!(verdict.score, 1.0);
        assert!(verdict.success);
        let breakdown = verdict.score_breakdown.unwrap();
        assert_eq!(breakdown["valid_tool_name_rate"], 1.0);
        assert_eq!(breakdown["valid_call_failure_rate"], 0.0);
    }

    #[tokio::test]
    async fn test_metric_without_calls() {
        let unit = EvaluationUnit::new("u1", "hi");
        let verdict = ToolAccuracyMetric::default().measure(&unit).await.unwrap();
        assert_eq!(verdict.score, 0.0);
        assert_eq!(verdict.reason.as_deref(), Some("No tool calls to evaluate."));
    }
}
