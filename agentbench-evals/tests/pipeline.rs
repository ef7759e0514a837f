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

//! Integration tests for the trace-to-verdict pipeline

use agentbench_evals::dataset::DatasetRow;
use agentbench_evals::metrics::{PassAtKMetric, TextMetric, TextMetricKind, ToolAccuracyMetric};
use agentbench_evals::{
    AgentError, AgentInvoker, AgentOutput, BatchEvaluator, EvalConfig, ExpectedCallParser,
    GenerationRunner, RunnerConfig, ToolCallMatcher, ToolMatchStrategy, UnitBuilder,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn weather_trace() -> Value {
    let tool_span = json!({
        "name": "execute_tool get_weather",
        "traceId": "trace-1",
        "spanId": "s1",
        "startTimeUnixNano": "2000000000",
        "endTimeUnixNano": "3500000000",
        "attributes": {
            "tool.name": "get_weather",
            "tool.input": "{\"location\": \"Beijing\"}",
            "tool.output": "{\"temperature\": 21, \"condition\": \"sunny\"}"
        }
    });

    json!({
        "trace_data": [
            {
                "name": "call_llm",
                "traceId": "trace-1",
                "spanId": "llm-1",
                "startTimeUnixNano": "1000000000",
                "endTimeUnixNano": "2000000000",
                "attributes": {
                    "gen_ai.request.model": "gpt-4o",
                    "gen_ai.request.functions.0.name": "get_weather",
                    "gen_ai.request.functions.0.description": "Current weather for a city",
                    "gen_ai.request.functions.0.parameters": "{\"type\": \"object\", \"properties\": {\"location\": {\"type\": \"string\"}}, \"required\": [\"location\"]}",
                    "gen_ai.request.functions.1.name": "send_email",
                    "gen_ai.request.functions.1.description": "Send an email"
                }
            },
            tool_span.clone(),
            tool_span
        ]
    })
}

#[tokio::test]
async fn test_end_to_end_weather_trace() {
    let mut unit = UnitBuilder::new().from_trace("weather-1", "What is the weather in Beijing?", &weather_trace());
    unit.actual_output = "It is sunny and 21 degrees in Beijing.".to_string();
    unit.expected_output = Some("Sunny, 21 degrees".to_string());
    unit.expected_tools = ExpectedCallParser::new().parse("1. get_weather: location=\"Beijing\"", None);

    // Duplicate span id collapses to one record
    assert_eq!(unit.tools_called.len(), 1);
    let call = &unit.tools_called[0];
    assert_eq!(call.name, "get_weather");
    assert_eq!(call.execution_order, 1);
    assert!(call.success);

    assert_eq!(unit.expected_tools.len(), 1);
    assert_eq!(unit.expected_tools[0].name, "get_weather");
    assert_eq!(unit.expected_tools[0].input_parameters["location"], json!("Beijing"));

    assert!(unit.available_tools.contains_key("get_weather"));
    assert!(unit.available_tools.contains_key("send_email"));

    let matcher = ToolCallMatcher::new(ToolMatchStrategy::Exact);
    assert!(matcher.matches(&unit.tools_called, &unit.expected_tools));

    let report = ToolAccuracyMetric::default().report(&unit);
    assert_eq!(report.valid_tool_name_rate, Some(1.0));
    assert_eq!(report.execution_success_rate, Some(1.0));
    assert_eq!(report.input_schema_compliance, Some(1.0));

    let evaluator = BatchEvaluator::new(EvalConfig::default());
    evaluator.register(Arc::new(ToolAccuracyMetric::default())).unwrap();
    evaluator.register(Arc::new(TextMetric::new(TextMetricKind::F1))).unwrap();
    evaluator.register(Arc::new(PassAtKMetric::task(1, 1))).unwrap();

    let batch = evaluator.evaluate(vec![unit]).await.unwrap();
    let verdicts = &batch.units[0];
    assert!(verdicts.verdict("tool_accuracy").unwrap().success);
    assert!(verdicts.verdict("pass@1").is_some());
    assert!(verdicts.verdicts.iter().all(|v| v.reason.is_some()));
}

/// Agent mock that records the highest number of concurrent calls
struct CountingAgent {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl CountingAgent {
    fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AgentInvoker for CountingAgent {
    fn id(&self) -> &str {
        "counting"
    }

    async fn generate(&self, input: &str) -> Result<AgentOutput, AgentError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(20)).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(AgentOutput {
            success: true,
            response: Some(format!("done: {}", input)),
            trace_data: weather_trace(),
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_generation_concurrency_is_bounded() {
    let agent = Arc::new(CountingAgent::new());
    let config = RunnerConfig {
        max_concurrency: 5,
        cache_enabled: false,
        ..Default::default()
    };
    let runner = GenerationRunner::new(agent.clone(), config);

    let rows: Vec<DatasetRow> = (0..20)
        .map(|i| DatasetRow {
            index: i,
            input: format!("question {}", i),
            ..Default::default()
        })
        .collect();
    let units = runner.run(rows).await;

    assert_eq!(units.len(), 20);
    assert_eq!(agent.calls.load(Ordering::SeqCst), 20);
    let peak = agent.peak.load(Ordering::SeqCst);
    assert!(peak <= 5, "peak concurrency {} exceeded the bound", peak);
    assert!(peak > 1);
    assert_eq!(units[7].id, "row-7");
}
