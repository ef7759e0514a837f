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

//! Latency scoring from trace timings

use crate::trace::PerformanceSummary;
use crate::{BaseMetric, EvalError, MetricMetadata, Scorable};
use agentbench_core::{EvaluationUnit, Verdict};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Map end-to-end seconds to a score. Zero means no timing data.
pub fn latency_score(end_to_end_secs: f64) -> f64 {
    if end_to_end_secs <= 0.0 || end_to_end_secs <= 30.0 {
        1.0
    } else if end_to_end_secs <= 120.0 {
        0.8
    } else if end_to_end_secs <= 300.0 {
        0.6
    } else {
        (1.0 - (end_to_end_secs - 300.0) / 300.0).max(0.2)
    }
}

/// Durations in seconds, summed across turns
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitTimings {
    pub end_to_end_duration: f64,
    pub tool_call_duration: f64,
    pub llm_call_duration: f64,
}

impl UnitTimings {
    /// Trace timings where available, recorded tool execution times otherwise
    pub fn of(unit: &EvaluationUnit) -> Self {
        let mut end_to_end = None::<f64>;
        let mut tool_from_trace = None::<f64>;
        let mut llm = 0.0;

        for turn in &unit.trace_data {
            let summary = PerformanceSummary::from_spans(turn);
            if let Some(d) = summary.end_to_end_duration {
                *end_to_end.get_or_insert(0.0) += d;
            }
            if !summary.tool_call_stats.is_empty() {
                *tool_from_trace.get_or_insert(0.0) += summary.tool_call_duration();
            }
            llm += summary.llm_call_duration();
        }

        let recorded: f64 = unit.tools_called.iter().filter_map(|c| c.execution_time).sum();
        Self {
            end_to_end_duration: end_to_end.unwrap_or(recorded),
            tool_call_duration: tool_from_trace.unwrap_or(recorded),
            llm_call_duration: llm,
        }
    }

    pub fn breakdown(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("end_to_end_duration".to_string(), self.end_to_end_duration),
            ("tool_call_duration".to_string(), self.tool_call_duration),
            ("llm_call_duration".to_string(), self.llm_call_duration),
        ])
    }
}

pub struct PerformanceMetric {
    base: BaseMetric,
}

impl PerformanceMetric {
    pub const DEFAULT_THRESHOLD: f64 = 0.5;

    pub fn new(base: BaseMetric) -> Self {
        Self { base }
    }
}

impl Default for PerformanceMetric {
    fn default() -> Self {
        Self::new(BaseMetric::new(Self::DEFAULT_THRESHOLD))
    }
}

fn performance_reason(unit: &EvaluationUnit, timings: &UnitTimings) -> String {
    let total = unit.tools_called.len();
    let successful = unit.tools_called.iter().filter(|c| c.success).count();
    let success_rate = if total > 0 { successful as f64 / total as f64 } else { 0.0 };
    let avg = if total > 0 {
        timings.end_to_end_duration / total as f64
    } else {
        0.0
    };
    let rounds = unit.total_rounds.max(1);
    let calls_per_round = total as f64 / rounds as f64;
    let parallel_efficiency = if avg > 0.0 {
        (calls_per_round / (1.0 + avg)).clamp(0.0, 1.0)
    } else {
        success_rate
    };

    let mut parts = vec![
        format!("Executed {} tool call(s) with success rate {:.2}.", total, success_rate),
        format!(
            "Average duration {:.3}s over {} round(s), parallel efficiency about {:.3}.",
            avg, rounds, parallel_efficiency
        ),
        format!("End-to-end duration {:.3}s.", timings.end_to_end_duration),
    ];
    if timings.tool_call_duration > 0.0 {
        parts.push(format!("Tool call duration {:.3}s.", timings.tool_call_duration));
    }
    if timings.llm_call_duration > 0.0 {
        parts.push(format!("LLM call duration {:.3}s.", timings.llm_call_duration));
    }
    parts.join(" ")
}

#[async_trait]
impl Scorable for PerformanceMetric {
    fn id(&self) -> &str {
        "performance"
    }

    async fn measure(&self, unit: &EvaluationUnit) -> Result<Verdict, EvalError> {
        let timings = UnitTimings::of(unit);
        let score = latency_score(timings.end_to_end_duration);
        let verdict = self
            .base
            .verdict(self.id(), score, |_| performance_reason(unit, &timings));
        Ok(verdict.with_breakdown(timings.breakdown()))
    }

    fn base(&self) -> &BaseMetric {
        &self.base
    }

    fn metadata(&self) -> MetricMetadata {
        MetricMetadata {
            name: "Performance".to_string(),
            version: "1.0.0".to_string(),
            description: "End-to-end latency with tool and LLM time breakdown".to_string(),
            cost_per_eval: Some(0.0),
            avg_latency_ms: Some(1),
            tags: vec!["latency".to_string(), "deterministic".to_string()],
        }
    }
}
