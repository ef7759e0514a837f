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

//! Trace analytics: tool usage, retrieval context, timing and schema diagnostics
//!
//! Durations are reported in seconds, assuming nanosecond timestamps.

use super::attributes::{value_text, SpanAttributeView, FUNCTION_HINTS};
use super::classifier::{agent_name_of, SpanClassifier, MERGED_TOOLS_SPAN, TOOL_SPAN_MARKER};
use super::parse_json_if_string;
use super::schema::{looks_like_llm, parse_functions_details, FunctionSchemaRecoverer};
use agentbench_core::{AvailableTool, SpanRecord, ToolCallRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

const NANOS_PER_SECOND: f64 = 1e9;
const KNOWLEDGE_SPANS: &[&str] = &["load_knowledgebase", "knowledge_retrieval", "retrieve_context"];
const PREVIEW_CHARS: usize = 200;

/// Aggregate view of a unit's tool calls
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolUsageSummary {
    pub total_calls: usize,
    pub unique_tools: usize,
    pub tool_frequency: BTreeMap<String, usize>,
    pub average_duration: f64,
    pub total_duration: f64,
    pub tools_with_errors: Vec<String>,
}

pub fn analyze_tool_usage_summary(calls: &[ToolCallRecord]) -> ToolUsageSummary {
    let mut tool_frequency = BTreeMap::new();
    for call in calls {
        *tool_frequency.entry(call.name.clone()).or_insert(0) += 1;
    }
    let total_duration: f64 = calls.iter().filter_map(|c| c.execution_time).sum();
    let tools_with_errors = calls
        .iter()
        .filter(|c| value_text(&c.output).to_lowercase().contains("error"))
        .map(|c| c.name.clone())
        .collect();

    ToolUsageSummary {
        total_calls: calls.len(),
        unique_tools: tool_frequency.len(),
        tool_frequency,
        average_duration: if calls.is_empty() {
            0.0
        } else {
            total_duration / calls.len() as f64
        },
        total_duration,
        tools_with_errors,
    }
}

/// Retrieved knowledge snippets recorded by knowledge-base tool spans
pub fn context_from_trace<'a>(spans: impl IntoIterator<Item = &'a SpanRecord>) -> Vec<String> {
    let mut context = Vec::new();
    for span in spans {
        if !KNOWLEDGE_SPANS.iter().any(|k| span.name.contains(k)) {
            continue;
        }
        let Some(output) = span.attributes.get("tool.output").map(parse_json_if_string) else {
            continue;
        };
        let knowledges = output
            .pointer("/response/result/knowledges")
            .and_then(Value::as_array);
        for knowledge in knowledges.into_iter().flatten() {
            if let Some(content) = knowledge.get("content") {
                context.push(value_text(content));
            }
        }
    }
    context
}

/// Population statistics over a set of durations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    pub count: usize,
    pub total_duration: f64,
    pub avg_duration: f64,
    pub min_duration: f64,
    pub max_duration: f64,
    pub std_duration: f64,
}

impl DurationStats {
    pub fn from_durations(durations: &[f64]) -> Option<Self> {
        if durations.is_empty() {
            return None;
        }
        let count = durations.len();
        let total: f64 = durations.iter().sum();
        let avg = total / count as f64;
        let std = if count > 1 {
            (durations.iter().map(|d| (d - avg).powi(2)).sum::<f64>() / count as f64).sqrt()
        } else {
            0.0
        };
        Some(Self {
            count,
            total_duration: total,
            avg_duration: avg,
            min_duration: durations.iter().cloned().fold(f64::INFINITY, f64::min),
            max_duration: durations.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            std_duration: std,
        })
    }
}

/// LLM timing; `pure_*` fields exclude time spent in child tool spans
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmCallStats {
    #[serde(flatten)]
    pub stats: DurationStats,
    pub pure_llm_duration: f64,
    pub pure_llm_avg_duration: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: u64,
    pub end: u64,
    pub duration: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub total_spans: usize,
    pub span_types: BTreeMap<String, usize>,
    pub time_range: Option<TimeRange>,
}

/// Timing breakdown of one trace
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub end_to_end_duration: Option<f64>,
    pub tool_call_stats: BTreeMap<String, DurationStats>,
    pub llm_call_stats: Option<LlmCallStats>,
    pub agent_run_stats: BTreeMap<String, DurationStats>,
    pub total_tool_calls: usize,
    pub total_llm_calls: usize,
    pub total_agent_runs: usize,
    pub trace_summary: TraceSummary,
}

impl PerformanceSummary {
    pub fn from_spans(spans: &[SpanRecord]) -> Self {
        let classifier = SpanClassifier::performance();

        let mut tool_durations: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut agent_durations: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut llm_durations = Vec::new();
        let mut pure_llm_durations = Vec::new();

        for span in spans {
            let Some(duration) = seconds(span) else {
                continue;
            };
            if classifier.is_tool_call_span(span) {
                if let Some(name) = performance_tool_name(span) {
                    tool_durations.entry(name).or_default().push(duration);
                }
            }
            if classifier.is_llm_call_span(span) {
                llm_durations.push(duration);
                if let Some(span_id) = span.span_id.as_deref() {
                    let child_tools: f64 = spans
                        .iter()
                        .filter(|c| {
                            c.parent_span_id.as_deref() == Some(span_id) && classifier.is_tool_call_span(c)
                        })
                        .filter_map(seconds)
                        .sum();
                    pure_llm_durations.push((duration - child_tools).max(0.0));
                }
            }
            if classifier.is_agent_run_span(span) {
                agent_durations.entry(agent_name_of(span)).or_default().push(duration);
            }
        }

        let llm_call_stats = DurationStats::from_durations(&llm_durations).map(|stats| {
            let (pure_total, pure_avg) = if pure_llm_durations.is_empty() {
                (stats.total_duration, stats.avg_duration)
            } else {
                let total: f64 = pure_llm_durations.iter().sum();
                (total, total / pure_llm_durations.len() as f64)
            };
            LlmCallStats {
                stats,
                pure_llm_duration: pure_total,
                pure_llm_avg_duration: pure_avg,
            }
        });

        let tool_call_stats: BTreeMap<String, DurationStats> = tool_durations
            .iter()
            .filter_map(|(name, d)| DurationStats::from_durations(d).map(|s| (name.clone(), s)))
            .collect();
        let agent_run_stats: BTreeMap<String, DurationStats> = agent_durations
            .iter()
            .filter_map(|(name, d)| DurationStats::from_durations(d).map(|s| (name.clone(), s)))
            .collect();

        Self {
            end_to_end_duration: end_to_end_duration(spans),
            total_tool_calls: tool_call_stats.values().map(|s| s.count).sum(),
            total_llm_calls: llm_durations.len(),
            total_agent_runs: agent_run_stats.values().map(|s| s.count).sum(),
            tool_call_stats,
            llm_call_stats,
            agent_run_stats,
            trace_summary: trace_summary(spans),
        }
    }

    /// Sum of every tool's total duration
    pub fn tool_call_duration(&self) -> f64 {
        self.tool_call_stats.values().map(|s| s.total_duration).sum()
    }

    /// LLM time net of child tool spans
    pub fn llm_call_duration(&self) -> f64 {
        self.llm_call_stats
            .as_ref()
            .map(|s| s.pure_llm_duration)
            .unwrap_or(0.0)
    }
}

fn seconds(span: &SpanRecord) -> Option<f64> {
    match (span.start_time, span.end_time) {
        (Some(start), Some(end)) if start > 0 && end > 0 => Some((end as f64 - start as f64) / NANOS_PER_SECOND),
        _ => None,
    }
}

/// Root span duration, else the full observed time range
pub fn end_to_end_duration(spans: &[SpanRecord]) -> Option<f64> {
    if spans.is_empty() {
        return None;
    }
    if let Some(root) = spans.iter().find(|s| s.is_root()) {
        return seconds(root);
    }
    trace_time_range(spans).map(|r| r.duration)
}

fn trace_time_range(spans: &[SpanRecord]) -> Option<TimeRange> {
    let timed: Vec<(u64, u64)> = spans
        .iter()
        .filter_map(|s| match (s.start_time, s.end_time) {
            (Some(start), Some(end)) if start > 0 && end > 0 => Some((start, end)),
            _ => None,
        })
        .collect();
    let start = timed.iter().map(|(s, _)| *s).min()?;
    let end = timed.iter().map(|(_, e)| *e).max()?;
    Some(TimeRange {
        start,
        end,
        duration: (end as f64 - start as f64) / NANOS_PER_SECOND,
    })
}

fn trace_summary(spans: &[SpanRecord]) -> TraceSummary {
    let mut span_types = BTreeMap::new();
    for span in spans {
        *span_types.entry(span.name.clone()).or_insert(0) += 1;
    }
    TraceSummary {
        total_spans: spans.len(),
        span_types,
        time_range: trace_time_range(spans),
    }
}

/// Tool name used for timing; merged rollups have none
fn performance_tool_name(span: &SpanRecord) -> Option<String> {
    if span.name == MERGED_TOOLS_SPAN {
        return None;
    }
    let view = SpanAttributeView::new(span);
    if let Some(name) = view.try_get_tool_name() {
        return Some(name);
    }
    if span.name.to_lowercase().contains(TOOL_SPAN_MARKER) {
        let from_input = span
            .attributes
            .iter()
            .filter(|(k, _)| {
                let k = k.to_lowercase();
                k.contains("input") || k.contains("params")
            })
            .find_map(|(_, v)| {
                parse_json_if_string(v)
                    .get("name")
                    .map(value_text)
            });
        if from_input.is_some() {
            return from_input;
        }
    }
    Some(span.name.clone())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSpanInfo {
    pub index: usize,
    pub name: String,
    pub attribute_count: usize,
    pub event_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionsDataPreview {
    pub span_index: usize,
    pub key: String,
    pub preview: String,
}

/// Diagnostics for tuning schema recovery on unfamiliar traces
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionsDebugReport {
    pub total_spans: usize,
    pub llm_spans: Vec<LlmSpanInfo>,
    pub spans_with_functions_keywords: Vec<usize>,
    pub all_attribute_keys: BTreeSet<String>,
    pub all_event_names: BTreeSet<String>,
    pub potential_functions_data: Vec<FunctionsDataPreview>,
    pub parsed_functions: Vec<AvailableTool>,
}

pub fn debug_functions_extraction(spans: &[SpanRecord]) -> FunctionsDebugReport {
    let recoverer = FunctionSchemaRecoverer::new();
    let mut report = FunctionsDebugReport {
        total_spans: spans.len(),
        ..Default::default()
    };

    for (index, span) in spans.iter().enumerate() {
        report.all_attribute_keys.extend(span.attributes.keys().cloned());
        report.all_event_names.extend(span.events.iter().map(|e| e.name.clone()));

        if looks_like_llm(span) {
            report.llm_spans.push(LlmSpanInfo {
                index,
                name: span.name.clone(),
                attribute_count: span.attributes.len(),
                event_count: span.events.len(),
            });
        }
        if SpanAttributeView::new(span).has_function_hints() {
            report.spans_with_functions_keywords.push(index);
        }
        for (key, value) in &span.attributes {
            let key_lower = key.to_lowercase();
            if FUNCTION_HINTS.iter().any(|h| key_lower.contains(h)) {
                report.potential_functions_data.push(FunctionsDataPreview {
                    span_index: index,
                    key: key.clone(),
                    preview: value_text(value).chars().take(PREVIEW_CHARS).collect(),
                });
            }
        }
        if let Some((raw, _)) = recoverer.functions_on(span) {
            report.parsed_functions.extend(parse_functions_details(&raw));
        }
    }
    report
}
