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

//! Pass@k metrics over a unit's repeated trials
//!
//! The three variants share one estimator and differ only in what makes a
//! trial count as passed: the trial's own success flag, a tool-name match,
//! or a parameter match.

use crate::matcher::{parameters_correct, ParameterStrategy, ToolCallMatcher, ToolMatchStrategy};
use crate::pass_at_k::{estimate, pad_trials};
use crate::{BaseMetric, EvalError, MetricMetadata, Scorable};
use agentbench_core::{EvaluationUnit, ToolCallExpected, TrialRecord, Verdict};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What makes one trial a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "criterion")]
pub enum PassCriterion {
    /// The trial's overall success flag
    Task,
    /// Called tools match the expected tools
    Tool { strategy: ToolMatchStrategy },
    /// Called tools' parameters match the expected parameters
    Parameter { strategy: ParameterStrategy },
}

impl PassCriterion {
    fn prefix(&self) -> &'static str {
        match self {
            PassCriterion::Task => "pass",
            PassCriterion::Tool { .. } => "tool_pass",
            PassCriterion::Parameter { .. } => "parameter_pass",
        }
    }
}

/// Per-trial outcome under all three criteria
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialOutcome {
    pub overall: bool,
    pub tool_correct: bool,
    pub parameter_correct: bool,
}

impl TrialOutcome {
    fn failed() -> Self {
        Self {
            overall: false,
            tool_correct: false,
            parameter_correct: false,
        }
    }
}

/// Trials of a unit; a unit without recorded trials is its own single trial
fn unit_trials(unit: &EvaluationUnit) -> Vec<TrialRecord> {
    if !unit.trials.is_empty() {
        return unit.trials.clone();
    }
    vec![TrialRecord {
        success: unit.success,
        tools_called: unit.tools_called.clone(),
        actual_output: Some(unit.actual_output.clone()),
    }]
}

pub struct PassAtKMetric {
    id: String,
    k: u64,
    trials_per_task: usize,
    criterion: PassCriterion,
    tool_strategy: ToolMatchStrategy,
    parameter_strategy: ParameterStrategy,
    base: BaseMetric,
}

impl PassAtKMetric {
    /// Pass@k is binary, so the threshold is pinned to 1.0
    pub const THRESHOLD: f64 = 1.0;

    fn build(k: u64, trials_per_task: usize, criterion: PassCriterion) -> Self {
        let (tool_strategy, parameter_strategy) = match criterion {
            PassCriterion::Task => (ToolMatchStrategy::default(), ParameterStrategy::default()),
            PassCriterion::Tool { strategy } => (strategy, ParameterStrategy::default()),
            PassCriterion::Parameter { strategy } => (ToolMatchStrategy::default(), strategy),
        };
        Self {
            id: format!("{}@{}", criterion.prefix(), k),
            k,
            trials_per_task: trials_per_task.max(1),
            criterion,
            tool_strategy,
            parameter_strategy,
            base: BaseMetric::new(Self::THRESHOLD),
        }
    }

    /// Task-level pass@k
    pub fn task(k: u64, trials_per_task: usize) -> Self {
        Self::build(k, trials_per_task, PassCriterion::Task)
    }

    /// Tool-selection pass@k
    pub fn tool(k: u64, trials_per_task: usize, strategy: ToolMatchStrategy) -> Self {
        Self::build(k, trials_per_task, PassCriterion::Tool { strategy })
    }

    /// Parameter-correctness pass@k
    pub fn parameter(k: u64, trials_per_task: usize, strategy: ParameterStrategy) -> Self {
        Self::build(k, trials_per_task, PassCriterion::Parameter { strategy })
    }

    /// Replace the shared settings; any threshold other than 1.0 is rejected
    pub fn with_base(mut self, base: BaseMetric) -> Result<Self, EvalError> {
        if (base.threshold - Self::THRESHOLD).abs() > f64::EPSILON {
            return Err(EvalError::InvalidInput(format!(
                "{} is binary and requires a threshold of 1.0, got {}",
                self.id, base.threshold
            )));
        }
        self.base = base;
        Ok(self)
    }

    pub fn k(&self) -> u64 {
        self.k
    }

    pub fn criterion(&self) -> PassCriterion {
        self.criterion
    }

    fn outcome(&self, trial: &TrialRecord, expected: &[ToolCallExpected]) -> TrialOutcome {
        TrialOutcome {
            overall: trial.success,
            tool_correct: ToolCallMatcher::new(self.tool_strategy).matches(&trial.tools_called, expected),
            parameter_correct: parameters_correct(self.parameter_strategy, &trial.tools_called, expected),
        }
    }

    /// Outcomes for every trial, padded with failures to the configured count
    pub fn outcomes(&self, unit: &EvaluationUnit) -> Vec<TrialOutcome> {
        let mut outcomes: Vec<TrialOutcome> = unit_trials(unit)
            .iter()
            .map(|t| self.outcome(t, &unit.expected_tools))
            .collect();
        if outcomes.len() < self.trials_per_task {
            outcomes.resize(self.trials_per_task, TrialOutcome::failed());
        }
        outcomes
    }

    fn passed(&self, outcome: &TrialOutcome) -> bool {
        match self.criterion {
            PassCriterion::Task => outcome.overall,
            PassCriterion::Tool { .. } => outcome.tool_correct,
            PassCriterion::Parameter { .. } => outcome.parameter_correct,
        }
    }

    fn reason(&self, outcomes: &[TrialOutcome], passed: usize, score: f64) -> String {
        let n = outcomes.len();
        let rate = if n > 0 { passed as f64 / n as f64 } else { 0.0 };
        let mark = |ok: bool| if ok { "✓" } else { "✗" };
        let mut lines = vec![
            format!("{} results:", self.id),
            format!("- Trials: {}", n),
            format!("- Passed: {}", passed),
            format!("- Pass rate: {:.2}%", rate * 100.0),
            format!("- Score: {:.4}", score),
            format!(
                "- Meets threshold: {}",
                if score >= self.base.effective_threshold() { "yes" } else { "no" }
            ),
        ];
        if n > 0 {
            lines.push(String::new());
            lines.push("Trials:".to_string());
            for (i, o) in outcomes.iter().enumerate() {
                lines.push(format!(
                    "  Trial {}: {} overall | {} tool | {} parameter",
                    i + 1,
                    mark(o.overall),
                    mark(o.tool_correct),
                    mark(o.parameter_correct)
                ));
            }
        }
        lines.join("\n")
    }
}

#[async_trait]
impl Scorable for PassAtKMetric {
    fn id(&self) -> &str {
        &self.id
    }

    async fn measure(&self, unit: &EvaluationUnit) -> Result<Verdict, EvalError> {
        let outcomes = self.outcomes(unit);
        let flags = pad_trials(
            outcomes.iter().map(|o| self.passed(o)).collect(),
            self.trials_per_task,
        );
        let n = flags.len();
        let c = flags.iter().filter(|p| **p).count();
        let score = estimate(n as u64, c as u64, self.k);

        let breakdown = BTreeMap::from([
            ("num_trials".to_string(), n as f64),
            ("num_passed".to_string(), c as f64),
            ("pass_rate".to_string(), if n > 0 { c as f64 / n as f64 } else { 0.0 }),
        ]);
        let verdict = self
            .base
            .verdict(&self.id, score, |s| self.reason(&outcomes, c, s));
        Ok(verdict.with_breakdown(breakdown))
    }

    fn base(&self) -> &BaseMetric {
        &self.base
    }

    fn metadata(&self) -> MetricMetadata {
        let description = match self.criterion {
            PassCriterion::Task => "Probability that one of k trials completes the task",
            PassCriterion::Tool { .. } => "Probability that one of k trials selects the expected tools",
            PassCriterion::Parameter { .. } => {
                "Probability that one of k trials passes the expected parameters"
            }
        };
        MetricMetadata {
            name: self.id.clone(),
            version: "1.0.0".to_string(),
            description: description.to_string(),
            cost_per_eval: Some(0.0),
            avg_latency_ms: Some(1),
            tags: vec!["pass@k".to_string(), "deterministic".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentbench_core::ToolCallRecord;
    use serde_json::json;

    fn trial(success: bool, tools: &[(&str, serde_json::Value)]) -> TrialRecord {
        TrialRecord {
            success,
            tools_called: tools
                .iter()
                .map(|(name, params)| {
                    ToolCallRecord::new(*name).with_parameters(params.as_object().cloned().unwrap_or_default())
                })
                .collect(),
            actual_output: None,
        }
    }

    fn unit() -> EvaluationUnit {
        let mut unit = EvaluationUnit::new("u1", "weather in Beijing");
        unit.expected_tools = vec![ToolCallExpected::new("get_weather").with_param("location", "Beijing")];
        unit.trials = vec![
            trial(false, &[("search", json!({}))]),
            trial(true, &[("get_weather", json!({"location": "beijing"}))]),
            trial(true, &[("get_weather", json!({"location": "Beijing"}))]),
        ];
        unit
    }

    #[tokio::test]
    async fn test_task_pass_at_k() {
        let metric = PassAtKMetric::task(1, 3);
        let verdict = metric.measure(&unit()).await.unwrap();
        assert_eq!(metric.id(), "pass@1");
        assert!((verdict.score - 2.0 / 3.0).abs() < 1e-12);
        assert!(!verdict.success);
        let reason = verdict.reason.unwrap();
        assert!(reason.contains("Trial 1: ✗ overall | ✗ tool | ✗ parameter"));
        assert!(reason.contains("Trial 3: ✓ overall | ✓ tool | ✓ parameter"));
    }

    #[tokio::test]
    async fn test_parameter_strategy_decides_trial() {
        let exact = PassAtKMetric::parameter(1, 3, ParameterStrategy::Exact);
        let semantic = PassAtKMetric::parameter(1, 3, ParameterStrategy::Semantic);
        let exact_score = exact.measure(&unit()).await.unwrap().score;
        let semantic_score = semantic.measure(&unit()).await.unwrap().score;
        assert!((exact_score - 1.0 / 3.0).abs() < 1e-12);
        assert!((semantic_score - 2.0 / 3.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_padding_with_failures() {
        let metric = PassAtKMetric::tool(2, 5, ToolMatchStrategy::Exact);
        let verdict = metric.measure(&unit()).await.unwrap();
        let breakdown = verdict.score_breakdown.unwrap();
        assert_eq!(breakdown["num_trials"], 5.0);
        assert_eq!(breakdown["num_passed"], 2.0);
        // 1 - C(3,2)/C(5,2)
        assert!((verdict.score - 0.7).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_unit_without_trials_is_single_trial() {
        let mut unit = EvaluationUnit::new("u1", "q");
        unit.success = true;
        let verdict = PassAtKMetric::task(1, 1).measure(&unit).await.unwrap();
        assert_eq!(verdict.score, 1.0);
        assert!(verdict.success);
    }

    #[test]
    fn test_threshold_is_pinned() {
        assert!(PassAtKMetric::task(1, 1).with_base(BaseMetric::new(0.5)).is_err());
        assert!(PassAtKMetric::task(1, 1)
            .with_base(BaseMetric::new(1.0).without_reason())
            .is_ok());
    }
}
