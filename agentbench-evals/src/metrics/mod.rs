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

//! Concrete metrics
//!
//! - [`TextMetric`]: F1, exact match, ROUGE-1 and multi-answer F1
//! - [`ToolAccuracyMetric`]: valid names, schema compliance, execution success
//! - [`PerformanceMetric`]: end-to-end latency
//! - [`PassAtKMetric`]: task, tool and parameter pass@k
//! - [`McpToolJudge`]: six-dimension LLM-as-judge blended with tool accuracy

pub mod judge;
pub mod pass_k;
pub mod performance;
pub mod text;
pub mod tool_accuracy;

pub use judge::{JudgeScores, McpToolJudge};
pub use pass_k::{PassAtKMetric, PassCriterion, TrialOutcome};
pub use performance::{PerformanceMetric, UnitTimings};
pub use text::{TextMetric, TextMetricKind};
pub use tool_accuracy::{SchemaValidatorCache, ToolAccuracyMetric, ToolAccuracyReport};

use crate::llm_client::LLMClient;
use crate::matcher::{ParameterStrategy, ToolMatchStrategy};
use crate::{BaseMetric, EvalError, Scorable};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Names accepted by [`build_metric`]
pub const METRIC_NAMES: &[&str] = &[
    "f1",
    "exact_match",
    "rouge",
    "f1_multi_answer",
    "tool_accuracy",
    "performance",
    "pass_at_k",
    "tool_pass_at_k",
    "parameter_pass_at_k",
    "mcp_tool_judge",
];

/// Per-metric options from a task configuration; unset fields keep the
/// metric's defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricOptions {
    pub threshold: Option<f64>,
    pub include_reason: Option<bool>,
    pub strict_mode: Option<bool>,
    pub k: Option<u64>,
    pub trials_per_task: Option<usize>,
    pub tool_strategy: Option<String>,
    pub parameter_strategy: Option<String>,
}

impl MetricOptions {
    fn base(&self, default_threshold: f64) -> BaseMetric {
        let mut base = BaseMetric::new(self.threshold.unwrap_or(default_threshold));
        if let Some(include) = self.include_reason {
            base.include_reason = include;
        }
        base.strict(self.strict_mode.unwrap_or(false))
    }

    fn tool_strategy(&self) -> Result<ToolMatchStrategy, EvalError> {
        self.tool_strategy
            .as_deref()
            .map(str::parse)
            .transpose()
            .map(Option::unwrap_or_default)
            .map_err(EvalError::InvalidInput)
    }

    fn parameter_strategy(&self) -> Result<ParameterStrategy, EvalError> {
        self.parameter_strategy
            .as_deref()
            .map(str::parse)
            .transpose()
            .map(Option::unwrap_or_default)
            .map_err(EvalError::InvalidInput)
    }
}

pub fn is_known_metric(name: &str) -> bool {
    METRIC_NAMES.contains(&name)
}

/// Whether the metric needs a judge client
pub fn requires_judge(name: &str) -> bool {
    name == "mcp_tool_judge"
}

/// Instantiate a metric by name
pub fn build_metric(
    name: &str,
    options: &MetricOptions,
    judge: Option<Arc<dyn LLMClient>>,
) -> Result<Arc<dyn Scorable>, EvalError> {
    let k = options.k.unwrap_or(1);
    let trials = options.trials_per_task.unwrap_or(1);
    let pass_base = || options.base(PassAtKMetric::THRESHOLD);

    let metric: Arc<dyn Scorable> = match name {
        "f1" | "exact_match" | "rouge" | "f1_multi_answer" => {
            let kind = match name {
                "f1" => TextMetricKind::F1,
                "exact_match" => TextMetricKind::ExactMatch,
                "rouge" => TextMetricKind::Rouge1,
                _ => TextMetricKind::MultiAnswerF1,
            };
            Arc::new(TextMetric::new(kind).with_base(options.base(TextMetric::DEFAULT_THRESHOLD)))
        }
        "tool_accuracy" => Arc::new(ToolAccuracyMetric::new(
            options.base(ToolAccuracyMetric::DEFAULT_THRESHOLD),
        )),
        "performance" => Arc::new(PerformanceMetric::new(
            options.base(PerformanceMetric::DEFAULT_THRESHOLD),
        )),
        "pass_at_k" => Arc::new(PassAtKMetric::task(k, trials).with_base(pass_base())?),
        "tool_pass_at_k" => Arc::new(
            PassAtKMetric::tool(k, trials, options.tool_strategy()?).with_base(pass_base())?,
        ),
        "parameter_pass_at_k" => Arc::new(
            PassAtKMetric::parameter(k, trials, options.parameter_strategy()?).with_base(pass_base())?,
        ),
        "mcp_tool_judge" => {
            let client = judge.ok_or_else(|| {
                EvalError::InvalidInput("mcp_tool_judge requires a judge model".to_string())
            })?;
            Arc::new(McpToolJudge::new(client).with_base(options.base(McpToolJudge::DEFAULT_THRESHOLD)))
        }
        other => return Err(EvalError::InvalidInput(format!("unknown metric: {}", other))),
    };
    Ok(metric)
}
