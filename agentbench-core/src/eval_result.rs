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

//! Verdict contract emitted by every metric

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Score, pass/fail and explanation for one metric on one unit
///
/// The threshold that produced `success` belongs to the metric, not the verdict.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Verdict {
    pub metric_id: String,
    /// Always within [0, 1]
    pub score: f64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_breakdown: Option<BTreeMap<String, f64>>,
    /// Set when the verdict stands in for a failed measurement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Judge spend in USD
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl Verdict {
    /// Build a verdict, clamping the score and deriving success from the threshold
    pub fn scored(metric_id: impl Into<String>, score: f64, threshold: f64) -> Self {
        let score = clamp_score(score);
        Self {
            metric_id: metric_id.into(),
            score,
            success: score >= threshold,
            ..Default::default()
        }
    }

    /// Zero-score failed verdict carrying the error as its reason
    pub fn failed(metric_id: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            metric_id: metric_id.into(),
            score: 0.0,
            success: false,
            reason: Some(error.clone()),
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_breakdown(mut self, breakdown: BTreeMap<String, f64>) -> Self {
        self.score_breakdown = Some(breakdown);
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// Clamp into [0, 1]; NaN becomes 0
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}
