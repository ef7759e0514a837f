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

//! # Agentbench Evaluation Pipeline
//!
//! Turns agent execution traces into verdicts.
//!
//! ## Features
//!
//! - **Trace analysis**: span extraction, classification, tool-call
//!   reconstruction and function-schema recovery
//! - **Expected calls**: free-text annotation parsing and tool-call matching
//! - **Pass@k**: unbiased estimation for task, tool and parameter correctness
//! - **Metrics**: text overlap, tool accuracy, performance and LLM-as-judge
//! - **Batch evaluation**: bounded concurrency, verdict caching, error policy
//!
//! ## Example
//!
//! ```rust,ignore
//! use agentbench_evals::{BatchEvaluator, EvalConfig, Scorable};
//! use agentbench_evals::metrics::ToolAccuracyMetric;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let evaluator = BatchEvaluator::new(EvalConfig::default());
//!     evaluator.register(Arc::new(ToolAccuracyMetric::default())).unwrap();
//!
//!     let units = vec![/* EvaluationUnit values built by the runner */];
//!     let report = evaluator.evaluate(units).await.unwrap();
//!     println!("pass rate: {:.2}", report.pass_rate());
//! }
//! ```

use agentbench_core::{EvaluationUnit, Verdict};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub mod cache;
pub mod dataset;
pub mod expected;
pub mod llm_client;
pub mod matcher;
pub mod metrics;
pub mod pass_at_k;
pub mod registry;
pub mod runner;
pub mod trace;

pub use cache::{CacheStats, FileVerdictCache, GenerationCache, VerdictCache};
pub use dataset::{DatasetRow, DatasetError};
pub use expected::ExpectedCallParser;
pub use llm_client::{GovernedClient, JudgeOutput, LLMClient, LLMError};
pub use matcher::{ParameterStrategy, ToolCallMatcher, ToolMatchStrategy, NUMERIC_TOLERANCE};
pub use registry::{BatchError, BatchEvaluator, BatchReport, UnitReport};
pub use runner::{AgentError, AgentInvoker, AgentOutput, GenerationRunner, RunnerConfig, UnitBuilder};

/// A scoring unit over one [`EvaluationUnit`]
#[async_trait]
pub trait Scorable: Send + Sync {
    /// Unique identifier (e.g., "tool_accuracy")
    fn id(&self) -> &str;

    /// Score one unit. Implementations clamp scores to [0, 1].
    async fn measure(&self, unit: &EvaluationUnit) -> Result<Verdict, EvalError>;

    /// Shared threshold/reason/strict settings
    fn base(&self) -> &BaseMetric;

    /// Metadata about this metric (name, version, costs, etc.)
    fn metadata(&self) -> MetricMetadata;

    fn threshold(&self) -> f64 {
        self.base().effective_threshold()
    }

    fn is_successful(&self, verdict: &Verdict) -> bool {
        verdict.error.is_none() && verdict.score >= self.threshold()
    }

    /// Default implementation measures units one after another
    async fn measure_batch(&self, units: Vec<&EvaluationUnit>) -> Result<Vec<Verdict>, EvalError> {
        let mut verdicts = Vec::with_capacity(units.len());
        for unit in units {
            verdicts.push(self.measure(unit).await?);
        }
        Ok(verdicts)
    }

    /// Estimated cost per measurement in USD
    fn cost_per_eval(&self) -> Option<f64> {
        self.metadata().cost_per_eval
    }
}

/// Settings every metric carries
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaseMetric {
    pub threshold: f64,
    #[serde(default = "default_true")]
    pub include_reason: bool,
    /// Forces the threshold to 1.0
    #[serde(default)]
    pub strict_mode: bool,
}

fn default_true() -> bool {
    true
}

impl BaseMetric {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            include_reason: true,
            strict_mode: false,
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    pub fn without_reason(mut self) -> Self {
        self.include_reason = false;
        self
    }

    pub fn effective_threshold(&self) -> f64 {
        if self.strict_mode {
            1.0
        } else {
            self.threshold
        }
    }

    /// Verdict for `score` against this metric's threshold, reason attached
    /// only when enabled
    pub fn verdict(&self, metric_id: &str, score: f64, reason: impl FnOnce(f64) -> String) -> Verdict {
        let verdict = Verdict::scored(metric_id, score, self.effective_threshold());
        if self.include_reason {
            let text = reason(verdict.score);
            verdict.with_reason(text)
        } else {
            verdict
        }
    }
}

/// Metadata about a metric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricMetadata {
    /// Human-readable name
    pub name: String,

    /// Version string (e.g., "1.0.0")
    pub version: String,

    pub description: String,

    /// Cost per measurement in USD (judge-based metrics)
    pub cost_per_eval: Option<f64>,

    pub avg_latency_ms: Option<u64>,

    pub tags: Vec<String>,
}

/// Errors that can occur while scoring
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Judge error: {0}")]
    Judge(String),

    #[error("Evaluation timeout")]
    Timeout,

    #[error("Task panicked: {0}")]
    Panic(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<LLMError> for EvalError {
    fn from(err: LLMError) -> Self {
        EvalError::Judge(err.to_string())
    }
}

/// Which directions the verdict cache is used in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMode {
    pub read: bool,
    pub write: bool,
}

impl Default for CacheMode {
    fn default() -> Self {
        Self {
            read: false,
            write: true,
        }
    }
}

impl CacheMode {
    pub fn disabled() -> Self {
        Self {
            read: false,
            write: false,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.read || self.write
    }
}

/// Configuration for batch evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Maximum number of units scored concurrently
    pub max_concurrent: usize,

    /// Timeout per metric measurement in seconds
    pub timeout_secs: u64,

    /// Record metric failures as zero-score verdicts instead of aborting
    pub ignore_errors: bool,

    pub cache: CacheMode,

    /// Cache TTL in seconds
    pub cache_ttl_secs: u64,

    /// Also persist verdicts as files under this directory
    pub cache_dir: Option<PathBuf>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            timeout_secs: 120,
            ignore_errors: true,
            cache: CacheMode::default(),
            cache_ttl_secs: 3600,
            cache_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_config_default() {
        let config = EvalConfig::default();
        assert_eq!(config.max_concurrent, 10);
        assert_eq!(config.timeout_secs, 120);
        assert!(config.ignore_errors);
        assert!(!config.cache.read);
        assert!(config.cache.write);
    }

    #[test]
    fn test_strict_mode_threshold() {
        let base = BaseMetric::new(0.7);
        assert_eq!(base.effective_threshold(), 0.7);
        assert_eq!(base.strict(true).effective_threshold(), 1.0);
    }

    #[test]
    fn test_base_verdict_reason_toggle() {
        let base = BaseMetric::new(0.5);
        let verdict = base.verdict("m", 0.6, |s| format!("score {:.1}", s));
        assert!(verdict.success);
        assert_eq!(verdict.reason.as_deref(), Some("score 0.6"));

        let quiet = base.without_reason().verdict("m", 0.4, |_| unreachable!());
        assert!(!quiet.success);
        assert!(quiet.reason.is_none());
    }

    #[test]
    fn test_llm_error_conversion() {
        let err: EvalError = LLMError::InvalidResponse("bad".into()).into();
        assert!(matches!(err, EvalError::Judge(_)));
    }
}
