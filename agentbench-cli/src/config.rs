// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use agentbench_evals::metrics::{is_known_metric, requires_judge, MetricOptions};
use agentbench_evals::{CacheMode, EvalConfig, RunnerConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Benchmark run configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
    #[serde(default)]
    pub judge: Option<JudgeConfig>,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// How a task obtains agent responses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    /// Build units directly from dataset rows and their trace files
    #[default]
    Offline,
    /// Feed recorded responses through the generation runner and its cache
    Replay,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskConfig {
    pub name: String,

    /// JSONL or JSON-array dataset
    pub dataset: PathBuf,

    /// Directory trace files are resolved against (defaults to the dataset's directory)
    #[serde(default)]
    pub traces_dir: Option<PathBuf>,

    #[serde(default)]
    pub mode: TaskMode,

    pub metrics: Vec<String>,

    /// Per-metric overrides keyed by metric name
    #[serde(default)]
    pub metric_options: BTreeMap<String, MetricOptions>,
}

impl TaskConfig {
    pub fn options_for(&self, metric: &str) -> MetricOptions {
        self.metric_options.get(metric).cloned().unwrap_or_default()
    }

    pub fn traces_root(&self) -> PathBuf {
        match &self.traces_dir {
            Some(dir) => dir.clone(),
            None => self
                .dataset
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JudgeConfig {
    /// `openai` or `anthropic`
    #[serde(default = "default_provider")]
    pub provider: String,

    pub model: String,

    /// OpenAI-compatible endpoint override
    #[serde(default)]
    pub base_url: Option<String>,

    /// Falls back to OPENAI_API_KEY / ANTHROPIC_API_KEY
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub requests_per_second: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Units scored concurrently
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Agent calls in flight (replay mode)
    #[serde(default = "default_generation_concurrency")]
    pub generation_concurrency: usize,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_true")]
    pub ignore_errors: bool,

    #[serde(default)]
    pub cache_read: bool,

    #[serde(default = "default_true")]
    pub cache_write: bool,

    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Run tasks concurrently
    #[serde(default = "default_true")]
    pub parallel: bool,

    #[serde(default = "default_trials")]
    pub trials_per_task: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_results_path")]
    pub results_path: PathBuf,

    /// Where report.csv and report.html are written
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_max_concurrent() -> usize {
    10
}

fn default_generation_concurrency() -> usize {
    5
}

fn default_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_trials() -> usize {
    1
}

fn default_results_path() -> PathBuf {
    PathBuf::from("results/results.json")
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("results")
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            generation_concurrency: default_generation_concurrency(),
            timeout_secs: default_timeout(),
            ignore_errors: true,
            cache_read: false,
            cache_write: true,
            cache_dir: None,
            parallel: true,
            trials_per_task: default_trials(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            results_path: default_results_path(),
            report_dir: default_report_dir(),
        }
    }
}

pub const TEMPLATE: &str = r#"# Agentbench task configuration

[execution]
# Units scored concurrently
max_concurrent = 10
# Agent calls in flight when replaying
generation_concurrency = 5
# Per-metric timeout in seconds
timeout_secs = 120
# Record metric failures as zero-score verdicts instead of aborting
ignore_errors = true
cache_read = false
cache_write = true
# cache_dir = ".cache/agentbench"
# Run tasks concurrently (overridden by `run --sequential`)
parallel = true
trials_per_task = 1

[output]
results_path = "results/results.json"
report_dir = "results"

# Required by mcp_tool_judge
# [judge]
# provider = "openai"          # or "anthropic"
# model = "gpt-4o-mini"
# base_url = "https://api.openai.com/v1"
# api_key = "..."              # defaults to OPENAI_API_KEY / ANTHROPIC_API_KEY
# requests_per_second = 5

[[tasks]]
name = "example"
# JSONL or JSON array; column aliases such as answer/response/trace_id are accepted
dataset = "data/example.jsonl"
# traces_dir = "data/traces"
# offline: score recorded traces directly; replay: go through the generation runner
mode = "offline"
metrics = ["tool_accuracy", "f1", "performance"]

# [tasks.metric_options.f1]
# threshold = 0.6
"#;

impl BenchConfig {
    /// Load from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file {:?}", path))
    }

    /// Load configuration with priority: env > file > defaults
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let config = if let Some(path) = config_file {
            if path.exists() {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(&path)?
            } else {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
        } else {
            Self::default()
        };

        Ok(Self::merge_with_env(config))
    }

    fn merge_with_env(mut config: Self) -> Self {
        if let Ok(value) = std::env::var("AGENTBENCH_MAX_CONCURRENT") {
            if let Ok(n) = value.parse() {
                config.execution.max_concurrent = n;
            }
        }

        if let Ok(value) = std::env::var("AGENTBENCH_MAX_CONCURRENCY") {
            if let Ok(n) = value.parse() {
                config.execution.generation_concurrency = n;
            }
        }

        if let Ok(dir) = std::env::var("AGENTBENCH_CACHE_DIR") {
            config.execution.cache_dir = Some(PathBuf::from(dir));
        }

        if let Some(judge) = config.judge.as_mut() {
            if judge.api_key.is_none() {
                let var = match judge.provider.as_str() {
                    "anthropic" => "ANTHROPIC_API_KEY",
                    _ => "OPENAI_API_KEY",
                };
                judge.api_key = std::env::var(var).ok();
            }
        }

        config
    }

    /// Every problem found; empty when the configuration is runnable
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.tasks.is_empty() {
            problems.push("no [[tasks]] configured".to_string());
        }
        if self.execution.max_concurrent == 0 {
            problems.push("execution.max_concurrent must be at least 1".to_string());
        }

        let mut needs_judge = false;
        for task in &self.tasks {
            if task.name.trim().is_empty() {
                problems.push("task with an empty name".to_string());
            }
            if !task.dataset.exists() {
                problems.push(format!("task {}: dataset {:?} not found", task.name, task.dataset));
            }
            if task.metrics.is_empty() {
                problems.push(format!("task {}: no metrics", task.name));
            }
            for metric in &task.metrics {
                if !is_known_metric(metric) {
                    problems.push(format!("task {}: unknown metric {}", task.name, metric));
                }
                needs_judge |= requires_judge(metric);
            }
            for name in task.metric_options.keys() {
                if !task.metrics.contains(name) {
                    problems.push(format!("task {}: options for unused metric {}", task.name, name));
                }
            }
        }

        let mut names: Vec<&str> = self.tasks.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            problems.push("task names must be unique".to_string());
        }

        match &self.judge {
            Some(judge) => {
                if !matches!(judge.provider.as_str(), "openai" | "anthropic") {
                    problems.push(format!("judge.provider {} is not openai or anthropic", judge.provider));
                }
                if judge.model.trim().is_empty() {
                    problems.push("judge.model is empty".to_string());
                }
                if needs_judge && judge.api_key.is_none() {
                    problems.push("judge API key missing (set judge.api_key or the provider's env var)".to_string());
                }
            }
            None if needs_judge => problems.push("mcp_tool_judge requires a [judge] section".to_string()),
            None => {}
        }

        problems
    }

    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Invalid configuration:\n  - {}", problems.join("\n  - "))
        }
    }

    pub fn eval_config(&self) -> EvalConfig {
        let exec = &self.execution;
        EvalConfig {
            max_concurrent: exec.max_concurrent,
            timeout_secs: exec.timeout_secs,
            ignore_errors: exec.ignore_errors,
            cache: CacheMode {
                read: exec.cache_read,
                write: exec.cache_write,
            },
            cache_dir: exec.cache_dir.as_ref().map(|d| d.join("verdicts")),
            ..Default::default()
        }
    }

    pub fn runner_config(&self, task: &TaskConfig) -> RunnerConfig {
        let exec = &self.execution;
        let mut config = RunnerConfig {
            max_concurrency: exec.generation_concurrency,
            cache_enabled: exec.cache_read || exec.cache_write,
            trials_per_task: exec.trials_per_task,
            ..Default::default()
        }
        .with_task_name(task.name.clone());
        if let Some(dir) = &exec.cache_dir {
            config.cache_dir = dir.join("generations");
        }
        config
    }
}
