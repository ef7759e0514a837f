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

//! Run results and the CSV/HTML reports

use agentbench_evals::registry::{MetricSummary, UnitReport};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }
}

/// Outcome of one configured task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub name: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub total_units: usize,
    /// Units whose generation failed and were not scored
    pub generation_failures: usize,
    pub pass_rate: f64,
    pub total_cost: f64,
    pub duration_ms: u64,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub units: Vec<UnitReport>,
}

impl TaskResult {
    pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: TaskStatus::Failed,
            error: Some(error.into()),
            total_units: 0,
            generation_failures: 0,
            pass_rate: 0.0,
            total_cost: 0.0,
            duration_ms: 0,
            metrics: BTreeMap::new(),
            units: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResults {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tasks: Vec<TaskResult>,
}

impl RunResults {
    pub fn all_succeeded(&self) -> bool {
        self.tasks.iter().all(|t| t.status == TaskStatus::Success)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))
    }

    /// One row per (task, unit, metric)
    pub fn to_csv(&self) -> String {
        let mut csv = String::new();
        csv.push_str("task,status,unit_id,metric,score,success,reason,error\n");

        for task in &self.tasks {
            if task.units.is_empty() {
                csv.push_str(&format!(
                    "{},{},,,,,,{}\n",
                    escape_csv(&task.name),
                    task.status.as_str(),
                    escape_csv(task.error.as_deref().unwrap_or_default())
                ));
                continue;
            }
            for unit in &task.units {
                for verdict in &unit.verdicts {
                    csv.push_str(&format!(
                        "{},{},{},{},{:.4},{},{},{}\n",
                        escape_csv(&task.name),
                        task.status.as_str(),
                        escape_csv(&unit.unit_id),
                        escape_csv(&verdict.metric_id),
                        verdict.score,
                        verdict.success,
                        escape_csv(verdict.reason.as_deref().unwrap_or_default()),
                        escape_csv(verdict.error.as_deref().unwrap_or_default())
                    ));
                }
            }
        }
        csv
    }

    pub fn to_html(&self) -> String {
        let mut html = String::new();
        html.push_str("<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Agentbench report</title>\n");
        html.push_str(
            "<style>body{font-family:sans-serif;margin:2em}table{border-collapse:collapse;margin-bottom:2em}\
             td,th{border:1px solid #ccc;padding:4px 8px;text-align:left}.success{color:#1a7f37}.failed{color:#cf222e}</style>\n",
        );
        html.push_str("</head><body>\n<h1>Agentbench report</h1>\n");
        let _ = writeln!(
            html,
            "<p>Started {} &middot; finished {}</p>",
            self.started_at.to_rfc3339(),
            self.finished_at.to_rfc3339()
        );

        html.push_str("<table><tr><th>Task</th><th>Status</th><th>Units</th><th>Generation failures</th><th>Pass rate</th><th>Cost (USD)</th><th>Duration (ms)</th></tr>\n");
        for task in &self.tasks {
            let _ = writeln!(
                html,
                "<tr><td>{}</td><td class=\"{status}\">{status}</td><td>{}</td><td>{}</td><td>{:.2}</td><td>{:.4}</td><td>{}</td></tr>",
                escape_html(&task.name),
                task.total_units,
                task.generation_failures,
                task.pass_rate,
                task.total_cost,
                task.duration_ms,
                status = task.status.as_str(),
            );
        }
        html.push_str("</table>\n");

        for task in &self.tasks {
            let _ = writeln!(html, "<h2>{}</h2>", escape_html(&task.name));
            if let Some(error) = &task.error {
                let _ = writeln!(html, "<p class=\"failed\">{}</p>", escape_html(error));
            }
            if task.metrics.is_empty() {
                continue;
            }
            html.push_str("<table><tr><th>Metric</th><th>Count</th><th>Mean score</th><th>Pass rate</th><th>Errors</th></tr>\n");
            for (metric, summary) in &task.metrics {
                let _ = writeln!(
                    html,
                    "<tr><td>{}</td><td>{}</td><td>{:.3}</td><td>{:.2}</td><td>{}</td></tr>",
                    escape_html(metric),
                    summary.count,
                    summary.mean_score,
                    summary.pass_rate(),
                    summary.errors
                );
            }
            html.push_str("</table>\n");
        }

        html.push_str("</body></html>\n");
        html
    }

    /// `report.csv` and `report.html` under `dir`
    pub fn write_reports(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        std::fs::write(dir.join("report.csv"), self.to_csv()).context("Failed to write report.csv")?;
        std::fs::write(dir.join("report.html"), self.to_html()).context("Failed to write report.html")?;
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
    }
    Ok(())
}

fn escape_csv(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
