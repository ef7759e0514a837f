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

//! Metric registry and batch execution engine

use crate::cache::{verdict_key, CacheStats, FileVerdictCache, VerdictCache};
use crate::{EvalConfig, EvalError, Scorable};
use agentbench_core::{EvaluationUnit, Verdict};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Runs every registered metric over a list of units
pub struct BatchEvaluator {
    metrics: Arc<RwLock<Vec<Arc<dyn Scorable>>>>,
    config: EvalConfig,
    cache: Option<Arc<VerdictCache>>,
    file_cache: Option<Arc<FileVerdictCache>>,
}

/// Verdicts for one unit, in metric registration order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitReport {
    pub unit_id: String,
    pub verdicts: Vec<Verdict>,
    /// Every verdict succeeded
    pub success: bool,
}

impl UnitReport {
    fn new(unit_id: String, verdicts: Vec<Verdict>) -> Self {
        let success = verdicts.iter().all(|v| v.success);
        Self {
            unit_id,
            verdicts,
            success,
        }
    }

    pub fn verdict(&self, metric_id: &str) -> Option<&Verdict> {
        self.verdicts.iter().find(|v| v.metric_id == metric_id)
    }
}

/// Per-metric aggregate over a batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: usize,
    pub passed: usize,
    pub errors: usize,
    pub mean_score: f64,
}

impl MetricSummary {
    pub fn pass_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.passed as f64 / self.count as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    /// One entry per unit, in submission order
    pub units: Vec<UnitReport>,
    pub duration_ms: u64,
    pub cache: Option<CacheStats>,
}

impl BatchReport {
    /// Fraction of units whose verdicts all succeeded
    pub fn pass_rate(&self) -> f64 {
        if self.units.is_empty() {
            return 0.0;
        }
        let passed = self.units.iter().filter(|u| u.success).count();
        passed as f64 / self.units.len() as f64
    }

    pub fn metric_summaries(&self) -> BTreeMap<String, MetricSummary> {
        let mut summaries: BTreeMap<String, MetricSummary> = BTreeMap::new();
        for verdict in self.units.iter().flat_map(|u| &u.verdicts) {
            let entry = summaries.entry(verdict.metric_id.clone()).or_default();
            // Running mean
            entry.count += 1;
            entry.mean_score += (verdict.score - entry.mean_score) / entry.count as f64;
            if verdict.success {
                entry.passed += 1;
            }
            if verdict.error.is_some() {
                entry.errors += 1;
            }
        }
        summaries
    }

    pub fn total_cost(&self) -> f64 {
        self.units
            .iter()
            .flat_map(|u| &u.verdicts)
            .filter_map(|v| v.cost)
            .sum()
    }

    pub fn error_count(&self) -> usize {
        self.units
            .iter()
            .flat_map(|u| &u.verdicts)
            .filter(|v| v.error.is_some())
            .count()
    }
}

impl BatchEvaluator {
    pub fn new(config: EvalConfig) -> Self {
        let cache = if config.cache.is_enabled() {
            Some(Arc::new(VerdictCache::new(config.cache_ttl_secs)))
        } else {
            None
        };
        let file_cache = match (&config.cache_dir, config.cache.is_enabled()) {
            (Some(dir), true) => Some(Arc::new(FileVerdictCache::new(dir.clone()))),
            _ => None,
        };

        Self {
            metrics: Arc::new(RwLock::new(Vec::new())),
            config,
            cache,
            file_cache,
        }
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    /// Register a new metric
    pub fn register(&self, metric: Arc<dyn Scorable>) -> Result<(), BatchError> {
        let id = metric.id().to_string();
        let mut metrics = self.metrics.write();

        if metrics.iter().any(|m| m.id() == id) {
            return Err(BatchError::DuplicateId(id));
        }

        info!("Registering metric: {} ({})", metric.metadata().name, id);
        metrics.push(metric);
        Ok(())
    }

    /// Unregister a metric by ID
    pub fn unregister(&self, metric_id: &str) -> Result<(), BatchError> {
        let mut metrics = self.metrics.write();
        let position = metrics
            .iter()
            .position(|m| m.id() == metric_id)
            .ok_or_else(|| BatchError::NotFound(metric_id.to_string()))?;
        metrics.remove(position);

        info!("Unregistered metric: {}", metric_id);
        Ok(())
    }

    pub fn list_metrics(&self) -> Vec<String> {
        self.metrics.read().iter().map(|m| m.id().to_string()).collect()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    /// Score every unit with every registered metric.
    ///
    /// At most `max_concurrent` units are in flight. With `ignore_errors`
    /// a failing metric yields a zero-score verdict carrying the error;
    /// without it the first failure aborts the batch.
    pub async fn evaluate(&self, units: Vec<EvaluationUnit>) -> Result<BatchReport, BatchError> {
        let start = Instant::now();
        let metrics: Vec<Arc<dyn Scorable>> = self.metrics.read().clone();
        if metrics.is_empty() {
            warn!("Evaluating {} units with no registered metrics", units.len());
        }

        info!(
            "Starting batch evaluation: {} units, {} metrics, concurrency {}",
            units.len(),
            metrics.len(),
            self.config.max_concurrent
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        for (index, unit) in units.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let scorer = UnitScorer {
                metrics: metrics.clone(),
                config: self.config.clone(),
                cache: self.cache.clone(),
                file_cache: self.file_cache.clone(),
            };

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| BatchError::TaskPanic(e.to_string()))?;
                let report = scorer.score(Arc::new(unit)).await?;
                Ok::<_, BatchError>((index, report))
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(entry)) => reports.push(entry),
                Ok(Err(e)) => {
                    tasks.abort_all();
                    error!("Batch evaluation aborted: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    tasks.abort_all();
                    error!("Task panicked: {}", e);
                    return Err(BatchError::TaskPanic(e.to_string()));
                }
            }
        }
        reports.sort_by_key(|(index, _)| *index);

        let report = BatchReport {
            units: reports.into_iter().map(|(_, r)| r).collect(),
            duration_ms: start.elapsed().as_millis() as u64,
            cache: self.cache_stats(),
        };

        info!(
            "Batch evaluation finished: {} units in {} ms, pass rate {:.2}, {} errors",
            report.units.len(),
            report.duration_ms,
            report.pass_rate(),
            report.error_count()
        );

        Ok(report)
    }
}

/// Per-unit view of the evaluator, moved into each unit task
struct UnitScorer {
    metrics: Vec<Arc<dyn Scorable>>,
    config: EvalConfig,
    cache: Option<Arc<VerdictCache>>,
    file_cache: Option<Arc<FileVerdictCache>>,
}

impl UnitScorer {
    /// Measures every metric concurrently inside the caller's task, so
    /// aborting that task cancels all in-flight measurements.
    async fn score(&self, unit: Arc<EvaluationUnit>) -> Result<UnitReport, BatchError> {
        let outcomes = join_all(self.metrics.iter().map(|metric| {
            AssertUnwindSafe(self.measure(metric, &unit))
                .catch_unwind()
                .map(flatten_caught)
        }))
        .await;

        let mut verdicts = Vec::with_capacity(outcomes.len());
        for (metric, outcome) in self.metrics.iter().zip(outcomes) {
            match outcome {
                Ok(verdict) => verdicts.push(verdict),
                Err(e) if self.config.ignore_errors => {
                    error!("Metric {} failed on unit {}: {}", metric.id(), unit.id, e);
                    verdicts.push(Verdict::failed(metric.id(), e.to_string()));
                }
                Err(e) => {
                    return Err(BatchError::MetricFailed {
                        unit: unit.id.clone(),
                        metric: metric.id().to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }

        Ok(UnitReport::new(unit.id.clone(), verdicts))
    }

    async fn measure(&self, metric: &Arc<dyn Scorable>, unit: &EvaluationUnit) -> Result<Verdict, EvalError> {
        let key = verdict_key(unit, metric.id());

        if self.config.cache.read {
            if let Some(mut verdict) = self.cached(&key).await {
                debug!("Cache hit for unit {} metric {}", unit.id, metric.id());
                verdict.success = metric.is_successful(&verdict);
                return Ok(verdict);
            }
            debug!("Cache miss for unit {} metric {}", unit.id, metric.id());
        }

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let start = Instant::now();
        let mut verdict = tokio::time::timeout(timeout, metric.measure(unit))
            .await
            .map_err(|_| EvalError::Timeout)??;
        verdict.success = metric.is_successful(&verdict);
        verdict.duration_ms = Some(start.elapsed().as_millis() as u64);

        if self.config.cache.write {
            self.store(key, &verdict).await;
        }
        Ok(verdict)
    }

    async fn cached(&self, key: &str) -> Option<Verdict> {
        if let Some(cache) = &self.cache {
            if let Some(verdict) = cache.get(key).await {
                return Some(verdict);
            }
        }
        let file_cache = self.file_cache.as_ref()?;
        match file_cache.get(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Verdict cache file {} unreadable: {}", key, e);
                None
            }
        }
    }

    async fn store(&self, key: String, verdict: &Verdict) {
        if let Some(file_cache) = &self.file_cache {
            if let Err(e) = file_cache.put(&key, verdict).await {
                warn!("Failed to persist verdict {}: {}", key, e);
            }
        }
        if let Some(cache) = &self.cache {
            cache.insert(key, verdict.clone()).await;
        }
    }
}

fn flatten_caught(caught: std::thread::Result<Result<Verdict, EvalError>>) -> Result<Verdict, EvalError> {
    caught.unwrap_or_else(|panic| Err(EvalError::Panic(panic_message(panic.as_ref()))))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "metric panicked".to_string()
    }
}

/// Errors raised by the batch evaluator
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Duplicate metric ID: {0}")]
    DuplicateId(String),

    #[error("Metric not found: {0}")]
    NotFound(String),

    #[error("Metric {metric} failed on unit {unit}: {message}")]
    MetricFailed {
        unit: String,
        metric: String,
        message: String,
    },

    #[error("Task panicked: {0}")]
    TaskPanic(String),
}
