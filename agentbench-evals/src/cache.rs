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

//! Caching layer for verdicts and agent generations
//!
//! Files are written to `<key>.json.tmp` and renamed into place so a
//! concurrent reader never sees a partial entry.

use agentbench_core::{AvailableTool, EvaluationUnit, ToolCallRecord, Verdict};
use chrono::Utc;
use moka::future::Cache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Content-addressed key for one (unit, metric) measurement
pub fn verdict_key(unit: &EvaluationUnit, metric_id: &str) -> String {
    sha256_hex(&[&unit.input, &unit.actual_output, metric_id])
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Counters {
    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn stats(&self, entry_count: u64) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            entry_count,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entry_count: u64,
}

/// In-memory verdict cache
pub struct VerdictCache {
    cache: Cache<String, Verdict>,
    counters: Arc<Counters>,
}

impl VerdictCache {
    /// Create a new cache with specified TTL in seconds
    pub fn new(ttl_secs: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        Self {
            cache,
            counters: Arc::new(Counters::default()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Verdict> {
        let found = self.cache.get(key).await;
        self.counters.record(found.is_some());
        found
    }

    pub async fn insert(&self, key: String, verdict: Verdict) {
        self.cache.insert(key, verdict).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.stats(self.cache.entry_count())
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CacheError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Verdicts persisted as `<dir>/<key>.json`
pub struct FileVerdictCache {
    dir: PathBuf,
    counters: Counters,
}

impl FileVerdictCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            counters: Counters::default(),
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    pub async fn get(&self, key: &str) -> Result<Option<Verdict>, CacheError> {
        let found = read_json::<Verdict>(&self.path(key)).await?;
        self.counters.record(found.is_some());
        Ok(found)
    }

    pub async fn put(&self, key: &str, verdict: &Verdict) -> Result<(), CacheError> {
        write_json_atomic(&self.path(key), verdict).await
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.stats(0)
    }
}

/// One cached agent generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub agent_id: String,
    pub task_name: String,
    pub testcase_input_hash: String,
    pub success: bool,
    #[serde(default)]
    pub response: Option<String>,
    /// Raw trace as the agent returned it
    #[serde(default)]
    pub trace_data: Value,
    #[serde(default)]
    pub tools_called: Vec<ToolCallRecord>,
    #[serde(default)]
    pub available_tools: BTreeMap<String, AvailableTool>,
    pub timestamp: String,
}

impl GenerationRecord {
    pub fn new(task_name: &str, agent_id: &str, input: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            task_name: task_name.to_string(),
            testcase_input_hash: input_hash(input),
            success: false,
            response: None,
            trace_data: Value::Null,
            tools_called: Vec::new(),
            available_tools: BTreeMap::new(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Only a successful generation with a response may be reused
    pub fn is_reusable(&self) -> bool {
        self.success && self.response.as_deref().is_some_and(|r| !r.is_empty())
    }
}

/// First 24 hex characters of SHA-256(input)
pub fn input_hash(input: &str) -> String {
    let digest = hex::encode(Sha256::digest(input.as_bytes()));
    digest[..24].to_string()
}

/// Agent generations persisted per (task, agent, input)
pub struct GenerationCache {
    dir: PathBuf,
    counters: Counters,
}

impl GenerationCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            counters: Counters::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `{task}__{agent}__{input_hash}`
    pub fn key(task_name: &str, agent_id: &str, input: &str) -> String {
        format!("{}__{}__{}", task_name, agent_id, input_hash(input))
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// A reusable record for `key`, if any. Unreadable entries count as misses.
    pub async fn load(&self, key: &str) -> Option<GenerationRecord> {
        let record = match read_json::<GenerationRecord>(&self.path(key)).await {
            Ok(record) => record.filter(GenerationRecord::is_reusable),
            Err(e) => {
                debug!("Ignoring unreadable generation cache entry {}: {}", key, e);
                None
            }
        };
        self.counters.record(record.is_some());
        debug!(
            "Generation cache {} for {}",
            if record.is_some() { "hit" } else { "miss" },
            key
        );
        record
    }

    pub async fn store(&self, key: &str, record: &GenerationRecord) -> Result<(), CacheError> {
        write_json_atomic(&self.path(key), record).await
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.stats(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_verdict_cache_stats() {
        let cache = VerdictCache::new(3600);
        let unit = EvaluationUnit::new("u1", "q");
        let key = verdict_key(&unit, "f1");

        // Miss
        assert!(cache.get(&key).await.is_none());

        // Hit
        cache.insert(key.clone(), Verdict::scored("f1", 0.8, 0.5)).await;
        assert_eq!(cache.get(&key).await.unwrap().score, 0.8);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[test]
    fn test_verdict_key_is_content_addressed() {
        let a = EvaluationUnit::new("u1", "q");
        let b = EvaluationUnit::new("u2", "q");
        assert_eq!(verdict_key(&a, "f1"), verdict_key(&b, "f1"));
        assert_ne!(verdict_key(&a, "f1"), verdict_key(&a, "rouge"));
        assert_eq!(verdict_key(&a, "f1").len(), 64);
    }

    #[tokio::test]
    async fn test_file_verdict_cache_round_trip() {
        let dir = tempdir().unwrap();
        let cache = FileVerdictCache::new(dir.path());
        assert!(cache.get("k").await.unwrap().is_none());

        let verdict = Verdict::scored("f1", 0.25, 0.5).with_reason("low");
        cache.put("k", &verdict).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(verdict));
        assert!(!dir.path().join("k.json.tmp").exists());
    }

    #[test]
    fn test_generation_key_format() {
        let key = GenerationCache::key("weather", "agent-a", "hello");
        let parts: Vec<&str> = key.split("__").collect();
        assert_eq!(parts[0], "weather");
        assert_eq!(parts[1], "agent-a");
        assert_eq!(parts[2].len(), 24);
        assert_eq!(parts[2], &hex::encode(Sha256::digest(b"hello"))[..24]);
    }

    #[tokio::test]
    async fn test_generation_cache_requires_success_and_response() {
        let dir = tempdir().unwrap();
        let cache = GenerationCache::new(dir.path().join("gen"));
        let key = GenerationCache::key("t", "a", "input");

        let mut record = GenerationRecord::new("t", "a", "input");
        record.trace_data = json!([{"name": "call_llm"}]);
        cache.store(&key, &record).await.unwrap();
        assert!(cache.load(&key).await.is_none());

        record.success = true;
        record.response = Some("answer".into());
        cache.store(&key, &record).await.unwrap();
        let loaded = cache.load(&key).await.unwrap();
        assert_eq!(loaded.response.as_deref(), Some("answer"));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_corrupt_generation_entry_is_a_miss() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let cache = GenerationCache::new(dir.path());
        assert!(cache.load("bad").await.is_none());
    }
}
