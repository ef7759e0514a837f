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

//! Token-overlap answer metrics: F1, exact match, ROUGE-1

use crate::{BaseMetric, EvalError, MetricMetadata, Scorable};
use agentbench_core::{EvaluationUnit, Verdict};
use async_trait::async_trait;
use regex::Regex;
use rust_stemmers::{Algorithm, Stemmer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

fn articles() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(a|an|the|and)\b").expect("article pattern is valid"))
}

/// Lowercase, drop ASCII punctuation and articles, collapse whitespace
pub fn normalize_answer(text: &str) -> String {
    let lowered = text.replace(',', "").to_lowercase();
    let no_punct: String = lowered.chars().filter(|c| !c.is_ascii_punctuation()).collect();
    let no_articles = articles().replace_all(&no_punct, " ");
    no_articles.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn stemmer() -> &'static Stemmer {
    static STEMMER: OnceLock<Stemmer> = OnceLock::new();
    STEMMER.get_or_init(|| Stemmer::create(Algorithm::English))
}

fn stemmed_tokens(text: &str) -> Vec<String> {
    let stemmer = stemmer();
    normalize_answer(text)
        .split_whitespace()
        .map(|token| stemmer.stem(token).into_owned())
        .collect()
}

/// Token F1 over stemmed tokens; empty vs empty scores 1.0
pub fn f1_score(prediction: &str, ground_truth: &str) -> f64 {
    let pred = stemmed_tokens(prediction);
    let truth = stemmed_tokens(ground_truth);
    if pred.is_empty() && truth.is_empty() {
        return 1.0;
    }
    if pred.is_empty() || truth.is_empty() {
        return 0.0;
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for token in &truth {
        *counts.entry(token.as_str()).or_insert(0) += 1;
    }
    let mut same = 0usize;
    for token in &pred {
        if let Some(n) = counts.get_mut(token.as_str()) {
            if *n > 0 {
                *n -= 1;
                same += 1;
            }
        }
    }
    if same == 0 {
        return 0.0;
    }
    let precision = same as f64 / pred.len() as f64;
    let recall = same as f64 / truth.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

/// Mean over comma-separated ground truths of the best F1 against any prediction part
pub fn f1_multi_answer(prediction: &str, ground_truth: &str) -> f64 {
    let predictions: Vec<&str> = prediction.split(',').map(str::trim).collect();
    let truths: Vec<&str> = ground_truth.split(',').map(str::trim).collect();
    let total: f64 = truths
        .iter()
        .map(|gt| {
            predictions
                .iter()
                .map(|p| f1_score(p, gt))
                .fold(0.0, f64::max)
        })
        .sum();
    total / truths.len() as f64
}

/// Token-set equality after normalization
pub fn exact_match_score(prediction: &str, ground_truth: &str) -> f64 {
    let pred: BTreeSet<String> = normalize_answer(prediction).split_whitespace().map(str::to_string).collect();
    let truth: BTreeSet<String> = normalize_answer(ground_truth).split_whitespace().map(str::to_string).collect();
    if pred == truth {
        1.0
    } else {
        0.0
    }
}

/// ROUGE-1 F over stemmed unigram sets; an empty hypothesis scores 0
pub fn rouge1_score(prediction: &str, ground_truth: &str) -> f64 {
    let pred: BTreeSet<String> = stemmed_tokens(prediction).into_iter().collect();
    let truth: BTreeSet<String> = stemmed_tokens(ground_truth).into_iter().collect();
    if pred.is_empty() || truth.is_empty() {
        return 0.0;
    }
    let overlap = pred.intersection(&truth).count() as f64;
    if overlap == 0.0 {
        return 0.0;
    }
    let precision = overlap / pred.len() as f64;
    let recall = overlap / truth.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

/// Which overlap measure a [`TextMetric`] computes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMetricKind {
    F1,
    ExactMatch,
    Rouge1,
    MultiAnswerF1,
}

impl TextMetricKind {
    pub fn id(&self) -> &'static str {
        match self {
            TextMetricKind::F1 => "f1",
            TextMetricKind::ExactMatch => "exact_match",
            TextMetricKind::Rouge1 => "rouge",
            TextMetricKind::MultiAnswerF1 => "f1_multi_answer",
        }
    }

    pub fn score(&self, prediction: &str, ground_truth: &str) -> f64 {
        match self {
            TextMetricKind::F1 => f1_score(prediction, ground_truth),
            TextMetricKind::ExactMatch => exact_match_score(prediction, ground_truth),
            TextMetricKind::Rouge1 => rouge1_score(prediction, ground_truth),
            TextMetricKind::MultiAnswerF1 => f1_multi_answer(prediction, ground_truth),
        }
    }
}

/// Compares a unit's actual output with its expected output
#[derive(Debug, Clone)]
pub struct TextMetric {
    kind: TextMetricKind,
    base: BaseMetric,
}

impl TextMetric {
    pub const DEFAULT_THRESHOLD: f64 = 0.5;

    pub fn new(kind: TextMetricKind) -> Self {
        Self {
            kind,
            base: BaseMetric::new(Self::DEFAULT_THRESHOLD),
        }
    }

    pub fn with_base(mut self, base: BaseMetric) -> Self {
        self.base = base;
        self
    }

    pub fn kind(&self) -> TextMetricKind {
        self.kind
    }
}

#[async_trait]
impl Scorable for TextMetric {
    fn id(&self) -> &str {
        self.kind.id()
    }

    async fn measure(&self, unit: &EvaluationUnit) -> Result<Verdict, EvalError> {
        let expected = unit
            .expected_output
            .as_deref()
            .ok_or_else(|| EvalError::MissingField("expected_output".to_string()))?;
        let score = self.kind.score(&unit.actual_output, expected);
        let threshold = self.base.effective_threshold();
        let name = self.kind.id().to_uppercase();
        Ok(self.base.verdict(self.id(), score, |s| {
            if s >= threshold {
                format!("{} score of {:.3} meets the threshold of {}.", name, s, threshold)
            } else {
                format!("{} score of {:.3} is below the threshold of {}.", name, s, threshold)
            }
        }))
    }

    fn base(&self) -> &BaseMetric {
        &self.base
    }

    fn metadata(&self) -> MetricMetadata {
        MetricMetadata {
            name: format!("Text {}", self.kind.id()),
            version: "1.0.0".to_string(),
            description: "Token overlap between actual and expected answers".to_string(),
            cost_per_eval: Some(0.0),
            avg_latency_ms: Some(1),
            tags: vec!["text".to_string(), "deterministic".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_answer() {
        assert_eq!(normalize_answer("The cat, and a DOG!"), "cat dog");
        assert_eq!(normalize_answer("  Paris.  "), "paris");
    }

    #[test]
    fn test_f1_edge_cases() {
        assert_eq!(f1_score("", ""), 1.0);
        assert_eq!(f1_score("the", "a"), 1.0);
        assert_eq!(f1_score("", "paris"), 0.0);
        assert_eq!(f1_score("london", "paris"), 0.0);
    }

    #[test]
    fn test_f1_partial_overlap_with_stemming() {
        // tokens: [cat, run] vs [cat, run, fast]
        let score = f1_score("cats running", "cat runs fast");
        assert!((score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_inflections_share_a_stem() {
        assert_eq!(f1_score("connected", "connection"), 1.0);
        assert_eq!(rouge1_score("hopping ponies", "pony hops"), 1.0);
        assert_eq!(stemmed_tokens("Running cats"), vec!["run".to_string(), "cat".to_string()]);
    }

    #[test]
    fn test_exact_match_is_token_set() {
        assert_eq!(exact_match_score("blue red", "Red, blue."), 1.0);
        assert_eq!(exact_match_score("blue", "blue red"), 0.0);
    }

    #[test]
    fn test_rouge_and_multi_answer() {
        assert_eq!(rouge1_score("", "x"), 0.0);
        assert!((rouge1_score("paris france", "paris") - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(f1_multi_answer("paris, rome", "rome, paris"), 1.0);
        assert_eq!(f1_multi_answer("paris", "rome, paris"), 0.5);
    }

    #[tokio::test]
    async fn test_metric_reason() {
        let mut unit = EvaluationUnit::new("u1", "capital of france?");
        unit.actual_output = "Paris".to_string();
        unit.expected_output = Some("paris".to_string());
        let verdict = TextMetric::new(TextMetricKind::F1).measure(&unit).await.unwrap();
        assert!(verdict.success);
        assert_eq!(verdict.reason.as_deref(), Some("F1 score of 1.000 meets the threshold of 0.5."));
    }

    #[tokio::test]
    async fn test_missing_expected_output() {
        let unit = EvaluationUnit::new("u1", "q");
        let err = TextMetric::new(TextMetricKind::Rouge1).measure(&unit).await.unwrap_err();
        assert!(matches!(err, EvalError::MissingField(_)));
    }
}
