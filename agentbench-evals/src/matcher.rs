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

//! Tool-call matching
//!
//! The matcher answers a single yes/no per trial. Partial credit belongs to
//! the metrics built on top of it.

use agentbench_core::{ToolCallExpected, ToolCallRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Largest absolute difference at which two numbers still match semantically
pub const NUMERIC_TOLERANCE: f64 = 0.01;

/// How tool names are compared
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolMatchStrategy {
    /// Same set of names, order ignored
    #[default]
    Exact,
    /// Every called tool was expected
    Subset,
    /// At least one called tool was expected
    Overlap,
    /// Exact name sets, and each expected call's parameters match semantically
    Semantic,
}

impl fmt::Display for ToolMatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ToolMatchStrategy::Exact => "exact",
            ToolMatchStrategy::Subset => "subset",
            ToolMatchStrategy::Overlap => "overlap",
            ToolMatchStrategy::Semantic => "semantic",
        };
        f.write_str(name)
    }
}

impl FromStr for ToolMatchStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "exact" => Ok(Self::Exact),
            "subset" => Ok(Self::Subset),
            "overlap" => Ok(Self::Overlap),
            "semantic" => Ok(Self::Semantic),
            other => Err(format!("unknown tool matching strategy: {}", other)),
        }
    }
}

/// How parameter maps are compared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ParameterStrategy {
    Exact,
    /// Key sets only; with `required_only`, expected keys ⊆ actual keys
    KeyMatch { required_only: bool },
    Semantic,
}

impl Default for ParameterStrategy {
    fn default() -> Self {
        Self::Exact
    }
}

impl FromStr for ParameterStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "exact" => Ok(Self::Exact),
            "key_match" => Ok(Self::KeyMatch { required_only: false }),
            "key_match_required" | "required_only" => Ok(Self::KeyMatch { required_only: true }),
            "semantic" => Ok(Self::Semantic),
            other => Err(format!("unknown parameter matching strategy: {}", other)),
        }
    }
}

/// Name-level comparison under a strategy (semantic compares like exact here)
pub fn match_tool_names<'a>(
    strategy: ToolMatchStrategy,
    actual: impl IntoIterator<Item = &'a str>,
    expected: impl IntoIterator<Item = &'a str>,
) -> bool {
    let actual: BTreeSet<&str> = actual.into_iter().collect();
    let expected: BTreeSet<&str> = expected.into_iter().collect();
    match strategy {
        ToolMatchStrategy::Exact | ToolMatchStrategy::Semantic => actual == expected,
        ToolMatchStrategy::Subset => actual.is_subset(&expected),
        ToolMatchStrategy::Overlap => !actual.is_disjoint(&expected),
    }
}

/// Compare two parameter maps under a strategy
pub fn parameters_match(strategy: ParameterStrategy, actual: &Map<String, Value>, expected: &Map<String, Value>) -> bool {
    match strategy {
        ParameterStrategy::Exact => actual == expected,
        ParameterStrategy::KeyMatch { required_only: true } => {
            expected.keys().all(|k| actual.contains_key(k))
        }
        ParameterStrategy::KeyMatch { required_only: false } => {
            actual.keys().collect::<BTreeSet<_>>() == expected.keys().collect::<BTreeSet<_>>()
        }
        ParameterStrategy::Semantic => {
            actual.len() == expected.len()
                && expected
                    .iter()
                    .all(|(k, e)| actual.get(k).map(|a| values_match(a, e)).unwrap_or(false))
        }
    }
}

/// Semantic value equality: strings ignore case and surrounding whitespace,
/// numbers match within [`NUMERIC_TOLERANCE`], everything else is exact
pub fn values_match(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::String(a), Value::String(e)) => a.trim().to_lowercase() == e.trim().to_lowercase(),
        (Value::Number(a), Value::Number(e)) => match (a.as_f64(), e.as_f64()) {
            (Some(a), Some(e)) => (a - e).abs() <= NUMERIC_TOLERANCE,
            _ => a == e,
        },
        _ => actual == expected,
    }
}

/// Whether the parameters of the actual calls satisfy the expected calls.
///
/// Each expected call that was made needs at least one same-named call
/// whose parameters match. Fails when no expected tool was called at all.
pub fn parameters_correct(
    strategy: ParameterStrategy,
    actual: &[ToolCallRecord],
    expected: &[ToolCallExpected],
) -> bool {
    if actual.is_empty() || expected.is_empty() {
        return false;
    }
    let mut any_called = false;
    for exp in expected {
        let candidates: Vec<&ToolCallRecord> = actual.iter().filter(|a| a.name == exp.name).collect();
        if candidates.is_empty() {
            continue;
        }
        any_called = true;
        if !candidates
            .iter()
            .any(|a| parameters_match(strategy, &a.input_parameters, &exp.input_parameters))
        {
            return false;
        }
    }
    any_called
}

/// Matches one trial's actual calls against the expected calls
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolCallMatcher {
    strategy: ToolMatchStrategy,
}

impl ToolCallMatcher {
    pub fn new(strategy: ToolMatchStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ToolMatchStrategy {
        self.strategy
    }

    pub fn matches(&self, actual: &[ToolCallRecord], expected: &[ToolCallExpected]) -> bool {
        let names_ok = match_tool_names(
            self.strategy,
            actual.iter().map(|c| c.name.as_str()),
            expected.iter().map(|c| c.name.as_str()),
        );
        if !names_ok || self.strategy != ToolMatchStrategy::Semantic {
            return names_ok;
        }
        expected.iter().all(|exp| {
            actual
                .iter()
                .filter(|a| a.name == exp.name)
                .any(|a| parameters_match(ParameterStrategy::Semantic, &a.input_parameters, &exp.input_parameters))
        })
    }
}
