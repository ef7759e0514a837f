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

//! Agentbench Core
//!
//! Data model shared by the trace analysis, matching and scoring crates:
//! spans, tool call records, evaluation units, verdicts, and the retry and
//! rate-limit primitives used around external services.

pub mod eval_result;
pub mod eval_unit;
pub mod event;
pub mod resilience;
pub mod span;
pub mod tool;

pub use eval_result::{clamp_score, Verdict};
pub use eval_unit::{ConversationTurn, EvaluationUnit, ToolExecutionStats, TrialRecord};
pub use event::SpanEvent;
pub use resilience::{
    is_retryable_message, retry_with_backoff, RateLimiter, RetryError, RetryPolicy, Retryable,
    TokenBucketLimiter, UnlimitedRateLimiter,
};
pub use span::SpanRecord;
pub use tool::{AvailableTool, ToolCallExpected, ToolCallRecord, DEFAULT_SERVER};
