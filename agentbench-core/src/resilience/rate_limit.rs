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

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use std::num::NonZeroU32;

/// Outbound request-rate governor, injected into whatever talks to a
/// rate-limited external service.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Wait until one more request is allowed, then record it
    async fn acquire(&self);
}

/// Allows everything
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedRateLimiter;

#[async_trait]
impl RateLimiter for UnlimitedRateLimiter {
    async fn acquire(&self) {}
}

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// GCRA token bucket: bursts up to the quota, then one request per
/// replenish interval
pub struct TokenBucketLimiter {
    inner: DirectLimiter,
}

impl TokenBucketLimiter {
    pub fn per_second(max_requests: usize) -> Self {
        Self::with_quota(Quota::per_second(non_zero(max_requests)))
    }

    pub fn per_minute(max_requests: usize) -> Self {
        Self::with_quota(Quota::per_minute(non_zero(max_requests)))
    }

    pub fn with_quota(quota: Quota) -> Self {
        Self {
            inner: governor::RateLimiter::direct(quota),
        }
    }

    /// Take a cell without waiting; false when the bucket is empty
    pub fn try_acquire(&self) -> bool {
        self.inner.check().is_ok()
    }
}

fn non_zero(n: usize) -> NonZeroU32 {
    NonZeroU32::new(u32::try_from(n).unwrap_or(u32::MAX)).unwrap_or(NonZeroU32::MIN)
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn acquire(&self) {
        self.inner.until_ready().await;
    }
}
