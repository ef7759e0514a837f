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

//! Unbiased pass@k estimation
//!
//! `pass@k = 1 - C(n-c, k) / C(n, k)`: the probability that a sample of `k`
//! of the `n` observed trials, drawn without replacement, contains at least
//! one of the `c` successes. The ratio is computed as a log-space product so
//! large `n` cannot overflow.

/// Estimate pass@k for `n` trials with `c` successes.
///
/// Returns exactly 1.0 when `n - c < k`, or when every one of `n > 0`
/// trials succeeded. `c` is clamped to `n`.
pub fn estimate(n: u64, c: u64, k: u64) -> f64 {
    let c = c.min(n);
    if n > 0 && c == n {
        return 1.0;
    }
    if n - c < k {
        return 1.0;
    }

    let failures = (n - c) as f64;
    let total = n as f64;
    let log_prob: f64 = (0..k)
        .map(|i| (failures - i as f64).ln() - (total - i as f64).ln())
        .sum();
    let estimate = 1.0 - log_prob.exp();

    if estimate.is_finite() {
        estimate.clamp(0.0, 1.0)
    } else if n == 0 {
        0.0
    } else {
        (c as f64 / n as f64 * k as f64).min(1.0)
    }
}

/// Element-wise pass@k over parallel arrays of trial and success counts
pub fn estimate_batch(num_trials: &[u64], num_passed: &[u64], k: u64) -> Vec<f64> {
    num_trials
        .iter()
        .zip(num_passed)
        .map(|(&n, &c)| estimate(n, c, k))
        .collect()
}

/// Pad per-trial outcomes with failures up to `trials`
pub fn pad_trials(mut outcomes: Vec<bool>, trials: usize) -> Vec<bool> {
    if outcomes.len() < trials {
        outcomes.resize(trials, false);
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_boundaries() {
        assert_eq!(estimate(5, 5, 3), 1.0);
        assert_eq!(estimate(5, 0, 5), 0.0);
        // n - c == k: exactly one all-failure subset
        assert!((estimate(5, 2, 3) - 0.9).abs() < 1e-12);
        // n - c < k
        assert_eq!(estimate(5, 3, 3), 1.0);
    }

    #[test]
    fn test_known_values() {
        // 1 - C(8,1)/C(10,1)
        assert!((estimate(10, 2, 1) - 0.2).abs() < 1e-12);
        // 1 - C(8,2)/C(10,2) = 1 - 28/45
        assert!((estimate(10, 2, 2) - 17.0 / 45.0).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert_eq!(estimate(0, 0, 0), 0.0);
        assert_eq!(estimate(0, 0, 1), 1.0);
        assert_eq!(estimate(3, 9, 1), 1.0);
        assert_eq!(estimate(3, 1, 0), 0.0);
    }

    #[test]
    fn test_batch_and_padding() {
        assert_eq!(estimate_batch(&[5, 4], &[5, 0], 2), vec![1.0, 0.0]);
        assert_eq!(pad_trials(vec![true], 3), vec![true, false, false]);
        assert_eq!(pad_trials(vec![true, true], 1).len(), 2);
    }

    proptest! {
        #[test]
        fn prop_bounded(n in 0u64..200, c_frac in 0.0f64..=1.0, k_frac in 0.0f64..=1.0) {
            let c = (n as f64 * c_frac) as u64;
            let k = (n as f64 * k_frac) as u64;
            let p = estimate(n, c, k);
            prop_assert!((0.0..=1.0).contains(&p));
        }

        #[test]
        fn prop_full_success_is_certain(n in 1u64..200, k_frac in 0.0f64..=1.0) {
            let k = (n as f64 * k_frac) as u64;
            prop_assert_eq!(estimate(n, n, k), 1.0);
        }

        #[test]
        fn prop_monotone_in_successes(n in 2u64..100, k in 1u64..10) {
            let k = k.min(n);
            let mut last = 0.0;
            for c in 0..=n {
                let p = estimate(n, c, k);
                prop_assert!(p + 1e-12 >= last);
                last = p;
            }
        }
    }
}
