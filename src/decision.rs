//! Scaling decision engine.
//!
//! A pure function of `(policy, snapshot, current worker count)`; no I/O and
//! no hidden state, so two identical inputs always give the same answer.
//!
//! ```text
//! if lag > lag_threshold and waiting > 0:          # urgent
//!     recommended = min(ceil(waiting / target) + 1, max)
//! elif waiting == 0 and active == 0:               # idle
//!     recommended = min
//! else:                                            # steady
//!     ideal = ceil((waiting + active) / target)
//!     if ideal < current and waiting > 0:          # sticky
//!         recommended = current
//!     else:
//!         recommended = clamp(ideal, min, max)
//! ```
//!
//! The result is always clamped into `[min, max]`.

use crate::{QueueConfig, QueueMetricsSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which branch produced a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingRule {
    UrgentScaleUp,
    Idle,
    Steady,
    Sticky,
}

impl fmt::Display for ScalingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalingRule::UrgentScaleUp => "urgent_scale_up",
            ScalingRule::Idle => "idle",
            ScalingRule::Steady => "steady",
            ScalingRule::Sticky => "sticky",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingAction {
    ScaleUp(usize),
    ScaleDown(usize),
    NoAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub queue: String,
    pub current: usize,
    pub recommended: usize,
    pub rule: ScalingRule,
}

impl ScalingDecision {
    pub fn action(&self) -> ScalingAction {
        if self.recommended > self.current {
            ScalingAction::ScaleUp(self.recommended - self.current)
        } else if self.recommended < self.current {
            ScalingAction::ScaleDown(self.current - self.recommended)
        } else {
            ScalingAction::NoAction
        }
    }

    pub fn is_change(&self) -> bool {
        self.recommended != self.current
    }
}

/// Ceiling division; `divisor` is validated non-zero by [`QueueConfig::validate`].
fn div_ceil(value: u64, divisor: u64) -> u64 {
    let divisor = divisor.max(1);
    value / divisor + u64::from(value % divisor != 0)
}

fn to_workers(count: u64) -> usize {
    usize::try_from(count).unwrap_or(usize::MAX)
}

/// Recommend a worker count for one queue.
pub fn recommend(
    config: &QueueConfig,
    metrics: &QueueMetricsSnapshot,
    current_workers: usize,
) -> ScalingDecision {
    let min = config.min_workers;
    let max = config.max_workers.max(min);
    let target = config.target_jobs_per_worker;

    let (raw, rule) = if metrics.lag_ms > config.lag_threshold_ms && metrics.waiting_jobs > 0 {
        let needed = to_workers(div_ceil(metrics.waiting_jobs, target));
        (needed.saturating_add(1).min(max), ScalingRule::UrgentScaleUp)
    } else if metrics.waiting_jobs == 0 && metrics.active_jobs == 0 {
        (min, ScalingRule::Idle)
    } else {
        let ideal = to_workers(div_ceil(metrics.backlog(), target));
        if ideal < current_workers && metrics.waiting_jobs > 0 {
            (current_workers, ScalingRule::Sticky)
        } else {
            (ideal, ScalingRule::Steady)
        }
    };

    ScalingDecision {
        queue: config.name.clone(),
        current: current_workers,
        recommended: raw.clamp(min, max),
        rule,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> QueueConfig {
        QueueConfig::new("q")
            .workers(1, 5)
            .lag_threshold_ms(30_000)
            .target_jobs_per_worker(10)
    }

    fn snapshot(waiting: u64, active: u64, lag_ms: u64) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            waiting_jobs: waiting,
            active_jobs: active,
            lag_ms,
            ..QueueMetricsSnapshot::empty("q", 0)
        }
    }

    #[test]
    fn test_urgent_scale_up_capped_at_max() {
        let decision = recommend(&policy(), &snapshot(50, 0, 40_000), 1);
        assert_eq!(decision.recommended, 5);
        assert_eq!(decision.rule, ScalingRule::UrgentScaleUp);
        assert_eq!(decision.action(), ScalingAction::ScaleUp(4));
    }

    #[test]
    fn test_urgent_scale_up_adds_one_worker_of_headroom() {
        let config = policy().workers(1, 20);
        let decision = recommend(&config, &snapshot(25, 0, 40_000), 1);
        assert_eq!(decision.recommended, 4);
    }

    #[test]
    fn test_idle_queue_returns_to_min() {
        let decision = recommend(&policy(), &snapshot(0, 0, 0), 5);
        assert_eq!(decision.recommended, 1);
        assert_eq!(decision.rule, ScalingRule::Idle);
        assert_eq!(decision.action(), ScalingAction::ScaleDown(4));
    }

    #[test]
    fn test_sticky_rule_holds_workers_while_backlog_remains() {
        let decision = recommend(&policy(), &snapshot(8, 2, 5_000), 3);
        assert_eq!(decision.recommended, 3);
        assert_eq!(decision.rule, ScalingRule::Sticky);
        assert_eq!(decision.action(), ScalingAction::NoAction);
    }

    #[test]
    fn test_steady_state_scales_to_ideal() {
        let decision = recommend(&policy(), &snapshot(25, 0, 5_000), 1);
        assert_eq!(decision.recommended, 3);
        assert_eq!(decision.rule, ScalingRule::Steady);
    }

    #[test]
    fn test_active_only_holds_until_jobs_finish() {
        // Nothing waiting, so sticky does not apply: shrink towards ideal.
        let decision = recommend(&policy(), &snapshot(0, 12, 0), 4);
        assert_eq!(decision.recommended, 2);
        assert_eq!(decision.rule, ScalingRule::Steady);

        let decision = recommend(&policy(), &snapshot(0, 30, 0), 3);
        assert_eq!(decision.recommended, 3);
    }

    #[test]
    fn test_lag_at_threshold_is_not_urgent() {
        let decision = recommend(&policy(), &snapshot(5, 0, 30_000), 1);
        assert_eq!(decision.rule, ScalingRule::Steady);
        assert_eq!(decision.recommended, 1);
    }

    #[test]
    fn test_result_is_clamped_even_from_out_of_range_current() {
        // Before the first tick a queue may have zero workers.
        let decision = recommend(&policy(), &snapshot(3, 0, 0), 0);
        assert_eq!(decision.recommended, 1);

        // Sticky with a current count above max still respects max.
        let decision = recommend(&policy(), &snapshot(1, 0, 0), 9);
        assert_eq!(decision.recommended, 5);

        // Urgent with min above needed + 1.
        let config = policy().workers(4, 6);
        let decision = recommend(&config, &snapshot(1, 0, 60_000), 4);
        assert_eq!(decision.recommended, 4);
    }

    #[test]
    fn test_bounds_hold_for_all_inputs() {
        let config = policy().workers(2, 7);
        for waiting in [0u64, 1, 9, 10, 11, 35, 70, 1_000, u64::MAX / 2] {
            for active in [0u64, 1, 10, 50] {
                for lag in [0u64, 29_999, 30_000, 30_001, 600_000] {
                    for current in 0..10usize {
                        let d = recommend(&config, &snapshot(waiting, active, lag), current);
                        assert!(
                            (2..=7).contains(&d.recommended),
                            "out of bounds: {:?} for waiting={} active={} lag={} current={}",
                            d, waiting, active, lag, current
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_idle_convergence_ignores_current() {
        for current in 0..12 {
            assert_eq!(recommend(&policy(), &snapshot(0, 0, 0), current).recommended, 1);
        }
    }

    #[test]
    fn test_urgent_is_at_least_needed() {
        let config = policy().workers(1, 50);
        for waiting in 1..=400u64 {
            let d = recommend(&config, &snapshot(waiting, 0, 45_000), 1);
            let needed = div_ceil(waiting, 10) as usize;
            assert!(d.recommended >= needed.min(50));
        }
    }

    #[test]
    fn test_sticky_returns_current_exactly() {
        let config = policy().workers(1, 10);
        for current in 2..=10usize {
            for waiting in 1..=((current as u64 - 1) * 10) {
                let d = recommend(&config, &snapshot(waiting, 0, 0), current);
                assert_eq!(d.recommended, current, "waiting={} current={}", waiting, current);
            }
        }
    }

    #[test]
    fn test_same_input_same_decision() {
        let s = snapshot(42, 3, 12_000);
        let first = recommend(&policy(), &s, 2);
        let second = recommend(&policy(), &s, 2);
        assert_eq!(first, second);
    }

    #[test]
    fn test_div_ceil() {
        assert_eq!(div_ceil(0, 10), 0);
        assert_eq!(div_ceil(1, 10), 1);
        assert_eq!(div_ceil(10, 10), 1);
        assert_eq!(div_ceil(11, 10), 2);
        assert_eq!(div_ceil(u64::MAX, 1), u64::MAX);
    }
}
