//! 供应商故障转移状态
//!
//! ```text
//! Healthy --(连续失败 >= 阈值)--> Cooldown --(冷却结束)--> Probation
//!    ^                               ^                          |
//!    |                               +-------(再次失败)---------+
//!    +-----------------------(成功)-----------------------------+
//! ```
//!
//! 冷却中的供应商不参与路由；冷却结束后乐观放行，试用期内一次失败立即回到冷却。

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverPhase {
    Healthy,
    Cooldown,
    Probation,
}

#[derive(Debug)]
struct ProviderState {
    phase: FailoverPhase,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
    last_error: Option<String>,
    last_failure_at: Option<DateTime<Utc>>,
}

impl Default for ProviderState {
    fn default() -> Self {
        Self {
            phase: FailoverPhase::Healthy,
            consecutive_failures: 0,
            cooldown_until: None,
            last_error: None,
            last_failure_at: None,
        }
    }
}

impl ProviderState {
    /// 冷却到期则转入试用期
    fn refresh(&mut self, now: Instant) {
        if self.phase == FailoverPhase::Cooldown {
            if let Some(until) = self.cooldown_until {
                if now >= until {
                    self.phase = FailoverPhase::Probation;
                    self.cooldown_until = None;
                    self.consecutive_failures = 0;
                }
            }
        }
    }
}

/// 对外展示的故障转移状态
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailoverSnapshot {
    pub phase: FailoverPhase,
    pub consecutive_failures: u32,
    pub cooldown_remaining_ms: u64,
    pub last_error: Option<String>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

pub struct FailoverTracker {
    states: DashMap<String, Mutex<ProviderState>>,
    threshold: u32,
    cooldown: Duration,
}

impl FailoverTracker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            states: DashMap::new(),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// 是否可以参与路由
    pub fn is_available(&self, provider: &str) -> bool {
        match self.states.get(provider) {
            Some(state) => {
                let mut state = state.lock();
                state.refresh(Instant::now());
                state.phase != FailoverPhase::Cooldown
            }
            None => true,
        }
    }

    pub fn phase(&self, provider: &str) -> FailoverPhase {
        match self.states.get(provider) {
            Some(state) => {
                let mut state = state.lock();
                state.refresh(Instant::now());
                state.phase
            }
            None => FailoverPhase::Healthy,
        }
    }

    /// 记录一次成功
    ///
    /// 冷却期内的成功（例如健康探测）不会提前结束冷却，只有试用期或正常状态会重置
    pub fn record_success(&self, provider: &str) {
        if let Some(state) = self.states.get(provider) {
            let mut state = state.lock();
            state.refresh(Instant::now());
            if state.phase == FailoverPhase::Cooldown {
                return;
            }
            if state.phase != FailoverPhase::Healthy {
                info!(provider = %provider, "Provider recovered from failover");
            }
            state.phase = FailoverPhase::Healthy;
            state.consecutive_failures = 0;
            state.cooldown_until = None;
        }
    }

    /// 记录一次失败，返回本次是否触发进入冷却
    pub fn record_failure(&self, provider: &str, error: &str) -> bool {
        let entry = self.states.entry(provider.to_string()).or_default();
        let mut state = entry.lock();
        let now = Instant::now();
        state.refresh(now);
        state.last_error = Some(error.to_string());
        state.last_failure_at = Some(Utc::now());

        match state.phase {
            FailoverPhase::Cooldown => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                false
            }
            FailoverPhase::Probation => {
                state.phase = FailoverPhase::Cooldown;
                state.cooldown_until = Some(now + self.cooldown);
                state.consecutive_failures = 1;
                warn!(provider = %provider, "Provider failed during probation, back to cooldown");
                true
            }
            FailoverPhase::Healthy => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                if state.consecutive_failures >= self.threshold {
                    state.phase = FailoverPhase::Cooldown;
                    state.cooldown_until = Some(now + self.cooldown);
                    warn!(
                        provider = %provider,
                        failures = state.consecutive_failures,
                        cooldown = ?self.cooldown,
                        "Provider entered cooldown"
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn reset(&self, provider: &str) {
        self.states.remove(provider);
    }

    pub fn snapshot(&self) -> BTreeMap<String, FailoverSnapshot> {
        let now = Instant::now();
        self.states
            .iter()
            .map(|entry| {
                let mut state = entry.value().lock();
                state.refresh(now);
                let remaining = state
                    .cooldown_until
                    .map(|until| until.saturating_duration_since(now).as_millis() as u64)
                    .unwrap_or(0);
                (
                    entry.key().clone(),
                    FailoverSnapshot {
                        phase: state.phase,
                        consecutive_failures: state.consecutive_failures,
                        cooldown_remaining_ms: remaining,
                        last_error: state.last_error.clone(),
                        last_failure_at: state.last_failure_at,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn threshold_failures_trigger_cooldown_until_elapsed() {
        let tracker = FailoverTracker::new(3, Duration::from_secs(30));

        assert!(!tracker.record_failure("openai", "boom"));
        assert!(!tracker.record_failure("openai", "boom"));
        assert!(tracker.is_available("openai"));
        assert!(tracker.record_failure("openai", "boom"));
        assert!(!tracker.is_available("openai"));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!tracker.is_available("openai"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(tracker.is_available("openai"));
        assert_eq!(tracker.phase("openai"), FailoverPhase::Probation);
    }

    #[tokio::test(start_paused = true)]
    async fn probation_failure_reenters_cooldown_immediately() {
        let tracker = FailoverTracker::new(2, Duration::from_secs(10));
        tracker.record_failure("p", "x");
        tracker.record_failure("p", "x");
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(tracker.is_available("p"));

        assert!(tracker.record_failure("p", "still down"));
        assert!(!tracker.is_available("p"));
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot["p"].phase, FailoverPhase::Cooldown);
        assert_eq!(snapshot["p"].last_error.as_deref(), Some("still down"));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count() {
        let tracker = FailoverTracker::new(2, Duration::from_secs(10));
        tracker.record_failure("p", "x");
        tracker.record_success("p");
        assert!(!tracker.record_failure("p", "x"));
        assert!(tracker.is_available("p"));
    }

    #[tokio::test(start_paused = true)]
    async fn success_during_cooldown_keeps_provider_out() {
        let tracker = FailoverTracker::new(2, Duration::from_secs(60));
        tracker.record_failure("p", "x");
        tracker.record_failure("p", "x");

        tracker.record_success("p");
        assert!(!tracker.is_available("p"));
        assert_eq!(tracker.phase("p"), FailoverPhase::Cooldown);

        tokio::time::advance(Duration::from_secs(61)).await;
        tracker.record_success("p");
        assert_eq!(tracker.phase("p"), FailoverPhase::Healthy);
        assert!(!tracker.record_failure("p", "x"));
        assert!(tracker.is_available("p"));
    }
}
