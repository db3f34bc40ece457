//! Restart strategy and intensity tracking

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Which children restart when one fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorRestartMode {
    /// Restart only the failed child
    #[default]
    OneForOne,
    /// Stop every sibling and restart them all with the failed child
    OneForAll,
}

/// Restart policy of one supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartStrategy {
    pub mode: SupervisorRestartMode,
    /// Restarts tolerated within `interval`
    pub restarts: u32,
    /// Sliding window the restart count is measured over
    pub interval: Duration,
}

impl RestartStrategy {
    pub fn one_for_one(restarts: u32, interval: Duration) -> Self {
        RestartStrategy {
            mode: SupervisorRestartMode::OneForOne,
            restarts,
            interval,
        }
    }

    pub fn one_for_all(restarts: u32, interval: Duration) -> Self {
        RestartStrategy {
            mode: SupervisorRestartMode::OneForAll,
            restarts,
            interval,
        }
    }
}

impl Default for RestartStrategy {
    fn default() -> Self {
        Self::one_for_one(3, Duration::from_secs(5))
    }
}

/// Sliding window of restart events
#[derive(Debug)]
pub(crate) struct RestartIntensity {
    max: u32,
    interval: Duration,
    events: VecDeque<Instant>,
}

impl RestartIntensity {
    pub(crate) fn new(strategy: &RestartStrategy) -> Self {
        RestartIntensity {
            max: strategy.restarts,
            interval: strategy.interval,
            events: VecDeque::new(),
        }
    }

    /// Record a restart at `now`. Returns false once the window holds more
    /// events than the strategy allows.
    pub(crate) fn record(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.events.front() {
            if now.saturating_duration_since(*oldest) > self.interval {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.events.push_back(now);
        self.events.len() as u64 <= u64::from(self.max)
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_exceeded_within_interval() {
        let mut intensity = RestartIntensity::new(&RestartStrategy::one_for_one(2, Duration::from_secs(10)));
        let t0 = Instant::now();
        assert!(intensity.record(t0));
        assert!(intensity.record(t0 + Duration::from_secs(1)));
        assert!(!intensity.record(t0 + Duration::from_secs(2)));
    }

    #[test]
    fn test_old_events_pruned() {
        let mut intensity = RestartIntensity::new(&RestartStrategy::one_for_one(2, Duration::from_secs(10)));
        let t0 = Instant::now();
        assert!(intensity.record(t0));
        assert!(intensity.record(t0 + Duration::from_secs(1)));
        assert!(intensity.record(t0 + Duration::from_secs(12)));
        assert_eq!(intensity.len(), 1);
    }

    #[test]
    fn test_zero_restarts_fails_first_event() {
        let mut intensity = RestartIntensity::new(&RestartStrategy::one_for_one(0, Duration::from_secs(1)));
        assert!(!intensity.record(Instant::now()));
    }

    #[test]
    fn test_mode_serde() {
        let mode: SupervisorRestartMode = serde_json::from_str("\"one_for_all\"").unwrap();
        assert_eq!(mode, SupervisorRestartMode::OneForAll);
    }
}
