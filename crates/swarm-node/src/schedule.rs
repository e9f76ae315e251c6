//! Polling timers.
//!
//! The engine never sleeps. Each periodic behaviour is an [`Interval`] polled
//! from `tick()`, and whether it fires is a pure function of the last fire
//! time, the current time and the period.

use swarm_proto::Millis;

/// Whether a timer last fired at `last` should fire again at `now`.
///
/// A timer that has never fired is due immediately.
pub fn should_fire(last: Option<Millis>, now: Millis, interval: Millis) -> bool {
    match last {
        None => true,
        Some(last) => now.saturating_sub(last) >= interval,
    }
}

/// A periodic timer driven by explicit clock readings.
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    period: Millis,
    last: Option<Millis>,
}

impl Interval {
    pub fn new(period: Millis) -> Self {
        Self { period, last: None }
    }

    pub fn period(&self) -> Millis {
        self.period
    }

    /// Returns true and records the fire if the period has elapsed.
    pub fn poll(&mut self, now: Millis) -> bool {
        if should_fire(self.last, now, self.period) {
            self.last = Some(now);
            true
        } else {
            false
        }
    }
}

/// Rate gate: lets an event through only if the previous one passed at least
/// `min_gap` ago.
#[derive(Debug, Clone, Copy)]
pub struct Debounce {
    min_gap: Millis,
    last: Option<Millis>,
}

impl Debounce {
    pub fn new(min_gap: Millis) -> Self {
        Self { min_gap, last: None }
    }

    /// Returns true and records the event if the gate is open.
    pub fn ready(&mut self, now: Millis) -> bool {
        if should_fire(self.last, now, self.min_gap) {
            self.last = Some(now);
            true
        } else {
            false
        }
    }

    /// Milliseconds until the gate opens again.
    pub fn remaining(&self, now: Millis) -> Millis {
        self.last
            .map_or(0, |last| self.min_gap.saturating_sub(now.saturating_sub(last)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn should_fire_boundaries() {
        assert!(should_fire(None, 0, 5_000));
        assert!(!should_fire(Some(1_000), 5_999, 5_000));
        assert!(should_fire(Some(1_000), 6_000, 5_000));
        assert!(!should_fire(Some(9_000), 1_000, 5_000));
    }

    #[test]
    fn interval_fires_once_per_period() {
        let mut interval = Interval::new(5_000);
        assert!(interval.poll(0));
        assert!(!interval.poll(100));
        assert!(!interval.poll(4_999));
        assert!(interval.poll(5_000));
        assert!(!interval.poll(5_001));
    }

    #[test]
    fn debounce_gates_bursts() {
        let mut gate = Debounce::new(2_000);
        assert!(gate.ready(100));
        assert!(!gate.ready(1_000));
        assert_eq!(gate.remaining(1_000), 1_100);
        assert!(gate.ready(2_100));
        assert_eq!(gate.remaining(2_100), 2_000);
    }

    proptest! {
        #[test]
        fn fires_are_at_least_one_period_apart(
            period in 1u64..10_000,
            times in proptest::collection::vec(0u64..100_000, 1..64),
        ) {
            let mut times = times;
            times.sort_unstable();
            let mut interval = Interval::new(period);
            let fired: Vec<Millis> = times.into_iter().filter(|&t| interval.poll(t)).collect();

            prop_assert!(!fired.is_empty());
            for pair in fired.windows(2) {
                prop_assert!(pair[1] - pair[0] >= period);
            }
        }
    }
}
