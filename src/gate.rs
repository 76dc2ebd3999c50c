//! Interval and magnitude gates guarding every emitted value.

use crate::attribute::{round_to, Target};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Key of the pass-level interval gate.
pub const SYSTEM_SYNC: &str = "SystemSync";

/// Rate-limit registry: last allowed timestamp per key.
#[derive(Debug, Clone, Default)]
pub struct IntervalGate {
    last_allowed: HashMap<String, DateTime<Utc>>,
}

impl IntervalGate {
    /// True if `interval` has elapsed since the last allowed call under `key`.
    /// Records `now` when allowing. A `now` earlier than the recorded time
    /// (clock stepped back) re-arms the key.
    pub fn allow(&mut self, key: &str, now: DateTime<Utc>, interval: Duration) -> bool {
        if let Some(last) = self.last_allowed.get(key) {
            if now >= *last && now - *last < interval {
                return false;
            }
        }
        self.last_allowed.insert(key.to_string(), now);
        true
    }

    pub fn last_allowed(&self, key: &str) -> Option<DateTime<Utc>> {
        self.last_allowed.get(key).copied()
    }

    pub fn clear(&mut self) {
        self.last_allowed.clear();
    }
}

/// Remembers the last value sent per attribute and suppresses small changes.
///
/// Comparison uses the unrounded value; the caller receives the value
/// rounded to two decimals for emission.
#[derive(Debug, Clone, Default)]
pub struct MagnitudeGate {
    last_emitted: HashMap<(Target, &'static str), f64>,
}

impl MagnitudeGate {
    pub fn check(
        &mut self,
        target: Target,
        name: &'static str,
        value: f64,
        threshold: f64,
    ) -> Option<f64> {
        let last = self.last_emitted.get(&(target, name)).copied().unwrap_or(0.0);
        if (value - last).abs() < threshold {
            return None;
        }
        Some(self.record(target, name, value))
    }

    /// Emission that bypasses the threshold but still updates the memory.
    pub fn record(&mut self, target: Target, name: &'static str, value: f64) -> f64 {
        self.last_emitted.insert((target, name), value);
        round_to(value, 2)
    }

    pub fn forget(&mut self, target: Target, name: &'static str) {
        self.last_emitted.remove(&(target, name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::names;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn interval_gate_per_key() {
        let mut gate = IntervalGate::default();
        let five = Duration::seconds(5);

        assert!(gate.allow(SYSTEM_SYNC, t(0), five));
        assert!(!gate.allow(SYSTEM_SYNC, t(4), five));
        assert!(gate.allow("voltage", t(4), five));
        assert!(gate.allow(SYSTEM_SYNC, t(5), five));
        assert_eq!(gate.last_allowed(SYSTEM_SYNC), Some(t(5)));

        gate.clear();
        assert!(gate.allow(SYSTEM_SYNC, t(6), five));
    }

    #[test]
    fn clock_stepping_back_rearms_the_key() {
        let mut gate = IntervalGate::default();
        let five = Duration::seconds(5);
        assert!(gate.allow(SYSTEM_SYNC, t(600), five));
        assert!(gate.allow(SYSTEM_SYNC, t(60), five));
        assert_eq!(gate.last_allowed(SYSTEM_SYNC), Some(t(60)));
        assert!(!gate.allow(SYSTEM_SYNC, t(62), five));
    }

    #[test]
    fn suppressed_calls_do_not_move_the_window() {
        let mut gate = IntervalGate::default();
        let five = Duration::seconds(5);
        assert!(gate.allow("k", t(0), five));
        assert!(!gate.allow("k", t(3), five));
        assert!(gate.allow("k", t(5), five));
    }

    #[test]
    fn magnitude_gate_is_idempotent() {
        let mut gate = MagnitudeGate::default();
        let target = Target::Channel(1);

        assert_eq!(gate.check(target, names::ENERGY, 0.126, 0.001), Some(0.13));
        assert_eq!(gate.check(target, names::ENERGY, 0.126, 0.001), None);
        assert_eq!(gate.check(target, names::ENERGY, 0.1265, 0.001), None);
        assert_eq!(gate.check(target, names::ENERGY, 0.128, 0.001), Some(0.13));
    }

    #[test]
    fn absent_prior_counts_as_zero() {
        let mut gate = MagnitudeGate::default();
        assert_eq!(gate.check(Target::Aggregate, names::POWER, 0.0, 0.1), None);
        assert_eq!(gate.check(Target::Aggregate, names::POWER, 0.05, 0.1), None);
        assert_eq!(gate.check(Target::Aggregate, names::POWER, 0.1, 0.1), Some(0.1));
        assert_eq!(gate.check(Target::Aggregate, names::POWER, 0.1, 0.1), None);
        gate.forget(Target::Aggregate, names::POWER);
        assert_eq!(gate.check(Target::Aggregate, names::POWER, 0.1, 0.1), Some(0.1));
    }

    #[test]
    fn targets_are_independent() {
        let mut gate = MagnitudeGate::default();
        assert!(gate.check(Target::Channel(1), names::POWER, 40.0, 0.1).is_some());
        assert!(gate.check(Target::Channel(2), names::POWER, 40.0, 0.1).is_some());
        assert!(gate.check(Target::Aggregate, names::POWER, 40.0, 0.1).is_some());
    }
}
