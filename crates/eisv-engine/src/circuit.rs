//! Loop detection over the ring of recent updates
//!
//! Each detector counts the ring entries inside its window plus the attempt
//! being made at `now`.

use chrono::{DateTime, Duration, Utc};
use eisv_core::config::CircuitConfig;
use eisv_core::UpdateStamp;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPattern {
    RapidFire,
    RecursiveReject,
    RapidUpdate,
}

impl LoopPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RapidFire => "rapid_fire",
            Self::RecursiveReject => "recursive_reject",
            Self::RapidUpdate => "rapid_update",
        }
    }
}

impl std::fmt::Display for LoopPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn within(ring: &VecDeque<UpdateStamp>, now: DateTime<Utc>, window: Duration) -> Vec<&UpdateStamp> {
    let since = now - window;
    ring.iter().filter(|s| s.at > since && s.at <= now).collect()
}

pub fn detect_rapid_fire(
    ring: &VecDeque<UpdateStamp>,
    now: DateTime<Utc>,
    cfg: &CircuitConfig,
) -> Option<LoopPattern> {
    let window = Duration::milliseconds(cfg.rapid_fire_window_ms as i64);
    let count = within(ring, now, window).len() + 1;
    (count >= cfg.rapid_fire_count).then_some(LoopPattern::RapidFire)
}

pub fn detect_recursive_reject(
    ring: &VecDeque<UpdateStamp>,
    now: DateTime<Utc>,
    cfg: &CircuitConfig,
) -> Option<LoopPattern> {
    let recent = within(ring, now, Duration::seconds(cfg.recursive_window_secs as i64));
    let rejects = recent.iter().filter(|s| s.decision.is_reject()).count();
    (recent.len() + 1 >= cfg.recursive_count && rejects >= cfg.recursive_rejects)
        .then_some(LoopPattern::RecursiveReject)
}

pub fn detect_rapid_update(
    ring: &VecDeque<UpdateStamp>,
    now: DateTime<Utc>,
    cfg: &CircuitConfig,
) -> Option<LoopPattern> {
    let count = within(ring, now, Duration::seconds(cfg.rapid_window_secs as i64)).len() + 1;
    (count >= cfg.rapid_count).then_some(LoopPattern::RapidUpdate)
}

/// First pattern that fires, checked from the tightest window outwards.
pub fn detect(
    ring: &VecDeque<UpdateStamp>,
    now: DateTime<Utc>,
    cfg: &CircuitConfig,
) -> Option<LoopPattern> {
    if !cfg.enabled {
        return None;
    }
    detect_rapid_fire(ring, now, cfg)
        .or_else(|| detect_recursive_reject(ring, now, cfg))
        .or_else(|| detect_rapid_update(ring, now, cfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use eisv_core::Decision;

    fn ring(base: DateTime<Utc>, entries: &[(i64, Decision)]) -> VecDeque<UpdateStamp> {
        entries
            .iter()
            .map(|(ms, decision)| UpdateStamp {
                at: base + Duration::milliseconds(*ms),
                decision: *decision,
            })
            .collect()
    }

    #[test]
    fn empty_ring_never_trips() {
        let now = Utc::now();
        assert_eq!(detect(&VecDeque::new(), now, &CircuitConfig::default()), None);
    }

    #[test]
    fn two_updates_within_a_second_is_rapid_fire() {
        let base = Utc::now();
        let r = ring(base, &[(0, Decision::Approve)]);
        let now = base + Duration::milliseconds(400);
        assert_eq!(detect(&r, now, &CircuitConfig::default()), Some(LoopPattern::RapidFire));
    }

    #[test]
    fn spaced_updates_pass() {
        let base = Utc::now();
        let r = ring(base, &[(0, Decision::Approve), (11_000, Decision::Approve)]);
        let now = base + Duration::milliseconds(22_000);
        assert_eq!(detect(&r, now, &CircuitConfig::default()), None);
    }

    #[test]
    fn repeated_rejects_trip_recursive_pattern() {
        let base = Utc::now();
        let r = ring(base, &[(0, Decision::Reject), (3_000, Decision::Reject)]);
        let now = base + Duration::milliseconds(6_000);
        assert_eq!(
            detect(&r, now, &CircuitConfig::default()),
            Some(LoopPattern::RecursiveReject)
        );
    }

    #[test]
    fn four_in_five_seconds_is_rapid_update() {
        let base = Utc::now();
        let r = ring(
            base,
            &[(0, Decision::Approve), (1_500, Decision::Approve), (3_000, Decision::Approve)],
        );
        let now = base + Duration::milliseconds(4_500);
        assert_eq!(detect(&r, now, &CircuitConfig::default()), Some(LoopPattern::RapidUpdate));
    }

    #[test]
    fn disabled_circuit_never_trips() {
        let base = Utc::now();
        let r = ring(base, &[(0, Decision::Reject)]);
        let cfg = CircuitConfig {
            enabled: false,
            ..CircuitConfig::default()
        };
        assert_eq!(detect(&r, base + Duration::milliseconds(10), &cfg), None);
    }
}
