use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::device::{AlertSeverity, BlockReason, Device, OwnerCategory};

/// Tunable weights for the trust score. The defaults are the engine's
/// hand-tuned values; they are configuration, not fixed truths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustWeights {
    /// Starting point for every device
    pub base: f64,

    /// Added once a device has been around longer than `age_days`
    pub age_bonus: f64,

    /// Days before the age bonus kicks in
    pub age_days: i64,

    /// Added when the device is assigned to a named user
    pub assigned_user_bonus: f64,

    /// Added for adult-owned devices
    pub adult_owner_bonus: f64,

    /// Added when no unresolved security alerts remain
    pub clean_alerts_bonus: f64,

    /// Subtracted while any unresolved High/Critical alert exists
    pub severe_alert_penalty: f64,

    /// Subtracted while the device is blocked
    pub blocked_penalty: f64,

    /// Subtracted when the block reason is a security threat
    pub security_threat_penalty: f64,
}

impl Default for TrustWeights {
    fn default() -> Self {
        Self {
            base: 0.5,
            age_bonus: 0.2,
            age_days: 7,
            assigned_user_bonus: 0.1,
            adult_owner_bonus: 0.3,
            clean_alerts_bonus: 0.1,
            severe_alert_penalty: 0.3,
            blocked_penalty: 0.2,
            security_threat_penalty: 0.4,
        }
    }
}

/// Deterministic, explainable trust scorer. A pure function of the
/// current device state: recomputed from scratch every cycle rather
/// than nudged incrementally, so the score can never drift.
pub struct TrustScorer {
    weights: TrustWeights,
}

impl TrustScorer {
    pub fn new(weights: TrustWeights) -> Self {
        Self { weights }
    }

    /// Compute the trust score for a device at `now`, clamped to [0, 1]
    pub fn score(&self, device: &Device, now: DateTime<Utc>) -> f64 {
        let w = &self.weights;
        let mut score = w.base;

        if now - device.first_seen > Duration::days(w.age_days) {
            score += w.age_bonus;
        }
        if device.assigned_user.as_deref().is_some_and(|u| !u.is_empty()) {
            score += w.assigned_user_bonus;
        }
        if device.owner_category == OwnerCategory::Adult {
            score += w.adult_owner_bonus;
        }
        if device.unresolved_alerts() == 0 {
            score += w.clean_alerts_bonus;
        }
        if device.has_unresolved_alert_at_least(AlertSeverity::High) {
            score -= w.severe_alert_penalty;
        }
        if device.is_blocked {
            score -= w.blocked_penalty;
        }
        if device.block_reason == BlockReason::SecurityThreat {
            score -= w.security_threat_penalty;
        }

        score.clamp(0.0, 1.0)
    }
}

impl Default for TrustScorer {
    fn default() -> Self {
        Self::new(TrustWeights::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::device::SecurityAlert;

    fn device_first_seen_days_ago(days: i64) -> Device {
        let now = Utc::now();
        let mut d = Device::new("AA:BB:CC:DD:EE:FF".to_string(), 480, now);
        d.first_seen = now - Duration::days(days);
        d
    }

    #[test]
    fn ten_day_old_clean_device_scores_point_eight() {
        // Regression fixed point: 0.5 base + 0.2 age + 0.1 clean alerts
        let scorer = TrustScorer::default();
        let mut d = device_first_seen_days_ago(10);
        d.owner_category = OwnerCategory::Child;
        let score = scorer.score(&d, Utc::now());
        assert!((score - 0.8).abs() < 1e-9, "got {}", score);
    }

    #[test]
    fn adult_owner_and_assigned_user_add_their_bonuses() {
        let scorer = TrustScorer::default();
        let mut d = device_first_seen_days_ago(0);
        d.owner_category = OwnerCategory::Adult;
        d.assigned_user = Some("sam".to_string());
        // 0.5 + 0.1 user + 0.3 adult + 0.1 clean = 1.0 (clamped exactly)
        assert!((scorer.score(&d, Utc::now()) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn severe_unresolved_alert_drags_the_score_down() {
        let scorer = TrustScorer::default();
        let now = Utc::now();
        let mut d = device_first_seen_days_ago(0);
        d.push_alert(SecurityAlert::new(AlertSeverity::Critical, "port scan", now));
        // 0.5 base, no clean bonus, -0.3 severe = 0.2
        assert!((scorer.score(&d, now) - 0.2).abs() < 1e-9);

        // Resolving it restores the clean bonus
        let id = d.alerts[0].id;
        d.resolve_alert(id);
        assert!((scorer.score(&d, now) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn security_threat_block_floors_at_zero() {
        let scorer = TrustScorer::default();
        let mut d = device_first_seen_days_ago(0);
        d.block(BlockReason::SecurityThreat);
        let now = Utc::now();
        d.push_alert(SecurityAlert::new(AlertSeverity::Critical, "c2 beaconing", now));
        // 0.5 - 0.3 - 0.2 - 0.4 would be -0.4, clamped to 0
        assert_eq!(scorer.score(&d, now), 0.0);
    }

    #[test]
    fn score_is_always_within_unit_interval() {
        let scorer = TrustScorer::default();
        let now = Utc::now();
        let mut devices = vec![device_first_seen_days_ago(30)];
        devices[0].owner_category = OwnerCategory::Adult;
        devices[0].assigned_user = Some("sam".to_string());
        let mut worst = device_first_seen_days_ago(0);
        worst.block(BlockReason::SecurityThreat);
        worst.push_alert(SecurityAlert::new(AlertSeverity::High, "bad", now));
        devices.push(worst);

        for d in &devices {
            let s = scorer.score(d, now);
            assert!((0.0..=1.0).contains(&s), "score {} out of range", s);
        }
    }
}
