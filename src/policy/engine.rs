use thiserror::Error;
use tracing::{debug, info};

use crate::models::device::Device;
use crate::policy::rules::{Action, PolicyRule};

/// Error types for rule-set mutations
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Rule id already exists: {0}")]
    DuplicateId(String),

    #[error("Rule id {0} uses the reserved built-in prefix")]
    ReservedId(String),

    #[error("Rule {new_id} conflicts with {existing_id}: same priority {priority} and overlapping predicates")]
    Conflict {
        new_id: String,
        existing_id: String,
        priority: i32,
    },

    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error("Built-in rule {0} can only be deactivated, not removed")]
    BuiltInImmutable(String),
}

/// Result type for policy operations
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Outcome of evaluating the rule set against one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Action to take
    pub action: Action,

    /// Id of the matching rule, None for the default-allow path
    pub rule_id: Option<String>,
}

impl Verdict {
    pub fn default_allow() -> Self {
        Self {
            action: Action::Allow,
            rule_id: None,
        }
    }
}

/// Ordered, prioritized rule set. Rules are kept sorted by ascending
/// priority (id as tiebreaker, though conflicts make ties rare) so
/// evaluation is a single deterministic scan.
pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
}

impl PolicyEngine {
    /// Build an engine holding the given rules (typically the
    /// built-ins). Assumes the seed set is conflict-free.
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        let mut engine = Self { rules };
        engine.sort();
        engine
    }

    fn sort(&mut self) {
        self.rules
            .sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
    }

    /// Evaluate active rules in ascending priority; first match wins,
    /// no match means Allow.
    pub fn evaluate(&self, device: &Device, minute_of_day: u16) -> Verdict {
        for rule in &self.rules {
            if !rule.is_active {
                continue;
            }
            if rule.predicate.matches(device, minute_of_day) {
                debug!(
                    "Rule {} matched device {} -> {}",
                    rule.id, device.mac_address, rule.action
                );
                return Verdict {
                    action: rule.action,
                    rule_id: Some(rule.id.clone()),
                };
            }
        }
        Verdict::default_allow()
    }

    /// Add a user rule. Reserved ids are rejected, duplicates are
    /// rejected, and a rule sharing a priority with an existing rule it
    /// overlaps is rejected here so evaluation never has to break ties.
    pub fn add_rule(&mut self, rule: PolicyRule) -> PolicyResult<()> {
        if PolicyRule::is_builtin_id(&rule.id) {
            return Err(PolicyError::ReservedId(rule.id));
        }
        if self.rules.iter().any(|r| r.id == rule.id) {
            return Err(PolicyError::DuplicateId(rule.id));
        }
        for existing in &self.rules {
            if existing.priority == rule.priority
                && !existing.predicate.provably_disjoint(&rule.predicate)
            {
                return Err(PolicyError::Conflict {
                    new_id: rule.id,
                    existing_id: existing.id.clone(),
                    priority: rule.priority,
                });
            }
        }

        info!("Added policy rule {} at priority {}", rule.id, rule.priority);
        self.rules.push(rule);
        self.sort();
        Ok(())
    }

    /// Toggle a rule's activation flag
    pub fn set_active(&mut self, rule_id: &str, active: bool) -> PolicyResult<()> {
        match self.rules.iter_mut().find(|r| r.id == rule_id) {
            Some(rule) => {
                rule.is_active = active;
                info!("Rule {} now {}", rule_id, if active { "active" } else { "inactive" });
                Ok(())
            }
            None => Err(PolicyError::RuleNotFound(rule_id.to_string())),
        }
    }

    /// Remove a user rule. Built-ins refuse removal.
    pub fn remove_rule(&mut self, rule_id: &str) -> PolicyResult<()> {
        let index = self
            .rules
            .iter()
            .position(|r| r.id == rule_id)
            .ok_or_else(|| PolicyError::RuleNotFound(rule_id.to_string()))?;
        if self.rules[index].built_in {
            return Err(PolicyError::BuiltInImmutable(rule_id.to_string()));
        }
        self.rules.remove(index);
        Ok(())
    }

    /// Priority slot after every existing rule, for user rules that do
    /// not pick their own.
    pub fn next_user_priority(&self) -> i32 {
        self.rules.iter().map(|r| r.priority).max().unwrap_or(0) + 10
    }

    /// Snapshot for persistence
    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::device::{DeviceType, OwnerCategory, RestrictionWindow};
    use crate::policy::rules::{builtin_rules, Clause, Comparison, Predicate};
    use chrono::Utc;

    fn engine() -> PolicyEngine {
        PolicyEngine::new(builtin_rules(0.3))
    }

    fn device() -> Device {
        Device::new("AA:BB:CC:DD:EE:FF".to_string(), 480, Utc::now())
    }

    #[test]
    fn unknown_device_blocks_regardless_of_trust() {
        let engine = engine();
        let mut d = device();
        d.trust_score = 1.0;
        let verdict = engine.evaluate(&d, 12 * 60);
        assert_eq!(verdict.action, Action::Block);
        assert_eq!(verdict.rule_id.as_deref(), Some("builtin:unknown-device"));
    }

    #[test]
    fn low_trust_restricts_known_devices() {
        let engine = engine();
        let mut d = device();
        d.device_type = DeviceType::Laptop;
        d.trust_score = 0.2;
        let verdict = engine.evaluate(&d, 12 * 60);
        assert_eq!(verdict.action, Action::Restrict);
        assert_eq!(verdict.rule_id.as_deref(), Some("builtin:low-trust"));
    }

    #[test]
    fn default_is_allow() {
        let engine = engine();
        let mut d = device();
        d.device_type = DeviceType::Laptop;
        d.trust_score = 0.9;
        assert_eq!(engine.evaluate(&d, 12 * 60), Verdict::default_allow());
    }

    #[test]
    fn night_curfew_is_opt_in() {
        let mut engine = engine();
        let mut d = device();
        d.device_type = DeviceType::Laptop;
        d.trust_score = 0.9;

        // 23:00, curfew shipped inactive
        assert_eq!(engine.evaluate(&d, 23 * 60).action, Action::Allow);

        engine.set_active("builtin:night-curfew", true).unwrap();
        assert_eq!(engine.evaluate(&d, 23 * 60).action, Action::Block);
        assert_eq!(engine.evaluate(&d, 12 * 60).action, Action::Allow);
    }

    #[test]
    fn lower_priority_number_wins_first() {
        let mut engine = engine();
        engine
            .add_rule(PolicyRule::new(
                "monitor-teens",
                5,
                Predicate::new(vec![Clause::OwnerIs(OwnerCategory::Teenager)]),
                Action::Monitor,
            ))
            .unwrap();

        let mut d = device();
        d.owner_category = OwnerCategory::Teenager;
        // Unknown device type would block at priority 10, but the
        // priority-5 rule is evaluated first
        let verdict = engine.evaluate(&d, 12 * 60);
        assert_eq!(verdict.action, Action::Monitor);
        assert_eq!(verdict.rule_id.as_deref(), Some("monitor-teens"));
    }

    #[test]
    fn reserved_prefix_is_rejected() {
        let mut engine = engine();
        let result = engine.add_rule(PolicyRule::new(
            "builtin:sneaky",
            99,
            Predicate::default(),
            Action::Block,
        ));
        assert!(matches!(result, Err(PolicyError::ReservedId(_))));
    }

    #[test]
    fn same_priority_overlap_is_a_conflict_at_add_time() {
        let mut engine = engine();
        engine
            .add_rule(PolicyRule::new(
                "evening-consoles",
                50,
                Predicate::new(vec![Clause::DeviceTypeIs(DeviceType::GameConsole)]),
                Action::Restrict,
            ))
            .unwrap();

        // Overlaps: both can match a child's console
        let result = engine.add_rule(PolicyRule::new(
            "child-devices",
            50,
            Predicate::new(vec![Clause::OwnerIs(OwnerCategory::Child)]),
            Action::Block,
        ));
        assert!(matches!(result, Err(PolicyError::Conflict { .. })));

        // Provably disjoint on the same priority is fine
        engine
            .add_rule(PolicyRule::new(
                "tablets",
                50,
                Predicate::new(vec![Clause::DeviceTypeIs(DeviceType::Tablet)]),
                Action::Monitor,
            ))
            .unwrap();
    }

    #[test]
    fn builtins_cannot_be_removed_but_users_can() {
        let mut engine = engine();
        assert!(matches!(
            engine.remove_rule("builtin:low-trust"),
            Err(PolicyError::BuiltInImmutable(_))
        ));

        engine
            .add_rule(PolicyRule::new(
                "school-hours",
                40,
                Predicate::new(vec![Clause::TimeOfDay(
                    RestrictionWindow::new(8 * 60, 15 * 60).unwrap(),
                )]),
                Action::Restrict,
            ))
            .unwrap();
        engine.remove_rule("school-hours").unwrap();
        assert!(matches!(
            engine.remove_rule("school-hours"),
            Err(PolicyError::RuleNotFound(_))
        ));
    }

    #[test]
    fn trust_score_comparison_respects_strictness() {
        let engine = engine();
        let mut d = device();
        d.device_type = DeviceType::Laptop;
        d.trust_score = 0.3;
        // Threshold is strict less-than
        assert_eq!(engine.evaluate(&d, 12 * 60).action, Action::Allow);
    }
}
