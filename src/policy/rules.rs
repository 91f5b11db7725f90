use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::device::{Device, DeviceType, OwnerCategory, RestrictionWindow};

/// Reserved id prefix for built-in rules. Rules carrying it cannot be
/// added or deleted through the public surface, only deactivated.
pub const BUILTIN_PREFIX: &str = "builtin:";

/// What to do with a device once a rule matches. Ordered from most to
/// least permissive, so `max` picks the more restrictive of two
/// verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Action {
    Allow,
    Monitor,
    Restrict,
    Block,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Allow => "allow",
            Action::Monitor => "monitor",
            Action::Restrict => "restrict",
            Action::Block => "block",
        };
        write!(f, "{}", s)
    }
}

/// Numeric comparison operator for score clauses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    LessThan,
    AtMost,
    GreaterThan,
    AtLeast,
}

impl Comparison {
    fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::LessThan => value < threshold,
            Comparison::AtMost => value <= threshold,
            Comparison::GreaterThan => value > threshold,
            Comparison::AtLeast => value >= threshold,
        }
    }
}

/// One declarative condition over a device plus the time-of-day
/// context. Deliberately a closed set of field comparisons so
/// evaluation stays deterministic and auditable: no user code ever
/// runs inside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Clause {
    /// Device type equals
    DeviceTypeIs(DeviceType),

    /// Device type differs
    DeviceTypeIsNot(DeviceType),

    /// Owner category equals
    OwnerIs(OwnerCategory),

    /// Owner category differs
    OwnerIsNot(OwnerCategory),

    /// Trust score compared against a threshold
    TrustScore { cmp: Comparison, threshold: f64 },

    /// Current block flag
    IsBlocked(bool),

    /// Local time-of-day falls inside the window (may wrap midnight)
    TimeOfDay(RestrictionWindow),
}

impl Clause {
    fn holds(&self, device: &Device, minute_of_day: u16) -> bool {
        match self {
            Clause::DeviceTypeIs(t) => device.device_type == *t,
            Clause::DeviceTypeIsNot(t) => device.device_type != *t,
            Clause::OwnerIs(c) => device.owner_category == *c,
            Clause::OwnerIsNot(c) => device.owner_category != *c,
            Clause::TrustScore { cmp, threshold } => cmp.holds(device.trust_score, *threshold),
            Clause::IsBlocked(b) => device.is_blocked == *b,
            Clause::TimeOfDay(window) => window.contains(minute_of_day),
        }
    }
}

/// AND of clauses. An empty predicate matches every device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub clauses: Vec<Clause>,
}

impl Predicate {
    pub fn new(clauses: Vec<Clause>) -> Self {
        Self { clauses }
    }

    /// Evaluate against a device snapshot and the local minute-of-day
    pub fn matches(&self, device: &Device, minute_of_day: u16) -> bool {
        self.clauses.iter().all(|c| c.holds(device, minute_of_day))
    }

    /// Conservative disjointness check used for conflict detection at
    /// rule-add time. Two predicates are provably disjoint when some
    /// clause pair can never both hold; anything weaker counts as
    /// overlapping.
    pub fn provably_disjoint(&self, other: &Predicate) -> bool {
        for a in &self.clauses {
            for b in &other.clauses {
                if clauses_disjoint(a, b) {
                    return true;
                }
            }
        }
        false
    }
}

fn clauses_disjoint(a: &Clause, b: &Clause) -> bool {
    use Clause::*;
    match (a, b) {
        (DeviceTypeIs(x), DeviceTypeIs(y)) => x != y,
        (DeviceTypeIs(x), DeviceTypeIsNot(y)) | (DeviceTypeIsNot(y), DeviceTypeIs(x)) => x == y,
        (OwnerIs(x), OwnerIs(y)) => x != y,
        (OwnerIs(x), OwnerIsNot(y)) | (OwnerIsNot(y), OwnerIs(x)) => x == y,
        (IsBlocked(x), IsBlocked(y)) => x != y,
        (
            TrustScore { cmp: ca, threshold: ta },
            TrustScore { cmp: cb, threshold: tb },
        ) => score_ranges_disjoint(*ca, *ta, *cb, *tb),
        (TimeOfDay(wa), TimeOfDay(wb)) => !windows_overlap(wa, wb),
        _ => false,
    }
}

fn score_ranges_disjoint(ca: Comparison, ta: f64, cb: Comparison, tb: f64) -> bool {
    // Only an upper bound paired with a lower bound can be disjoint
    let bound = |cmp: Comparison, t: f64| match cmp {
        Comparison::LessThan => (Some((t, true)), None),  // x < t
        Comparison::AtMost => (Some((t, false)), None),   // x <= t
        Comparison::GreaterThan => (None, Some((t, true))), // x > t
        Comparison::AtLeast => (None, Some((t, false))),  // x >= t
    };
    let (upper_a, lower_a) = bound(ca, ta);
    let (upper_b, lower_b) = bound(cb, tb);

    let check = |upper: Option<(f64, bool)>, lower: Option<(f64, bool)>| match (upper, lower) {
        (Some((u, u_strict)), Some((l, l_strict))) => l > u || (l == u && (u_strict || l_strict)),
        _ => false,
    };
    check(upper_a, lower_b) || check(upper_b, lower_a)
}

fn windows_overlap(a: &RestrictionWindow, b: &RestrictionWindow) -> bool {
    // Windows are at most a day long; a shared minute means overlap
    (0u16..24 * 60).any(|m| a.contains(m) && b.contains(m))
}

/// A prioritized predicate-to-action mapping. Immutable once created
/// apart from the activation flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Unique rule id; built-ins carry the reserved prefix
    pub id: String,

    /// Evaluation order, lower first
    pub priority: i32,

    /// Condition the device+context must satisfy
    pub predicate: Predicate,

    /// Action taken when the predicate holds
    pub action: Action,

    /// Inactive rules are skipped during evaluation
    pub is_active: bool,

    /// Built-in rules cannot be deleted, only deactivated
    pub built_in: bool,
}

impl PolicyRule {
    pub fn new(id: impl Into<String>, priority: i32, predicate: Predicate, action: Action) -> Self {
        Self {
            id: id.into(),
            priority,
            predicate,
            action,
            is_active: true,
            built_in: false,
        }
    }

    pub fn is_builtin_id(id: &str) -> bool {
        id.starts_with(BUILTIN_PREFIX)
    }
}

/// The engine's built-in rules, in priority order. The night curfew
/// ships inactive; households opt in.
pub fn builtin_rules(low_trust_threshold: f64) -> Vec<PolicyRule> {
    let mut unknown = PolicyRule::new(
        format!("{}unknown-device", BUILTIN_PREFIX),
        10,
        Predicate::new(vec![Clause::DeviceTypeIs(DeviceType::Unknown)]),
        Action::Block,
    );
    unknown.built_in = true;

    let mut low_trust = PolicyRule::new(
        format!("{}low-trust", BUILTIN_PREFIX),
        20,
        Predicate::new(vec![Clause::TrustScore {
            cmp: Comparison::LessThan,
            threshold: low_trust_threshold,
        }]),
        Action::Restrict,
    );
    low_trust.built_in = true;

    let mut curfew = PolicyRule::new(
        format!("{}night-curfew", BUILTIN_PREFIX),
        30,
        Predicate::new(vec![Clause::TimeOfDay(RestrictionWindow {
            start_min: 22 * 60,
            end_min: 6 * 60,
        })]),
        Action::Block,
    );
    curfew.built_in = true;
    curfew.is_active = false;

    vec![unknown, low_trust, curfew]
}
