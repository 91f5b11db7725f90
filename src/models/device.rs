use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Schema version written into every persisted device record so the
/// on-disk layout can evolve additively.
pub const DEVICE_SCHEMA_VERSION: u32 = 1;

/// Maximum security alerts retained per device, oldest dropped first
const MAX_ALERTS: usize = 100;

/// Error types for device state validation
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Trust score {0} outside [0.0, 1.0]")]
    TrustScoreOutOfRange(f64),

    #[error("Blocked flag and block reason disagree: blocked={blocked}, reason={reason}")]
    BlockStateMismatch { blocked: bool, reason: BlockReason },

    #[error("Restriction window start and end are equal ({0} minutes past midnight)")]
    EmptyRestrictionWindow(u16),

    #[error("Restriction window boundary {0} outside a 24h day")]
    WindowOutOfRange(u16),

    #[error("Invalid MAC address format: {0}")]
    InvalidMacAddress(String),
}

/// Result type for validation
pub type ValidationResult<T> = Result<T, ValidationError>;

/// What kind of hardware a device appears to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    Unknown,
    Smartphone,
    Tablet,
    Laptop,
    Desktop,
    SmartTv,
    GameConsole,
    SmartSpeaker,
    Iot,
    Router,
    Camera,
    Printer,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceType::Unknown => "unknown",
            DeviceType::Smartphone => "smartphone",
            DeviceType::Tablet => "tablet",
            DeviceType::Laptop => "laptop",
            DeviceType::Desktop => "desktop",
            DeviceType::SmartTv => "smart_tv",
            DeviceType::GameConsole => "game_console",
            DeviceType::SmartSpeaker => "smart_speaker",
            DeviceType::Iot => "iot",
            DeviceType::Router => "router",
            DeviceType::Camera => "camera",
            DeviceType::Printer => "printer",
        };
        write!(f, "{}", s)
    }
}

/// Who the device most likely belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnerCategory {
    Unknown,
    Child,
    Teenager,
    Adult,
    Guest,
}

/// Why a device is currently blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockReason {
    None,
    TimeLimit,
    InappropriateContent,
    ParentBlocked,
    PolicyBlocked,
    ScheduleRestriction,
    SecurityThreat,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlockReason::None => "none",
            BlockReason::TimeLimit => "time_limit",
            BlockReason::InappropriateContent => "inappropriate_content",
            BlockReason::ParentBlocked => "parent_blocked",
            BlockReason::PolicyBlocked => "policy_blocked",
            BlockReason::ScheduleRestriction => "schedule_restriction",
            BlockReason::SecurityThreat => "security_threat",
        };
        write!(f, "{}", s)
    }
}

/// Severity of a security alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Security alert attached to a device. Append-only apart from the
/// `resolved` flag, which an external reviewer may flip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityAlert {
    /// Unique alert id
    pub id: Uuid,

    /// Severity level
    pub severity: AlertSeverity,

    /// Human readable description
    pub description: String,

    /// When the alert was raised
    pub timestamp: DateTime<Utc>,

    /// Whether a reviewer has resolved it
    pub resolved: bool,
}

impl SecurityAlert {
    pub fn new(severity: AlertSeverity, description: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            severity,
            description: description.into(),
            timestamp: now,
            resolved: false,
        }
    }
}

/// Daily time-of-day window during which a device should not be used.
/// Boundaries are minutes past local midnight; a window whose start is
/// after its end wraps across midnight (e.g. 22:00-06:00).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestrictionWindow {
    /// Window start, minutes past midnight (inclusive)
    pub start_min: u16,

    /// Window end, minutes past midnight (exclusive)
    pub end_min: u16,
}

impl RestrictionWindow {
    pub fn new(start_min: u16, end_min: u16) -> ValidationResult<Self> {
        if start_min >= 24 * 60 {
            return Err(ValidationError::WindowOutOfRange(start_min));
        }
        if end_min >= 24 * 60 {
            return Err(ValidationError::WindowOutOfRange(end_min));
        }
        if start_min == end_min {
            return Err(ValidationError::EmptyRestrictionWindow(start_min));
        }
        Ok(Self { start_min, end_min })
    }

    /// Check whether a minute-of-day falls inside the window, handling
    /// windows that cross midnight.
    pub fn contains(&self, minute_of_day: u16) -> bool {
        if self.start_min < self.end_min {
            minute_of_day >= self.start_min && minute_of_day < self.end_min
        } else {
            minute_of_day >= self.start_min || minute_of_day < self.end_min
        }
    }
}

/// The durable, classified, policy-bearing record for one piece of
/// hardware on the network. Keyed by MAC address; never hard-deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Stable synthetic id
    pub id: Uuid,

    /// Normalized MAC address, the natural key for merging
    pub mac_address: String,

    /// Last known IP address
    pub ip_address: Option<IpAddr>,

    /// Last observed hostname
    pub hostname: Option<String>,

    /// Person this device has been assigned to, if any
    pub assigned_user: Option<String>,

    /// Classified hardware type
    pub device_type: DeviceType,

    /// Classified owner category
    pub owner_category: OwnerCategory,

    /// Whether the device is currently blocked from the network
    pub is_blocked: bool,

    /// Why the device is blocked (None when it is not)
    pub block_reason: BlockReason,

    /// Deterministic trust score in [0.0, 1.0]
    pub trust_score: f64,

    /// Sites this device must never reach
    pub blocked_sites: HashSet<String>,

    /// Sites always permitted for this device
    pub allowed_sites: HashSet<String>,

    /// Daily screen-time allowance in minutes
    pub daily_limit_min: u32,

    /// Minutes of usage accumulated today
    pub used_today_min: u32,

    /// Exempt from all time-budget enforcement
    pub always_on: bool,

    /// Optional daily no-use window
    pub restriction_window: Option<RestrictionWindow>,

    /// First time this MAC was ever observed
    pub first_seen: DateTime<Utc>,

    /// Most recent observation
    pub last_seen: DateTime<Utc>,

    /// Seen during the latest discovery pass
    pub is_connected: bool,

    /// Security alerts raised against this device
    pub alerts: Vec<SecurityAlert>,

    /// On-disk record version
    pub schema_version: u32,
}

impl Device {
    /// Create a fresh device record with engine defaults. The MAC must
    /// already be normalized (see `observation::normalize_mac`).
    pub fn new(mac_address: String, default_daily_limit_min: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mac_address,
            ip_address: None,
            hostname: None,
            assigned_user: None,
            device_type: DeviceType::Unknown,
            owner_category: OwnerCategory::Unknown,
            is_blocked: false,
            block_reason: BlockReason::None,
            trust_score: 0.5,
            blocked_sites: HashSet::new(),
            allowed_sites: HashSet::new(),
            daily_limit_min: default_daily_limit_min,
            used_today_min: 0,
            always_on: false,
            restriction_window: None,
            first_seen: now,
            last_seen: now,
            is_connected: true,
            alerts: Vec::new(),
            schema_version: DEVICE_SCHEMA_VERSION,
        }
    }

    /// Check the record invariants. Called before every persist.
    pub fn validate(&self) -> ValidationResult<()> {
        if !(0.0..=1.0).contains(&self.trust_score) || self.trust_score.is_nan() {
            return Err(ValidationError::TrustScoreOutOfRange(self.trust_score));
        }
        if self.is_blocked != (self.block_reason != BlockReason::None) {
            return Err(ValidationError::BlockStateMismatch {
                blocked: self.is_blocked,
                reason: self.block_reason,
            });
        }
        if let Some(window) = &self.restriction_window {
            // Re-check in case the record was deserialized from disk
            RestrictionWindow::new(window.start_min, window.end_min)?;
        }
        Ok(())
    }

    /// Block the device, keeping flag and reason in lockstep
    pub fn block(&mut self, reason: BlockReason) {
        debug_assert!(reason != BlockReason::None);
        self.is_blocked = true;
        self.block_reason = reason;
    }

    /// Unblock the device
    pub fn unblock(&mut self) {
        self.is_blocked = false;
        self.block_reason = BlockReason::None;
    }

    /// Append an alert, dropping the oldest once the list is full
    pub fn push_alert(&mut self, alert: SecurityAlert) {
        if self.alerts.len() >= MAX_ALERTS {
            self.alerts.remove(0);
        }
        self.alerts.push(alert);
    }

    /// Mark an alert resolved. Returns false if the id is unknown.
    pub fn resolve_alert(&mut self, alert_id: Uuid) -> bool {
        match self.alerts.iter_mut().find(|a| a.id == alert_id) {
            Some(alert) => {
                alert.resolved = true;
                true
            }
            None => false,
        }
    }

    /// Count of alerts not yet resolved
    pub fn unresolved_alerts(&self) -> usize {
        self.alerts.iter().filter(|a| !a.resolved).count()
    }

    /// Whether any unresolved alert is at or above the given severity
    pub fn has_unresolved_alert_at_least(&self, severity: AlertSeverity) -> bool {
        self.alerts
            .iter()
            .any(|a| !a.resolved && a.severity >= severity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::new("AA:BB:CC:DD:EE:FF".to_string(), 480, Utc::now())
    }

    #[test]
    fn new_device_has_engine_defaults() {
        let d = device();
        assert_eq!(d.trust_score, 0.5);
        assert_eq!(d.owner_category, OwnerCategory::Unknown);
        assert_eq!(d.daily_limit_min, 480);
        assert!(!d.is_blocked);
        assert!(d.validate().is_ok());
    }

    #[test]
    fn block_flag_and_reason_stay_in_lockstep() {
        let mut d = device();
        d.block(BlockReason::ParentBlocked);
        assert!(d.validate().is_ok());
        d.unblock();
        assert!(d.validate().is_ok());

        // Corrupt the pair on purpose
        d.is_blocked = true;
        assert!(matches!(
            d.validate(),
            Err(ValidationError::BlockStateMismatch { .. })
        ));
    }

    #[test]
    fn trust_score_outside_range_fails_validation() {
        let mut d = device();
        d.trust_score = 1.2;
        assert!(matches!(
            d.validate(),
            Err(ValidationError::TrustScoreOutOfRange(_))
        ));
    }

    #[test]
    fn restriction_window_wraps_midnight() {
        // 22:00 - 06:00
        let w = RestrictionWindow::new(22 * 60, 6 * 60).unwrap();
        assert!(w.contains(23 * 60 + 30));
        assert!(w.contains(5 * 60 + 30));
        assert!(!w.contains(12 * 60));
        // boundaries: start inclusive, end exclusive
        assert!(w.contains(22 * 60));
        assert!(!w.contains(6 * 60));
    }

    #[test]
    fn restriction_window_rejects_degenerate_bounds() {
        assert!(RestrictionWindow::new(600, 600).is_err());
        assert!(RestrictionWindow::new(1500, 120).is_err());
    }

    #[test]
    fn alert_list_is_bounded() {
        let mut d = device();
        for i in 0..(MAX_ALERTS + 10) {
            d.push_alert(SecurityAlert::new(
                AlertSeverity::Low,
                format!("alert {}", i),
                Utc::now(),
            ));
        }
        assert_eq!(d.alerts.len(), MAX_ALERTS);
        assert_eq!(d.alerts[0].description, "alert 10");
    }

    #[test]
    fn resolve_alert_flips_only_the_matching_one() {
        let mut d = device();
        let a = SecurityAlert::new(AlertSeverity::High, "open telnet port", Utc::now());
        let id = a.id;
        d.push_alert(a);
        assert!(d.has_unresolved_alert_at_least(AlertSeverity::High));
        assert!(d.resolve_alert(id));
        assert_eq!(d.unresolved_alerts(), 0);
        assert!(!d.resolve_alert(Uuid::new_v4()));
    }
}
