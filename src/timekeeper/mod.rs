use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::models::device::{BlockReason, Device};

/// Usage violations retained per device, oldest dropped first
const MAX_VIOLATIONS: usize = 500;

/// Kind of time-policy violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationKind {
    /// Device was active inside its restriction window. A
    /// notification, not an automatic block.
    RestrictedTimeAccess,

    /// Device ran its daily budget to zero
    DailyLimitExceeded,
}

/// One recorded time-policy violation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageViolation {
    pub kind: ViolationKind,
    pub timestamp: DateTime<Utc>,
}

/// Per-device time-tracking extras. Survives the daily reset apart
/// from the fields the reset explicitly zeroes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeEntry {
    /// Extra minutes granted on top of the daily limit
    pub extra_min: u32,

    /// Why the last grant was made
    pub extra_reason: Option<String>,

    /// Ticking is suspended until this instant
    pub paused_until: Option<DateTime<Utc>>,

    /// Low-time warning may fire; disarmed after firing, re-armed by a
    /// grant or the daily reset so it fires once per threshold crossing
    pub warning_armed: bool,

    /// Recorded violations, bounded
    pub violations: Vec<UsageViolation>,
}

impl Default for TimeEntry {
    fn default() -> Self {
        Self {
            extra_min: 0,
            extra_reason: None,
            paused_until: None,
            warning_armed: true,
            violations: Vec::new(),
        }
    }
}

impl TimeEntry {
    fn record_violation(&mut self, kind: ViolationKind, now: DateTime<Utc>) {
        if self.violations.len() >= MAX_VIOLATIONS {
            self.violations.remove(0);
        }
        self.violations.push(UsageViolation { kind, timestamp: now });
    }
}

/// Events produced by one tracker tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeEvent {
    /// Remaining allowance dropped into the warning band
    Warning { remaining_min: u32 },

    /// Daily allowance exhausted; the device was just blocked
    LimitExceeded,

    /// Device active inside its restriction window
    RestrictedAccess,
}

struct TrackerState {
    entries: HashMap<String, TimeEntry>,
    last_reset_date: Option<NaiveDate>,
}

/// Per-device daily usage accounting: minute ticks, restriction
/// windows, extra-time grants, low-time warnings and automatic
/// blocking on exhaustion.
pub struct TimeBudgetTracker {
    state: Mutex<TrackerState>,
    warn_threshold_min: u32,
}

impl TimeBudgetTracker {
    pub fn new(warn_threshold_min: u32) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                entries: HashMap::new(),
                last_reset_date: None,
            }),
            warn_threshold_min,
        }
    }

    /// Restore persisted extras and the last-reset marker
    pub async fn restore(
        &self,
        last_reset_date: Option<NaiveDate>,
        entries: Vec<(String, TimeEntry)>,
    ) {
        let mut state = self.state.lock().await;
        state.last_reset_date = last_reset_date;
        state.entries = entries.into_iter().collect();
    }

    /// Export state for persistence
    pub async fn export(&self) -> (Option<NaiveDate>, Vec<(String, TimeEntry)>) {
        let state = self.state.lock().await;
        (
            state.last_reset_date,
            state.entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        )
    }

    /// Advance one device by one minute of wall-clock usage.
    ///
    /// The caller only ticks connected, unblocked, non-always-on
    /// devices, but the same guards are re-checked here so a stray call
    /// cannot corrupt accounting. `minute_of_day` is local time for the
    /// restriction-window check.
    pub async fn tick(
        &self,
        device: &mut Device,
        now: DateTime<Utc>,
        minute_of_day: u16,
    ) -> Vec<TimeEvent> {
        if !device.is_connected || device.is_blocked || device.always_on {
            return Vec::new();
        }

        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .entry(device.mac_address.clone())
            .or_default();

        if let Some(until) = entry.paused_until {
            if until > now {
                return Vec::new();
            }
            entry.paused_until = None;
        }

        if let Some(window) = &device.restriction_window {
            if window.contains(minute_of_day) {
                entry.record_violation(ViolationKind::RestrictedTimeAccess, now);
                debug!(
                    "Device {} active inside restriction window",
                    device.mac_address
                );
                return vec![TimeEvent::RestrictedAccess];
            }
        }

        device.used_today_min += 1;

        let total_allowed = device.daily_limit_min + entry.extra_min;
        if device.used_today_min >= total_allowed {
            device.block(BlockReason::TimeLimit);
            entry.record_violation(ViolationKind::DailyLimitExceeded, now);
            info!(
                "Device {} exhausted its daily allowance ({} min)",
                device.mac_address, total_allowed
            );
            return vec![TimeEvent::LimitExceeded];
        }

        let remaining = total_allowed - device.used_today_min;
        if remaining <= self.warn_threshold_min {
            if entry.warning_armed {
                entry.warning_armed = false;
                return vec![TimeEvent::Warning {
                    remaining_min: remaining,
                }];
            }
        } else {
            entry.warning_armed = true;
        }

        Vec::new()
    }

    /// Grant extra minutes on top of the daily limit. A device blocked
    /// for exhausting its budget is unblocked immediately, and the
    /// low-time warning is re-armed for the new threshold crossing.
    pub async fn grant_extra_time(
        &self,
        device: &mut Device,
        minutes: u32,
        reason: impl Into<String>,
    ) {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .entry(device.mac_address.clone())
            .or_default();
        entry.extra_min += minutes;
        entry.extra_reason = Some(reason.into());
        entry.warning_armed = true;

        if device.block_reason == BlockReason::TimeLimit {
            device.unblock();
            info!(
                "Device {} unblocked by extra-time grant of {} min",
                device.mac_address, minutes
            );
        }
    }

    /// Suspend ticking for a device until the given instant
    pub async fn pause(&self, mac: &str, until: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.entries.entry(mac.to_string()).or_default().paused_until = Some(until);
    }

    /// Total allowance (daily limit plus granted extras) for a device
    pub async fn total_allowed(&self, device: &Device) -> u32 {
        let state = self.state.lock().await;
        let extra = state
            .entries
            .get(&device.mac_address)
            .map(|e| e.extra_min)
            .unwrap_or(0);
        device.daily_limit_min + extra
    }

    /// Recorded violations for a device
    pub async fn violations(&self, mac: &str) -> Vec<UsageViolation> {
        let state = self.state.lock().await;
        state
            .entries
            .get(mac)
            .map(|e| e.violations.clone())
            .unwrap_or_default()
    }

    /// Run the daily reset if `today` differs from the recorded
    /// last-reset date. Guarded by the date marker rather than a timer,
    /// so a process asleep over midnight still resets exactly once on
    /// wake. Returns whether a reset actually ran.
    pub async fn reset_daily_if_needed(
        &self,
        today: NaiveDate,
        devices: &[Arc<RwLock<Device>>],
    ) -> bool {
        {
            let mut state = self.state.lock().await;
            if state.last_reset_date == Some(today) {
                return false;
            }
            state.last_reset_date = Some(today);
        }

        // Device lock first, then tracker state, matching every other
        // path so no two callers can deadlock each other
        for handle in devices {
            let mut device = handle.write().await;
            device.used_today_min = 0;
            if device.block_reason == BlockReason::TimeLimit {
                device.unblock();
            }

            let mut state = self.state.lock().await;
            let entry = state
                .entries
                .entry(device.mac_address.clone())
                .or_default();
            if !device.always_on {
                entry.extra_min = 0;
                entry.extra_reason = None;
            }
            entry.warning_armed = true;
        }

        info!("Daily time-budget reset completed for {}", today);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::device::RestrictionWindow;
    use chrono::Duration;

    const NOON: u16 = 12 * 60;

    fn device(limit_min: u32) -> Device {
        let mut d = Device::new("AA:BB:CC:DD:EE:FF".to_string(), limit_min, Utc::now());
        d.is_connected = true;
        d
    }

    #[tokio::test]
    async fn thirty_ticks_exhaust_a_thirty_minute_limit() {
        let tracker = TimeBudgetTracker::new(15);
        let mut d = device(30);
        let now = Utc::now();

        let mut limit_hit = false;
        for _ in 0..30 {
            let events = tracker.tick(&mut d, now, NOON).await;
            if events.contains(&TimeEvent::LimitExceeded) {
                limit_hit = true;
            }
        }

        assert!(limit_hit);
        assert!(d.is_blocked);
        assert_eq!(d.block_reason, BlockReason::TimeLimit);
        assert_eq!(d.used_today_min, 30);

        let violations = tracker.violations(&d.mac_address).await;
        assert!(violations
            .iter()
            .any(|v| v.kind == ViolationKind::DailyLimitExceeded));
    }

    #[tokio::test]
    async fn warning_fires_once_per_threshold_crossing() {
        let tracker = TimeBudgetTracker::new(15);
        let mut d = device(30);
        let now = Utc::now();

        let mut warnings = 0;
        for _ in 0..29 {
            for event in tracker.tick(&mut d, now, NOON).await {
                if matches!(event, TimeEvent::Warning { .. }) {
                    warnings += 1;
                }
            }
        }
        // remaining hits 15 at tick 15 and then keeps shrinking; the
        // warning must not re-fire every minute below the threshold
        assert_eq!(warnings, 1);
    }

    #[tokio::test]
    async fn grant_unblocks_and_rearms_the_warning() {
        let tracker = TimeBudgetTracker::new(15);
        let mut d = device(30);
        let now = Utc::now();

        for _ in 0..30 {
            tracker.tick(&mut d, now, NOON).await;
        }
        assert!(d.is_blocked);

        tracker.grant_extra_time(&mut d, 20, "homework").await;
        assert!(!d.is_blocked);
        assert_eq!(d.block_reason, BlockReason::None);
        assert_eq!(tracker.total_allowed(&d).await, 50);

        // Next crossing warns again exactly once
        let mut warnings = 0;
        for _ in 0..19 {
            for event in tracker.tick(&mut d, now, NOON).await {
                if matches!(event, TimeEvent::Warning { .. }) {
                    warnings += 1;
                }
            }
        }
        assert_eq!(warnings, 1);
    }

    #[tokio::test]
    async fn restriction_window_tick_records_violation_without_usage() {
        let tracker = TimeBudgetTracker::new(15);
        let mut d = device(60);
        d.restriction_window = Some(RestrictionWindow::new(22 * 60, 6 * 60).unwrap());
        let now = Utc::now();

        let events = tracker.tick(&mut d, now, 23 * 60 + 30).await;
        assert_eq!(events, vec![TimeEvent::RestrictedAccess]);
        assert_eq!(d.used_today_min, 0);
        // A notification, never an automatic block
        assert!(!d.is_blocked);

        // Outside the window usage counts normally
        let events = tracker.tick(&mut d, now, NOON).await;
        assert!(events.is_empty());
        assert_eq!(d.used_today_min, 1);
    }

    #[tokio::test]
    async fn paused_device_does_not_accumulate_usage() {
        let tracker = TimeBudgetTracker::new(15);
        let mut d = device(60);
        let now = Utc::now();

        tracker.pause(&d.mac_address, now + Duration::minutes(10)).await;
        assert!(tracker.tick(&mut d, now, NOON).await.is_empty());
        assert_eq!(d.used_today_min, 0);

        // Pause expired: ticking resumes
        let later = now + Duration::minutes(11);
        tracker.tick(&mut d, later, NOON).await;
        assert_eq!(d.used_today_min, 1);
    }

    #[tokio::test]
    async fn always_on_and_blocked_devices_are_skipped() {
        let tracker = TimeBudgetTracker::new(15);
        let now = Utc::now();

        let mut always_on = device(30);
        always_on.always_on = true;
        for _ in 0..100 {
            assert!(tracker.tick(&mut always_on, now, NOON).await.is_empty());
        }
        assert_eq!(always_on.used_today_min, 0);

        let mut blocked = device(30);
        blocked.block(BlockReason::ParentBlocked);
        assert!(tracker.tick(&mut blocked, now, NOON).await.is_empty());
        assert_eq!(blocked.used_today_min, 0);
    }

    #[tokio::test]
    async fn daily_reset_runs_once_per_calendar_day() {
        let tracker = TimeBudgetTracker::new(15);
        let now = Utc::now();

        let mut d = device(30);
        for _ in 0..30 {
            tracker.tick(&mut d, now, NOON).await;
        }
        assert!(d.is_blocked);
        let handle = Arc::new(RwLock::new(d));
        let devices = vec![handle.clone()];

        let today = NaiveDate::from_ymd_opt(2026, 8, 25).unwrap();
        assert!(tracker.reset_daily_if_needed(today, &devices).await);
        {
            let d = handle.read().await;
            assert_eq!(d.used_today_min, 0);
            assert!(!d.is_blocked);
        }

        // Second call the same day is a no-op
        {
            handle.write().await.used_today_min = 5;
        }
        assert!(!tracker.reset_daily_if_needed(today, &devices).await);
        assert_eq!(handle.read().await.used_today_min, 5);

        // A new day resets again, even if midnight was missed
        let tomorrow = today.succ_opt().unwrap();
        assert!(tracker.reset_daily_if_needed(tomorrow, &devices).await);
        assert_eq!(handle.read().await.used_today_min, 0);
    }

    #[tokio::test]
    async fn reset_keeps_extras_for_always_on_devices() {
        let tracker = TimeBudgetTracker::new(15);
        let today = NaiveDate::from_ymd_opt(2026, 8, 25).unwrap();

        let mut normal = device(30);
        tracker.grant_extra_time(&mut normal, 20, "chores done").await;
        let mut exempt = device(30);
        exempt.mac_address = "AA:BB:CC:DD:EE:01".to_string();
        exempt.always_on = true;
        tracker.grant_extra_time(&mut exempt, 20, "keep").await;

        let devices = vec![
            Arc::new(RwLock::new(normal)),
            Arc::new(RwLock::new(exempt)),
        ];
        tracker.reset_daily_if_needed(today, &devices).await;

        assert_eq!(
            tracker.total_allowed(&*devices[0].read().await).await,
            30
        );
        assert_eq!(
            tracker.total_allowed(&*devices[1].read().await).await,
            50
        );
    }

    #[tokio::test]
    async fn manual_block_does_not_count_as_time_limit_on_reset() {
        let tracker = TimeBudgetTracker::new(15);
        let today = NaiveDate::from_ymd_opt(2026, 8, 25).unwrap();

        let mut d = device(30);
        d.block(BlockReason::ParentBlocked);
        let handle = Arc::new(RwLock::new(d));
        tracker
            .reset_daily_if_needed(today, &[handle.clone()])
            .await;

        // Parent blocks survive the reset; only TimeLimit blocks lift
        assert!(handle.read().await.is_blocked);
    }
}
