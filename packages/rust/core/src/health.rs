//! Per-source health state machine.
//!
//! Levels are a function of `consecutive_failures` alone: below the degraded
//! threshold a source is healthy, from it degraded, from the unhealthy
//! threshold unhealthy. Entering degraded or unhealthy starts a cooldown.

use chrono::{DateTime, Duration, Utc};

use sourcewatch_shared::{HealthLevel, HealthRecord, Settings, SourceStatus};

/// Final outcome of a source in one run, fed to the tracker exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// Fetched successfully; `empty` when zero items came back.
    Success { empty: bool },
    Failure { error: String },
}

/// Thresholds and cooldown durations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthPolicy {
    pub degraded_after_failures: u32,
    pub unhealthy_after_failures: u32,
    /// `None` means entering degraded sets no cooldown.
    pub degraded_cooldown: Option<Duration>,
    pub unhealthy_cooldown: Option<Duration>,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for HealthPolicy {
    fn from(settings: &Settings) -> Self {
        let degraded = settings.degraded_after_failures.clamp(1, 10);
        let unhealthy = settings.unhealthy_after_failures.clamp(degraded, 20);
        Self {
            degraded_after_failures: degraded,
            unhealthy_after_failures: unhealthy,
            degraded_cooldown: cooldown_minutes(
                settings.degraded_cooldown_minutes,
                MAX_DEGRADED_COOLDOWN_MINUTES,
            ),
            unhealthy_cooldown: cooldown_minutes(
                settings.unhealthy_cooldown_minutes,
                MAX_UNHEALTHY_COOLDOWN_MINUTES,
            ),
        }
    }
}

/// One week.
const MAX_DEGRADED_COOLDOWN_MINUTES: u64 = 7 * 24 * 60;
/// Two weeks.
const MAX_UNHEALTHY_COOLDOWN_MINUTES: u64 = 14 * 24 * 60;

fn cooldown_minutes(minutes: u64, max: u64) -> Option<Duration> {
    match minutes.min(max) {
        0 => None,
        m => Some(Duration::minutes(m as i64)),
    }
}

impl HealthPolicy {
    /// Level implied by a failure count.
    pub fn level_for(&self, consecutive_failures: u32) -> HealthLevel {
        if consecutive_failures >= self.unhealthy_after_failures {
            HealthLevel::Unhealthy
        } else if consecutive_failures >= self.degraded_after_failures {
            HealthLevel::Degraded
        } else {
            HealthLevel::Healthy
        }
    }

    /// Compute the next record from `prev` and the run's outcome.
    pub fn apply(&self, prev: &HealthRecord, event: &HealthEvent, now: DateTime<Utc>) -> HealthRecord {
        match event {
            HealthEvent::Success { empty } => HealthRecord {
                level: HealthLevel::Healthy,
                consecutive_failures: 0,
                cooldown_until: None,
                last_status: Some(if *empty {
                    SourceStatus::Empty
                } else {
                    SourceStatus::Ok
                }),
                last_error: None,
                last_checked_at: Some(now),
                last_success_at: Some(now),
            },
            HealthEvent::Failure { error } => {
                let failures = prev.consecutive_failures.saturating_add(1);
                let level = self.level_for(failures);
                let cooldown = match level {
                    HealthLevel::Unhealthy => self.unhealthy_cooldown,
                    HealthLevel::Degraded => self.degraded_cooldown,
                    HealthLevel::Healthy => None,
                };
                HealthRecord {
                    level,
                    consecutive_failures: failures,
                    cooldown_until: cooldown.map(|d| now + d),
                    last_status: Some(SourceStatus::Error),
                    last_error: Some(error.clone()),
                    last_checked_at: Some(now),
                    last_success_at: prev.last_success_at,
                }
            }
        }
    }
}
