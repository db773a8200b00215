//! Warmup ramp for new sending identities.
//!
//! A fresh sending domain starts with a small daily allowance that
//! grows along a configured schedule until the identity is considered
//! warmed and the cap disappears. The clock starts the first time the
//! identity is seen and never resets.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::BTreeMap;

/// One step of the ramp: from `day` onward (1-based), at most `limit`
/// messages per day. A step with no limit ends the ramp.
#[derive(Debug, Clone, Deserialize)]
pub struct WarmupStep {
    pub day: u32,
    #[serde(default)]
    pub limit: Option<u64>,
}

/// Ascending day-to-allowance schedule.
#[derive(Debug, Clone)]
pub struct WarmupSchedule {
    steps: BTreeMap<u32, Option<u64>>,
}

impl WarmupSchedule {
    #[must_use]
    pub fn from_steps(steps: &[WarmupStep]) -> Self {
        Self {
            steps: steps.iter().map(|s| (s.day, s.limit)).collect(),
        }
    }

    /// Daily allowance for the given 1-based warmup day. `None` means
    /// the identity is fully warmed.
    #[must_use]
    pub fn daily_limit(&self, day: u32) -> Option<u64> {
        self.steps
            .range(..=day)
            .next_back()
            .map_or(Some(0), |(_, limit)| *limit)
    }
}

impl Default for WarmupSchedule {
    /// Doubling ramp over two weeks, then unrestricted.
    fn default() -> Self {
        let steps = [
            WarmupStep { day: 1, limit: Some(50) },
            WarmupStep { day: 2, limit: Some(100) },
            WarmupStep { day: 3, limit: Some(200) },
            WarmupStep { day: 4, limit: Some(400) },
            WarmupStep { day: 5, limit: Some(800) },
            WarmupStep { day: 6, limit: Some(1600) },
            WarmupStep { day: 7, limit: Some(3200) },
            WarmupStep { day: 8, limit: Some(6400) },
            WarmupStep { day: 9, limit: Some(12800) },
            WarmupStep { day: 10, limit: Some(25000) },
            WarmupStep { day: 11, limit: Some(50000) },
            WarmupStep { day: 12, limit: Some(100_000) },
            WarmupStep { day: 13, limit: Some(200_000) },
            WarmupStep { day: 14, limit: None },
        ];
        Self::from_steps(&steps)
    }
}

impl<'de> Deserialize<'de> for WarmupSchedule {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let steps = Vec::<WarmupStep>::deserialize(deserializer)?;
        Ok(Self::from_steps(&steps))
    }
}

/// Tracks when each identity started sending and derives its current
/// allowance from the schedule.
#[derive(Debug)]
pub struct WarmupTracker {
    schedule: WarmupSchedule,
    // Write-once start stamps. The first observation of an identity
    // pins its day-1 date.
    starts: DashMap<String, DateTime<Utc>>,
}

impl WarmupTracker {
    #[must_use]
    pub fn new(schedule: WarmupSchedule) -> Self {
        Self {
            schedule,
            starts: DashMap::new(),
        }
    }

    /// Current 1-based warmup day for `identity`, stamping the start
    /// if this is the first time the identity is seen.
    pub fn warmup_day(&self, identity: &str, now: DateTime<Utc>) -> u32 {
        let start = *self
            .starts
            .entry(identity.to_owned())
            .or_insert(now)
            .value();

        let days = (now.date_naive() - start.date_naive()).num_days().max(0);
        u32::try_from(days).unwrap_or(u32::MAX).saturating_add(1)
    }

    /// Daily allowance for `identity` at `now`. `None` once warmed.
    pub fn daily_limit(&self, identity: &str, now: DateTime<Utc>) -> Option<u64> {
        let day = self.warmup_day(identity, now);
        self.schedule.daily_limit(day)
    }

    /// Hourly sublimit smoothing the daily allowance across the day:
    /// one twentieth of the daily allowance, but never below 10.
    #[must_use]
    pub fn hourly_limit(daily: u64) -> u64 {
        (daily / 20).max(10)
    }
}
