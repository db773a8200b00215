//! Send-rate admission control.
//!
//! Two independent gates guard every delivery attempt:
//!
//! - a per-destination-domain token bucket (messages per minute), so a
//!   burst of traffic never hammers one receiving provider, and
//! - the warmup allowance of the sending identity, enforced through
//!   atomic day and hour counters so concurrent workers can never
//!   jointly overshoot a cap.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use courier_common::Domain;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use crate::warmup::WarmupTracker;

/// Windowed counters with an indivisible check-and-increment.
#[derive(Debug, Default)]
pub struct CounterStore {
    counters: DashMap<String, AtomicU64>,
}

impl CounterStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments `key` only if the current value is below `limit`.
    /// Returns whether the increment happened. The comparison and the
    /// increment are a single atomic operation.
    pub fn check_and_increment(&self, key: &str, limit: u64) -> bool {
        let entry = self
            .counters
            .entry(key.to_owned())
            .or_insert_with(|| AtomicU64::new(0));

        entry
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < limit).then_some(current + 1)
            })
            .is_ok()
    }

    /// Undo one increment, for admissions granted here but refused by
    /// a later gate.
    pub fn decrement(&self, key: &str) {
        if let Some(entry) = self.counters.get(key) {
            let _ = entry.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> u64 {
        self.counters
            .get(key)
            .map_or(0, |entry| entry.load(Ordering::Acquire))
    }

    /// Drops every window key that does not carry `live_day`'s date
    /// stamp. Day and hour keys both embed it, so one sweep per day
    /// rollover keeps the store bounded.
    pub fn prune_stale(&self, live_day: &str) {
        self.counters.retain(|key, _| key.contains(live_day));
    }
}

/// Continuous-refill token bucket. Capacity is one minute's quota,
/// refilled at `per_minute / 60` tokens per second.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_minute: u32) -> Self {
        let capacity = f64::from(per_minute.max(1));
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = Instant::now();
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Return a token taken by an admission that was later refused.
    fn refund(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }

    fn time_until_available(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let needed = 1.0 - self.tokens;
        Duration::from_secs_f64(needed / self.refill_per_sec)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Messages per minute for domains without an override.
    #[serde(default = "default_per_minute")]
    pub default_per_minute: u32,

    /// Per-destination-domain caps. Ships with conservative defaults
    /// for the big webmail providers.
    #[serde(default = "default_domain_overrides")]
    pub domain_overrides: AHashMap<String, u32>,
}

const fn default_per_minute() -> u32 {
    60
}

fn default_domain_overrides() -> AHashMap<String, u32> {
    let mut overrides = AHashMap::new();
    for domain in ["gmail.com", "googlemail.com"] {
        overrides.insert(domain.to_owned(), 50);
    }
    for domain in ["yahoo.com", "outlook.com", "hotmail.com", "live.com", "aol.com"] {
        overrides.insert(domain.to_owned(), 30);
    }
    overrides
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_per_minute: default_per_minute(),
            domain_overrides: default_domain_overrides(),
        }
    }
}

/// Verdict for one attempted send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// The destination domain's bucket is empty. Come back after
    /// `retry_after`.
    DomainSaturated { retry_after: Duration },
    /// The sending identity has used up its warmup allowance for the
    /// current day or hour.
    WarmupExhausted { identity: String },
}

pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<Domain, Arc<Mutex<TokenBucket>>>,
    counters: Arc<CounterStore>,
    warmup: Arc<WarmupTracker>,
    // Date stamp of the last counter sweep, so stale windows are
    // evicted once per day rollover.
    pruned_day: Mutex<String>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(
        config: RateLimitConfig,
        counters: Arc<CounterStore>,
        warmup: Arc<WarmupTracker>,
    ) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            counters,
            warmup,
            pruned_day: Mutex::new(String::new()),
        }
    }

    fn per_minute(&self, domain: &Domain) -> u32 {
        self.config
            .domain_overrides
            .get(domain.as_ref())
            .copied()
            .unwrap_or(self.config.default_per_minute)
    }

    fn bucket(&self, domain: &Domain) -> Arc<Mutex<TokenBucket>> {
        Arc::clone(
            &self
                .buckets
                .entry(domain.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(TokenBucket::new(self.per_minute(domain))))
                }),
        )
    }

    /// Asks both gates for permission to send one message from
    /// `identity` to `domain` right now. On [`Admission::Granted`] the
    /// send is counted; any refusal leaves all counters untouched.
    pub fn admit(&self, domain: &Domain, identity: &str, now: DateTime<Utc>) -> Admission {
        self.prune_on_rollover(now);

        let bucket = self.bucket(domain);
        {
            let mut bucket = bucket.lock();
            if !bucket.try_consume() {
                let retry_after = bucket.time_until_available();
                debug!(%domain, ?retry_after, "destination domain saturated");
                return Admission::DomainSaturated { retry_after };
            }
        }

        if let Some(daily) = self.warmup.daily_limit(identity, now) {
            let day_key = day_key(identity, now);
            if !self.counters.check_and_increment(&day_key, daily) {
                bucket.lock().refund();
                debug!(identity, daily, "daily warmup allowance exhausted");
                return Admission::WarmupExhausted {
                    identity: identity.to_owned(),
                };
            }

            let hourly = WarmupTracker::hourly_limit(daily);
            let hour_key = hour_key(identity, now);
            if !self.counters.check_and_increment(&hour_key, hourly) {
                self.counters.decrement(&day_key);
                bucket.lock().refund();
                debug!(identity, hourly, "hourly warmup sublimit exhausted");
                return Admission::WarmupExhausted {
                    identity: identity.to_owned(),
                };
            }
        }

        Admission::Granted
    }

    /// Sends counted against `identity` today.
    #[must_use]
    pub fn sent_today(&self, identity: &str, now: DateTime<Utc>) -> u64 {
        self.counters.get(&day_key(identity, now))
    }

    /// Evicts the previous day's window counters the first time an
    /// admission arrives on a new calendar day.
    fn prune_on_rollover(&self, now: DateTime<Utc>) {
        let stamp = now.format("%Y-%m-%d").to_string();
        let mut pruned = self.pruned_day.lock();
        if *pruned != stamp {
            pruned.clone_from(&stamp);
            drop(pruned);
            self.counters.prune_stale(&stamp);
        }
    }
}

fn day_key(identity: &str, now: DateTime<Utc>) -> String {
    format!("sent:{identity}:{}", now.format("%Y-%m-%d"))
}

fn hour_key(identity: &str, now: DateTime<Utc>) -> String {
    format!("sent:{identity}:{}", now.format("%Y-%m-%d-%H"))
}
