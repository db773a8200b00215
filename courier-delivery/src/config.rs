//! Engine configuration.

use serde::Deserialize;

use crate::limiter::RateLimitConfig;
use crate::pool::PoolConfig;
use crate::resolver::ResolverConfig;
use crate::retry::RetryPolicy;
use crate::signer::SignerConfig;
use crate::warmup::WarmupSchedule;

/// Timeouts applied to individual SMTP commands during a delivery.
/// Session setup has its own timeout in the pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpTimeouts {
    /// Envelope commands (MAIL, RCPT, DATA, RSET), in seconds.
    #[serde(default = "default_command_secs")]
    pub command_secs: u64,

    /// Payload transfer after DATA, in seconds.
    #[serde(default = "default_data_secs")]
    pub data_secs: u64,
}

const fn default_command_secs() -> u64 {
    30
}

const fn default_data_secs() -> u64 {
    120
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            command_secs: default_command_secs(),
            data_secs: default_data_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Concurrent delivery workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Hostname announced in EHLO.
    #[serde(default = "default_helo_hostname")]
    pub helo_hostname: String,

    /// How long an idle worker parks on the queue before re-checking
    /// for shutdown, in milliseconds.
    #[serde(default = "default_claim_wait_ms")]
    pub claim_wait_ms: u64,

    /// A saturated destination with a wait at or below this is slept
    /// through inline instead of requeued, in milliseconds.
    #[serde(default = "default_max_inline_wait_ms")]
    pub max_inline_wait_ms: u64,

    /// Requeue delay when a sending identity has exhausted its warmup
    /// allowance, in seconds.
    #[serde(default = "default_warmup_defer_secs")]
    pub warmup_defer_secs: u64,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    #[serde(default)]
    pub warmup: WarmupSchedule,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub timeouts: SmtpTimeouts,

    /// DKIM keys, keyed by sending domain.
    #[serde(default)]
    pub signing: SignerConfig,
}

const fn default_workers() -> usize {
    4
}

fn default_helo_hostname() -> String {
    "localhost".to_owned()
}

const fn default_claim_wait_ms() -> u64 {
    500
}

const fn default_max_inline_wait_ms() -> u64 {
    2000
}

const fn default_warmup_defer_secs() -> u64 {
    3600
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            helo_hostname: default_helo_hostname(),
            claim_wait_ms: default_claim_wait_ms(),
            max_inline_wait_ms: default_max_inline_wait_ms(),
            warmup_defer_secs: default_warmup_defer_secs(),
            resolver: ResolverConfig::default(),
            rate_limits: RateLimitConfig::default(),
            warmup: WarmupSchedule::default(),
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            timeouts: SmtpTimeouts::default(),
            signing: SignerConfig::default(),
        }
    }
}
