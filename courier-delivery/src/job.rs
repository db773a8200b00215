//! Delivery jobs and their priority classes.

use std::fmt::{Display, Formatter};
use std::time::SystemTime;

use courier_common::EmailAddress;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique, lexically sortable job identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(Ulid);

impl JobId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Milliseconds since the Unix epoch, from the ulid's timestamp
    /// component.
    #[must_use]
    pub const fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }
}

#[cfg(test)]
impl From<Ulid> for JobId {
    fn from(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::generate()
    }
}

/// Which lane a job is drained from. Tiers 10 down to 1 are always
/// served before the bulk lane, which is served before the retry lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Numbered lane, 1 (lowest) through 10 (highest).
    Tier(u8),
    /// Campaign traffic with no explicit tier.
    Bulk,
    /// Jobs coming back around after a transient failure.
    Retry,
}

impl Priority {
    pub(crate) const LANES: usize = 12;

    /// Index into the lane array, in drain order.
    #[must_use]
    pub(crate) fn lane(self) -> usize {
        match self {
            Self::Tier(n) => {
                let n = usize::from(n.clamp(1, 10));
                10 - n
            }
            Self::Bulk => 10,
            Self::Retry => 11,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Bulk
    }
}

/// A single message awaiting delivery to a single recipient.
///
/// Fan-out to multiple recipients happens upstream of the queue: each
/// recipient gets its own job so that suppression, throttling, and
/// retry decisions never couple unrelated recipients together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJob {
    #[serde(default)]
    pub id: JobId,
    pub sender: EmailAddress,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub recipient: EmailAddress,
    pub subject: String,
    #[serde(default)]
    pub html_body: Option<String>,
    #[serde(default)]
    pub text_body: Option<String>,
    /// Owning account, scopes suppression and webhook events.
    pub account_id: String,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Attempts consumed so far. Bumped only by real delivery failures,
    /// never by quota deferrals.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "SystemTime::now")]
    pub created_at: SystemTime,
}

impl DeliveryJob {
    /// The sending identity this job counts against for warmup and
    /// reputation purposes: the sender's domain.
    #[must_use]
    pub fn identity(&self) -> &str {
        self.sender.domain().as_ref()
    }
}
