//! SMTP outcome classification.
//!
//! Maps a server reply (code plus text) to a delivery outcome. Textual
//! patterns are checked in a fixed order so overlapping phrasings
//! resolve the same way every time: complaint, then spam rejection,
//! then hard bounce, then soft bounce. Replies matching no pattern
//! fall back to the reply-code class.

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    /// Transient condition, worth retrying.
    SoftBounce,
    /// The recipient is permanently unreachable.
    HardBounce,
    /// Mail refused on content or reputation grounds.
    SpamRejection,
    /// The recipient reported the mail as unwanted.
    Complaint,
    /// Unclassifiable reply.
    Unknown,
}

impl Outcome {
    /// Whether this outcome lands the recipient on suppression lists.
    #[must_use]
    pub const fn suppresses(self) -> bool {
        matches!(self, Self::HardBounce | Self::SpamRejection | Self::Complaint)
    }

    /// Whether this outcome earns another delivery attempt.
    #[must_use]
    pub const fn retries(self) -> bool {
        matches!(self, Self::SoftBounce | Self::Unknown)
    }

    /// Label used in status reports and webhook payloads.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::SoftBounce => "soft_bounce",
            Self::HardBounce => "hard_bounce",
            Self::SpamRejection => "spam_rejection",
            Self::Complaint => "complaint",
            Self::Unknown => "unknown",
        }
    }
}

struct BounceRule {
    outcome: Outcome,
    pattern: Regex,
    detail: &'static str,
}

pub struct OutcomeClassifier {
    rules: Vec<BounceRule>,
}

impl OutcomeClassifier {
    #[must_use]
    pub fn new() -> Self {
        // Order matters: the first matching rule wins.
        let table: &[(Outcome, &str, &str)] = &[
            (
                Outcome::Complaint,
                r"complaint|abuse report|feedback loop|reported as spam by the recipient",
                "recipient complaint",
            ),
            (
                Outcome::SpamRejection,
                r"spam|blocklist|blacklist|blocked using|poor reputation|content rejected|rejected due to policy|spamhaus|barracuda",
                "rejected as spam",
            ),
            (
                Outcome::HardBounce,
                r"user unknown|unknown user|no such user|recipient not found|mailbox unavailable|mailbox not found|does not exist|invalid recipient|address rejected|account .*(disabled|deactivated)|no mailbox|relay(ing)? denied",
                "recipient permanently unreachable",
            ),
            (
                Outcome::SoftBounce,
                r"mailbox full|quota exceeded|over quota|try again later|temporarily (deferred|unavailable|rejected)|greylist|rate limit|too many (messages|connections)|service (not |un)available|resources temporarily unavailable",
                "temporary delivery problem",
            ),
        ];

        #[allow(
            clippy::expect_used,
            reason = "patterns are compile-time literals exercised by tests"
        )]
        let rules = table
            .iter()
            .map(|&(outcome, pattern, detail)| BounceRule {
                outcome,
                pattern: Regex::new(pattern).expect("bounce pattern must compile"),
                detail,
            })
            .collect();

        Self { rules }
    }

    /// Classifies one SMTP reply.
    #[must_use]
    pub fn classify(&self, code: u16, text: &str) -> (Outcome, &'static str) {
        if (200..300).contains(&code) {
            return (Outcome::Delivered, "accepted");
        }

        let text = text.to_lowercase();
        for rule in &self.rules {
            if rule.pattern.is_match(&text) {
                return (rule.outcome, rule.detail);
            }
        }

        match code {
            500..=599 => (Outcome::HardBounce, "permanent failure"),
            400..=499 => (Outcome::SoftBounce, "temporary failure"),
            _ => (Outcome::Unknown, "unclassified reply"),
        }
    }
}

impl Default for OutcomeClassifier {
    fn default() -> Self {
        Self::new()
    }
}
