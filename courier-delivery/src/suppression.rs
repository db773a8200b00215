//! Suppression registry: recipients we must not mail.
//!
//! Two scopes exist. Global entries protect the whole platform's
//! reputation and block the recipient for every account; account
//! entries block only mail from that account. A hard bounce writes to
//! both scopes at once. Global hard-bounce entries are never removed
//! automatically.

use chrono::{DateTime, Utc};
use courier_common::EmailAddress;
use dashmap::DashMap;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    HardBounce,
    SpamRejection,
    Complaint,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuppressionScope {
    Global,
    Account(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SuppressionRecord {
    pub reason: SuppressionReason,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// How many delivery failures have been attributed to this
    /// recipient since the record was created.
    pub bounce_count: u32,
}

#[derive(Debug, Default)]
pub struct SuppressionStore {
    global: DashMap<EmailAddress, SuppressionRecord>,
    by_account: DashMap<(String, EmailAddress), SuppressionRecord>,
}

impl SuppressionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or refreshes a suppression entry. An existing entry keeps
    /// its first-seen stamp and original reason; only the last-seen
    /// stamp and bounce count move.
    pub fn add(
        &self,
        email: &EmailAddress,
        scope: SuppressionScope,
        reason: SuppressionReason,
    ) {
        let now = Utc::now();
        match scope {
            SuppressionScope::Global => {
                self.global
                    .entry(email.clone())
                    .and_modify(|record| {
                        record.last_seen = now;
                        record.bounce_count += 1;
                    })
                    .or_insert_with(|| {
                        info!(%email, ?reason, "suppressing recipient globally");
                        new_record(reason, now)
                    });
            }
            SuppressionScope::Account(account_id) => {
                self.by_account
                    .entry((account_id, email.clone()))
                    .and_modify(|record| {
                        record.last_seen = now;
                        record.bounce_count += 1;
                    })
                    .or_insert_with(|| new_record(reason, now));
            }
        }
    }

    /// Removes an entry. Used by operator tooling for manual cleanup;
    /// the engine itself never unsuppresses anyone.
    pub fn remove(&self, email: &EmailAddress, scope: &SuppressionScope) -> bool {
        match scope {
            SuppressionScope::Global => self.global.remove(email).is_some(),
            SuppressionScope::Account(account_id) => self
                .by_account
                .remove(&(account_id.clone(), email.clone()))
                .is_some(),
        }
    }

    /// Checks whether `email` is blocked for `account_id`. The global
    /// scope wins over the account scope.
    #[must_use]
    pub fn lookup(
        &self,
        email: &EmailAddress,
        account_id: &str,
    ) -> Option<(SuppressionScope, SuppressionReason)> {
        if let Some(record) = self.global.get(email) {
            return Some((SuppressionScope::Global, record.reason));
        }
        self.by_account
            .get(&(account_id.to_owned(), email.clone()))
            .map(|record| {
                (
                    SuppressionScope::Account(account_id.to_owned()),
                    record.reason,
                )
            })
    }

    #[must_use]
    pub fn is_suppressed(&self, email: &EmailAddress, account_id: &str) -> bool {
        self.lookup(email, account_id).is_some()
    }

    /// Record for `email` in the given scope, if any.
    #[must_use]
    pub fn record(
        &self,
        email: &EmailAddress,
        scope: &SuppressionScope,
    ) -> Option<SuppressionRecord> {
        match scope {
            SuppressionScope::Global => self.global.get(email).map(|r| r.clone()),
            SuppressionScope::Account(account_id) => self
                .by_account
                .get(&(account_id.clone(), email.clone()))
                .map(|r| r.clone()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.global.len() + self.by_account.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn new_record(reason: SuppressionReason, now: DateTime<Utc>) -> SuppressionRecord {
    SuppressionRecord {
        reason,
        first_seen: now,
        last_seen: now,
        bounce_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> EmailAddress {
        EmailAddress::parse(s).unwrap()
    }

    #[test]
    fn global_entries_block_every_account() {
        let store = SuppressionStore::new();
        let email = addr("gone@example.com");
        store.add(&email, SuppressionScope::Global, SuppressionReason::HardBounce);

        assert!(store.is_suppressed(&email, "acct-1"));
        assert!(store.is_suppressed(&email, "acct-2"));
    }

    #[test]
    fn account_entries_block_only_their_account() {
        let store = SuppressionStore::new();
        let email = addr("unsubscribed@example.com");
        store.add(
            &email,
            SuppressionScope::Account("acct-1".into()),
            SuppressionReason::Complaint,
        );

        assert!(store.is_suppressed(&email, "acct-1"));
        assert!(!store.is_suppressed(&email, "acct-2"));
    }

    #[test]
    fn global_scope_wins_the_lookup() {
        let store = SuppressionStore::new();
        let email = addr("both@example.com");
        store.add(
            &email,
            SuppressionScope::Account("acct-1".into()),
            SuppressionReason::Manual,
        );
        store.add(&email, SuppressionScope::Global, SuppressionReason::HardBounce);

        let (scope, reason) = store.lookup(&email, "acct-1").unwrap();
        assert_eq!(scope, SuppressionScope::Global);
        assert_eq!(reason, SuppressionReason::HardBounce);
    }

    #[test]
    fn repeat_bounces_bump_the_count_and_keep_first_seen() {
        let store = SuppressionStore::new();
        let email = addr("flaky@example.com");
        store.add(&email, SuppressionScope::Global, SuppressionReason::HardBounce);
        let first = store.record(&email, &SuppressionScope::Global).unwrap();

        store.add(&email, SuppressionScope::Global, SuppressionReason::HardBounce);
        let second = store.record(&email, &SuppressionScope::Global).unwrap();

        assert_eq!(second.bounce_count, 2);
        assert_eq!(second.first_seen, first.first_seen);
    }

    #[test]
    fn remove_clears_one_scope_only() {
        let store = SuppressionStore::new();
        let email = addr("pardoned@example.com");
        store.add(&email, SuppressionScope::Global, SuppressionReason::Manual);
        store.add(
            &email,
            SuppressionScope::Account("acct-1".into()),
            SuppressionReason::Manual,
        );

        assert!(store.remove(&email, &SuppressionScope::Global));
        assert!(store.is_suppressed(&email, "acct-1"));
        assert!(!store.is_suppressed(&email, "acct-2"));
    }
}
