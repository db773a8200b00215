//! Case-normalized email addresses.
//!
//! Suppression lookups, rate buckets, and routing all key off the recipient
//! address, so a single normalized representation matters: the address is
//! lowercased once at the boundary and split into local part and domain.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Domain;

/// Errors produced when parsing an email address.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// The address has no `@`, or more than one.
    #[error("Malformed address: {0}")]
    Malformed(String),

    /// The local part or domain is empty.
    #[error("Empty local part or domain: {0}")]
    Empty(String),

    /// The domain has no dot or contains whitespace.
    #[error("Invalid domain in address: {0}")]
    InvalidDomain(String),
}

/// A validated, lowercased email address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EmailAddress {
    local: String,
    domain: Domain,
}

impl EmailAddress {
    /// Parse and normalize an address.
    ///
    /// # Errors
    ///
    /// Returns `AddressError` if the input is not a plausible `local@domain`
    /// address. Validation here is deliberately shallow; the destination
    /// server has the final say.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        let mut parts = trimmed.splitn(2, '@');
        let local = parts.next().unwrap_or_default();
        let Some(domain) = parts.next() else {
            return Err(AddressError::Malformed(trimmed.to_string()));
        };

        if local.is_empty() || domain.is_empty() {
            return Err(AddressError::Empty(trimmed.to_string()));
        }

        if domain.contains('@') {
            return Err(AddressError::Malformed(trimmed.to_string()));
        }

        if !domain.contains('.') || domain.chars().any(char::is_whitespace) {
            return Err(AddressError::InvalidDomain(trimmed.to_string()));
        }

        Ok(Self {
            local: local.to_ascii_lowercase(),
            domain: Domain::new(domain),
        })
    }

    /// The local part (before the `@`), lowercased.
    #[must_use]
    pub fn local(&self) -> &str {
        &self.local
    }

    /// The domain part, lowercased.
    #[must_use]
    pub fn domain(&self) -> &Domain {
        &self.domain
    }
}

impl Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl TryFrom<String> for EmailAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EmailAddress> for String {
    fn from(addr: EmailAddress) -> Self {
        addr.to_string()
    }
}
