//! Domain newtype for type safety
//!
//! Wraps domain strings so an email address or an arbitrary string cannot be
//! passed where a destination domain is expected. Cheap to clone (`Arc<str>`).

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// A destination domain name.
///
/// Always stored lowercased so that `GMAIL.com` and `gmail.com` share rate
/// buckets, cache entries, and pool keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Domain(Arc<str>);

impl Domain {
    /// Create a new `Domain`, lowercasing the input.
    #[must_use]
    pub fn new(s: &str) -> Self {
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            Self(Arc::from(s.to_ascii_lowercase()))
        } else {
            Self(Arc::from(s))
        }
    }

    /// Get the domain as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert into the inner `Arc<str>`.
    #[must_use]
    pub fn into_inner(self) -> Arc<str> {
        self.0
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Domain {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Domain {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_on_construction() {
        let domain = Domain::new("MAIL.Example.COM");
        assert_eq!(domain.as_str(), "mail.example.com");
    }

    #[test]
    fn equal_regardless_of_input_case() {
        assert_eq!(Domain::new("Gmail.com"), Domain::new("gmail.com"));
    }
}
