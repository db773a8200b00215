//! Delivery error taxonomy.
//!
//! Every failure on the delivery path lands in one of two buckets that
//! drive the retry decision: [`TemporaryError`] (worth another attempt
//! later) or [`PermanentError`] (finalize the job, never retry).
//! Configuration problems get their own variant since they are neither.

use courier_smtp::ClientError;

use crate::resolver::ResolverError;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("permanent delivery failure: {0}")]
    Permanent(#[from] PermanentError),

    #[error("temporary delivery failure: {0}")]
    Temporary(#[from] TemporaryError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }
}

/// Failures that will not succeed on retry.
#[derive(Debug, thiserror::Error)]
pub enum PermanentError {
    #[error("no mail route for domain {0}")]
    NoRoute(String),

    #[error("recipient rejected: {0}")]
    RecipientRejected(String),

    #[error("message rejected: {0}")]
    MessageRejected(String),
}

/// Failures that may clear up: network trouble, full mailboxes,
/// greylisting, exhausted pools or quotas.
#[derive(Debug, thiserror::Error)]
pub enum TemporaryError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection pool exhausted for {0}")]
    PoolExhausted(String),

    #[error("DNS lookup failed: {0}")]
    DnsLookupFailed(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("server deferred: {0}")]
    ServerDeferred(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("signing key for {0} could not be loaded: {1}")]
    SigningKey(String, String),
}

impl From<ResolverError> for DeliveryError {
    fn from(err: ResolverError) -> Self {
        match err {
            ResolverError::NoRoute(domain) => {
                Self::Permanent(PermanentError::NoRoute(domain))
            }
            ResolverError::Timeout(detail) => {
                Self::Temporary(TemporaryError::Timeout(detail))
            }
            ResolverError::LookupFailed(err) => {
                Self::Temporary(TemporaryError::DnsLookupFailed(err.to_string()))
            }
        }
    }
}

impl From<ClientError> for DeliveryError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::SmtpError { code, message } if (500..600).contains(&code) => {
                Self::Permanent(PermanentError::MessageRejected(format!(
                    "{code} {message}"
                )))
            }
            ClientError::SmtpError { code, message } => Self::Temporary(
                TemporaryError::ServerDeferred(format!("{code} {message}")),
            ),
            other => Self::Temporary(TemporaryError::ConnectionFailed(
                other.to_string(),
            )),
        }
    }
}
