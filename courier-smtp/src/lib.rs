//! Minimal async SMTP client used by the courier delivery engine.
//!
//! Supports the outbound half of the protocol only: EHLO/HELO, opportunistic
//! STARTTLS, MAIL FROM, RCPT TO, DATA, NOOP, RSET, and QUIT.

mod client;
mod error;
mod response;

pub use client::SmtpClient;
pub use error::{ClientError, Result};
pub use response::Response;
