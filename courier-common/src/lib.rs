//! Shared vocabulary types for the courier delivery engine.

pub mod address;
pub mod domain;
pub mod logging;

pub use address::{AddressError, EmailAddress};
pub use domain::Domain;

pub use tracing;
