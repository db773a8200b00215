//! Outbound mail delivery engine.
//!
//! Jobs enter through [`queue::JobQueue`], workers drain them through
//! the pipeline in [`worker::DeliveryEngine`], and terminal outcomes
//! flow out through the sinks in [`report`].

pub mod classifier;
pub mod config;
pub mod error;
pub mod job;
pub mod limiter;
pub mod message;
pub mod pool;
pub mod queue;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod signer;
pub mod suppression;
pub mod warmup;
pub mod worker;

pub use classifier::{Outcome, OutcomeClassifier};
pub use config::EngineConfig;
pub use error::DeliveryError;
pub use job::{DeliveryJob, JobId, Priority};
pub use queue::JobQueue;
pub use report::{
    LogSink, MemorySink, StatusSink, StatusUpdate, TerminalStatus, WebhookEvent,
    WebhookSink,
};
pub use suppression::{SuppressionReason, SuppressionScope, SuppressionStore};
pub use worker::DeliveryEngine;
