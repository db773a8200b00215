//! The delivery engine: a pool of workers draining the job queue.
//!
//! Each worker walks a claimed job through the full pipeline:
//! suppression gate, rate admission, route resolution, connection
//! acquisition, signing, the SMTP transaction, and finally outcome
//! classification with its side effects (suppression writes, webhook
//! events, requeues). A job reaches exactly one terminal state, and
//! transient trouble sends it back to the queue rather than crashing
//! the worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use ulid::Ulid;

use courier_smtp::ClientError;

use crate::classifier::{Outcome, OutcomeClassifier};
use crate::config::EngineConfig;
use crate::error::{ConfigError, DeliveryError};
use crate::job::{DeliveryJob, JobId};
use crate::limiter::{Admission, CounterStore, RateLimiter};
use crate::message;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::queue::JobQueue;
use crate::report::{
    StatusSink, StatusUpdate, TerminalStatus, WebhookEvent, WebhookSink,
};
use crate::resolver::{MxResolver, ResolverError};
use crate::retry::RetryPolicy;
use crate::signer::MessageSigner;
use crate::suppression::{SuppressionReason, SuppressionScope, SuppressionStore};
use crate::warmup::WarmupTracker;

/// Terminal transitions between sweeps of the finalized-id set.
const FINALIZED_SWEEP_INTERVAL: u64 = 1024;

/// How the destination server answered the envelope and payload.
enum Attempt {
    Accepted,
    Rejected { code: u16, text: String },
}

pub struct DeliveryEngine {
    config: EngineConfig,
    queue: Arc<JobQueue>,
    resolver: MxResolver,
    limiter: RateLimiter,
    pool: ConnectionPool,
    signer: MessageSigner,
    suppression: Arc<SuppressionStore>,
    classifier: OutcomeClassifier,
    retry: RetryPolicy,
    status: Arc<dyn StatusSink>,
    webhooks: Arc<dyn WebhookSink>,
    // Guards terminal transitions: a job id lands here exactly once,
    // so replayed outcomes cannot double-write suppression or fire a
    // webhook twice.
    finalized: DashSet<JobId>,
    finalize_count: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl DeliveryEngine {
    /// Wires up every component from configuration.
    ///
    /// # Errors
    ///
    /// Fails when the system resolver cannot be initialized.
    pub fn new(
        config: EngineConfig,
        status: Arc<dyn StatusSink>,
        webhooks: Arc<dyn WebhookSink>,
    ) -> Result<Self, DeliveryError> {
        let resolver = MxResolver::new(config.resolver.clone()).map_err(|err| {
            DeliveryError::Config(ConfigError::Invalid(format!(
                "resolver initialization failed: {err}"
            )))
        })?;

        let warmup = Arc::new(WarmupTracker::new(config.warmup.clone()));
        let limiter = RateLimiter::new(
            config.rate_limits.clone(),
            Arc::new(CounterStore::new()),
            warmup,
        );
        let pool = ConnectionPool::new(config.pool.clone());
        let signer = MessageSigner::from_config(&config.signing);
        let retry = config.retry.clone();
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            queue: Arc::new(JobQueue::new()),
            resolver,
            limiter,
            pool,
            signer,
            suppression: Arc::new(SuppressionStore::new()),
            classifier: OutcomeClassifier::new(),
            retry,
            status,
            webhooks,
            finalized: DashSet::new(),
            finalize_count: AtomicU64::new(0),
            shutdown,
        })
    }

    /// Intake side: enqueue jobs here.
    #[must_use]
    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Suppression registry, shared with administrative tooling.
    #[must_use]
    pub fn suppression(&self) -> &Arc<SuppressionStore> {
        &self.suppression
    }

    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Asks the workers to stop once their current job is done.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Runs the worker pool until [`Self::shutdown`] is called, then
    /// drains idle connections.
    pub async fn run(self: Arc<Self>) {
        info!(workers = self.config.workers, "delivery engine starting");

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers {
            let engine = Arc::clone(&self);
            workers.spawn(async move { engine.worker_loop(id).await });
        }

        while workers.join_next().await.is_some() {}

        self.pool.drain().await;
        info!("delivery engine stopped");
    }

    async fn worker_loop(&self, id: usize) {
        debug!(worker = id, "worker started");
        let mut shutdown = self.shutdown.subscribe();
        let claim_wait = Duration::from_millis(self.config.claim_wait_ms);

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            if let Some(job) = self.queue.claim(claim_wait).await {
                self.process_job(job).await;
            }
        }
        debug!(worker = id, "worker stopped");
    }

    /// Runs one job through the delivery pipeline. Never panics and
    /// never returns an error: every path ends in a terminal status or
    /// a requeue.
    pub async fn process_job(&self, job: DeliveryJob) {
        if self.finalized.contains(&job.id) {
            debug!(job_id = %job.id, "job already finalized, dropping replay");
            return;
        }

        // Gate 1: suppression, before any network activity or quota
        // consumption.
        if let Some((scope, reason)) = self.suppression.lookup(&job.recipient, &job.account_id)
        {
            debug!(job_id = %job.id, recipient = %job.recipient, ?reason, "recipient suppressed");
            let detail = match scope {
                SuppressionScope::Global => format!("{reason:?} (global)"),
                SuppressionScope::Account(_) => format!("{reason:?} (account)"),
            };
            self.finalize(&job, TerminalStatus::Suppressed, Some(detail), None);
            return;
        }

        // Gate 2: rate admission. Short waits are slept through so a
        // briefly saturated domain does not churn the queue.
        let domain = job.recipient.domain().clone();
        let inline_wait = Duration::from_millis(self.config.max_inline_wait_ms);
        let mut inline_retries = 1_u8;
        let admission = loop {
            match self.limiter.admit(&domain, job.identity(), Utc::now()) {
                Admission::DomainSaturated { retry_after }
                    if retry_after <= inline_wait && inline_retries > 0 =>
                {
                    inline_retries -= 1;
                    tokio::time::sleep(retry_after).await;
                }
                verdict => break verdict,
            }
        };
        match admission {
            Admission::Granted => {}
            Admission::DomainSaturated { retry_after } => {
                debug!(job_id = %job.id, %domain, ?retry_after, "deferring on saturated domain");
                self.queue.enqueue_delayed(job, retry_after);
                return;
            }
            Admission::WarmupExhausted { identity } => {
                debug!(job_id = %job.id, identity, "deferring on exhausted warmup allowance");
                self.queue.enqueue_delayed(
                    job,
                    Duration::from_secs(self.config.warmup_defer_secs),
                );
                return;
            }
        }

        // Route resolution.
        let hosts = match self.resolver.resolve(&domain).await {
            Ok(hosts) => hosts,
            Err(err @ ResolverError::NoRoute(_)) => {
                if self.finalize(
                    &job,
                    TerminalStatus::Bounced,
                    Some(err.to_string()),
                    None,
                ) {
                    self.emit(&job, WebhookEvent::BOUNCED);
                }
                return;
            }
            Err(err) => {
                self.handle_transient(job, err.to_string());
                return;
            }
        };

        // Connection acquisition, walking the MX list in preference
        // order.
        let mut conn = None;
        let mut last_error = String::from("no reachable mail host");
        for host in hosts.iter() {
            match self.pool.acquire(host, &self.config.helo_hostname).await {
                Ok(c) => {
                    conn = Some(c);
                    break;
                }
                Err(err) => {
                    warn!(job_id = %job.id, host = %host.host, %err, "mail host unavailable");
                    last_error = err.to_string();
                }
            }
        }
        let Some(mut conn) = conn else {
            self.handle_transient(job, last_error);
            return;
        };

        // Assemble and sign.
        let mut payload = message::build(&job, job.identity());
        if let Some(header) = self.signer.sign(job.identity(), payload.as_bytes()) {
            payload.insert_str(0, &header);
        }

        match self.transact(&mut conn, &job, &payload).await {
            Ok(Attempt::Accepted) => {
                conn.record_send();
                self.pool.release(conn);
                let tracking_id = Ulid::new().to_string();
                info!(job_id = %job.id, recipient = %job.recipient, "delivered");
                if self.finalize(&job, TerminalStatus::Sent, None, Some(tracking_id)) {
                    self.emit(&job, WebhookEvent::SENT);
                }
            }
            Ok(Attempt::Rejected { code, text }) => {
                // The session survived the rejection; reset it for the
                // next tenant.
                let _ = timeout(
                    Duration::from_secs(self.config.timeouts.command_secs),
                    conn.client.rset(),
                )
                .await;
                self.pool.release(conn);
                self.handle_rejection(job, code, &text);
            }
            Err(err) => {
                // IO trouble mid-transaction leaves the session in an
                // unknown state.
                conn.record_error();
                self.pool.discard(conn);
                self.handle_transient(job, err.to_string());
            }
        }
    }

    /// The SMTP envelope and payload exchange on an established
    /// session.
    async fn transact(
        &self,
        conn: &mut PooledConnection,
        job: &DeliveryJob,
        payload: &str,
    ) -> Result<Attempt, ClientError> {
        let command = Duration::from_secs(self.config.timeouts.command_secs);
        let data = Duration::from_secs(self.config.timeouts.data_secs);

        let reply = timeout(command, conn.client.mail_from(&job.sender.to_string()))
            .await
            .map_err(|_| command_timeout("MAIL FROM"))??;
        if !reply.is_success() {
            return Ok(Attempt::Rejected {
                code: reply.code,
                text: reply.message(),
            });
        }

        let reply = timeout(command, conn.client.rcpt_to(&job.recipient.to_string()))
            .await
            .map_err(|_| command_timeout("RCPT TO"))??;
        if !reply.is_success() {
            return Ok(Attempt::Rejected {
                code: reply.code,
                text: reply.message(),
            });
        }

        let reply = timeout(command, conn.client.data())
            .await
            .map_err(|_| command_timeout("DATA"))??;
        if !(300..400).contains(&reply.code) {
            return Ok(Attempt::Rejected {
                code: reply.code,
                text: reply.message(),
            });
        }

        let reply = timeout(data, conn.client.send_data(payload))
            .await
            .map_err(|_| command_timeout("payload transfer"))??;
        if reply.is_success() {
            Ok(Attempt::Accepted)
        } else {
            Ok(Attempt::Rejected {
                code: reply.code,
                text: reply.message(),
            })
        }
    }

    /// Applies the classifier's verdict for a rejected send.
    fn handle_rejection(&self, job: DeliveryJob, code: u16, text: &str) {
        let (outcome, detail) = self.classifier.classify(code, text);
        debug!(job_id = %job.id, code, outcome = outcome.label(), "send rejected");

        if outcome.suppresses() {
            let reason = match outcome {
                Outcome::Complaint => SuppressionReason::Complaint,
                Outcome::SpamRejection => SuppressionReason::SpamRejection,
                _ => SuppressionReason::HardBounce,
            };
            // Guard the suppression write behind the terminal
            // transition so a replayed outcome cannot double-count.
            if self.finalize(
                &job,
                TerminalStatus::Bounced,
                Some(format!("{code} {text}")),
                None,
            ) {
                self.suppression.add(
                    &job.recipient,
                    SuppressionScope::Account(job.account_id.clone()),
                    reason,
                );
                self.suppression
                    .add(&job.recipient, SuppressionScope::Global, reason);
                let event = if outcome == Outcome::Complaint {
                    WebhookEvent::COMPLAINT
                } else {
                    WebhookEvent::BOUNCED
                };
                self.emit(&job, event);
            }
            return;
        }

        if outcome.retries() {
            self.handle_transient(job, format!("{code} {text} ({detail})"));
        } else {
            // Delivered cannot reach here; anything else is a
            // classifier gap, treated as transient.
            self.handle_transient(job, format!("{code} {text}"));
        }
    }

    /// Requeues a job after a transient failure, or fails it once the
    /// attempt budget is spent.
    fn handle_transient(&self, mut job: DeliveryJob, error: String) {
        job.retry_count += 1;

        if self.retry.should_retry(job.retry_count) {
            let delay = self.retry.next_delay(job.retry_count);
            info!(
                job_id = %job.id,
                attempt = job.retry_count,
                ?delay,
                error,
                "transient failure, retrying"
            );
            self.queue.enqueue_delayed(job, delay);
        } else {
            warn!(job_id = %job.id, attempts = job.retry_count, error, "retries exhausted");
            self.finalize(&job, TerminalStatus::Failed, Some(error), None);
        }
    }

    /// Records the terminal state for a job. Returns whether this call
    /// performed the transition; replays return `false` and write
    /// nothing.
    fn finalize(
        &self,
        job: &DeliveryJob,
        status: TerminalStatus,
        detail: Option<String>,
        tracking_id: Option<String>,
    ) -> bool {
        if !self.finalized.insert(job.id) {
            return false;
        }
        let count = self.finalize_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count % FINALIZED_SWEEP_INTERVAL == 0 {
            self.prune_finalized();
        }

        self.status.record(StatusUpdate {
            job_id: job.id,
            status,
            timestamp: Utc::now(),
            detail,
            tracking_id,
        });
        true
    }

    /// Drops finalized ids old enough that no replay of them can still
    /// be in flight: twice the retry policy's maximum backoff.
    fn prune_finalized(&self) {
        let horizon_ms = self.retry.max_delay_secs.saturating_mul(2_000);
        let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        self.finalized
            .retain(|id| now_ms.saturating_sub(id.timestamp_ms()) < horizon_ms);
    }

    fn emit(&self, job: &DeliveryJob, event_type: &'static str) {
        self.webhooks.emit(WebhookEvent {
            event_type,
            account_id: job.account_id.clone(),
            job_id: job.id,
            recipient: job.recipient.clone(),
            timestamp: Utc::now(),
        });
    }
}

fn command_timeout(what: &str) -> ClientError {
    ClientError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{what} timed out"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::MemorySink;

    #[tokio::test]
    async fn finalized_ids_age_out_after_the_replay_horizon() {
        let sink = Arc::new(MemorySink::new());
        let engine =
            DeliveryEngine::new(EngineConfig::default(), sink.clone(), sink).unwrap();

        // An id minted at the epoch is far past any replay horizon.
        let stale = JobId::from(Ulid::from_parts(0, 1));
        let fresh = JobId::generate();
        engine.finalized.insert(stale);
        engine.finalized.insert(fresh);

        engine.prune_finalized();

        assert!(!engine.finalized.contains(&stale));
        assert!(engine.finalized.contains(&fresh));
    }
}
