//! SMTP connection pooling.
//!
//! Sessions are expensive to establish (TCP, EHLO, STARTTLS), so
//! healthy ones are parked per destination host and handed back out
//! to later deliveries. A checked-out connection is owned exclusively
//! by its worker; the pool only tracks how many are open per host so
//! the cap holds across workers.

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Deserialize;
use tokio::time::timeout;
use tracing::{debug, warn};

use courier_smtp::{ClientError, SmtpClient};

use crate::error::{DeliveryError, TemporaryError};
use crate::resolver::MailHost;

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Open-connection cap per destination host.
    #[serde(default = "default_max_per_host")]
    pub max_per_host: usize,

    /// Connections older than this are never reused.
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,

    /// Idle connections unused for this long are dropped.
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,

    /// Messages a single session may carry before being retired.
    #[serde(default = "default_max_sends")]
    pub max_sends: u32,

    /// Protocol errors a session may accumulate before being retired.
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,

    /// How many times `acquire` polls for a free slot before giving up.
    #[serde(default = "default_acquire_attempts")]
    pub acquire_attempts: u32,

    /// Pause between slot polls, in milliseconds.
    #[serde(default = "default_acquire_backoff_ms")]
    pub acquire_backoff_ms: u64,

    /// TCP connect plus session setup timeout, in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Skip STARTTLS even when the server offers it.
    #[serde(default)]
    pub disable_tls: bool,

    /// Accept certificates that fail verification. Test rigs only.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

const fn default_max_per_host() -> usize {
    10
}

const fn default_max_lifetime_secs() -> u64 {
    300
}

const fn default_max_idle_secs() -> u64 {
    60
}

const fn default_max_sends() -> u32 {
    100
}

const fn default_max_errors() -> u32 {
    3
}

const fn default_acquire_attempts() -> u32 {
    50
}

const fn default_acquire_backoff_ms() -> u64 {
    100
}

const fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_host: default_max_per_host(),
            max_lifetime_secs: default_max_lifetime_secs(),
            max_idle_secs: default_max_idle_secs(),
            max_sends: default_max_sends(),
            max_errors: default_max_errors(),
            acquire_attempts: default_acquire_attempts(),
            acquire_backoff_ms: default_acquire_backoff_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            disable_tls: false,
            accept_invalid_certs: false,
        }
    }
}

/// An SMTP session checked out from the pool.
pub struct PooledConnection {
    pub client: SmtpClient,
    key: String,
    created_at: Instant,
    last_used: Instant,
    send_count: u32,
    error_count: u32,
}

impl PooledConnection {
    fn is_healthy(&self, config: &PoolConfig) -> bool {
        session_fit(
            config,
            self.created_at.elapsed(),
            self.last_used.elapsed(),
            self.send_count,
            self.error_count,
        )
    }

    /// Record a message carried by this session.
    pub fn record_send(&mut self) {
        self.send_count += 1;
        self.last_used = Instant::now();
    }

    /// Record a protocol error on this session.
    pub fn record_error(&mut self) {
        self.error_count += 1;
        self.last_used = Instant::now();
    }
}

#[derive(Debug, Default)]
struct PoolStats {
    created: AtomicU64,
    reused: AtomicU64,
    evicted: AtomicU64,
    exhausted: AtomicU64,
}

/// Point-in-time pool counters, mostly for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub created: u64,
    pub reused: u64,
    pub evicted: u64,
    pub exhausted: u64,
}

pub struct ConnectionPool {
    config: PoolConfig,
    idle: DashMap<String, Vec<PooledConnection>>,
    open: DashMap<String, AtomicUsize>,
    stats: PoolStats,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            idle: DashMap::new(),
            open: DashMap::new(),
            stats: PoolStats::default(),
        }
    }

    /// Checks out a session to `target`, reusing an idle one when
    /// possible and dialing otherwise.
    ///
    /// # Errors
    ///
    /// [`TemporaryError::PoolExhausted`] when the per-host cap stays
    /// saturated for the whole acquire window, or a connection error
    /// from dialing.
    pub async fn acquire(
        &self,
        target: &MailHost,
        helo_hostname: &str,
    ) -> Result<PooledConnection, DeliveryError> {
        let key = target.address();

        for _ in 0..self.config.acquire_attempts {
            while let Some(mut conn) = self.pop_idle(&key) {
                if !conn.is_healthy(&self.config) {
                    self.discard(conn);
                    continue;
                }
                // Liveness probe: the server may have dropped us while
                // the session sat idle.
                let probe = timeout(Duration::from_secs(5), conn.client.noop()).await;
                match probe {
                    Ok(Ok(reply)) if reply.is_success() => {
                        conn.last_used = Instant::now();
                        self.stats.reused.fetch_add(1, Ordering::Relaxed);
                        debug!(host = %key, "reusing pooled connection");
                        return Ok(conn);
                    }
                    _ => self.discard(conn),
                }
            }

            if self.reserve_slot(&key) {
                match self.dial(target, helo_hostname).await {
                    Ok(conn) => {
                        self.stats.created.fetch_add(1, Ordering::Relaxed);
                        return Ok(conn);
                    }
                    Err(err) => {
                        self.release_slot(&key);
                        return Err(err);
                    }
                }
            }

            tokio::time::sleep(Duration::from_millis(self.config.acquire_backoff_ms))
                .await;
        }

        self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
        Err(TemporaryError::PoolExhausted(key).into())
    }

    /// Returns a session to the pool if it is still fit for reuse,
    /// drops it otherwise.
    pub fn release(&self, conn: PooledConnection) {
        if conn.is_healthy(&self.config) {
            self.idle.entry(conn.key.clone()).or_default().push(conn);
        } else {
            self.discard(conn);
        }
    }

    /// Drops a session that is no longer usable.
    pub fn discard(&self, conn: PooledConnection) {
        self.release_slot(&conn.key);
        self.stats.evicted.fetch_add(1, Ordering::Relaxed);
    }

    /// Politely closes every idle session. Called on shutdown.
    pub async fn drain(&self) {
        let keys: Vec<String> = self.idle.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let Some((_, conns)) = self.idle.remove(&key) else {
                continue;
            };
            for mut conn in conns {
                let _ = timeout(Duration::from_secs(2), conn.client.quit()).await;
                self.release_slot(&conn.key);
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            created: self.stats.created.load(Ordering::Relaxed),
            reused: self.stats.reused.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
            exhausted: self.stats.exhausted.load(Ordering::Relaxed),
        }
    }

    fn pop_idle(&self, key: &str) -> Option<PooledConnection> {
        self.idle.get_mut(key).and_then(|mut conns| conns.pop())
    }

    fn reserve_slot(&self, key: &str) -> bool {
        let counter = self.open.entry(key.to_owned()).or_default();
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < self.config.max_per_host).then_some(open + 1)
            })
            .is_ok()
    }

    fn release_slot(&self, key: &str) {
        if let Some(counter) = self.open.get(key) {
            let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                open.checked_sub(1)
            });
        }
    }

    async fn dial(
        &self,
        target: &MailHost,
        helo_hostname: &str,
    ) -> Result<PooledConnection, DeliveryError> {
        let attempt_tls = !self.config.disable_tls;
        match self.dial_once(target, helo_hostname, attempt_tls).await {
            Ok(conn) => Ok(conn),
            // A broken handshake leaves the stream unusable. RFC 3207
            // permits falling back to a fresh plaintext session.
            Err(ClientError::TlsError(err)) if attempt_tls => {
                warn!(host = %target.host, %err, "TLS negotiation failed, redialing without TLS");
                self.dial_once(target, helo_hostname, false)
                    .await
                    .map_err(Into::into)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn dial_once(
        &self,
        target: &MailHost,
        helo_hostname: &str,
        attempt_tls: bool,
    ) -> Result<PooledConnection, ClientError> {
        let setup = Duration::from_secs(self.config.connect_timeout_secs);
        let addr = target.address();

        let connect = SmtpClient::connect(&addr, target.host.clone());
        let mut client = timeout(setup, connect)
            .await
            .map_err(|_| timeout_error(&addr))??
            .accept_invalid_certs(self.config.accept_invalid_certs);

        let greeting = timeout(setup, client.read_greeting())
            .await
            .map_err(|_| timeout_error(&addr))??;
        if !greeting.is_success() {
            return Err(ClientError::SmtpError {
                code: greeting.code,
                message: greeting.message(),
            });
        }

        let mut ehlo = timeout(setup, client.ehlo(helo_hostname))
            .await
            .map_err(|_| timeout_error(&addr))??;
        if !ehlo.is_success() {
            // Ancient servers without ESMTP support.
            let helo = timeout(setup, client.helo(helo_hostname))
                .await
                .map_err(|_| timeout_error(&addr))??;
            if !helo.is_success() {
                return Err(ClientError::SmtpError {
                    code: helo.code,
                    message: helo.message(),
                });
            }
            ehlo = helo;
        }

        if attempt_tls && ehlo.advertises("STARTTLS") {
            let reply = timeout(setup, client.starttls())
                .await
                .map_err(|_| timeout_error(&addr))??;
            if reply.is_success() {
                // The session state resets across the handshake.
                let reply = timeout(setup, client.ehlo(helo_hostname))
                    .await
                    .map_err(|_| timeout_error(&addr))??;
                if !reply.is_success() {
                    return Err(ClientError::SmtpError {
                        code: reply.code,
                        message: reply.message(),
                    });
                }
            } else {
                debug!(host = %target.host, code = reply.code, "STARTTLS refused, continuing in plaintext");
            }
        }

        debug!(host = %addr, tls = client.is_tls(), "established SMTP session");
        Ok(PooledConnection {
            client,
            key: addr,
            created_at: Instant::now(),
            last_used: Instant::now(),
            send_count: 0,
            error_count: 0,
        })
    }
}

fn session_fit(
    config: &PoolConfig,
    age: Duration,
    idle: Duration,
    sends: u32,
    errors: u32,
) -> bool {
    age < Duration::from_secs(config.max_lifetime_secs)
        && idle < Duration::from_secs(config.max_idle_secs)
        && sends < config.max_sends
        && errors < config.max_errors
}

fn timeout_error(addr: &str) -> ClientError {
    ClientError::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("session setup to {addr} timed out"),
    ))
}
