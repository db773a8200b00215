//! Destination resolution: which hosts accept mail for a recipient
//! domain.
//!
//! MX lookups with A/AAAA fallback per RFC 5321 section 5.1, a
//! lock-free result cache, and per-domain static overrides for
//! domains that must bypass DNS entirely (smarthosts, test rigs).

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use dashmap::DashMap;
use hickory_resolver::{
    TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use courier_common::Domain;

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    /// No MX, A, or AAAA records exist for the domain.
    #[error("no mail route for domain: {0}")]
    NoRoute(String),

    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::ResolveError),

    #[error("DNS query timed out for domain: {0}")]
    Timeout(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// DNS query timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// How long resolved routes stay cached.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Static routes that bypass DNS, keyed by recipient domain. The
    /// value is `host` or `host:port`.
    #[serde(default)]
    pub mx_overrides: AHashMap<String, String>,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_cache_ttl_secs() -> u64 {
    3600
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            mx_overrides: AHashMap::new(),
        }
    }
}

/// A host that accepts mail for some domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailHost {
    pub host: String,
    /// MX preference, lower is tried first. 0 for fallback and
    /// override routes.
    pub priority: u16,
    pub port: u16,
}

impl MailHost {
    #[must_use]
    pub const fn new(host: String, priority: u16, port: u16) -> Self {
        Self {
            host,
            priority,
            port,
        }
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
struct CachedRoute {
    hosts: Arc<Vec<MailHost>>,
    expires_at: Instant,
}

/// Cached MX resolver.
#[derive(Debug)]
pub struct MxResolver {
    resolver: TokioResolver,
    cache: DashMap<Domain, CachedRoute>,
    config: ResolverConfig,
}

impl MxResolver {
    /// Builds a resolver from the system DNS configuration.
    ///
    /// # Errors
    ///
    /// Fails if the system resolver configuration cannot be loaded.
    pub fn new(config: ResolverConfig) -> Result<Self, ResolverError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self {
            resolver,
            cache: DashMap::new(),
            config,
        })
    }

    /// Resolves the ordered host list for `domain`.
    ///
    /// Overrides win over DNS; otherwise MX records sorted by
    /// preference, falling back to A/AAAA when the domain publishes no
    /// MX at all.
    ///
    /// # Errors
    ///
    /// [`ResolverError::NoRoute`] when nothing accepts mail for the
    /// domain, [`ResolverError::LookupFailed`] for query failures.
    pub async fn resolve(&self, domain: &Domain) -> Result<Arc<Vec<MailHost>>, ResolverError> {
        if let Some(route) = self.config.mx_overrides.get(domain.as_ref()) {
            return Ok(Arc::new(vec![parse_override(route)]));
        }

        if let Some(cached) = self.cache.get(domain) {
            if cached.expires_at > Instant::now() {
                debug!(%domain, hosts = cached.hosts.len(), "route cache hit");
                return Ok(Arc::clone(&cached.hosts));
            }
        }

        let hosts = Arc::new(self.lookup(domain.as_ref()).await?);
        self.cache.insert(
            domain.clone(),
            CachedRoute {
                hosts: Arc::clone(&hosts),
                expires_at: Instant::now()
                    + Duration::from_secs(self.config.cache_ttl_secs),
            },
        );

        debug!(%domain, hosts = hosts.len(), "route resolved and cached");
        Ok(hosts)
    }

    async fn lookup(&self, domain: &str) -> Result<Vec<MailHost>, ResolverError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(mx) => {
                let mut hosts: Vec<MailHost> = mx
                    .iter()
                    .map(|record| {
                        let host =
                            record.exchange().to_utf8().trim_end_matches('.').to_owned();
                        MailHost::new(host, record.preference(), 25)
                    })
                    .collect();

                if hosts.is_empty() {
                    return self.fallback_to_address_records(domain).await;
                }

                hosts.sort_by_key(|h| h.priority);
                Ok(hosts)
            }
            Err(err) if err.is_no_records_found() => {
                debug!(%domain, "no MX records, trying A/AAAA fallback");
                self.fallback_to_address_records(domain).await
            }
            Err(err) => {
                warn!(%domain, %err, "MX lookup failed");
                Err(ResolverError::LookupFailed(err))
            }
        }
    }

    async fn fallback_to_address_records(
        &self,
        domain: &str,
    ) -> Result<Vec<MailHost>, ResolverError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) => {
                let hosts: Vec<MailHost> = lookup
                    .iter()
                    .map(|ip| MailHost::new(ip.to_string(), 0, 25))
                    .collect();

                if hosts.is_empty() {
                    Err(ResolverError::NoRoute(domain.to_owned()))
                } else {
                    Ok(hosts)
                }
            }
            Err(err) if err.is_no_records_found() || err.is_nx_domain() => {
                Err(ResolverError::NoRoute(domain.to_owned()))
            }
            Err(err) => {
                warn!(%domain, %err, "A/AAAA lookup failed");
                Err(ResolverError::LookupFailed(err))
            }
        }
    }
}

fn parse_override(route: &str) -> MailHost {
    match route.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => MailHost::new(host.to_owned(), 0, port),
            Err(_) => MailHost::new(route.to_owned(), 0, 25),
        },
        None => MailHost::new(route.to_owned(), 0, 25),
    }
}
