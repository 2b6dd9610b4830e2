// The dial orchestrator: the piece that replaces the HTTP client's low-level
// dialer. It derives an SRV name from the dialed address, asks the selector
// for targets, retries across them inside a deadline, and records every
// outcome in the health cache.

pub mod connect;
pub mod dialer;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, RwLock};
use tracing::debug;

use crate::config::Config;
use crate::dns::{DnsResolver, SystemResolver};
use crate::health::prober::{ProbeClient, ProbeParams};
use crate::health::{HealthCache, HealthCacheEntry};
use crate::metrics;
use crate::srv::cache::{SrvCache, SrvCacheEntry, SrvView};
use crate::srv::selector::{self, Endpoint};
use crate::stats::InterceptStats;
use crate::status;
use crate::utils::extract_host_port;

use dialer::{Dialer, TcpDialer};

/// What an intercepted dial can fail with. Per the propagation policy,
/// callers only ever see a connection, [`DialError::AllTargetsFailed`], or a
/// deadline; everything else is recovered internally or belongs to the
/// bypass path.
#[derive(Error, Debug)]
pub enum DialError {
    /// Every distinct target was attempted and none produced a connection.
    #[error("All unique targets failed for {address}/{last_target}. Tried: {attempts}. Last error: {last_error}")]
    AllTargetsFailed {
        /// The address originally dialed.
        address: String,
        /// The target whose reappearance ended the loop.
        last_target: String,
        /// Number of distinct targets attempted.
        attempts: usize,
        /// Message of the last underlying dial error.
        last_error: String,
    },

    /// The intercept deadline expired before any attempt succeeded.
    #[error("dial deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// The attempt-loop worker went away without reporting a result.
    #[error("dial worker terminated unexpectedly")]
    WorkerTerminated,

    /// The dial destination had no usable host.
    #[error("address {0} has no usable host")]
    BadAddress(String),

    /// An error from the underlying dialer on the bypass path.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The random-index source used for weighted selection: given `n`, return a
/// uniform value in `[0, n)`. Replaceable so property tests can drive the
/// selector deterministically.
pub type RandIntn = Box<dyn Fn(usize) -> usize + Send + Sync>;

struct Inner {
    config: Config,
    resolver: Arc<dyn DnsResolver>,
    dialer: Arc<dyn Dialer>,
    rand_intn: RandIntn,
    srv_cache: SrvCache,
    health_cache: HealthCache,
    stats: RwLock<InterceptStats>,
    started_at: DateTime<Utc>,
    workers_started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    status_addr: Mutex<Option<SocketAddr>>,
}

/// The client-side load balancer. Cheap to clone; all clones share one set
/// of caches, statistics, and background workers.
///
/// Construct one per process (or use [`crate::default_balancer`]) and either
/// hand its [`Balancer::client`] to code that wants a ready-made HTTP
/// client, or wire [`Balancer::dial_context`] up as the dial hook of an
/// existing transport.
#[derive(Clone)]
pub struct Balancer {
    inner: Arc<Inner>,
}

impl Balancer {
    /// Builds a balancer with the production resolver, dialer, and RNG.
    pub fn new(config: Config) -> Self {
        Self::with_parts(
            config,
            Arc::new(SystemResolver::new()),
            Arc::new(TcpDialer),
            Box::new(|n| rand::thread_rng().gen_range(0..n)),
        )
    }

    /// Builds a balancer configured from `cslb_*` environment variables.
    pub fn from_env() -> Self {
        Self::new(Config::from_env())
    }

    /// Builds a balancer with every external seam supplied by the caller:
    /// the DNS resolver, the underlying dialer, and the random-index source
    /// used for weighted selection. This is the constructor tests use.
    pub fn with_parts(
        config: Config,
        resolver: Arc<dyn DnsResolver>,
        dialer: Arc<dyn Dialer>,
        rand_intn: RandIntn,
    ) -> Self {
        let probe_params = if config.disable_health_checks {
            None
        } else {
            Some(ProbeParams {
                resolver: Arc::clone(&resolver),
                client: build_probe_client(),
                txt_prefix: config.health_check_txt_prefix.clone(),
                ok_phrase: config.health_check_content_ok.clone(),
                frequency: config.health_check_frequency,
                debug: config.debug_health_checks,
            })
        };
        let health_cache = HealthCache::new(config.health_ttl, config.dial_veto, probe_params);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                resolver,
                dialer,
                rand_intn,
                srv_cache: SrvCache::new(),
                health_cache,
                stats: RwLock::new(InterceptStats::default()),
                started_at: Utc::now(),
                workers_started: AtomicBool::new(false),
                shutdown_tx,
                status_addr: Mutex::new(None),
            }),
        }
    }

    /// Starts the cache cleaners and, when configured, the status server.
    /// Dialing starts them implicitly; call this to start them eagerly.
    pub async fn start(&self) {
        self.ensure_workers();
    }

    /// Stops the cache cleaners and the status server. Probers are not
    /// force-stopped; they exit when their records expire.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }

    /// The address the status server actually bound, once it is up.
    pub fn status_addr(&self) -> Option<SocketAddr> {
        *self
            .inner
            .status_addr
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn note_status_addr(&self, addr: Option<SocketAddr>) {
        *self
            .inner
            .status_addr
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = addr;
    }

    /// A copy of the cumulative intercept statistics.
    pub async fn stats(&self) -> InterceptStats {
        self.inner.stats.read().await.clone()
    }

    pub(crate) async fn add_stats(&self, local: &InterceptStats) {
        self.inner.stats.write().await.merge(local);
    }

    pub(crate) fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// Rows for the status page's SRV table.
    pub async fn srv_snapshot(&self) -> Vec<SrvCacheEntry> {
        self.inner.srv_cache.snapshot(&self.inner.health_cache).await
    }

    /// Rows for the status page's health table.
    pub async fn health_snapshot(&self) -> Vec<HealthCacheEntry> {
        self.inner.health_cache.snapshot().await
    }

    /// Number of SRV views currently cached.
    pub fn srv_cache_len(&self) -> usize {
        self.inner.srv_cache.len()
    }

    /// Number of health records currently cached.
    pub async fn health_cache_len(&self) -> usize {
        self.inner.health_cache.len().await
    }

    /// Records a dial outcome against an endpoint, exactly as the attempt
    /// loop does. Exposed so drivers that dial through other paths can feed
    /// the health view, and so tests can seed it.
    pub async fn record_dial(&self, now: Instant, host: &str, port: u16, error: Option<&str>) {
        self.inner.health_cache.record_dial(now, host, port, error).await;
    }

    /// Resolves (or returns the cached view of) the SRV records for
    /// `_service._proto.domain`. Always returns a view; one with zero
    /// targets means the name is not under SRV control.
    pub async fn lookup_srv(
        &self,
        now: Instant,
        service: &str,
        proto: &str,
        domain: &str,
    ) -> Arc<SrvView> {
        let key = format!("_{}._{}.{}", service, proto, domain).to_ascii_lowercase();
        if let Some(view) = self.inner.srv_cache.get(&key) {
            metrics::SRV_LOOKUPS_TOTAL.with_label_values(&["hit"]).inc();
            return view;
        }
        metrics::SRV_LOOKUPS_TOTAL.with_label_values(&["miss"]).inc();

        // The resolver is consulted without holding any cache lock. A
        // concurrent lookup of the same name means the last writer's view
        // wins; resolutions are not serialized.
        let records = match self.inner.resolver.lookup_srv(&key).await {
            Ok(records) => records,
            Err(err) => {
                if self.inner.config.debug_srv_lookups {
                    debug!(%key, error = %err, "SRV lookup returned no records");
                }
                Vec::new()
            }
        };
        let (view, target_keys) = SrvView::build(
            records,
            now,
            self.inner.config.found_srv_ttl,
            self.inner.config.not_found_srv_ttl,
        );
        let view = Arc::new(view);
        self.inner.srv_cache.install(key, Arc::clone(&view));
        self.inner.health_cache.populate(now, &target_keys).await;
        view
    }

    /// Picks the next candidate target from a view, consulting the health
    /// cache. `None` only when the view holds no targets at all.
    pub async fn best_target(&self, view: &SrvView) -> Option<Endpoint> {
        selector::best_target(view, &self.inner.health_cache, self.inner.rand_intn.as_ref()).await
    }

    /// The intercepting dial entry point, with the signature of the
    /// underlying dialer: `host:port` in, connection out.
    ///
    /// Addresses that are IP literals, have no derivable service, or arrive
    /// while interception is disabled pass straight through. Otherwise the
    /// SRV view is consulted and targets are attempted one at a time until
    /// one connects, every distinct target has failed, or the intercept
    /// timeout elapses. Callers with their own deadline can simply drop the
    /// returned future; the attempt loop is abandoned with it.
    pub async fn dial_context(
        &self,
        network: &str,
        address: &str,
    ) -> Result<TcpStream, DialError> {
        self.ensure_workers();
        metrics::DIAL_INTERCEPTS_TOTAL.inc();
        let mut local = InterceptStats {
            intercepts: 1,
            ..Default::default()
        };
        let result = self.dial_inner(network, address, &mut local).await;
        self.add_stats(&local).await;
        result
    }

    async fn dial_inner(
        &self,
        network: &str,
        address: &str,
        local: &mut InterceptStats,
    ) -> Result<TcpStream, DialError> {
        let config = &self.inner.config;
        let address_lc = address.to_ascii_lowercase();
        let parsed = extract_host_port(&address_lc);
        if config.debug_dial_context {
            debug!(network, address, parsed = ?parsed, "dial intercepted");
        }

        let service = parsed
            .as_ref()
            .map(|(_, port)| config.service_for_port(port))
            .unwrap_or_default();
        let host = match parsed {
            Some((host, _)) if !service.is_empty() && !config.disable_interception => host,
            _ => {
                local.bypasses = 1;
                metrics::DIAL_BYPASSES_TOTAL.inc();
                return Ok(self.inner.dialer.dial(network, address).await?);
            }
        };

        let now = Instant::now();
        let view = self.lookup_srv(now, &service, network, &host).await;
        if config.debug_srv_lookups {
            debug!(%service, proto = network, %host, targets = view.unique_targets(), %view, "SRV lookup");
        }
        if view.unique_targets() == 0 {
            // Not under SRV control; hand the original address back to the
            // underlying dialer.
            local.no_srv = 1;
            let result = self.inner.dialer.dial(network, address).await;
            local.intercept_time = now.elapsed();
            return Ok(result?);
        }

        // Run the attempt loop in its own task so this function can race it
        // against the deadline; an abandoned worker is aborted and its
        // in-flight dial cancelled with it.
        let (tx, rx) = oneshot::channel();
        let worker_self = self.clone();
        let worker_view = Arc::clone(&view);
        let worker_network = network.to_string();
        let worker_address = address_lc.clone();
        let worker = tokio::spawn(async move {
            let result = worker_self
                .attempt_targets(worker_view, &worker_network, &worker_address)
                .await;
            let _ = tx.send(result);
        });

        let outcome = match tokio::time::timeout(config.intercept_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DialError::WorkerTerminated),
            Err(_) => {
                worker.abort();
                local.deadlines = 1;
                metrics::DEADLINES_TOTAL.inc();
                Err(DialError::DeadlineExceeded(config.intercept_timeout))
            }
        };
        local.intercept_time = now.elapsed();
        outcome
    }

    /// Attempts targets until one connects or the selector hands back a
    /// target this call has already tried. Because a failed target drops to
    /// the bottom of both the eligibility and least-worst orderings, seeing
    /// a target twice means every distinct target has been attempted.
    async fn attempt_targets(
        &self,
        view: Arc<SrvView>,
        network: &str,
        address: &str,
    ) -> Result<TcpStream, DialError> {
        let mut local = InterceptStats::default();
        let mut attempted: HashSet<String> = HashSet::new();
        let mut last_error = String::new();
        let result = loop {
            local.selector_calls += 1;
            let Some(endpoint) = self.best_target(&view).await else {
                break Err(DialError::BadAddress(address.to_string()));
            };
            let new_address = endpoint.address();
            if !attempted.insert(new_address.clone()) {
                local.dupes_stopped += 1;
                metrics::TARGETS_EXHAUSTED_TOTAL.inc();
                break Err(DialError::AllTargetsFailed {
                    address: address.to_string(),
                    last_target: new_address,
                    attempts: attempted.len(),
                    last_error: last_error.clone(),
                });
            }
            if self.inner.config.debug_intercepts {
                debug!(from = %address, to = %new_address, network, "redirecting dial");
            }

            match self.inner.dialer.dial(network, &new_address).await {
                Ok(conn) => {
                    self.inner
                        .health_cache
                        .record_dial(Instant::now(), &endpoint.host, endpoint.port, None)
                        .await;
                    if self.inner.config.debug_dial_results {
                        debug!(%new_address, "underlying dial succeeded");
                    }
                    local.good_dials += 1;
                    metrics::DIALS_TOTAL.with_label_values(&["good"]).inc();
                    break Ok(conn);
                }
                Err(err) => {
                    let message = err.to_string();
                    self.inner
                        .health_cache
                        .record_dial(
                            Instant::now(),
                            &endpoint.host,
                            endpoint.port,
                            Some(&message),
                        )
                        .await;
                    if self.inner.config.debug_dial_results {
                        debug!(%new_address, error = %message, "underlying dial failed");
                    }
                    local.failed_dials += 1;
                    metrics::DIALS_TOTAL.with_label_values(&["failed"]).inc();
                    last_error = message;
                }
            }
        };
        self.add_stats(&local).await;
        result
    }

    /// Idempotently starts the background workers: the two cache cleaners
    /// and, when a listen address is configured, the status server.
    fn ensure_workers(&self) {
        if self.inner.workers_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let srv_interval = self.inner.config.found_srv_ttl / 5 + Duration::from_secs(1);
        let health_interval = self.inner.config.health_ttl / 5 + Duration::from_secs(1);
        self.inner
            .srv_cache
            .spawn_cleaner(srv_interval, self.inner.shutdown_tx.subscribe());
        self.inner
            .health_cache
            .spawn_cleaner(health_interval, self.inner.shutdown_tx.subscribe());

        if let Some(addr) = self.inner.config.status_listen {
            let balancer = self.clone();
            let shutdown = self.inner.shutdown_tx.subscribe();
            tokio::spawn(async move {
                status::server::run(balancer, addr, shutdown).await;
            });
        }
    }
}

/// The probers' HTTP client. Built on its own connector stack so probe GETs
/// never re-enter the interceptor.
fn build_probe_client() -> ProbeClient {
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .https_or_http()
        .enable_http1()
        .build();
    hyper::Client::builder().build(https)
}
