use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::health::prober::{self, ProberContext};
use crate::utils::trim_to;

/// Health-cache key for an endpoint, `host:port` with the host lowercased.
pub(crate) fn target_key(host: &str, port: u16) -> String {
    format!("{}:{}", host.to_ascii_lowercase(), port)
}

/// Everything known about one endpoint: dial history, veto window, and the
/// verdict of its health prober.
#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub(crate) expires: Instant,
    pub(crate) good_dials: u64,
    pub(crate) failed_dials: u64,
    /// When this target may next be considered; `None` means "eligible now".
    pub(crate) next_dial_attempt: Option<Instant>,
    pub(crate) last_dial_attempt: Option<Instant>,
    pub(crate) last_dial_status: String,
    pub(crate) last_health_check: Option<Instant>,
    pub(crate) last_health_check_status: String,
    pub(crate) probe_url: String,
    pub(crate) unhealthy: bool,
}

impl HealthRecord {
    fn new(expires: Instant) -> Self {
        Self {
            expires,
            good_dials: 0,
            failed_dials: 0,
            next_dial_attempt: None,
            last_dial_attempt: None,
            last_dial_status: String::new(),
            last_health_check: None,
            last_health_check_status: String::new(),
            probe_url: String::new(),
            unhealthy: false,
        }
    }

    /// Whether this target may be dialed right now. The boundary is
    /// inclusive: a veto expiring exactly now no longer vetoes.
    pub fn is_good(&self, now: Instant) -> bool {
        !self.unhealthy && self.next_dial_attempt.map_or(true, |at| at <= now)
    }

    pub fn next_dial_attempt(&self) -> Option<Instant> {
        self.next_dial_attempt
    }

    pub fn good_dials(&self) -> u64 {
        self.good_dials
    }

    pub fn failed_dials(&self) -> u64 {
        self.failed_dials
    }
}

/// One row of the status page's health table, durations flattened to
/// seconds-from-now / seconds-ago.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCacheEntry {
    pub target: String,
    pub good_dials: u64,
    pub failed_dials: u64,
    pub expires_in_secs: u64,
    pub next_dial_in_secs: u64,
    pub last_dial_ago_secs: Option<u64>,
    pub last_dial_status: String,
    pub last_health_check_ago_secs: Option<u64>,
    pub last_health_check_status: String,
    pub probe_url: String,
    pub is_good: bool,
}

/// The health store plus the knobs that govern it. Records are created by
/// SRV registration or by dial outcomes, read under a shared lock, and swept
/// by a periodic cleaner once expired. Deleting a record does not kill its
/// prober; the prober notices on its next tick.
pub struct HealthCache {
    store: Arc<RwLock<HashMap<String, HealthRecord>>>,
    ttl: Duration,
    veto: Duration,
    prober: Option<Arc<ProberContext>>,
}

impl HealthCache {
    /// `prober` is `None` when active health checks are disabled; records are
    /// then governed purely by dial outcomes.
    pub(crate) fn new(
        ttl: Duration,
        veto: Duration,
        prober: Option<prober::ProbeParams>,
    ) -> Self {
        let store = Arc::new(RwLock::new(HashMap::new()));
        let prober = prober.map(|params| Arc::new(ProberContext::new(Arc::clone(&store), params)));
        Self {
            store,
            ttl,
            veto,
            prober,
        }
    }

    pub(crate) fn store(&self) -> &Arc<RwLock<HashMap<String, HealthRecord>>> {
        &self.store
    }

    /// Creates records for any keys not yet present, spawning a prober for
    /// each new one when health checks are enabled.
    pub(crate) async fn populate(&self, now: Instant, keys: &[String]) {
        let mut store = self.store.write().await;
        for key in keys {
            if store.contains_key(key) {
                continue;
            }
            store.insert(key.clone(), HealthRecord::new(now + self.ttl));
            self.spawn_prober(key);
        }
    }

    /// Records the outcome of one underlying dial. Unknown endpoints are
    /// created on the fly with the same side effects as [`Self::populate`];
    /// that can happen when a connection runs across a record expiry.
    pub(crate) async fn record_dial(
        &self,
        now: Instant,
        host: &str,
        port: u16,
        error: Option<&str>,
    ) {
        let key = target_key(host, port);
        let mut store = self.store.write().await;
        if !store.contains_key(&key) {
            store.insert(key.clone(), HealthRecord::new(now + self.ttl));
            self.spawn_prober(&key);
        }
        let Some(record) = store.get_mut(&key) else {
            return;
        };
        record.last_dial_attempt = Some(now);
        match error {
            None => {
                record.good_dials += 1;
                record.next_dial_attempt = None;
                record.last_dial_status.clear();
            }
            Some(message) => {
                record.failed_dials += 1;
                record.next_dial_attempt = Some(now + self.veto);
                record.last_dial_status = message.to_string();
            }
        }
    }

    fn spawn_prober(&self, key: &str) {
        if let Some(ctx) = &self.prober {
            tokio::spawn(prober::fetch_and_run(Arc::clone(ctx), key.to_string()));
        }
    }

    /// Dial counters and eligibility for one key, for the SRV status table.
    pub(crate) async fn dial_counters(&self, key: &str, now: Instant) -> (u64, u64, bool) {
        let store = self.store.read().await;
        match store.get(key) {
            Some(record) => (record.good_dials, record.failed_dials, record.is_good(now)),
            None => (0, 0, true),
        }
    }

    pub(crate) async fn len(&self) -> usize {
        self.store.read().await.len()
    }

    /// Spawns the periodic cleaner, mirroring the SRV cache's.
    pub(crate) fn spawn_cleaner(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut store = store.write().await;
                        sweep_store(&mut store, Instant::now());
                    }
                    _ = shutdown.changed() => return,
                }
            }
        })
    }

    /// Clones the store into status-page rows, sorted by target for a stable
    /// rendering.
    pub(crate) async fn snapshot(&self) -> Vec<HealthCacheEntry> {
        let now = Instant::now();
        let store = self.store.read().await;
        let mut rows: Vec<HealthCacheEntry> = store
            .iter()
            .map(|(key, record)| HealthCacheEntry {
                target: key.clone(),
                good_dials: record.good_dials,
                failed_dials: record.failed_dials,
                expires_in_secs: record.expires.saturating_duration_since(now).as_secs(),
                next_dial_in_secs: record
                    .next_dial_attempt
                    .map(|at| at.saturating_duration_since(now).as_secs())
                    .unwrap_or(0),
                last_dial_ago_secs: record
                    .last_dial_attempt
                    .map(|at| now.saturating_duration_since(at).as_secs()),
                last_dial_status: trim_to(&record.last_dial_status, 60),
                last_health_check_ago_secs: record
                    .last_health_check
                    .map(|at| now.saturating_duration_since(at).as_secs()),
                last_health_check_status: trim_to(&record.last_health_check_status, 90),
                probe_url: record.probe_url.clone(),
                is_good: record.is_good(now),
            })
            .collect();
        rows.sort_by(|a, b| a.target.cmp(&b.target));
        rows
    }
}

/// Drops every record whose expiry is in the past.
fn sweep_store(store: &mut HashMap<String, HealthRecord>, now: Instant) {
    let before = store.len();
    store.retain(|_, record| record.expires >= now);
    let removed = before - store.len();
    if removed > 0 {
        debug!(removed, "swept expired health records");
    }
}
