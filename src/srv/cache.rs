use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::dns::SrvRecordData;
use crate::health::HealthCache;

/// Weights are stored multiplied by this so that zero-weight targets can be
/// given a collective share of roughly 0.1% of their group without losing
/// integer precision (RFC 2782's "very small chance of being selected").
pub(crate) const WEIGHT_SCALE: u64 = 1000;

/// One target inside a priority group. The host is stored lowercased and the
/// weight is the effective (scaled) weight, never zero after population.
#[derive(Debug, Clone)]
pub(crate) struct SrvTarget {
    pub(crate) weight: u64,
    pub(crate) port: u16,
    pub(crate) host: String,
}

impl SrvTarget {
    /// Health-cache key for this target, `host:port`.
    pub(crate) fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// All targets sharing one SRV priority, in resolver-returned order.
#[derive(Debug, Clone)]
pub(crate) struct PriorityGroup {
    pub(crate) priority: u16,
    /// Sum of the effective weights, the upper bound for the selector's PRNG.
    pub(crate) total_weight: u64,
    pub(crate) targets: Vec<SrvTarget>,
}

/// The prepared, priority-grouped result of one SRV lookup.
///
/// A view is frozen once it is installed in the cache; the lookup counter is
/// advisory and the only field that still moves.
#[derive(Debug)]
pub struct SrvView {
    expires: Instant,
    lookups: AtomicU64,
    pub(crate) priorities: Vec<PriorityGroup>,
    unique_target_count: usize,
}

impl SrvView {
    /// Builds a view from raw SRV records: sort by ascending priority, drop
    /// empty targets, scale weights, give zero-weight targets their floor,
    /// and pick the expiry based on whether anything survived. Also returns
    /// the distinct `host:port` keys for health-cache registration.
    pub(crate) fn build(
        mut records: Vec<SrvRecordData>,
        now: Instant,
        found_ttl: Duration,
        not_found_ttl: Duration,
    ) -> (SrvView, Vec<String>) {
        // Resolvers may or may not pre-sort; never trust them.
        records.sort_by_key(|record| record.priority);

        let mut priorities: Vec<PriorityGroup> = Vec::new();
        for record in records {
            if record.target.is_empty() {
                // RFC 2782 says a zero-length target means "ignore entirely".
                continue;
            }
            let target = SrvTarget {
                weight: record.weight as u64 * WEIGHT_SCALE,
                port: record.port,
                host: record.target.to_ascii_lowercase(),
            };
            match priorities.last_mut() {
                Some(group) if group.priority == record.priority => {
                    group.total_weight += target.weight;
                    group.targets.push(target);
                }
                _ => priorities.push(PriorityGroup {
                    priority: record.priority,
                    total_weight: target.weight,
                    targets: vec![target],
                }),
            }
        }

        // Zero-weight targets collectively get ~0.1% of their group's
        // selection probability, split evenly, with a floor of one.
        for group in &mut priorities {
            let zero_count = group.targets.iter().filter(|t| t.weight == 0).count() as u64;
            if zero_count == 0 {
                continue;
            }
            let mut very_small = group.total_weight / WEIGHT_SCALE;
            very_small = (very_small + zero_count - 1) / zero_count;
            if very_small == 0 {
                very_small = 1;
            }
            for target in &mut group.targets {
                if target.weight == 0 {
                    target.weight = very_small;
                    group.total_weight += very_small;
                }
            }
        }

        let keys: HashSet<String> = priorities
            .iter()
            .flat_map(|group| group.targets.iter().map(SrvTarget::key))
            .collect();
        let unique_target_count = keys.len();
        let expires = if unique_target_count > 0 {
            now + found_ttl
        } else {
            now + not_found_ttl
        };

        let view = SrvView {
            expires,
            lookups: AtomicU64::new(1),
            priorities,
            unique_target_count,
        };
        (view, keys.into_iter().collect())
    }

    /// Count of distinct `host:port` endpoints. Zero means "no SRV data";
    /// the caller should fall back to the underlying dialer.
    pub fn unique_targets(&self) -> usize {
        self.unique_target_count
    }

    pub(crate) fn expires(&self) -> Instant {
        self.expires
    }

    pub(crate) fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    pub(crate) fn note_lookup(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Display for SrvView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "srv view ({} groups):", self.priorities.len())?;
        for group in &self.priorities {
            write!(
                f,
                "\n\tp={} totw={} ({}):",
                group.priority,
                group.total_weight,
                group.targets.len()
            )?;
            for target in &group.targets {
                write!(f, "\n\t\ttarw={} {}:{}", target.weight, target.host, target.port)?;
            }
        }
        Ok(())
    }
}

/// One row of the status page's SRV table.
#[derive(Debug, Clone, Serialize)]
pub struct SrvCacheEntry {
    pub name: String,
    pub expires_in_secs: u64,
    pub lookups: u64,
    pub priority: u16,
    pub weight: u64,
    pub port: u16,
    pub target: String,
    pub good_dials: u64,
    pub failed_dials: u64,
    pub is_good: bool,
    pub no_records: bool,
}

/// Cache of SRV views keyed by the lowercased qname. The map is concurrent;
/// view internals are immutable, so readers never block each other.
pub struct SrvCache {
    cache: Arc<DashMap<String, Arc<SrvView>>>,
}

impl SrvCache {
    pub(crate) fn new() -> Self {
        Self {
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Returns the cached view for `key`, bumping its lookup counter.
    pub(crate) fn get(&self, key: &str) -> Option<Arc<SrvView>> {
        let view = self.cache.get(key).map(|entry| entry.value().clone())?;
        view.note_lookup();
        Some(view)
    }

    /// Installs a freshly built view, overwriting any entry another lookup
    /// raced in meanwhile. Last writer wins.
    pub(crate) fn install(&self, key: String, view: Arc<SrvView>) {
        self.cache.insert(key, view);
    }

    pub(crate) fn len(&self) -> usize {
        self.cache.len()
    }

    /// Spawns the periodic cleaner. It stops when the shutdown signal flips
    /// or its sender is dropped.
    pub(crate) fn spawn_cleaner(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweep_map(&cache, Instant::now()),
                    _ = shutdown.changed() => return,
                }
            }
        })
    }

    /// Clones the cache contents into status-page rows, one per target plus
    /// one per negative entry.
    pub(crate) async fn snapshot(&self, health: &HealthCache) -> Vec<SrvCacheEntry> {
        let now = Instant::now();
        let mut rows = Vec::new();
        // Copy the entries out first; map guards must not be held across the
        // health-cache awaits below.
        let mut views: Vec<(String, Arc<SrvView>)> = self
            .cache
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        views.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, view) in views {
            let expires_in_secs = view.expires().saturating_duration_since(now).as_secs();
            if view.priorities.is_empty() {
                rows.push(SrvCacheEntry {
                    name,
                    expires_in_secs,
                    lookups: view.lookups(),
                    priority: 0,
                    weight: 0,
                    port: 0,
                    target: String::new(),
                    good_dials: 0,
                    failed_dials: 0,
                    is_good: false,
                    no_records: true,
                });
                continue;
            }
            for group in &view.priorities {
                for target in &group.targets {
                    let (good_dials, failed_dials, is_good) =
                        health.dial_counters(&target.key(), now).await;
                    rows.push(SrvCacheEntry {
                        name: name.clone(),
                        expires_in_secs,
                        lookups: view.lookups(),
                        priority: group.priority,
                        weight: target.weight,
                        port: target.port,
                        target: target.host.clone(),
                        good_dials,
                        failed_dials,
                        is_good,
                        no_records: false,
                    });
                }
            }
        }
        rows
    }
}

/// Drops every view whose expiry is in the past.
fn sweep_map(cache: &DashMap<String, Arc<SrvView>>, now: Instant) {
    let before = cache.len();
    cache.retain(|_, view| view.expires() >= now);
    let removed = before - cache.len();
    if removed > 0 {
        debug!(removed, "swept expired SRV cache entries");
    }
}
