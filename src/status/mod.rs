// Read-only status service: an HTML view of the caches and counters, the
// same snapshot as JSON, and a Prometheus endpoint. No access control, so
// bind it to loopback.

pub mod server;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::health::HealthCacheEntry;
use crate::srv::SrvCacheEntry;

/// A point-in-time copy of everything the status service renders.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub config: ConfigSnapshot,
    pub stats: StatsSnapshot,
    pub srv: Vec<SrvCacheEntry>,
    pub health: Vec<HealthCacheEntry>,
}

/// The effective configuration, durations flattened to seconds.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSnapshot {
    pub debug_dial_context: bool,
    pub debug_health_checks: bool,
    pub debug_intercepts: bool,
    pub debug_dial_results: bool,
    pub debug_srv_lookups: bool,
    pub disable_interception: bool,
    pub disable_health_checks: bool,
    pub allow_numeric_services: bool,
    pub service_name: Option<String>,
    pub health_check_txt_prefix: String,
    pub health_check_content_ok: String,
    pub health_check_frequency_secs: u64,
    pub intercept_timeout_secs: u64,
    pub dial_veto_secs: u64,
    pub not_found_srv_ttl_secs: u64,
    pub found_srv_ttl_secs: u64,
    pub health_ttl_secs: u64,
}

/// The cumulative intercept counters plus total time spent intercepting.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub intercepts: u64,
    pub bypasses: u64,
    pub no_srv: u64,
    pub selector_calls: u64,
    pub dupes_stopped: u64,
    pub good_dials: u64,
    pub failed_dials: u64,
    pub deadlines: u64,
    pub intercept_time_ms: u64,
}
