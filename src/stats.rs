use std::time::Duration;

use serde::Serialize;

/// Counters describing everything the interceptor has done since startup.
///
/// Callers accumulate a local copy during a single intercepted dial and merge
/// it into the shared instance exactly once, so the shared lock is touched a
/// bounded number of times per dial no matter how many attempts were made.
#[derive(Debug, Default, Clone, Serialize)]
pub struct InterceptStats {
    /// Calls to the intercepting dial entry point.
    pub intercepts: u64,
    /// Dials forwarded untouched because host, service, or config said so.
    pub bypasses: u64,
    /// Intercepted dials whose SRV lookup produced zero usable targets.
    pub no_srv: u64,
    /// Calls into the target selector.
    pub selector_calls: u64,
    /// Times a repeated target ended the attempt loop with every target failed.
    pub dupes_stopped: u64,
    /// Underlying dials that returned a connection.
    pub good_dials: u64,
    /// Underlying dials that returned an error.
    pub failed_dials: u64,
    /// Times the intercept deadline expired before any attempt succeeded.
    pub deadlines: u64,
    /// Total wall-clock time spent inside intercepted dials.
    #[serde(skip)]
    pub intercept_time: Duration,
}

impl InterceptStats {
    /// Adds another set of counters into this one.
    pub fn merge(&mut self, other: &InterceptStats) {
        self.intercepts += other.intercepts;
        self.bypasses += other.bypasses;
        self.no_srv += other.no_srv;
        self.selector_calls += other.selector_calls;
        self.dupes_stopped += other.dupes_stopped;
        self.good_dials += other.good_dials;
        self.failed_dials += other.failed_dials;
        self.deadlines += other.deadlines;
        self.intercept_time += other.intercept_time;
    }
}
