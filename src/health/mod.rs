// Per-target health tracking.
//
// Each endpoint that ever appears in an SRV view (or in a dial outcome) gets
// a record of its dial history and, when active health checks are enabled, a
// background prober that keeps an unhealthy flag up to date from a
// TXT-advertised URL.

pub mod cache;
pub mod prober;

pub use cache::{HealthCache, HealthCacheEntry, HealthRecord};
