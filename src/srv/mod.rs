// SRV cache and target selection.
//
// The cache stores one immutable view per queried SRV name, shaped so the
// selector can walk priority groups without taking any lock on the view
// itself: SrvView -> PriorityGroup -> SrvTarget.

pub mod cache;
pub mod selector;

pub use cache::{SrvCache, SrvCacheEntry, SrvView};
pub use selector::Endpoint;
