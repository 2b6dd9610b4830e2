use std::time::Instant;

use serde::Serialize;

use crate::health::HealthCache;
use crate::srv::cache::{SrvTarget, SrvView, WEIGHT_SCALE};

/// The selector's pick: a single dialable endpoint. The weight is the
/// presentation value, scaled back down from the effective weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

impl Endpoint {
    fn from_target(target: &SrvTarget, priority: u16) -> Self {
        Self {
            host: target.host.clone(),
            port: target.port,
            priority,
            weight: (target.weight / WEIGHT_SCALE).min(u16::MAX as u64) as u16,
        }
    }

    /// `host:port`, the form handed to the underlying dialer.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Picks the next target to dial, or `None` when the view holds no targets.
///
/// The search works down the priority groups in ascending order, holding the
/// health cache's read lock for the whole scan so weights and eligibility
/// stay consistent. Within a group a uniform draw over the summed effective
/// weights picks the preferred target; if that draw lands on an ineligible
/// target, the first eligible target of the same group is returned instead,
/// so a healthy target in the preferred priority always beats anything in a
/// lower priority.
///
/// When no target anywhere is eligible, a second pass returns the target
/// whose `next_dial_attempt` is soonest, ignoring priority and weight: a
/// high-priority target that just failed is a worse bet than a low-priority
/// one whose veto has nearly elapsed.
pub(crate) async fn best_target(
    view: &SrvView,
    health: &HealthCache,
    rand_intn: &(dyn Fn(usize) -> usize + Send + Sync),
) -> Option<Endpoint> {
    if view.priorities.is_empty() {
        return None;
    }
    let now = Instant::now();
    let store = health.store().read().await;

    let mut second_choice: Option<Endpoint> = None;
    for group in &view.priorities {
        if group.total_weight == 0 {
            continue;
        }
        let wix = rand_intn(group.total_weight as usize) as u64;
        let mut lower = 0u64;
        for target in &group.targets {
            let upper = lower + target.weight;
            let eligible = store
                .get(&target.key())
                .map_or(true, |record| record.is_good(now));
            if eligible {
                if wix >= lower && wix < upper {
                    return Some(Endpoint::from_target(target, group.priority));
                }
                if second_choice.is_none() {
                    second_choice = Some(Endpoint::from_target(target, group.priority));
                }
            }
            lower = upper;
        }
        if second_choice.is_some() {
            // The preferred draw was ineligible but this priority still has a
            // healthy target.
            return second_choice;
        }
    }

    // Least-worst pass. A missing record counts as "available now"; a record
    // whose veto has been cleared sorts ahead of everything.
    let mut best: Option<Endpoint> = None;
    let mut soonest: Option<Option<Instant>> = None;
    for group in &view.priorities {
        for target in &group.targets {
            let next_attempt = match store.get(&target.key()) {
                None => Some(now),
                Some(record) => record.next_dial_attempt(),
            };
            let better = match &soonest {
                None => true,
                Some(current) => earlier_than(&next_attempt, current),
            };
            if better {
                best = Some(Endpoint::from_target(target, group.priority));
                soonest = Some(next_attempt);
            }
        }
    }
    best
}

/// Orders optional instants with `None` (no pending veto) first.
fn earlier_than(a: &Option<Instant>, b: &Option<Instant>) -> bool {
    match (a, b) {
        (None, None) => false,
        (None, Some(_)) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => a < b,
    }
}
