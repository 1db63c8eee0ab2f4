//! RDY credit distribution.
//!
//! Pure planning functions; the reader feeds them a snapshot of its
//! connections and applies the resulting grants.
//!
//! The budget invariant: for every connection, the broker may push at most
//! `max(last_rdy, in_flight)` messages that are not yet finished. Keeping
//! the sum of that claim at or below `max_in_flight` keeps the total in
//! flight there too, whatever order messages arrive and complete in.

use std::time::Duration;

use crate::events::ConnectionId;

/// What the planner needs to know about one ready connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditView {
    pub id: ConnectionId,
    pub max_rdy: u64,
    pub last_rdy: u64,
    pub in_flight: u64,
    /// Time since the last delivered message (or since the connection
    /// became ready).
    pub idle_for: Duration,
}

impl CreditView {
    #[inline]
    fn claim(&self) -> u64 {
        self.last_rdy.max(self.in_flight)
    }
}

/// Target RDY for each connection.
///
/// With at least as much credit as connections the credit is split evenly,
/// remainder to the lowest ids, each share capped at the broker's max RDY.
/// Otherwise current holders of RDY keep their single slot until they have
/// been idle longer than `low_rdy_idle_timeout`; freed slots go to the
/// connections that have waited longest.
pub fn plan_distribution(
    max_in_flight: u64,
    views: &[CreditView],
    low_rdy_idle_timeout: Duration,
) -> Vec<(ConnectionId, u64)> {
    if views.is_empty() {
        return Vec::new();
    }
    let mut sorted: Vec<&CreditView> = views.iter().collect();
    sorted.sort_by_key(|v| v.id);
    let n = sorted.len() as u64;

    if max_in_flight >= n {
        let share = max_in_flight / n;
        let remainder = max_in_flight % n;
        return sorted
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let extra = u64::from((i as u64) < remainder);
                (v.id, (share + extra).min(v.max_rdy))
            })
            .collect();
    }

    let mut keep: Vec<ConnectionId> = sorted
        .iter()
        .filter(|v| v.last_rdy > 0 && v.idle_for <= low_rdy_idle_timeout)
        .map(|v| v.id)
        .take(max_in_flight as usize)
        .collect();

    let mut waiting: Vec<&CreditView> = sorted
        .iter()
        .copied()
        .filter(|v| !keep.contains(&v.id))
        .collect();
    // Connections that just lost their slot go last, then longest idle first.
    waiting.sort_by(|a, b| {
        (a.last_rdy > 0)
            .cmp(&(b.last_rdy > 0))
            .then(b.idle_for.cmp(&a.idle_for))
            .then(a.id.cmp(&b.id))
    });
    let free = max_in_flight as usize - keep.len();
    keep.extend(waiting.iter().take(free).map(|v| v.id));

    sorted
        .iter()
        .map(|v| {
            let target = if keep.contains(&v.id) { 1.min(v.max_rdy) } else { 0 };
            (v.id, target)
        })
        .collect()
}

/// Turn a plan into RDY updates that never break the budget.
///
/// Decreases are applied first; increases only get what the budget has
/// left, so a connection may end up below its target until messages it
/// already holds complete. Connections whose RDY would not change are
/// omitted.
pub fn admit(
    max_in_flight: u64,
    views: &[CreditView],
    plan: &[(ConnectionId, u64)],
) -> Vec<(ConnectionId, u64)> {
    let mut claimed: u64 = views.iter().map(CreditView::claim).sum();
    let mut updates = Vec::new();

    let lookup = |id: ConnectionId| views.iter().find(|v| v.id == id);

    for &(id, target) in plan {
        let Some(view) = lookup(id) else { continue };
        if target < view.last_rdy {
            let old = view.claim();
            let new = target.max(view.in_flight);
            claimed = claimed - old + new;
            updates.push((id, target));
        }
    }

    for &(id, target) in plan {
        let Some(view) = lookup(id) else { continue };
        if target <= view.last_rdy {
            continue;
        }
        let old = view.claim();
        let room = max_in_flight.saturating_sub(claimed);
        let granted = target.min(old + room);
        if granted <= view.last_rdy {
            continue;
        }
        claimed = claimed - old + granted.max(view.in_flight);
        updates.push((id, granted));
    }
    updates
}
