//! Capacity-aware placement.
//!
//! Picks the target server for a new subscription from a capacity snapshot:
//! least-loaded by ratio, deterministic under ties. Placement is advisory
//! only — the store re-checks capacity inside the purchase transaction, so a
//! stale snapshot can cost a retry but never an over-placement.

use vac_common::{PlacementError, Server, ServerLoad};

/// Compare load ratios `a.active / a.max_users` vs `b.active / b.max_users`
/// without touching floats: cross-multiply in u64.
fn ratio_less(a: &ServerLoad, b: &ServerLoad) -> bool {
    (a.active as u64) * (b.server.max_users as u64)
        < (b.active as u64) * (a.server.max_users as u64)
}

/// Choose the server for a new subscription.
///
/// Candidates are the enabled servers with `active < max_users`. Among them:
/// lowest load ratio wins; ties break on lower absolute active count, then
/// lexicographically smaller id, so repeated calls over the same snapshot
/// pick the same server.
pub fn select_server(snapshot: &[ServerLoad]) -> Result<Server, PlacementError> {
    let mut best: Option<&ServerLoad> = None;
    for load in snapshot {
        if !load.server.enabled || load.server.max_users == 0 {
            continue;
        }
        if load.active >= load.server.max_users {
            continue;
        }
        best = match best {
            None => Some(load),
            Some(current) => {
                if ratio_less(load, current)
                    || (!ratio_less(current, load)
                        && (load.active, load.server.id.as_str())
                            < (current.active, current.server.id.as_str()))
                {
                    Some(load)
                } else {
                    Some(current)
                }
            }
        };
    }
    best.map(|load| load.server.clone())
        .ok_or(PlacementError::NoCapacity)
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
