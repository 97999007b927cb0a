use chrono::{DateTime, Duration, Utc};

use crate::crd::CapacityReservation;

/// Sum of reservations still valid at `now`. A reservation is valid iff its
/// expiration time is strictly after the evaluation instant; entries with no
/// expiration never became effective and are ignored.
pub fn valid_sum(
    reservations: &[CapacityReservation],
    now: DateTime<Utc>,
) -> i64 {
    reservations
        .iter()
        .filter(|r| matches!(r.expiration_time, Some(exp) if exp > now))
        .map(|r| r.replicas)
        .sum()
}

/// Rewrites a reservation list for one batch of triggers.
///
/// Expired entries are dropped (this is the lazy prune point), positive
/// amounts append a fresh reservation, and each non-positive amount removes
/// the first remaining entry it algebraically cancels. Unmatched negative
/// amounts are dropped.
pub fn apply_triggers(
    existing: Vec<CapacityReservation>,
    triggers: &[(i64, Duration)],
    now: DateTime<Utc>,
) -> Vec<CapacityReservation> {
    let mut out: Vec<CapacityReservation> = existing
        .into_iter()
        .filter(|r| matches!(r.expiration_time, Some(exp) if exp > now))
        .collect();
    for &(amount, duration) in triggers {
        if amount > 0 {
            out.push(CapacityReservation {
                effective_time: Some(now),
                expiration_time: Some(now + duration),
                replicas: amount,
            });
        } else if let Some(pos) =
            out.iter().position(|r| r.replicas == -amount)
        {
            // First structurally matching entry, not FIFO-fair.
            out.remove(pos);
        }
    }
    out
}
