//! Priority & Allocator (§4.6): orders eligible requests by tier + FCFS and
//! assigns courts without conflicts.

use crate::domain::reservation::ReservationRequest;

/// One confirmed assignment: the request and the court it should attempt
/// first, plus its remaining preferences as fallback courts.
#[derive(Debug, Clone)]
pub struct ConfirmedAssignment {
    pub request_id: String,
    pub primary_court: u32,
    pub fallback_courts: Vec<u32>,
}

/// The allocator's output for one window (§3 "Booking Plan", §GLOSSARY
/// "Plan"): confirmed assignments plus a waitlist of request ids.
#[derive(Debug, Clone, Default)]
pub struct BookingPlan {
    pub confirmed: Vec<ConfirmedAssignment>,
    pub waitlist: Vec<String>,
}

/// Sorts by `(tier ascending, created_at ascending)`, takes the first
/// `min(len, num_courts)` as confirmed, assigns courts by walking each
/// confirmed request's preference list, and waitlists the rest (§4.6).
pub fn allocate(requests: &[ReservationRequest], courts: &[u32]) -> BookingPlan {
    let mut ordered: Vec<&ReservationRequest> = requests.iter().collect();
    ordered.sort_by(|a, b| a.tier.cmp(&b.tier).then(a.created_at.cmp(&b.created_at)));

    let capacity = courts.len();
    let (confirmed_candidates, waitlisted_candidates) = if ordered.len() > capacity {
        ordered.split_at(capacity)
    } else {
        (ordered.as_slice(), &ordered[ordered.len()..])
    };

    let mut plan = BookingPlan::default();
    let mut assigned: std::collections::HashSet<u32> = std::collections::HashSet::new();

    for request in confirmed_candidates {
        match pick_court(request, courts, &assigned) {
            Some(primary) => {
                assigned.insert(primary);
                let fallback_courts: Vec<u32> =
                    request.court_preferences.iter().copied().filter(|c| *c != primary).collect();
                plan.confirmed.push(ConfirmedAssignment {
                    request_id: request.id.clone(),
                    primary_court: primary,
                    fallback_courts,
                });
            }
            None => plan.waitlist.push(request.id.clone()),
        }
    }

    for request in waitlisted_candidates {
        plan.waitlist.push(request.id.clone());
    }

    plan
}

fn pick_court(
    request: &ReservationRequest,
    courts: &[u32],
    assigned: &std::collections::HashSet<u32>,
) -> Option<u32> {
    if let Some(preferred) = request.court_preferences.iter().find(|c| !assigned.contains(c)) {
        return Some(*preferred);
    }
    let mut free: Vec<u32> = courts.iter().copied().filter(|c| !assigned.contains(c)).collect();
    free.sort_unstable();
    free.into_iter().next()
}

/// Late-VIP handling (§4.6): re-runs allocation including a newly-arrived
/// privileged request. Only called before dispatch begins for the window;
/// in-flight attempts are never interrupted (§9 design note).
pub fn reallocate_with_late_arrival(
    mut eligible: Vec<ReservationRequest>,
    late_arrival: ReservationRequest,
    courts: &[u32],
) -> BookingPlan {
    eligible.push(late_arrival);
    allocate(&eligible, courts)
}
