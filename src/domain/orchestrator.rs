//! Orchestrator (§4.8): per-window coordinator. Builds the concurrent
//! attempt set from a booking plan, launches one executor per (request,
//! court) pair, collects results, and reassigns fallbacks for attempts
//! that fail without reserving their court.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::config::Config;
use crate::domain::executor::{run_attempt, BookingAttemptRequest, TimingPreset};
use crate::domain::notifier::{NotificationEvent, Notifier};
use crate::domain::pool::BrowserPool;
use crate::domain::priority::BookingPlan;
use crate::domain::queue::ReservationQueue;
use crate::domain::reservation::{RequestState, ReservationRequest};
use crate::error::ExecutorError;

const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of one (request, court) attempt, used both to update the
/// queue and to decide whether a court became free for a fallback
/// attempt (§4.8).
pub struct AttemptResult {
    pub request_id: String,
    pub court: u32,
    pub outcome: Result<String, ExecutorError>,
}

/// Runs every confirmed assignment in `plan` concurrently against `pool`,
/// then issues fallback attempts against whatever courts became free
/// because another attempt failed without reserving them. A confirmed
/// request whose own attempt failed non-terminally gets first claim on a
/// freed court via its own remaining preferences, then the waitlist claims
/// what's left via its full preference list (§4.8 "Parallelism", "fallback").
pub async fn run_window(
    plan: &BookingPlan,
    requests_by_id: &std::collections::HashMap<String, ReservationRequest>,
    pool: &Arc<BrowserPool>,
    queue: &ReservationQueue,
    notifier: &Arc<dyn Notifier>,
    config: &Config,
) -> Vec<AttemptResult> {
    pool.mark_critical_operation(true);
    let primary_results = run_assignments(&plan.confirmed, requests_by_id, pool, queue, notifier, config).await;
    let freed_courts: Vec<u32> = primary_results
        .iter()
        .filter(|r| r.outcome.is_err())
        .map(|r| r.court)
        .collect();

    // Fallback candidates, in priority order: a confirmed request whose own
    // primary attempt failed non-terminally tries its own remaining
    // preferences first (`ConfirmedAssignment::fallback_courts`), then the
    // waitlist tries its full preference list (§4.8 "fallback").
    let mut candidates: Vec<(&str, &[u32])> = Vec::new();
    for assignment in &plan.confirmed {
        let failed_non_terminal = primary_results.iter().any(|r| {
            r.request_id == assignment.request_id
                && matches!(&r.outcome, Err(e) if !e.is_terminal_for_window())
        });
        if failed_non_terminal {
            candidates.push((&assignment.request_id, &assignment.fallback_courts));
        }
    }
    for waitlisted_id in &plan.waitlist {
        if let Some(request) = requests_by_id.get(waitlisted_id) {
            candidates.push((waitlisted_id, &request.court_preferences));
        }
    }

    let mut fallback_results = Vec::new();
    let mut remaining_free = freed_courts;
    for (request_id, preferences) in candidates {
        if remaining_free.is_empty() {
            break;
        }
        let Some(position) = preferences.iter().position(|c| remaining_free.contains(c)) else { continue };
        let court = preferences[position];
        remaining_free.retain(|c| *c != court);

        let Some(request) = requests_by_id.get(request_id) else { continue };
        let result = run_single_attempt(request, court, pool, queue, notifier, config).await;
        fallback_results.push(result);
    }

    pool.mark_critical_operation(false);
    primary_results.into_iter().chain(fallback_results).collect()
}

async fn run_assignments(
    assignments: &[crate::domain::priority::ConfirmedAssignment],
    requests_by_id: &std::collections::HashMap<String, ReservationRequest>,
    pool: &Arc<BrowserPool>,
    queue: &ReservationQueue,
    notifier: &Arc<dyn Notifier>,
    config: &Config,
) -> Vec<AttemptResult> {
    let futures = assignments.iter().filter_map(|assignment| {
        let request = requests_by_id.get(&assignment.request_id)?;
        Some(run_single_attempt(request, assignment.primary_court, pool, queue, notifier, config))
    });
    join_all(futures).await
}

async fn run_single_attempt(
    request: &ReservationRequest,
    court: u32,
    pool: &Arc<BrowserPool>,
    queue: &ReservationQueue,
    notifier: &Arc<dyn Notifier>,
    config: &Config,
) -> AttemptResult {
    let request_id = request.id.clone();

    if queue.mark_dispatching(&request_id).await.is_err() {
        return AttemptResult { request_id, court, outcome: Err(ExecutorError::Internal("request vanished before dispatch".to_string())) };
    }
    notifier.notify(&request.user_id, NotificationEvent::Dispatched { request_id: request_id.clone() }).await;

    if queue.mark_executing(&request_id).await.is_err() {
        return AttemptResult {
            request_id,
            court,
            outcome: Err(ExecutorError::Internal("already executing for this user and slot".to_string())),
        };
    }

    let lease = match pool.acquire_page(court).await {
        Ok(lease) => lease,
        Err(e) => {
            let _ = queue.mark_failed(&request_id, e.to_string()).await;
            return AttemptResult { request_id, court, outcome: Err(ExecutorError::Internal(e.to_string())) };
        }
    };

    // The lifetime-confirmation count drives the `experienced` timing
    // promotion (§4.4): a user who has already confirmed several bookings
    // gets the tighter preset regardless of `config.experienced_mode`.
    let lifetime_confirmations =
        queue.list_for_user(&request.user_id).await.iter().filter(|r| r.state == RequestState::Confirmed).count() as u32;

    let attempt_request = BookingAttemptRequest {
        court,
        target_date: request.target_date,
        target_time: request.target_time.clone(),
        contact: request.contact.clone(),
        preset: TimingPreset::for_user(lifetime_confirmations, config.experienced_mode),
        base_speed_multiplier: config.speed_multiplier,
    };

    let outcome = match tokio::time::timeout(DEFAULT_ATTEMPT_TIMEOUT, run_attempt(&lease, &attempt_request)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ExecutorError::ConfirmationTimeout),
    };

    match &outcome {
        Ok(confirmation_id) => {
            let _ = queue.mark_confirmed(&request_id, court, confirmation_id.clone()).await;
            notifier
                .notify(
                    &request.user_id,
                    NotificationEvent::Confirmed { request_id: request_id.clone(), court, confirmation_id: confirmation_id.clone() },
                )
                .await;
        }
        Err(error) => {
            let _ = queue.mark_failed(&request_id, error.to_string()).await;
            if error.is_terminal_for_window() {
                notifier.notify(&request.user_id, NotificationEvent::Failed { request_id: request_id.clone(), reason: error.to_string() }).await;
            } else {
                let _ = queue.schedule_retry(&request_id, chrono::Utc::now(), config.booking_window_hours, &config.timezone).await;
            }
        }
    }

    AttemptResult { request_id, court, outcome }
}
