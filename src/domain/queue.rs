//! Reservation Queue (§4.5): an ordered, persistent collection of
//! requests with serialised state transitions. Readers may list
//! concurrently; writers serialise via the queue-wide `RwLock` (§5).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::reservation::{RequestState, ReservationRequest};
use crate::domain::store::QueueStore;
use crate::error::{QueueError, Result};
use crate::logger::log_event;

/// Computes the next retry delay given how long ago the window opened
/// (§4.5 "Retry policy"). `attempts_so_far` selects among the first three
/// fixed delays in the opening 5 minutes; beyond that the delay depends
/// only on elapsed time.
pub fn next_retry_delay(elapsed_since_window_open: chrono::Duration, attempts_so_far: u32) -> chrono::Duration {
    let five_minutes = chrono::Duration::minutes(5);
    let thirty_minutes = chrono::Duration::minutes(30);

    if elapsed_since_window_open < five_minutes {
        match attempts_so_far {
            0 => chrono::Duration::seconds(30),
            1 => chrono::Duration::seconds(60),
            _ => chrono::Duration::seconds(120),
        }
    } else if elapsed_since_window_open < thirty_minutes {
        chrono::Duration::minutes(5)
    } else {
        chrono::Duration::minutes(15)
    }
}

/// The reservation queue: owns all requests for the duration of the
/// process. The scheduler holds only references obtained through its
/// selection methods (§3 "Lifecycle ownership").
pub struct ReservationQueue {
    requests: RwLock<HashMap<String, ReservationRequest>>,
    store: Arc<dyn QueueStore>,
    max_retry_attempts: u32,
}

impl ReservationQueue {
    pub async fn load(store: Arc<dyn QueueStore>, max_retry_attempts: u32) -> Result<Self> {
        let loaded = store.load_all().await?;
        let requests = loaded.into_iter().map(|r| (r.id.clone(), r)).collect();
        Ok(ReservationQueue { requests: RwLock::new(requests), store, max_retry_attempts })
    }

    async fn persist(&self, guard: &HashMap<String, ReservationRequest>) -> Result<()> {
        let snapshot: Vec<ReservationRequest> = guard.values().cloned().collect();
        self.store.save_all(&snapshot).await
    }

    pub async fn add(&self, request: ReservationRequest) -> Result<()> {
        let mut guard = self.requests.write().await;
        guard.insert(request.id.clone(), request);
        self.persist(&guard).await
    }

    pub async fn get(&self, id: &str) -> Option<ReservationRequest> {
        self.requests.read().await.get(id).cloned()
    }

    pub async fn list_by_state(&self, state: RequestState) -> Vec<ReservationRequest> {
        self.requests.read().await.values().filter(|r| r.state == state).cloned().collect()
    }

    pub async fn list_for_user(&self, user_id: &str) -> Vec<ReservationRequest> {
        self.requests.read().await.values().filter(|r| r.user_id == user_id).cloned().collect()
    }

    pub async fn mark_dispatching(&self, id: &str) -> Result<()> {
        let mut guard = self.requests.write().await;
        let request = guard.get_mut(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        request.mark_dispatching();
        self.persist(&guard).await?;
        log_event("queue", None, Some(id), None, "state=dispatching");
        Ok(())
    }

    /// Atomic per §4.5: fails if another request for the same user and
    /// target slot is already `Executing`.
    pub async fn mark_executing(&self, id: &str) -> Result<()> {
        let mut guard = self.requests.write().await;
        let (user_id, target_date, target_time) = {
            let request = guard.get(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            (request.user_id.clone(), request.target_date, request.target_time.clone())
        };

        let already_executing = guard.values().any(|r| {
            r.id != id
                && r.user_id == user_id
                && r.target_date == target_date
                && r.target_time == target_time
                && r.state == RequestState::Executing
        });
        if already_executing {
            return Err(QueueError::AlreadyExecuting(id.to_string()).into());
        }

        let request = guard.get_mut(id).expect("presence checked above");
        request.mark_executing();
        self.persist(&guard).await?;
        log_event("queue", None, Some(id), None, "state=executing");
        Ok(())
    }

    pub async fn mark_confirmed(&self, id: &str, court: u32, confirmation_id: impl Into<String>) -> Result<()> {
        let mut guard = self.requests.write().await;
        let request = guard.get_mut(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        request.mark_confirmed(court, confirmation_id)?;
        self.persist(&guard).await?;
        log_event("queue", Some(court), Some(id), None, "state=confirmed");
        Ok(())
    }

    pub async fn mark_failed(&self, id: &str, error: impl Into<String>) -> Result<()> {
        let mut guard = self.requests.write().await;
        let request = guard.get_mut(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        request.mark_failed(error);
        self.persist(&guard).await?;
        log_event("queue", None, Some(id), None, "state=failed");
        Ok(())
    }

    pub async fn mark_expired(&self, id: &str) -> Result<()> {
        let mut guard = self.requests.write().await;
        let request = guard.get_mut(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        request.mark_expired();
        self.persist(&guard).await?;
        log_event("queue", None, Some(id), None, "state=expired");
        Ok(())
    }

    pub async fn cancel(&self, id: &str) -> Result<()> {
        let mut guard = self.requests.write().await;
        let request = guard.get_mut(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if request.state.is_terminal() {
            return Err(QueueError::AlreadyTerminal(id.to_string()).into());
        }
        request.mark_cancelled();
        self.persist(&guard).await
    }

    pub async fn back_to_pending(&self, id: &str) -> Result<()> {
        let mut guard = self.requests.write().await;
        let request = guard.get_mut(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        request.back_to_pending();
        self.persist(&guard).await
    }

    /// Returns a failed attempt to `pending`, gated by the §4.5 backoff
    /// schedule: the delay is chosen from how long ago this window opened
    /// and how many attempts have already been made.
    pub async fn schedule_retry(&self, id: &str, now: DateTime<Utc>, booking_window_hours: i64, timezone: &str) -> Result<()> {
        let mut guard = self.requests.write().await;
        let request = guard.get_mut(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let elapsed = match request.window_open(booking_window_hours, timezone) {
            Some(window_open) => (now - window_open).max(chrono::Duration::zero()),
            None => chrono::Duration::zero(),
        };
        let delay = next_retry_delay(elapsed, request.attempts.saturating_sub(1));
        request.schedule_retry(now + delay);
        self.persist(&guard).await
    }

    /// Selection policy (§4.5): `pending`, attempts below the retry
    /// ceiling, and `now` within `[window_open - dispatch_lead,
    /// window_open + retry_tail]`.
    pub async fn select_eligible(
        &self,
        now: DateTime<Utc>,
        booking_window_hours: i64,
        timezone: &str,
        dispatch_lead: chrono::Duration,
        retry_tail: chrono::Duration,
    ) -> Vec<ReservationRequest> {
        self.requests
            .read()
            .await
            .values()
            .filter(|r| {
                if r.state != RequestState::Pending || r.attempts >= self.max_retry_attempts {
                    return false;
                }
                let retry_ready = r.next_retry_at.map_or(true, |t| now >= t);
                retry_ready
                    && match r.window_open(booking_window_hours, timezone) {
                        Some(window_open) => now >= window_open - dispatch_lead && now <= window_open + retry_tail,
                        None => false,
                    }
            })
            .cloned()
            .collect()
    }

    /// Sweeps `pending` requests whose retry ceiling has been reached into
    /// `expired` (§4.5 end state of the retry policy).
    pub async fn expire_exhausted(&self) -> Result<Vec<String>> {
        let mut guard = self.requests.write().await;
        let mut expired_ids = Vec::new();
        for request in guard.values_mut() {
            if request.state == RequestState::Pending && request.attempts >= self.max_retry_attempts {
                request.mark_expired();
                expired_ids.push(request.id.clone());
            }
        }
        if !expired_ids.is_empty() {
            self.persist(&guard).await?;
        }
        Ok(expired_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::contact::ContactInfo;
    use crate::domain::store::InMemoryStore;
    use crate::domain::tier::UserTier;
    use chrono::NaiveDate;

    fn sample_request(user_id: &str, date: NaiveDate, time: &str, court: u32) -> ReservationRequest {
        ReservationRequest::new(
            user_id,
            ContactInfo {
                first_name: "Ana".to_string(),
                last_name: "Lopez".to_string(),
                phone: "555".to_string(),
                email: "a@b.test".to_string(),
            },
            date,
            time,
            vec![court],
            UserTier::Regular,
            &[court],
            Utc::now(),
        )
        .unwrap()
    }

    async fn new_queue() -> ReservationQueue {
        ReservationQueue::load(Arc::new(InMemoryStore::default()), 8).await.unwrap()
    }

    #[tokio::test]
    async fn mark_executing_twice_for_same_user_and_slot_fails() {
        let queue = new_queue().await;
        let date = NaiveDate::from_ymd_opt(2025, 8, 15).unwrap();
        let a = sample_request("u1", date, "10:00", 1);
        let mut b = sample_request("u1", date, "10:00", 1);
        b.id = "other-id".to_string();

        queue.add(a.clone()).await.unwrap();
        queue.add(b.clone()).await.unwrap();

        queue.mark_executing(&a.id).await.unwrap();
        let result = queue.mark_executing(&b.id).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn retry_ceiling_respected_by_attempts_monotonic() {
        let queue = ReservationQueue::load(Arc::new(InMemoryStore::default()), 2).await.unwrap();
        let request = sample_request("u1", NaiveDate::from_ymd_opt(2025, 8, 15).unwrap(), "10:00", 1);
        queue.add(request.clone()).await.unwrap();

        queue.mark_executing(&request.id).await.unwrap();
        queue.back_to_pending(&request.id).await.unwrap();
        queue.mark_executing(&request.id).await.unwrap();
        queue.back_to_pending(&request.id).await.unwrap();

        let stored = queue.get(&request.id).await.unwrap();
        assert_eq!(stored.attempts, 2);

        let expired = queue.expire_exhausted().await.unwrap();
        assert_eq!(expired, vec![request.id.clone()]);
        let stored = queue.get(&request.id).await.unwrap();
        assert_eq!(stored.state, RequestState::Expired);
    }

    #[tokio::test]
    async fn select_eligible_boundary_before_and_after_window_open() {
        let queue = new_queue().await;
        let request = sample_request("u1", NaiveDate::from_ymd_opt(2025, 8, 15).unwrap(), "10:00", 1);
        let window_open = request.window_open(48, "UTC").unwrap();
        queue.add(request.clone()).await.unwrap();

        let before = queue
            .select_eligible(window_open - chrono::Duration::seconds(31), 48, "UTC", chrono::Duration::seconds(30), chrono::Duration::minutes(5))
            .await;
        assert!(before.is_empty());

        let after = queue
            .select_eligible(window_open - chrono::Duration::seconds(1), 48, "UTC", chrono::Duration::seconds(30), chrono::Duration::minutes(5))
            .await;
        assert_eq!(after.len(), 1);
    }

    #[tokio::test]
    async fn retry_delay_schedule_matches_spec_thresholds() {
        assert_eq!(next_retry_delay(chrono::Duration::seconds(10), 0), chrono::Duration::seconds(30));
        assert_eq!(next_retry_delay(chrono::Duration::seconds(10), 1), chrono::Duration::seconds(60));
        assert_eq!(next_retry_delay(chrono::Duration::seconds(10), 2), chrono::Duration::seconds(120));
        assert_eq!(next_retry_delay(chrono::Duration::minutes(10), 5), chrono::Duration::minutes(5));
        assert_eq!(next_retry_delay(chrono::Duration::minutes(45), 5), chrono::Duration::minutes(15));
    }

    #[tokio::test]
    async fn scheduled_retry_is_not_eligible_until_the_backoff_elapses() {
        let queue = new_queue().await;
        let request = sample_request("u1", NaiveDate::from_ymd_opt(2025, 8, 15).unwrap(), "10:00", 1);
        let window_open = request.window_open(48, "UTC").unwrap();
        queue.add(request.clone()).await.unwrap();

        queue.mark_executing(&request.id).await.unwrap();
        let failure_time = window_open + chrono::Duration::seconds(10);
        queue.schedule_retry(&request.id, failure_time, 48, "UTC").await.unwrap();

        let too_soon = queue
            .select_eligible(failure_time + chrono::Duration::seconds(10), 48, "UTC", chrono::Duration::seconds(30), chrono::Duration::minutes(30))
            .await;
        assert!(too_soon.is_empty(), "first retry is scheduled 30s out, not 10s");

        let after_backoff = queue
            .select_eligible(failure_time + chrono::Duration::seconds(31), 48, "UTC", chrono::Duration::seconds(30), chrono::Duration::minutes(30))
            .await;
        assert_eq!(after_backoff.len(), 1);
    }

    #[tokio::test]
    async fn confirming_twice_same_id_is_noop_through_queue() {
        let queue = new_queue().await;
        let request = sample_request("u1", NaiveDate::from_ymd_opt(2025, 8, 15).unwrap(), "10:00", 1);
        queue.add(request.clone()).await.unwrap();

        queue.mark_confirmed(&request.id, 1, "abc123").await.unwrap();
        assert!(queue.mark_confirmed(&request.id, 1, "abc123").await.is_ok());
        assert!(queue.mark_confirmed(&request.id, 1, "different").await.is_err());
    }

    #[tokio::test]
    async fn cancelling_a_terminal_request_fails() {
        let queue = new_queue().await;
        let request = sample_request("u1", NaiveDate::from_ymd_opt(2025, 8, 15).unwrap(), "10:00", 1);
        queue.add(request.clone()).await.unwrap();
        queue.mark_confirmed(&request.id, 1, "abc123").await.unwrap();
        assert!(queue.cancel(&request.id).await.is_err());
    }
}
