//! Scheduler Loop (§4.7): the continuously running cooperative task that
//! ticks, selects eligible requests, groups them by `(date, time)`, and
//! triggers the orchestrator at the precise window-open moment. Also owns
//! the browser-pool maintenance discipline (§4.2 refresh).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::domain::notifier::{NotificationEvent, Notifier};
use crate::domain::orchestrator::run_window;
use crate::domain::pool::BrowserPool;
use crate::domain::priority::{allocate, reallocate_with_late_arrival};
use crate::domain::queue::ReservationQueue;
use crate::domain::reservation::{RequestState, ReservationRequest};

/// Fixed pre-positioning margin ahead of window-open at which the
/// scheduler performs its single pre-window refresh (§4.7 "Timing
/// precision"): slots appear ~1.4s early, refresh takes ~1.0s, so the
/// refresh is issued 2.0s before the nominal window-open instant.
pub const PRE_WINDOW_REFRESH_MARGIN: chrono::Duration = chrono::Duration::milliseconds(2000);

/// Calendar navigation must complete at least this long before
/// window-open to leave slack for the final refresh (§4.7).
pub const NAVIGATION_SLACK: chrono::Duration = chrono::Duration::seconds(10);

/// Default retry-tail window past window-open during which a request
/// remains eligible for dispatch (§4.5 selection policy).
pub const DEFAULT_RETRY_TAIL: chrono::Duration = chrono::Duration::minutes(30);

/// Computes whether `now` falls within the dispatch window for a request
/// whose window opens at `window_open`, given the configured dispatch
/// lead (§4.5, §8 "Boundary behaviours"). Exposed standalone so the
/// boundary properties can be tested without a running loop.
pub fn is_dispatchable(now: DateTime<Utc>, window_open: DateTime<Utc>, dispatch_lead: chrono::Duration) -> bool {
    now >= window_open - dispatch_lead && now <= window_open + DEFAULT_RETRY_TAIL
}

/// Computes the delay until the single pre-window refresh instant for a
/// window whose `window_open` moment is known (§4.7 "Timing precision"):
/// `window_open - PRE_WINDOW_REFRESH_MARGIN`. Returns `None` when that
/// instant has already passed or is further out than `NAVIGATION_SLACK`
/// allows the scheduler to look ahead, so a tick only ever schedules the
/// refresh once the window is genuinely imminent.
pub fn pre_window_refresh_delay(now: DateTime<Utc>, window_open: DateTime<Utc>) -> Option<std::time::Duration> {
    let refresh_at = window_open - PRE_WINDOW_REFRESH_MARGIN;
    if refresh_at < now - chrono::Duration::seconds(1) || refresh_at > now + NAVIGATION_SLACK {
        return None;
    }
    (refresh_at - now).to_std().ok().or(Some(std::time::Duration::ZERO))
}

/// Groups eligible requests by `(date, time)` so the allocator runs once
/// per window rather than once per request (§4.7 step ii).
pub fn group_by_window(requests: Vec<ReservationRequest>) -> HashMap<(chrono::NaiveDate, String), Vec<ReservationRequest>> {
    let mut groups: HashMap<(chrono::NaiveDate, String), Vec<ReservationRequest>> = HashMap::new();
    for request in requests {
        groups.entry((request.target_date, request.target_time.clone())).or_default().push(request);
    }
    groups
}

/// Folds any privileged (`vip`/`admin`) request for the same `(date,
/// time)` window into `group` before allocation, provided it isn't
/// already present (§4.6 "Late VIP handling", §9). `currently_pending` is
/// an independent, freshly-fetched view of the queue's pending requests —
/// in `tick_once` this re-check is what lets a request that arrived after
/// `select_eligible`'s original snapshot but before this window's dispatch
/// still be considered. Pulled out as a pure function so the fold-in
/// behaviour is testable without a live queue or a dispatch-timing race.
pub fn fold_in_late_arrivals(
    group: Vec<ReservationRequest>,
    currently_pending: &[ReservationRequest],
    date: chrono::NaiveDate,
    time: &str,
    courts: &[u32],
) -> (Vec<ReservationRequest>, crate::domain::priority::BookingPlan) {
    let already_grouped: std::collections::HashSet<&str> = group.iter().map(|r| r.id.as_str()).collect();
    let late_arrivals: Vec<ReservationRequest> = currently_pending
        .iter()
        .filter(|r| r.tier.is_privileged() && r.target_date == date && r.target_time == time && !already_grouped.contains(r.id.as_str()))
        .cloned()
        .collect();

    let mut merged = group;
    let mut plan = allocate(&merged, courts);
    for late in late_arrivals {
        plan = reallocate_with_late_arrival(merged.clone(), late.clone(), courts);
        merged.push(late);
    }
    (merged, plan)
}

/// The scheduler's owned state: queue, pool, and the critical-operation
/// flag consulted by the refresh task (§5 "Shared resources").
pub struct Scheduler {
    config: Config,
    queue: Arc<ReservationQueue>,
    pool: Arc<BrowserPool>,
    notifier: Arc<dyn Notifier>,
    /// `(date, time)` windows for which a pre-window refresh task has
    /// already been spawned (§4.7 "Timing precision"), so a tick that
    /// observes the same imminent window twice doesn't double-schedule it.
    scheduled_refreshes: Arc<Mutex<HashSet<(NaiveDate, String)>>>,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(config: Config, queue: Arc<ReservationQueue>, pool: Arc<BrowserPool>, notifier: Arc<dyn Notifier>) -> Self {
        Scheduler {
            config,
            queue,
            pool,
            notifier,
            scheduled_refreshes: Arc::new(Mutex::new(HashSet::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Runs the scheduler loop until shutdown is signalled. Unblocks
    /// within one tick of the signal and never strands a request in
    /// `dispatching` (§4.7 "Cancellation") because each window's
    /// orchestrator run completes its own `mark_dispatching` /
    /// `mark_executing` transitions atomically per request before the
    /// loop observes shutdown again.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(self.config.check_interval_seconds));
        let pool_for_refresh = Arc::clone(&self.pool);
        let refresh_interval = self.config.browser_refresh_interval_seconds;
        let court_numbers = self.config.court_numbers();
        let shutdown_for_refresh = Arc::clone(&self.shutdown);

        let refresh_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(refresh_interval));
            loop {
                interval.tick().await;
                if shutdown_for_refresh.load(Ordering::SeqCst) {
                    break;
                }
                if pool_for_refresh.critical_operation_in_progress() {
                    continue;
                }
                for court in &court_numbers {
                    let _ = pool_for_refresh.refresh_court(*court).await;
                }
            }
        });

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            ticker.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.tick_once().await;
        }

        refresh_task.abort();
    }

    /// Spawns the single precise pre-window refresh for every pending
    /// request's window that has just become imminent (§4.7 "Timing
    /// precision"), deduped per `(date, time)` via `scheduled_refreshes` so
    /// a later tick observing the same window doesn't spawn it twice.
    async fn schedule_pre_window_refreshes(&self, now: DateTime<Utc>) {
        let pending = self.queue.list_by_state(RequestState::Pending).await;
        let groups = group_by_window(pending);

        for ((date, time), group) in groups {
            let Some(sample) = group.first() else { continue };
            let Some(window_open) = sample.window_open(self.config.booking_window_hours, &self.config.timezone) else { continue };
            let Some(delay) = pre_window_refresh_delay(now, window_open) else { continue };

            let key = (date, time);
            {
                let mut scheduled = self.scheduled_refreshes.lock().await;
                if !scheduled.insert(key.clone()) {
                    continue;
                }
            }

            let pool = Arc::clone(&self.pool);
            let court_numbers = self.config.court_numbers();
            let scheduled_refreshes = Arc::clone(&self.scheduled_refreshes);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if !pool.critical_operation_in_progress() {
                    for court in &court_numbers {
                        let _ = pool.refresh_court(*court).await;
                    }
                }
                scheduled_refreshes.lock().await.remove(&key);
            });
        }
    }

    /// One scheduling tick (§4.7 steps i-iii): poll, group, dispatch any
    /// window whose open moment has arrived.
    async fn tick_once(&self) {
        let now = Utc::now();
        self.schedule_pre_window_refreshes(now).await;

        let dispatch_lead = chrono::Duration::seconds(self.config.dispatch_horizon_seconds);
        let eligible = self
            .queue
            .select_eligible(now, self.config.booking_window_hours, &self.config.timezone, dispatch_lead, DEFAULT_RETRY_TAIL)
            .await;

        let groups = group_by_window(eligible);
        let courts = self.config.court_numbers();

        for ((date, time), group) in groups {
            // Late-VIP handling (§4.6, §9): fold in any privileged request
            // for this same window that the queue gained after
            // `select_eligible`'s snapshot but before this window's
            // dispatch begins. Once `run_window` below has started, any
            // further arrival waits for the next tick or a fallback slot
            // (§9 "does not interrupt in-flight attempts").
            let currently_pending = self.queue.list_by_state(RequestState::Pending).await;
            let (merged, plan) = fold_in_late_arrivals(group, &currently_pending, date, &time, &courts);

            let by_id: HashMap<String, ReservationRequest> = merged.into_iter().map(|r| (r.id.clone(), r)).collect();

            let results = run_window(&plan, &by_id, &self.pool, &self.queue, &self.notifier, &self.config).await;

            for id in &plan.waitlist {
                if results.iter().all(|r| r.request_id != *id) {
                    if let Some(request) = by_id.get(id) {
                        self.notifier
                            .notify(&request.user_id, NotificationEvent::Failed { request_id: id.clone(), reason: "no court available this window".to_string() })
                            .await;
                    }
                }
            }
        }

        for id in self.queue.expire_exhausted().await.unwrap_or_default() {
            if let Some(request) = self.queue.get(&id).await {
                self.notifier.notify(&request.user_id, NotificationEvent::Expired { request_id: id }).await;
            }
        }
    }

    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_before_window_open_minus_epsilon_is_not_dispatchable() {
        let window_open = Utc::now() + chrono::Duration::hours(1);
        let lead = chrono::Duration::seconds(30);
        let now = window_open - lead - chrono::Duration::seconds(1);
        assert!(!is_dispatchable(now, window_open, lead));
    }

    #[test]
    fn boundary_at_window_open_minus_epsilon_is_dispatchable() {
        let window_open = Utc::now() + chrono::Duration::hours(1);
        let lead = chrono::Duration::seconds(30);
        let now = window_open - lead + chrono::Duration::milliseconds(10);
        assert!(is_dispatchable(now, window_open, lead));
    }

    #[test]
    fn grouping_buckets_by_date_and_time() {
        use crate::domain::contact::ContactInfo;
        use crate::domain::tier::UserTier;
        use chrono::NaiveDate;

        let contact = ContactInfo { first_name: "A".to_string(), last_name: "B".to_string(), phone: "1".to_string(), email: "a@b.test".to_string() };
        let a = ReservationRequest::new("u1", contact.clone(), NaiveDate::from_ymd_opt(2025, 8, 15).unwrap(), "10:00", vec![1], UserTier::Regular, &[1], Utc::now()).unwrap();
        let b = ReservationRequest::new("u2", contact.clone(), NaiveDate::from_ymd_opt(2025, 8, 15).unwrap(), "10:00", vec![1], UserTier::Regular, &[1], Utc::now()).unwrap();
        let c = ReservationRequest::new("u3", contact, NaiveDate::from_ymd_opt(2025, 8, 16).unwrap(), "09:00", vec![1], UserTier::Regular, &[1], Utc::now()).unwrap();

        let groups = group_by_window(vec![a, b, c]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&(NaiveDate::from_ymd_opt(2025, 8, 15).unwrap(), "10:00".to_string())].len(), 2);
    }

    #[test]
    fn late_vip_not_in_the_original_group_bumps_an_already_confirmed_regular_candidate() {
        use crate::domain::contact::ContactInfo;
        use crate::domain::tier::UserTier;
        use chrono::NaiveDate;

        let contact = ContactInfo { first_name: "A".to_string(), last_name: "B".to_string(), phone: "1".to_string(), email: "a@b.test".to_string() };
        let date = NaiveDate::from_ymd_opt(2025, 8, 15).unwrap();

        // A single court, so the regular request's original snapshot would
        // have it confirmed alone.
        let regular = ReservationRequest::new("u1", contact.clone(), date, "10:00", vec![1], UserTier::Regular, &[1], Utc::now() - chrono::Duration::days(1)).unwrap();
        let original_group = vec![regular.clone()];

        // The VIP is absent from `original_group` (it arrived after the
        // `select_eligible` snapshot was taken) but is present in the
        // independently-fetched "currently pending" view passed alongside.
        let vip = ReservationRequest::new("u2", contact, date, "10:00", vec![1], UserTier::Vip, &[1], Utc::now()).unwrap();
        let currently_pending = vec![regular.clone(), vip.clone()];

        let (merged, plan) = fold_in_late_arrivals(original_group, &currently_pending, date, "10:00", &[1]);

        assert_eq!(merged.len(), 2, "the late vip must be folded into the merged set");
        assert_eq!(plan.confirmed.len(), 1);
        assert_eq!(plan.confirmed[0].request_id, vip.id, "vip must win the only court");
        assert_eq!(plan.waitlist, vec![regular.id]);
    }

    #[test]
    fn no_late_arrivals_leaves_the_original_allocation_unchanged() {
        use crate::domain::contact::ContactInfo;
        use crate::domain::tier::UserTier;
        use chrono::NaiveDate;

        let contact = ContactInfo { first_name: "A".to_string(), last_name: "B".to_string(), phone: "1".to_string(), email: "a@b.test".to_string() };
        let date = NaiveDate::from_ymd_opt(2025, 8, 15).unwrap();
        let regular = ReservationRequest::new("u1", contact, date, "10:00", vec![1], UserTier::Regular, &[1], Utc::now()).unwrap();

        let (merged, plan) = fold_in_late_arrivals(vec![regular.clone()], std::slice::from_ref(&regular), date, "10:00", &[1]);

        assert_eq!(merged.len(), 1);
        assert_eq!(plan.confirmed.len(), 1);
        assert_eq!(plan.confirmed[0].request_id, regular.id);
    }

    #[test]
    fn pre_window_refresh_delay_none_when_too_far_out() {
        let now = Utc::now();
        let window_open = now + NAVIGATION_SLACK + chrono::Duration::seconds(1) + PRE_WINDOW_REFRESH_MARGIN;
        assert!(pre_window_refresh_delay(now, window_open).is_none());
    }

    #[test]
    fn pre_window_refresh_delay_none_when_already_passed() {
        let now = Utc::now();
        let window_open = now - chrono::Duration::seconds(10);
        assert!(pre_window_refresh_delay(now, window_open).is_none());
    }

    #[test]
    fn pre_window_refresh_delay_some_within_navigation_slack() {
        let now = Utc::now();
        let window_open = now + chrono::Duration::seconds(5) + PRE_WINDOW_REFRESH_MARGIN;
        let delay = pre_window_refresh_delay(now, window_open).expect("refresh instant is within navigation slack");
        assert_eq!(delay.as_secs(), 5);
    }
}
