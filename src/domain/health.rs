//! Health & Recovery (§4.3): pure health-status evaluation plus an
//! escalating recovery command, tried strategy-by-strategy until one
//! succeeds.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::domain::contact::ContactInfo;
use crate::domain::pool::{split_calendar_url, BrowserPool, EmergencyDriver, PageDriverFactory, PoolReadiness};
use crate::domain::reservation::direct_datetime_token;
use crate::error::{PoolError, Result};
use crate::logger::log_event;

/// Aggregated health status for a component (§3 "Health Record").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    Failed,
}

/// Per-check pass/fail bits for one court (§3, §4.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct CourtChecks {
    pub page_accessible: bool,
    pub script_executable: bool,
    pub network_reachable: bool,
    pub dom_queryable: bool,
}

impl CourtChecks {
    pub fn all_pass(&self) -> bool {
        self.page_accessible && self.script_executable && self.network_reachable && self.dom_queryable
    }

    pub fn status(&self) -> HealthStatus {
        let passed = [self.page_accessible, self.script_executable, self.network_reachable, self.dom_queryable]
            .iter()
            .filter(|b| **b)
            .count();
        match passed {
            4 => HealthStatus::Healthy,
            3 | 2 => HealthStatus::Degraded,
            1 => HealthStatus::Critical,
            _ => HealthStatus::Failed,
        }
    }
}

/// Per-component health check record (§3 "Health Record").
#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub court: u32,
    pub status: HealthStatus,
    pub checks: CourtChecks,
    pub response_time: Duration,
}

const PER_COMPONENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the four per-court checks against a live page (§4.3 contract).
/// Each check is independently timed out so one hung check cannot starve
/// the others; a timed-out check simply fails.
pub async fn check_court_health(pool: &Arc<BrowserPool>, court: u32) -> HealthRecord {
    let started = Instant::now();

    let lease = match pool.acquire_page(court).await {
        Ok(lease) => lease,
        Err(_) => {
            return HealthRecord {
                court,
                status: HealthStatus::Failed,
                checks: CourtChecks::default(),
                response_time: started.elapsed(),
            };
        }
    };

    let page = lease.page().clone();
    let page_accessible = timeout(PER_COMPONENT_TIMEOUT, page.current_url()).await.map(|r| r.is_ok()).unwrap_or(false);
    let script_executable =
        timeout(PER_COMPONENT_TIMEOUT, page.evaluate("1+1")).await.map(|r| r.is_ok()).unwrap_or(false);
    let network_reachable = page_accessible;
    let dom_queryable =
        timeout(PER_COMPONENT_TIMEOUT, page.text_content()).await.map(|r| r.is_ok()).unwrap_or(false);

    let checks = CourtChecks { page_accessible, script_executable, network_reachable, dom_queryable };
    let status = checks.status();
    log_event("health", Some(court), None, Some(started.elapsed().as_millis()), &format!("status={status:?}"));
    HealthRecord { court, status, checks, response_time: started.elapsed() }
}

/// Aggregates per-court checks into an overall pool status (§4.3
/// "Pool-health check").
pub fn aggregate_pool_status(records: &[HealthRecord]) -> HealthStatus {
    if records.is_empty() {
        return HealthStatus::Failed;
    }
    let healthy = records.iter().filter(|r| r.status == HealthStatus::Healthy).count();
    if healthy == records.len() {
        HealthStatus::Healthy
    } else if healthy == 0 {
        HealthStatus::Failed
    } else if healthy * 2 >= records.len() {
        HealthStatus::Degraded
    } else {
        HealthStatus::Critical
    }
}

/// Ordered recovery strategies (§4.3), tried until one succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    RecreateSingle,
    RecreateParallelStaggered,
    FullPoolRestart,
    EmergencyFallback,
}

impl RecoveryStrategy {
    pub fn next(self) -> Option<RecoveryStrategy> {
        match self {
            RecoveryStrategy::RecreateSingle => Some(RecoveryStrategy::RecreateParallelStaggered),
            RecoveryStrategy::RecreateParallelStaggered => Some(RecoveryStrategy::FullPoolRestart),
            RecoveryStrategy::FullPoolRestart => Some(RecoveryStrategy::EmergencyFallback),
            RecoveryStrategy::EmergencyFallback => None,
        }
    }

    /// Picks the initial strategy from the failure scope (§4.3 "Strategy
    /// selection"): a single failed court starts at strategy 1; several
    /// (but not all) start at strategy 2; all failed starts at strategy 3.
    pub fn initial_for_scope(failed_courts: usize, total_courts: usize) -> RecoveryStrategy {
        if total_courts == 0 || failed_courts == 0 {
            RecoveryStrategy::RecreateSingle
        } else if failed_courts == total_courts {
            RecoveryStrategy::FullPoolRestart
        } else if failed_courts > 1 {
            RecoveryStrategy::RecreateParallelStaggered
        } else {
            RecoveryStrategy::RecreateSingle
        }
    }
}

/// One escalation attempt's outcome, retained for later inspection (§3
/// "Recovery Attempt record", grounded on the original's
/// `get_recovery_stats`).
#[derive(Debug, Clone)]
pub struct RecoveryAttempt {
    pub strategy: RecoveryStrategy,
    pub started_at: Instant,
    pub duration: Duration,
    pub affected_courts: Vec<u32>,
    pub success: bool,
    pub error: Option<String>,
}

const RECOVERY_RING_CAPACITY: usize = 200;
const STAGGER_DELAY: Duration = Duration::from_millis(1500);

/// Parameters for an actual emergency booking attempt, as opposed to a
/// bare capability probe (§4.3 strategy 4, §9). Set via
/// [`RecoveryService::set_emergency_context`] by whatever caller knows a
/// concrete request to retry under `EmergencyFallback`; `None` means the
/// strategy only validates that the direct-url path is reachable.
#[derive(Debug, Clone)]
pub struct EmergencyBookingContext {
    pub target_date: NaiveDate,
    pub target_time: String,
    pub timezone: String,
    pub contact: ContactInfo,
}

/// Escalation engine: tries strategies in order until one succeeds,
/// recording every attempt in a bounded ring (§3, §4.3).
pub struct RecoveryService {
    pool: Arc<BrowserPool>,
    emergency_factory: Arc<dyn PageDriverFactory>,
    emergency_context: Mutex<Option<EmergencyBookingContext>>,
    attempts: Mutex<VecDeque<RecoveryAttempt>>,
}

impl RecoveryService {
    pub fn new(pool: Arc<BrowserPool>, emergency_factory: Arc<dyn PageDriverFactory>) -> Self {
        RecoveryService { pool, emergency_factory, emergency_context: Mutex::new(None), attempts: Mutex::new(VecDeque::new()) }
    }

    /// Supplies (or clears) the concrete request `EmergencyFallback` should
    /// attempt to book via the direct date-time url once the calendar-driven
    /// ladder is exhausted (§4.3 #4).
    pub async fn set_emergency_context(&self, context: Option<EmergencyBookingContext>) {
        *self.emergency_context.lock().await = context;
    }

    async fn record(&self, attempt: RecoveryAttempt) {
        log_event(
            "recovery",
            attempt.affected_courts.first().copied(),
            None,
            Some(attempt.duration.as_millis()),
            &format!("strategy={:?} success={} affected={:?}", attempt.strategy, attempt.success, attempt.affected_courts),
        );
        let mut guard = self.attempts.lock().await;
        guard.push_back(attempt);
        while guard.len() > RECOVERY_RING_CAPACITY {
            guard.pop_front();
        }
    }

    pub async fn stats(&self) -> Vec<RecoveryAttempt> {
        self.attempts.lock().await.iter().cloned().collect()
    }

    /// Runs the escalation starting from the strategy appropriate for the
    /// current failure scope, stepping forward until one attempt succeeds
    /// or the floor strategy is exhausted (§4.3).
    pub async fn recover(&self, failed_courts: Vec<u32>, total_courts: usize) -> Result<bool> {
        let mut strategy = RecoveryStrategy::initial_for_scope(failed_courts.len(), total_courts);
        loop {
            let started = Instant::now();
            let result = self.attempt_strategy(strategy, &failed_courts).await;
            let success = result.is_ok();
            let error = result.as_ref().err().map(|e| e.to_string());
            self.record(RecoveryAttempt {
                strategy,
                started_at: started,
                duration: started.elapsed(),
                affected_courts: failed_courts.clone(),
                success,
                error,
            })
            .await;

            if success {
                return Ok(true);
            }
            match strategy.next() {
                Some(next) => strategy = next,
                None => return Ok(false),
            }
        }
    }

    async fn attempt_strategy(&self, strategy: RecoveryStrategy, failed_courts: &[u32]) -> Result<()> {
        match strategy {
            RecoveryStrategy::RecreateSingle => {
                for court in failed_courts {
                    self.pool.recreate_court(*court).await?;
                }
                Ok(())
            }
            RecoveryStrategy::RecreateParallelStaggered => {
                let mut handles = Vec::new();
                for (i, court) in failed_courts.iter().enumerate() {
                    let pool = Arc::clone(&self.pool);
                    let court = *court;
                    handles.push(tokio::spawn(async move {
                        tokio::time::sleep(STAGGER_DELAY * i as u32).await;
                        pool.recreate_court(court).await
                    }));
                }
                for handle in handles {
                    handle.await.map_err(|e| crate::error::PoolError::EvaluationFailed(e.to_string()))??;
                }
                Ok(())
            }
            RecoveryStrategy::FullPoolRestart => {
                let urls = self.pool.court_urls().await;
                for (number, _url) in &urls {
                    self.pool.recreate_court(*number).await?;
                }
                Ok(())
            }
            RecoveryStrategy::EmergencyFallback => {
                let driver = EmergencyDriver::new(Arc::clone(&self.emergency_factory));
                let context = self.emergency_context.lock().await.clone();
                let urls = self.pool.court_urls().await;

                match context {
                    Some(ctx) => {
                        let token = direct_datetime_token(ctx.target_date, &ctx.target_time, &ctx.timezone)
                            .ok_or_else(|| PoolError::EvaluationFailed("cannot resolve emergency booking instant".to_string()))?;

                        let mut last_err = None;
                        for (court, url) in &urls {
                            match driver.attempt_booking(*court, url, &token, &ctx.contact).await {
                                Ok(confirmation_id) => {
                                    log_event("recovery", Some(*court), None, None, &format!("emergency booking confirmed={confirmation_id}"));
                                    return Ok(());
                                }
                                Err(e) => last_err = Some(e),
                            }
                        }
                        Err(last_err.unwrap_or_else(|| PoolError::CourtUnavailable(0).into()))
                    }
                    None => {
                        // No concrete request supplied: validate the direct-url
                        // path itself by navigating (not submitting) through
                        // `navigate_direct` against one configured court (§4.3 #4).
                        let Some((_, url)) = urls.into_iter().next() else { return Ok(()) };
                        match split_calendar_url(&url) {
                            Some((base, query)) => {
                                driver.navigate_direct(&base, &format!("/datetime/probe?{query}")).await?;
                            }
                            None => {
                                self.emergency_factory.create(&url).await?;
                            }
                        }
                        Ok(())
                    }
                }
            }
        }
    }
}
