//! Browser Pool (§4.2): owns one long-lived browser page per configured
//! court, pre-navigated to that court's scheduling URL, retained warm for
//! the process lifetime. Generic over the [`PageDriver`] capability so the
//! pool/executor/scheduler logic is unit-testable against an in-memory
//! fake without spawning a real browser (§4.2 "Capability abstraction").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::domain::contact::ContactInfo;
use crate::domain::executor::{extract_confirmation_id, submit_button_selector, CONFIRM_BUTTON_PHRASE, FORM_FIELD_NAMES};
use crate::error::{PoolError, Result};

/// Everything the probe and the executor need from a browser page,
/// abstracted so the production implementation can drive `chromiumoxide`
/// while tests drive an in-memory fake (§4.2).
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;
    async fn reload(&self) -> Result<()>;
    async fn current_url(&self) -> Result<String>;
    /// Evaluates a script and returns its result as a JSON value.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value>;
    /// Returns the visible text content of the document body.
    async fn text_content(&self) -> Result<String>;
    async fn click(&self, selector: &str) -> Result<()>;
    async fn move_mouse(&self, x: f64, y: f64) -> Result<()>;
    /// Types one character at a time into the currently focused element.
    async fn type_char(&self, ch: char) -> Result<()>;
    async fn press_backspace(&self) -> Result<()>;
    /// Fills a named form field (`client.firstName` etc, §6) directly,
    /// used only by the emergency single-shot fallback path where the
    /// full human-timing discipline is not applied.
    async fn set_field_value(&self, field_name: &str, value: &str) -> Result<()>;
}

/// Overall readiness of the pool (§4.2 "Partial readiness").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolReadiness {
    Healthy,
    PartiallyReady,
    None,
}

struct CourtSlot {
    page: Option<Arc<dyn PageDriver>>,
    url: String,
    /// Owned separately from the page so a lease can hold the lock for its
    /// full lifetime without borrowing from the pool's `RwLock` guard
    /// (§5 "Per-court page ... held for the full duration of one attempt").
    mutex: Arc<Mutex<()>>,
}

/// Factory for creating a fresh [`PageDriver`] navigated to a given URL;
/// injected so the pool never hard-codes the production browser backend.
#[async_trait]
pub trait PageDriverFactory: Send + Sync {
    async fn create(&self, url: &str) -> Result<Arc<dyn PageDriver>>;
}

/// Owns one dedicated page per configured court (§4.2, §3 "Court").
pub struct BrowserPool {
    courts: RwLock<HashMap<u32, CourtSlot>>,
    factory: Arc<dyn PageDriverFactory>,
    /// Set while any dispatch/orchestrator/executor activity is underway;
    /// read by the refresh task to decline maintenance (§GLOSSARY
    /// "Critical operation", §5).
    critical_operation: AtomicBool,
}

impl BrowserPool {
    /// Acquires a page for each configured court and navigates it to the
    /// court's URL. Per-court navigation failures do not abort the whole
    /// pool; the court is marked unavailable and left for recovery (§4.2
    /// "Partial readiness", "never silently drop a court").
    pub async fn initialize(
        factory: Arc<dyn PageDriverFactory>,
        courts: &[(u32, String)],
    ) -> Self {
        let mut map = HashMap::new();
        for (number, url) in courts {
            let page = match factory.create(url).await {
                Ok(page) => Some(page),
                Err(err) => {
                    log::warn!("court={number} failed to initialize: {err}");
                    None
                }
            };
            map.insert(*number, CourtSlot { page, url: url.clone(), mutex: Arc::new(Mutex::new(())) });
        }
        BrowserPool { courts: RwLock::new(map), factory, critical_operation: AtomicBool::new(false) }
    }

    pub fn mark_critical_operation(&self, in_progress: bool) {
        self.critical_operation.store(in_progress, Ordering::SeqCst);
    }

    pub fn critical_operation_in_progress(&self) -> bool {
        self.critical_operation.load(Ordering::SeqCst)
    }

    pub async fn readiness(&self) -> PoolReadiness {
        let guard = self.courts.read().await;
        if guard.is_empty() {
            return PoolReadiness::None;
        }
        let healthy = guard.values().filter(|s| s.page.is_some()).count();
        if healthy == guard.len() {
            PoolReadiness::Healthy
        } else if healthy == 0 {
            PoolReadiness::None
        } else {
            PoolReadiness::PartiallyReady
        }
    }

    pub async fn available_courts(&self) -> Vec<u32> {
        let mut numbers: Vec<u32> =
            self.courts.read().await.iter().filter(|(_, s)| s.page.is_some()).map(|(n, _)| *n).collect();
        numbers.sort_unstable();
        numbers
    }

    /// Non-blocking handoff of the page dedicated to `court` (§4.2
    /// "acquire-page-for-court"). The returned lease holds the per-court
    /// mutex for its entire lifetime, so at most one executor can ever
    /// drive a given court's page concurrently (§5, §8 invariant).
    pub async fn acquire_page(self: &Arc<Self>, court: u32) -> Result<PageLease> {
        let (page, mutex) = {
            let guard = self.courts.read().await;
            let slot = guard.get(&court).ok_or(PoolError::UnknownCourt(court))?;
            let page = slot.page.clone().ok_or(PoolError::CourtUnavailable(court))?;
            (page, Arc::clone(&slot.mutex))
        };
        let permit = mutex.lock_owned().await;
        Ok(PageLease { court, page, _permit: permit })
    }

    /// Replaces a single court's page with a freshly-navigated one,
    /// preserving its configured URL (§4.2 "Refresh discipline", §4.3
    /// "Recreate a single failed court").
    pub async fn recreate_court(&self, court: u32) -> Result<()> {
        let url = {
            let guard = self.courts.read().await;
            guard.get(&court).ok_or(PoolError::UnknownCourt(court))?.url.clone()
        };
        let page = self.factory.create(&url).await?;
        let mut guard = self.courts.write().await;
        if let Some(slot) = guard.get_mut(&court) {
            slot.page = Some(page);
        }
        Ok(())
    }

    /// Refreshes a single court's page in place without blocking others
    /// (§4.2 "A refresh of a single court never blocks others"). Skipped
    /// entirely while a critical operation is in progress.
    pub async fn refresh_court(&self, court: u32) -> Result<()> {
        if self.critical_operation_in_progress() {
            return Ok(());
        }
        let page = {
            let guard = self.courts.read().await;
            guard.get(&court).and_then(|s| s.page.clone())
        };
        match page {
            Some(page) => page.reload().await,
            None => Err(PoolError::CourtUnavailable(court).into()),
        }
    }

    pub async fn court_urls(&self) -> Vec<(u32, String)> {
        self.courts.read().await.iter().map(|(n, s)| (*n, s.url.clone())).collect()
    }
}

/// Temporary capability handed to one executor for one attempt. Must not
/// be retained beyond the attempt (§3 "Lifecycle ownership"). Holding the
/// per-court mutex for its whole lifetime is what makes the §8 invariant
/// ("at most one executor holds a court's page at a time") actually true,
/// rather than merely documented.
pub struct PageLease {
    court: u32,
    page: Arc<dyn PageDriver>,
    _permit: tokio::sync::OwnedMutexGuard<()>,
}

impl PageLease {
    pub fn page(&self) -> &Arc<dyn PageDriver> {
        &self.page
    }

    pub fn court(&self) -> u32 {
        self.court
    }
}

/// Minimal single-browser emergency capability (§4.3 strategy 4): enough
/// to attempt one booking at a time via the direct date-time URL,
/// bypassing the calendar entirely (§9 open question resolution).
pub struct EmergencyDriver {
    factory: Arc<dyn PageDriverFactory>,
}

impl EmergencyDriver {
    pub fn new(factory: Arc<dyn PageDriverFactory>) -> Self {
        EmergencyDriver { factory }
    }

    /// Builds the direct date-time URL and returns a page navigated to it
    /// (§6 "Direct date-time URL").
    pub async fn navigate_direct(&self, base_url: &str, date_time_path: &str) -> Result<Arc<dyn PageDriver>> {
        let url = format!("{base_url}{date_time_path}");
        self.factory.create(&url).await
    }

    /// Runs a full single-shot booking attempt against `court`'s direct
    /// date-time URL (§4.3 strategy 4, §9 open question resolution),
    /// grounded on the "Method 3: Direct URL navigation" approach of
    /// bypassing the calendar entirely. Skips the human-timing discipline:
    /// fields are filled in one shot via [`PageDriver::set_field_value`]
    /// rather than typed character-by-character.
    pub async fn attempt_booking(
        &self,
        court: u32,
        calendar_url: &str,
        date_time_token: &str,
        contact: &ContactInfo,
    ) -> Result<String> {
        let (base_url, query) = split_calendar_url(calendar_url)
            .ok_or_else(|| PoolError::NavigationFailed { court, message: format!("cannot derive a direct url from {calendar_url}") })?;
        let date_time_path = format!("/datetime/{date_time_token}?{query}");
        let page = self.navigate_direct(&base_url, &date_time_path).await?;

        let mut remaining = EMERGENCY_FORM_POLL_ATTEMPTS;
        loop {
            let script = format!("!!document.querySelector('[name=\"{}\"]')", FORM_FIELD_NAMES[0]);
            let present = page.evaluate(&script).await?.as_bool().unwrap_or(false);
            if present {
                break;
            }
            remaining -= 1;
            if remaining == 0 {
                return Err(PoolError::NavigationFailed { court, message: "emergency form never loaded".to_string() }.into());
            }
            tokio::time::sleep(EMERGENCY_FORM_POLL_INTERVAL).await;
        }

        page.set_field_value(FORM_FIELD_NAMES[0], &contact.first_name).await?;
        page.set_field_value(FORM_FIELD_NAMES[1], &contact.last_name).await?;
        page.set_field_value(FORM_FIELD_NAMES[2], &contact.phone).await?;
        page.set_field_value(FORM_FIELD_NAMES[3], &contact.email).await?;

        let page_text = page.text_content().await?;
        if !page_text.to_uppercase().contains(CONFIRM_BUTTON_PHRASE) {
            return Err(PoolError::NavigationFailed { court, message: "submit button not found".to_string() }.into());
        }
        page.click(submit_button_selector()).await?;

        let mut remaining = EMERGENCY_FORM_POLL_ATTEMPTS;
        loop {
            let url = page.current_url().await.unwrap_or_default();
            if let Some(id) = extract_confirmation_id(&url) {
                return Ok(id);
            }
            remaining -= 1;
            if remaining == 0 {
                return Err(PoolError::NavigationFailed { court, message: "emergency attempt never confirmed".to_string() }.into());
            }
            tokio::time::sleep(EMERGENCY_FORM_POLL_INTERVAL).await;
        }
    }
}

/// Splits a configured court's calendar URL (§6: `.../calendar/<id>?query`)
/// into the base path shared with the direct date-time URL and the
/// trailing `appointmentTypeIds[]=...` query string to carry over.
pub(crate) fn split_calendar_url(calendar_url: &str) -> Option<(String, String)> {
    let (path, query) = calendar_url.split_once('?')?;
    let marker_at = path.find("/calendar/")?;
    Some((path[..marker_at].to_string(), query.to_string()))
}

const EMERGENCY_FORM_POLL_INTERVAL: Duration = Duration::from_millis(200);
const EMERGENCY_FORM_POLL_ATTEMPTS: u32 = 40;

/// Default refresh cadence used by the scheduler's maintenance task
/// (§4.2 "Refresh discipline").
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

#[cfg(test)]
pub mod test_support {
    use super::*;
    use tokio::sync::Mutex as TokioMutex;

    /// In-memory fake driver: records calls, returns scripted responses.
    /// Lets the pool/executor/scheduler be exercised without a real
    /// browser (§4.2).
    pub struct FakePageDriver {
        pub current_url: TokioMutex<String>,
        pub evaluate_responses: TokioMutex<HashMap<String, serde_json::Value>>,
        pub text: TokioMutex<String>,
        pub typed: TokioMutex<String>,
        pub clicked_selectors: TokioMutex<Vec<String>>,
        pub fail_navigate: bool,
    }

    impl FakePageDriver {
        pub fn new(initial_url: impl Into<String>) -> Self {
            FakePageDriver {
                current_url: TokioMutex::new(initial_url.into()),
                evaluate_responses: TokioMutex::new(HashMap::new()),
                text: TokioMutex::new(String::new()),
                typed: TokioMutex::new(String::new()),
                clicked_selectors: TokioMutex::new(Vec::new()),
                fail_navigate: false,
            }
        }

        pub async fn set_text(&self, text: impl Into<String>) {
            *self.text.lock().await = text.into();
        }

        pub async fn set_url(&self, url: impl Into<String>) {
            *self.current_url.lock().await = url.into();
        }
    }

    #[async_trait]
    impl PageDriver for FakePageDriver {
        async fn navigate(&self, url: &str) -> Result<()> {
            if self.fail_navigate {
                return Err(PoolError::NavigationFailed { court: 0, message: "forced failure".to_string() }.into());
            }
            *self.current_url.lock().await = url.to_string();
            Ok(())
        }

        async fn reload(&self) -> Result<()> {
            Ok(())
        }

        async fn current_url(&self) -> Result<String> {
            Ok(self.current_url.lock().await.clone())
        }

        async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
            Ok(self.evaluate_responses.lock().await.get(script).cloned().unwrap_or(serde_json::Value::Null))
        }

        async fn text_content(&self) -> Result<String> {
            Ok(self.text.lock().await.clone())
        }

        async fn click(&self, selector: &str) -> Result<()> {
            self.clicked_selectors.lock().await.push(selector.to_string());
            Ok(())
        }

        async fn move_mouse(&self, _x: f64, _y: f64) -> Result<()> {
            Ok(())
        }

        async fn type_char(&self, ch: char) -> Result<()> {
            self.typed.lock().await.push(ch);
            Ok(())
        }

        async fn press_backspace(&self) -> Result<()> {
            self.typed.lock().await.pop();
            Ok(())
        }

        async fn set_field_value(&self, _field_name: &str, value: &str) -> Result<()> {
            *self.typed.lock().await = value.to_string();
            Ok(())
        }
    }

    pub struct FakePageDriverFactory {
        pub fail_for: TokioMutex<Vec<String>>,
    }

    impl FakePageDriverFactory {
        pub fn new(fail_for: Vec<String>) -> Self {
            FakePageDriverFactory { fail_for: TokioMutex::new(fail_for) }
        }

        pub async fn clear_failures(&self) {
            self.fail_for.lock().await.clear();
        }
    }

    #[async_trait]
    impl PageDriverFactory for FakePageDriverFactory {
        async fn create(&self, url: &str) -> Result<Arc<dyn PageDriver>> {
            if self.fail_for.lock().await.iter().any(|u| u == url) {
                return Err(PoolError::NavigationFailed { court: 0, message: "forced failure".to_string() }.into());
            }
            let driver = FakePageDriver::new(url.to_string());
            driver.navigate(url).await?;
            Ok(Arc::new(driver))
        }
    }

    #[tokio::test]
    async fn partial_readiness_when_one_court_fails_to_initialize() {
        let factory = Arc::new(FakePageDriverFactory::new(vec!["https://example.test/2".to_string()]));
        let pool = BrowserPool::initialize(
            factory,
            &[
                (1, "https://example.test/1".to_string()),
                (2, "https://example.test/2".to_string()),
                (3, "https://example.test/3".to_string()),
            ],
        )
        .await;

        assert_eq!(pool.readiness().await, PoolReadiness::PartiallyReady);
        assert_eq!(pool.available_courts().await, vec![1, 3]);
    }

    #[tokio::test]
    async fn recreate_court_restores_full_health() {
        let factory = Arc::new(FakePageDriverFactory::new(vec!["https://example.test/2".to_string()]));
        let pool = Arc::new(
            BrowserPool::initialize(
                factory.clone(),
                &[(1, "https://example.test/1".to_string()), (2, "https://example.test/2".to_string())],
            )
            .await,
        );
        assert_eq!(pool.readiness().await, PoolReadiness::PartiallyReady);

        factory.clear_failures().await;
        pool.recreate_court(2).await.unwrap();
        assert_eq!(pool.readiness().await, PoolReadiness::Healthy);
    }

    #[tokio::test]
    async fn refresh_is_suppressed_during_critical_operation() {
        let factory = Arc::new(FakePageDriverFactory::new(vec![]));
        let pool = BrowserPool::initialize(factory, &[(1, "https://example.test/1".to_string())]).await;
        pool.mark_critical_operation(true);
        // should be a no-op, not an error
        pool.refresh_court(1).await.unwrap();
    }

    #[tokio::test]
    async fn acquire_page_for_unknown_court_fails() {
        let factory = Arc::new(FakePageDriverFactory::new(vec![]));
        let pool = Arc::new(BrowserPool::initialize(factory, &[(1, "https://example.test/1".to_string())]).await);
        assert!(pool.acquire_page(99).await.is_err());
    }

    #[tokio::test]
    async fn a_second_lease_for_the_same_court_waits_for_the_first_to_drop() {
        let factory = Arc::new(FakePageDriverFactory::new(vec![]));
        let pool = Arc::new(BrowserPool::initialize(factory, &[(1, "https://example.test/1".to_string())]).await);

        let first = pool.acquire_page(1).await.unwrap();
        let pool_clone = Arc::clone(&pool);
        let second = tokio::spawn(async move { pool_clone.acquire_page(1).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        drop(first);
        let second = second.await.unwrap();
        assert!(second.is_ok());
    }

    #[test]
    fn split_calendar_url_separates_base_from_the_appointment_type_query() {
        let (base, query) =
            split_calendar_url("https://example.test/schedule/acc/appointment/1/calendar/5?appointmentTypeIds[]=1").unwrap();
        assert_eq!(base, "https://example.test/schedule/acc/appointment/1");
        assert_eq!(query, "appointmentTypeIds[]=1");
    }

    #[test]
    fn split_calendar_url_rejects_a_url_without_a_calendar_segment() {
        assert!(split_calendar_url("https://example.test/schedule/acc/appointment/1?appointmentTypeIds[]=1").is_none());
    }
}
