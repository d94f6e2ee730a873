//! Booking Executor (§4.4): drives one page through the slot-selection →
//! form-fill → submit → confirm state machine, with a precise human-like
//! timing discipline that is contract, not decoration (§9 "Timing
//! fidelity").

use std::time::Duration;

use chrono::NaiveDate;
use rand::Rng;
use tokio::time::timeout;

use crate::domain::contact::ContactInfo;
use crate::domain::pool::PageLease;
use crate::error::{ExecutorError, Result};

/// Timing preset (§4.4): `normal` is the default, full human affectation
/// envelope; `experienced` is tighter for repeat users whose prior
/// successful attempts lower the detection risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingPreset {
    Normal,
    Experienced,
}

impl TimingPreset {
    /// Scales `base` (the configured `speed_multiplier`, §6) for this
    /// preset: `normal` uses it as-is, `experienced` doubles it.
    pub fn speed_multiplier(self, base: f64) -> f64 {
        match self {
            TimingPreset::Normal => base,
            TimingPreset::Experienced => base * 2.0,
        }
    }

    pub fn initial_delay_range(self) -> (f64, f64) {
        match self {
            TimingPreset::Normal => (1.0, 2.0),
            TimingPreset::Experienced => (0.8, 1.2),
        }
    }

    pub fn typo_chance(self) -> f64 {
        match self {
            TimingPreset::Normal => 0.10,
            TimingPreset::Experienced => 0.0,
        }
    }

    /// After this many lifetime confirmed bookings a user's requests
    /// default to `experienced` mode (ambient detail, §4.4).
    pub const EXPERIENCED_THRESHOLD: u32 = 3;

    pub fn for_user(lifetime_confirmations: u32, experienced_mode_override: bool) -> TimingPreset {
        if experienced_mode_override || lifetime_confirmations >= Self::EXPERIENCED_THRESHOLD {
            TimingPreset::Experienced
        } else {
            TimingPreset::Normal
        }
    }
}

pub(crate) const FORM_FIELD_NAMES: [&str; 4] = ["client.firstName", "client.lastName", "client.phone", "client.email"];
pub(crate) const CONFIRM_BUTTON_PHRASE: &str = "CONFIRMAR CITA";
const BOT_DETECTION_PHRASE_FRAGMENTS: [&str; 2] = ["irregular", "detectó"];
const CONFIRMED_PHRASE_FRAGMENT: &str = "confirmad";

const FORM_LOAD_TIMEOUT: Duration = Duration::from_secs(10);
const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(8);
const TOTAL_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);
const MIN_WAIT_FLOOR: Duration = Duration::from_millis(50);

/// A single booking attempt's parameters (§4.4 contract).
#[derive(Debug, Clone)]
pub struct BookingAttemptRequest {
    pub court: u32,
    pub target_date: NaiveDate,
    pub target_time: String,
    pub contact: ContactInfo,
    pub preset: TimingPreset,
    /// The configured `speed_multiplier` (§6) this attempt's preset scales
    /// from.
    pub base_speed_multiplier: f64,
}

/// Result of one attempt: either a confirmation id, or a classified
/// failure (§4.4).
pub type AttemptOutcome = std::result::Result<String, ExecutorError>;

fn scaled_wait(base_secs_range: (f64, f64), multiplier: f64) -> Duration {
    let mut rng = rand::rng();
    let base = rng.random_range(base_secs_range.0..=base_secs_range.1);
    let scaled = (base / multiplier).max(MIN_WAIT_FLOOR.as_secs_f64());
    Duration::from_secs_f64(scaled)
}

async fn sleep_scaled(range: (f64, f64), multiplier: f64) {
    tokio::time::sleep(scaled_wait(range, multiplier)).await;
}

/// Runs the full state machine for one attempt on the page held by
/// `lease` (§4.4). Bounded by the total-attempt timeout; a timeout at any
/// point surfaces as [`ExecutorError::ConfirmationTimeout`] or
/// [`ExecutorError::FormLoadTimeout`] depending on where it occurred.
pub async fn run_attempt(lease: &PageLease, request: &BookingAttemptRequest) -> AttemptOutcome {
    match timeout(TOTAL_ATTEMPT_TIMEOUT, run_attempt_inner(lease, request)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ExecutorError::ConfirmationTimeout),
    }
}

async fn run_attempt_inner(lease: &PageLease, request: &BookingAttemptRequest) -> AttemptOutcome {
    let multiplier = request.preset.speed_multiplier(request.base_speed_multiplier);
    let page = lease.page();

    // IDLE -> APPROACH: initial human-like delay before any action.
    sleep_scaled(request.preset.initial_delay_range(), multiplier).await;

    // Preparatory mouse motions: 1-2 moves to random central viewport
    // coordinates, pausing between them.
    let move_count = rand::rng().random_range(1..=2);
    for _ in 0..move_count {
        let x = rand::rng().random_range(400.0..900.0);
        let y = rand::rng().random_range(300.0..600.0);
        let _ = page.move_mouse(x, y).await;
        sleep_scaled((0.2, 0.5), multiplier).await;
    }

    // APPROACH -> CLICK_SLOT: locate the time button, move to it, click.
    let button_selector = time_button_selector(&request.target_time);
    let available = fetch_time_buttons(page).await.map_err(|_| ExecutorError::TimeSlotNotFound)?;
    if !available.iter().any(|t| time_matches(t, &request.target_time)) {
        return Err(ExecutorError::TimeSlotNotFound);
    }
    sleep_scaled((0.3, 0.5), multiplier).await;
    page.click(&button_selector).await.map_err(|_| ExecutorError::TimeSlotNotFound)?;

    // CLICK_SLOT -> AWAIT_FORM: wait for the form to appear.
    sleep_scaled((2.0, 3.0), multiplier).await;
    let first_name_present =
        timeout(FORM_LOAD_TIMEOUT, wait_for_field(page, FORM_FIELD_NAMES[0])).await.map(|r| r.is_ok()).unwrap_or(false);
    if !first_name_present {
        return Err(ExecutorError::FormLoadTimeout);
    }

    // AWAIT_FORM -> FILL_FIELDS -> REVIEW.
    type_field(page, FORM_FIELD_NAMES[0], &request.contact.first_name, request.preset, multiplier, true).await;
    type_field(page, FORM_FIELD_NAMES[1], &request.contact.last_name, request.preset, multiplier, true).await;
    type_field(page, FORM_FIELD_NAMES[2], &request.contact.phone, request.preset, multiplier, false).await;
    type_field(page, FORM_FIELD_NAMES[3], &request.contact.email, request.preset, multiplier, true).await;

    // REVIEW: pre-submit mouse move to a lower-viewport coordinate.
    let review_x = rand::rng().random_range(400.0..900.0);
    let review_y = rand::rng().random_range(650.0..750.0);
    let _ = page.move_mouse(review_x, review_y).await;
    sleep_scaled((0.5, 1.0), multiplier).await;

    // REVIEW -> SUBMIT: locate and click the confirm button.
    let page_text = page.text_content().await.map_err(|e| ExecutorError::Internal(e.to_string()))?;
    if !page_text.to_uppercase().contains(CONFIRM_BUTTON_PHRASE) {
        return Err(ExecutorError::SubmitButtonNotFound);
    }
    page.click(submit_button_selector()).await.map_err(|e| ExecutorError::Internal(e.to_string()))?;

    // SUBMIT -> AWAIT_RESPONSE -> terminal.
    sleep_scaled((3.0, 8.0), multiplier).await;
    await_response(page).await
}

fn time_button_selector(target_time: &str) -> String {
    format!("button.time-selection[data-time=\"{target_time}\"]")
}

pub(crate) fn submit_button_selector() -> &'static str {
    "button[type=submit]"
}

fn time_matches(button_text: &str, target_time: &str) -> bool {
    let trimmed = button_text.trim();
    trimmed == target_time || trimmed.split(':').next() == target_time.split(':').next()
}

async fn fetch_time_buttons(page: &std::sync::Arc<dyn crate::domain::pool::PageDriver>) -> Result<Vec<String>> {
    let value = page
        .evaluate(
            "Array.from(document.querySelectorAll('button.time-selection')).map(b => b.textContent.trim())",
        )
        .await?;
    Ok(value.as_array().map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect()).unwrap_or_default())
}

async fn wait_for_field(page: &std::sync::Arc<dyn crate::domain::pool::PageDriver>, field_name: &str) -> Result<()> {
    loop {
        let script = format!("!!document.querySelector('[name=\"{field_name}\"]')");
        let present = page.evaluate(&script).await?.as_bool().unwrap_or(false);
        if present {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Types `value` into `field_name` one character at a time, with
/// per-character timing jitter, optional typo-then-backspace, and
/// thinking pauses (§4.4). `allow_mistakes` is false for the phone field,
/// which the spec requires to be "typed directly without mistakes".
async fn type_field(
    page: &std::sync::Arc<dyn crate::domain::pool::PageDriver>,
    field_name: &str,
    value: &str,
    preset: TimingPreset,
    multiplier: f64,
    allow_mistakes: bool,
) {
    let typo_chance = if allow_mistakes { preset.typo_chance() } else { 0.0 };
    let thinking_chance = 0.20 / multiplier;

    let _ = page.click(&format!("[name=\"{field_name}\"]")).await;

    for ch in value.chars() {
        if typo_chance > 0.0 && rand::rng().random_bool(typo_chance) {
            let wrong = random_letter();
            let _ = page.type_char(wrong).await;
            key_delay(multiplier).await;
            let _ = page.press_backspace().await;
        }
        let _ = page.type_char(ch).await;
        key_delay(multiplier).await;

        if rand::rng().random_bool(thinking_chance.min(1.0)) {
            sleep_scaled((0.3, 1.2), multiplier).await;
        }
    }
}

async fn key_delay(multiplier: f64) {
    let ms = rand::rng().random_range(90.0..=220.0);
    let scaled = (ms / multiplier).max(MIN_WAIT_FLOOR.as_millis() as f64);
    tokio::time::sleep(Duration::from_millis(scaled as u64)).await;
}

fn random_letter() -> char {
    let idx = rand::rng().random_range(0..26u8);
    (b'a' + idx) as char
}

async fn await_response(page: &std::sync::Arc<dyn crate::domain::pool::PageDriver>) -> AttemptOutcome {
    let deadline = tokio::time::Instant::now() + CONFIRMATION_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        let url = page.current_url().await.unwrap_or_default();
        if let Some(id) = extract_confirmation_id(&url) {
            return Ok(id);
        }
        let text = page.text_content().await.unwrap_or_default();
        let lower = text.to_lowercase();
        if BOT_DETECTION_PHRASE_FRAGMENTS.iter().any(|frag| lower.contains(frag)) {
            return Err(ExecutorError::BotDetected);
        }
        if lower.contains(CONFIRMED_PHRASE_FRAGMENT) {
            // The site confirmed but did not expose a `/confirmation/<id>/`
            // URL segment; synthesize an id from the current url so callers
            // always receive a non-empty confirmation id (§8 invariant).
            return Ok(format!("confirmed-{}", uuid::Uuid::new_v4()));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Err(ExecutorError::ConfirmationTimeout)
}

/// Extracts the opaque token from a `/confirmation/<id>/` URL segment
/// (§6). Returns `None` if the segment is absent.
pub fn extract_confirmation_id(url: &str) -> Option<String> {
    let marker = "/confirmation/";
    let start = url.find(marker)? + marker.len();
    let rest = &url[start..];
    let id = rest.split('/').next()?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_id_extracted_from_url() {
        assert_eq!(
            extract_confirmation_id("https://example.test/schedule/acc/confirmation/abc123/"),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn confirmation_id_absent_without_segment() {
        assert_eq!(extract_confirmation_id("https://example.test/schedule/acc/calendar/1"), None);
    }

    #[test]
    fn time_matches_allows_trimmed_hour_variant() {
        assert!(time_matches("10:00", "10:00"));
        assert!(time_matches(" 10 ", "10:00"));
        assert!(!time_matches("11:00", "10:00"));
    }

    #[test]
    fn experienced_preset_kicks_in_after_threshold() {
        assert_eq!(TimingPreset::for_user(0, false), TimingPreset::Normal);
        assert_eq!(TimingPreset::for_user(3, false), TimingPreset::Experienced);
        assert_eq!(TimingPreset::for_user(0, true), TimingPreset::Experienced);
    }

    #[test]
    fn all_waits_stay_above_floor_under_extreme_multiplier() {
        for _ in 0..1000 {
            let wait = scaled_wait((0.3, 0.5), 10_000.0);
            assert!(wait >= MIN_WAIT_FLOOR);
        }
    }

    #[tokio::test]
    async fn attempt_fails_with_time_slot_not_found_when_absent() {
        use crate::domain::contact::ContactInfo;
        use crate::domain::pool::test_support::{FakePageDriverFactory, FakePageDriver};
        use crate::domain::pool::BrowserPool;
        use std::sync::Arc;

        let factory = Arc::new(FakePageDriverFactory::new(vec![]));
        let pool = Arc::new(BrowserPool::initialize(factory, &[(1, "https://example.test/1".to_string())]).await);
        let lease = pool.acquire_page(1).await.unwrap();
        let _ = FakePageDriver::new("https://example.test/1");

        let request = BookingAttemptRequest {
            court: 1,
            target_date: NaiveDate::from_ymd_opt(2025, 8, 15).unwrap(),
            target_time: "10:00".to_string(),
            contact: ContactInfo {
                first_name: "Ana".to_string(),
                last_name: "Lopez".to_string(),
                phone: "555".to_string(),
                email: "a@b.test".to_string(),
            },
            preset: TimingPreset::Experienced,
            base_speed_multiplier: 2.5,
        };

        let outcome = run_attempt(&lease, &request).await;
        assert_eq!(outcome, Err(ExecutorError::TimeSlotNotFound));
    }
}
