use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::contact::ContactInfo;
use crate::domain::tier::UserTier;
use crate::error::{QueueError, Result};

/// Lifecycle state of a reservation request (§3).
///
/// Terminal states are `Confirmed`, `Cancelled`, and `Expired`: once
/// reached, no further transition is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Dispatching,
    Executing,
    Confirmed,
    Failed,
    Cancelled,
    Expired,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Confirmed | RequestState::Cancelled | RequestState::Expired)
    }
}

/// The unit of work: a member's request to reserve a court at a given
/// date/time, tracked through its full lifecycle (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub id: String,
    pub user_id: String,
    pub contact: ContactInfo,
    pub target_date: NaiveDate,
    /// "HH:MM" time of day, as offered by the upstream calendar.
    pub target_time: String,
    /// Ordered, non-empty, duplicate-free list of acceptable courts.
    pub court_preferences: Vec<u32>,
    pub tier: UserTier,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub confirmation_id: Option<String>,
    pub reserved_court: Option<u32>,
    /// Earliest moment this request becomes eligible again after a failed
    /// attempt (§4.5 "Retry policy"). `None` means immediately eligible,
    /// which is the state of a freshly-created request.
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl ReservationRequest {
    /// Builds a new request in `Pending` state. `court_preferences` must be
    /// non-empty and duplicate-free; `known_courts` is the configured set
    /// every preference must belong to (§3 invariant).
    pub fn new(
        user_id: impl Into<String>,
        contact: ContactInfo,
        target_date: NaiveDate,
        target_time: impl Into<String>,
        court_preferences: Vec<u32>,
        tier: UserTier,
        known_courts: &[u32],
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        if court_preferences.is_empty() {
            return Err(QueueError::NotFound("court_preferences must not be empty".to_string()).into());
        }
        let mut seen = std::collections::HashSet::new();
        for court in &court_preferences {
            if !seen.insert(*court) {
                return Err(QueueError::NotFound(format!("duplicate court preference {court}")).into());
            }
            if !known_courts.contains(court) {
                return Err(QueueError::NotFound(format!("court {court} is not configured")).into());
            }
        }

        Ok(ReservationRequest {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            contact,
            target_date,
            target_time: target_time.into(),
            court_preferences,
            tier,
            state: RequestState::Pending,
            created_at,
            attempts: 0,
            last_error: None,
            confirmation_id: None,
            reserved_court: None,
            next_retry_at: None,
        })
    }

    /// The moment this request's booking window opens (§4.5, §GLOSSARY),
    /// computed against the configured `timezone` rather than UTC, since
    /// `target_time` is the court's local wall-clock time.
    pub fn window_open(&self, booking_window_hours: i64, timezone: &str) -> Option<DateTime<Utc>> {
        let local = resolve_local_datetime(self.target_date, &self.target_time, timezone)?;
        Some(local.with_timezone(&Utc) - chrono::Duration::hours(booking_window_hours))
    }

    pub fn mark_dispatching(&mut self) {
        self.state = RequestState::Dispatching;
    }

    pub fn mark_executing(&mut self) {
        self.state = RequestState::Executing;
        self.attempts += 1;
    }

    /// Idempotent per §8: confirming twice with the same id is a no-op;
    /// confirming with a different id is an error.
    pub fn mark_confirmed(&mut self, court: u32, confirmation_id: impl Into<String>) -> Result<()> {
        let confirmation_id = confirmation_id.into();
        if self.state == RequestState::Confirmed {
            if self.confirmation_id.as_deref() == Some(confirmation_id.as_str()) {
                return Ok(());
            }
            return Err(QueueError::ConfirmationMismatch {
                id: self.id.clone(),
                existing: self.confirmation_id.clone().unwrap_or_default(),
                attempted: confirmation_id,
            }
            .into());
        }
        self.state = RequestState::Confirmed;
        self.reserved_court = Some(court);
        self.confirmation_id = Some(confirmation_id);
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.state = RequestState::Failed;
        self.last_error = Some(error.into());
    }

    pub fn mark_expired(&mut self) {
        self.state = RequestState::Expired;
    }

    pub fn mark_cancelled(&mut self) {
        self.state = RequestState::Cancelled;
    }

    pub fn back_to_pending(&mut self) {
        if !self.state.is_terminal() {
            self.state = RequestState::Pending;
            self.next_retry_at = None;
        }
    }

    /// Returns to `pending` but not eligible for dispatch again until
    /// `next_retry_at` (§4.5 "Retry policy"); a no-op on terminal states.
    pub fn schedule_retry(&mut self, next_retry_at: DateTime<Utc>) {
        if !self.state.is_terminal() {
            self.state = RequestState::Pending;
            self.next_retry_at = Some(next_retry_at);
        }
    }
}

fn parse_hhmm(value: &str) -> Option<(u32, u32)> {
    let (h, m) = value.split_once(':')?;
    let hour: u32 = h.trim().parse().ok()?;
    let minute: u32 = m.trim().parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

/// Resolves `date`+`time` ("HH:MM") as a local instant in the named IANA
/// `timezone` (§6 "configured timezone"), falling back to UTC for an
/// unrecognised name. Disambiguates a DST-ambiguous wall-clock instant by
/// picking the earlier of the two possibilities.
pub fn resolve_local_datetime(date: NaiveDate, time: &str, timezone: &str) -> Option<DateTime<Tz>> {
    let (hour, minute) = parse_hhmm(time)?;
    let naive = date.and_hms_opt(hour, minute, 0)?;
    let tz: Tz = timezone.parse().unwrap_or(chrono_tz::UTC);
    tz.from_local_datetime(&naive).single().or_else(|| tz.from_local_datetime(&naive).earliest())
}

/// Formats `date`+`time` as an offset-qualified ISO instant suitable for
/// the direct date-time URL (§6, §9), e.g. `2025-07-30T11:00:00-06:00`.
pub fn direct_datetime_token(date: NaiveDate, time: &str, timezone: &str) -> Option<String> {
    let local = resolve_local_datetime(date, time, timezone)?;
    Some(local.format("%Y-%m-%dT%H:%M:%S%:z").to_string())
}
