//! Availability Probe (§4.1): pure parsing of a court page's DOM snapshot
//! into a `date -> ordered times` mapping. The DOM evaluation itself lives
//! behind [`crate::domain::pool::PageDriver`]; everything in this module
//! is deterministic and has no I/O, so it is exercised directly by tests
//! without a real browser.

use std::collections::BTreeMap;

use chrono::NaiveDate;

/// One time-slot button as returned by the page's DOM-order script
/// evaluation (§4.1, grounded on the upstream `button.time-selection`
/// extraction).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeButton {
    pub time: String,
    pub order: usize,
}

/// `date -> ordered list of time strings` for one court, exactly as the
/// contract in §4.1 describes. Dates are kept as strings because labels
/// that don't map to a known relative-day pattern pass through unchanged.
pub type AvailabilitySnapshot = BTreeMap<String, Vec<String>>;

const DAY_PATTERNS: &[(&str, &[&str])] = &[
    ("hoy", &["hoy"]),
    ("mañana", &["mañana", "manana"]),
    ("esta semana", &["esta semana", "estasemana"]),
    ("la próxima semana", &["la próxima semana", "próxima semana"]),
];

/// Detects which of the known relative day labels are present in the
/// page's visible text, in a fixed canonical order (§4.1).
pub fn detect_available_days(text_content: &str) -> Vec<&'static str> {
    if text_content.is_empty() {
        return Vec::new();
    }
    let lower = text_content.to_lowercase();
    DAY_PATTERNS
        .iter()
        .filter(|(_, patterns)| patterns.iter().any(|p| lower.contains(p)))
        .map(|(canonical, _)| *canonical)
        .collect()
}

fn time_to_hour(time_str: &str) -> u32 {
    time_str.split(':').next().and_then(|h| h.parse().ok()).unwrap_or(0)
}

/// Groups DOM-ordered time buttons into day buckets using the
/// non-increasing-hour-transition rule (§4.1): a day boundary is crossed
/// whenever a button's hour is not strictly greater than the previous
/// button's hour, as long as a further day bucket remains.
pub fn group_times_by_day(buttons: &[TimeButton], day_labels: &[&str]) -> BTreeMap<String, Vec<String>> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if buttons.is_empty() || day_labels.is_empty() {
        return grouped;
    }
    for label in day_labels {
        grouped.insert((*label).to_string(), Vec::new());
    }

    let mut current_day_index = 0usize;
    let mut previous_hour: i64 = -1;

    for button in buttons {
        let current_hour = time_to_hour(&button.time) as i64;
        if current_hour <= previous_hour && current_day_index < day_labels.len() - 1 {
            current_day_index += 1;
        }
        grouped
            .get_mut(day_labels[current_day_index])
            .expect("day bucket was pre-populated for every label")
            .push(button.time.clone());
        previous_hour = current_hour;
    }

    grouped
}

/// Maps relative day labels to concrete ISO dates relative to
/// `reference` (§4.1): `hoy -> reference`, `mañana -> reference + 1`,
/// and both week-out labels collapse onto `reference + 2` (the site never
/// actually surfaces more than ~2 days of calendar depth in practice, so
/// "this week" and "next week" resolve to the same bucket). Unknown
/// labels pass through unchanged.
pub fn map_day_labels_to_dates(
    times_by_day: BTreeMap<String, Vec<String>>,
    reference: NaiveDate,
) -> AvailabilitySnapshot {
    let mut mapped = AvailabilitySnapshot::new();
    for (label, times) in times_by_day {
        let target_date = match label.as_str() {
            "hoy" => Some(reference),
            "mañana" => Some(reference + chrono::Duration::days(1)),
            "esta semana" | "la próxima semana" => Some(reference + chrono::Duration::days(2)),
            _ => None,
        };
        match target_date {
            Some(date) => {
                mapped.insert(date.format("%Y-%m-%d").to_string(), times);
            }
            None => {
                mapped.insert(label, times);
            }
        }
    }
    mapped
}

/// Discards times that have already passed for "today" given a reference
/// moment (§4.1). Malformed strings are kept (treated as not-yet-passed).
pub fn filter_future_times_for_today(times: &[String], current_hour: u32, current_minute: u32) -> Vec<String> {
    times
        .iter()
        .filter(|t| match parse_hhmm(t) {
            Some((hour, minute)) => hour > current_hour || (hour == current_hour && minute > current_minute),
            None => true,
        })
        .cloned()
        .collect()
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

/// The full probe pipeline (§4.1 contract), composing the steps above.
pub fn build_availability_snapshot(
    text_content: &str,
    buttons: &[TimeButton],
    reference: NaiveDate,
    now_hour: u32,
    now_minute: u32,
) -> AvailabilitySnapshot {
    if text_content.is_empty() || buttons.is_empty() {
        return AvailabilitySnapshot::new();
    }

    let day_labels = detect_available_days(text_content);
    if day_labels.is_empty() {
        return AvailabilitySnapshot::new();
    }

    let grouped = group_times_by_day(buttons, &day_labels);
    let mut mapped = map_day_labels_to_dates(grouped, reference);

    let today_key = reference.format("%Y-%m-%d").to_string();
    if let Some(times) = mapped.get(&today_key) {
        let filtered = filter_future_times_for_today(times, now_hour, now_minute);
        mapped.insert(today_key, filtered);
    }

    mapped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buttons(times: &[&str]) -> Vec<TimeButton> {
        times
            .iter()
            .enumerate()
            .map(|(order, t)| TimeButton { time: (*t).to_string(), order })
            .collect()
    }

    #[test]
    fn empty_text_or_buttons_yield_empty_snapshot() {
        assert!(build_availability_snapshot("", &buttons(&["07:00"]), NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(), 0, 0).is_empty());
        assert!(build_availability_snapshot("hoy", &[], NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(), 0, 0).is_empty());
    }

    #[test]
    fn groups_two_days_on_hour_decrease() {
        let day_labels = vec!["hoy", "mañana"];
        let btns = buttons(&["07:00", "08:00", "09:00", "07:00", "08:00"]);
        let grouped = group_times_by_day(&btns, &day_labels);
        assert_eq!(grouped["hoy"], vec!["07:00", "08:00", "09:00"]);
        assert_eq!(grouped["mañana"], vec!["07:00", "08:00"]);
    }

    #[test]
    fn concatenation_round_trips_original_order() {
        let day_labels = vec!["hoy", "mañana", "esta semana"];
        let times = ["06:00", "07:00", "08:00", "06:00", "10:00", "06:00", "07:00"];
        let btns = buttons(&times);
        let grouped = group_times_by_day(&btns, &day_labels);
        let concatenated: Vec<String> = day_labels.iter().flat_map(|d| grouped[*d].clone()).collect();
        assert_eq!(concatenated, times.iter().map(|s| s.to_string()).collect::<Vec<_>>());
    }

    #[test]
    fn day_label_mapping_round_trips_reference_date() {
        let reference = NaiveDate::from_ymd_opt(2025, 8, 13).unwrap();
        let mut times_by_day = BTreeMap::new();
        times_by_day.insert("hoy".to_string(), vec!["09:00".to_string()]);
        times_by_day.insert("mañana".to_string(), vec!["09:00".to_string()]);
        let mapped = map_day_labels_to_dates(times_by_day, reference);
        assert!(mapped.contains_key(&reference.format("%Y-%m-%d").to_string()));
        assert!(mapped.contains_key(&(reference + chrono::Duration::days(1)).format("%Y-%m-%d").to_string()));
    }

    #[test]
    fn unknown_label_passes_through_unchanged() {
        let reference = NaiveDate::from_ymd_opt(2025, 8, 13).unwrap();
        let mut times_by_day = BTreeMap::new();
        times_by_day.insert("martes especial".to_string(), vec!["09:00".to_string()]);
        let mapped = map_day_labels_to_dates(times_by_day, reference);
        assert_eq!(mapped.get("martes especial"), Some(&vec!["09:00".to_string()]));
    }

    #[test]
    fn past_times_discarded_for_today_only() {
        let filtered = filter_future_times_for_today(
            &["07:00".to_string(), "08:00".to_string(), "09:00".to_string()],
            8,
            0,
        );
        assert_eq!(filtered, vec!["09:00".to_string()]);
    }

    #[test]
    fn malformed_time_string_is_kept_and_ordered_as_hour_zero() {
        let day_labels = vec!["hoy"];
        let btns = vec![
            TimeButton { time: "bogus".to_string(), order: 0 },
            TimeButton { time: "05:00".to_string(), order: 1 },
        ];
        let grouped = group_times_by_day(&btns, &day_labels);
        assert_eq!(grouped["hoy"], vec!["bogus", "05:00"]);
    }

    #[test]
    fn full_scenario_four_from_spec() {
        let text = "Hoy Mañana";
        let btns = buttons(&["07:00", "08:00", "09:00", "07:00", "08:00"]);
        let reference = NaiveDate::from_ymd_opt(2025, 8, 13).unwrap();
        let snapshot = build_availability_snapshot(text, &btns, reference, 0, 0);
        let today_key = reference.format("%Y-%m-%d").to_string();
        let tomorrow_key = (reference + chrono::Duration::days(1)).format("%Y-%m-%d").to_string();
        assert_eq!(snapshot[&today_key], vec!["07:00", "08:00", "09:00"]);
        assert_eq!(snapshot[&tomorrow_key], vec!["07:00", "08:00"]);
    }
}
