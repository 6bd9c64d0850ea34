//! Business rules applied while normalizing bookings.
//!
//! All functions are pure: the current time is always passed in, never read
//! from the clock, so boundary behaviour can be tested exactly.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate};
use serde::Deserialize;

use crate::value::Value;

/// Lifecycle stage of a booking on the CRM side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Arrived,
    InProgress,
    Completed,
    PaymentDue,
    Booked,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Arrived => "arrived",
            Stage::InProgress => "in-progress",
            Stage::Completed => "completed",
            Stage::PaymentDue => "payment-due",
            Stage::Booked => "booked",
        }
    }
}

/// Boundary policy for stage derivation.
#[derive(Debug, Clone, Deserialize)]
pub struct StagePolicy {
    /// A booking starting within this many days (and not today) is payment-due.
    #[serde(default = "default_payment_window")]
    pub payment_window_days: i64,
    /// Whether `now == start_at` already counts as in-progress.
    #[serde(default = "default_true")]
    pub in_progress_includes_start: bool,
    /// Whether `now == end_at` still counts as in-progress.
    #[serde(default = "default_true")]
    pub in_progress_includes_end: bool,
    /// Source status that means "booked" (compared case-insensitively).
    #[serde(default = "default_booked_status")]
    pub booked_status: String,
}

fn default_payment_window() -> i64 {
    32
}
fn default_true() -> bool {
    true
}
fn default_booked_status() -> String {
    "Booked".to_string()
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            payment_window_days: default_payment_window(),
            in_progress_includes_start: true,
            in_progress_includes_end: true,
            booked_status: default_booked_status(),
        }
    }
}

/// Whole calendar days from `now`'s date to `start_at`'s date, both read in `now`'s offset.
pub fn days_until(start_at: DateTime<FixedOffset>, now: DateTime<FixedOffset>) -> i64 {
    let start_day = start_at.with_timezone(now.offset()).date_naive();
    (start_day - now.date_naive()).num_days()
}

/// Derive the booking stage. First matching rule wins:
///
/// 1. starts today → [`Stage::Arrived`]
/// 2. `start_at <= now <= end_at` → [`Stage::InProgress`]
/// 3. `now > end_at` → [`Stage::Completed`]
/// 4. `0 < days_until_start <= payment_window_days` → [`Stage::PaymentDue`]
/// 5. status is the booked status → [`Stage::Booked`]
///
/// Missing dates leave the stage unset.
pub fn derive_stage(
    start_at: Option<DateTime<FixedOffset>>,
    end_at: Option<DateTime<FixedOffset>>,
    status: &str,
    now: DateTime<FixedOffset>,
    policy: &StagePolicy,
) -> Option<Stage> {
    let (start_at, end_at) = (start_at?, end_at?);
    let ahead = days_until(start_at, now);

    let started = if policy.in_progress_includes_start {
        start_at <= now
    } else {
        start_at < now
    };
    let not_ended = if policy.in_progress_includes_end {
        now <= end_at
    } else {
        now < end_at
    };

    if ahead == 0 {
        Some(Stage::Arrived)
    } else if started && not_ended {
        Some(Stage::InProgress)
    } else if now > end_at {
        Some(Stage::Completed)
    } else if ahead > 0 && ahead <= policy.payment_window_days {
        Some(Stage::PaymentDue)
    } else if status.eq_ignore_ascii_case(&policy.booked_status) {
        Some(Stage::Booked)
    } else {
        None
    }
}

/// Nights between two values, on calendar dates. `None` when either side is not a date.
pub fn night_count(start: &Value, end: &Value) -> Option<i64> {
    Some((end.as_date()? - start.as_date()?).num_days())
}

/// Client ids that appear on more than one booking of the set.
pub fn returning_clients<'a>(client_ids: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for id in client_ids.into_iter().filter(|id| !id.is_empty()) {
        *counts.entry(id).or_default() += 1;
    }
    counts
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(id, _)| id.to_string())
        .collect()
}

/// Which month a night belongs to when a stay crosses a month boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NightAttribution {
    /// A night counts towards the month of the following morning:
    /// the night of Jan 31 → Feb 1 is a February night.
    #[default]
    Checkout,
    /// A night counts towards the month it starts in.
    Checkin,
}

/// One calendar-month slice of a stay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthSegment {
    /// Synthetic id: `parent_id * 100 + index`.
    pub id: i64,
    pub index: usize,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub nights: i64,
}

/// Split a stay into per-month segments.
///
/// A stay inside one month, or with no nights, yields a single segment with
/// id `parent_id * 100`. Synthetic ids depend only on the parent id and the
/// segment position, so re-runs produce the same ids. `None` when a synthetic
/// id does not fit in an `i64`.
pub fn split_by_month(
    parent_id: i64,
    start: NaiveDate,
    end: NaiveDate,
    attribution: NightAttribution,
) -> Option<Vec<MonthSegment>> {
    let base = parent_id.checked_mul(100)?;
    let month_of = |night: NaiveDate| {
        let day = match attribution {
            NightAttribution::Checkout => night.succ_opt().unwrap_or(night),
            NightAttribution::Checkin => night,
        };
        (day.year(), day.month())
    };

    let mut segments: Vec<MonthSegment> = Vec::new();
    let mut night = start;
    while night < end {
        let next = match night.succ_opt() {
            Some(d) => d,
            None => break,
        };
        let same_month = segments
            .last()
            .map(|s| month_of(s.end.pred_opt().unwrap_or(s.end)) == month_of(night))
            .unwrap_or(false);
        if same_month {
            if let Some(last) = segments.last_mut() {
                last.end = next;
                last.nights += 1;
            }
        } else {
            let index = segments.len();
            segments.push(MonthSegment {
                id: base.checked_add(index as i64)?,
                index,
                start: night,
                end: next,
                nights: 1,
            });
        }
        night = next;
    }

    if segments.is_empty() {
        segments.push(MonthSegment {
            id: base,
            index: 0,
            start,
            end,
            nights: 0,
        });
    }
    Some(segments)
}

/// Allocate an amount across segments proportionally to their nights.
///
/// Shares are rounded to cents and the rounding remainder goes to the last
/// segment, so the shares always add up to `amount`. With no nights at all
/// the first segment carries the whole amount.
pub fn allocate(amount: f64, segments: &[MonthSegment]) -> Vec<f64> {
    let total: i64 = segments.iter().map(|s| s.nights).sum();
    if segments.is_empty() {
        return Vec::new();
    }
    if total <= 0 {
        let mut shares = vec![0.0; segments.len()];
        shares[0] = round_cents(amount);
        return shares;
    }

    let mut shares = Vec::with_capacity(segments.len());
    let mut allocated = 0.0;
    for (i, segment) in segments.iter().enumerate() {
        let share = if i + 1 == segments.len() {
            round_cents(amount - allocated)
        } else {
            round_cents(amount * segment.nights as f64 / total as f64)
        };
        allocated += share;
        shares.push(share);
    }
    shares
}

pub fn round_cents(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// A "days ahead → win probability" interval, e.g. `0-7 days 90%`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityInterval {
    pub from_days: f64,
    pub to_days: f64,
    pub percent: i64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("malformed probability interval '{0}', expected e.g. '0-7 days 90%' or '60-inf days 10%'")]
pub struct IntervalParseError(String);

impl FromStr for ProbabilityInterval {
    type Err = IntervalParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || IntervalParseError(s.to_string());
        let (range, rest) = s.trim().split_once("days").ok_or_else(err)?;
        let (from, to) = range.split_once('-').ok_or_else(err)?;
        let from_days = from.trim().parse::<f64>().map_err(|_| err())?;
        let to_days = match to.trim() {
            "inf" => f64::INFINITY,
            t => t.parse::<f64>().map_err(|_| err())?,
        };
        let percent = rest
            .trim()
            .trim_end_matches('%')
            .trim()
            .parse::<i64>()
            .map_err(|_| err())?;
        Ok(Self {
            from_days,
            to_days,
            percent,
        })
    }
}

/// Win probability for a booking starting `days_ahead` days from now.
pub fn win_probability(intervals: &[ProbabilityInterval], days_ahead: i64) -> Option<i64> {
    let days = days_ahead as f64;
    intervals
        .iter()
        .find(|i| i.from_days <= days && days <= i.to_days)
        .map(|i| i.percent)
}

/// A missing or null optional field becomes explicit empty text.
pub fn coalesce(value: Option<Value>) -> Value {
    match value {
        None | Some(Value::Null) => Value::empty(),
        Some(v) => v,
    }
}
