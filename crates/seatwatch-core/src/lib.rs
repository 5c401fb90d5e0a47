//! Core domain model for seat availability watches.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "seatwatch-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("minimum seats must be at least 1")]
    MinSeats,
    #[error("maximum price must be positive when set")]
    MaxPrice,
    #[error("unrecognised travel date {0:?} (expected YYYY-MM-DD or DD.MM.YYYY)")]
    TravelDate(String),
    #[error("unrecognised time of day {0:?} (expected HH:MM)")]
    TimeOfDay(String),
    #[error("origin and destination are the same station ({0})")]
    SameStation(String),
}

/// A station as known to the availability source: a user-facing key, the
/// source's numeric code and a display label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Station {
    pub key: String,
    pub code: String,
    pub label: String,
}

/// Fetch deduplication key: one external query per distinct key per tick.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueryKey {
    pub origin_code: String,
    pub destination_code: String,
    pub travel_date: NaiveDate,
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.origin_code,
            self.destination_code,
            self.travel_date.format("%Y-%m-%d")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filters {
    pub min_seats: u32,
    pub max_price: Option<u64>,
}

impl Filters {
    pub fn new(min_seats: u32, max_price: Option<u64>) -> Result<Self, ValidationError> {
        if min_seats < 1 {
            return Err(ValidationError::MinSeats);
        }
        if max_price == Some(0) {
            return Err(ValidationError::MaxPrice);
        }
        Ok(Self {
            min_seats,
            max_price,
        })
    }
}

impl Default for Filters {
    fn default() -> Self {
        Self {
            min_seats: 1,
            max_price: None,
        }
    }
}

/// Do-not-disturb window in the reference timezone. `end <= start` wraps
/// past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietWindow {
    pub enabled: bool,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            enabled: true,
            start,
            end,
        }
    }

    /// Disabled window; the default bounds are kept so re-enabling is lossless.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for QuietWindow {
    fn default() -> Self {
        Self {
            enabled: true,
            start: NaiveTime::from_hms_opt(23, 0, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(7, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

/// The part of a subscription owned by the monitoring engine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DecisionState {
    pub last_available: bool,
    pub last_signature: Option<String>,
    pub last_notified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub owner_id: i64,
    pub origin: Station,
    pub destination: Station,
    pub travel_date: NaiveDate,
    pub filters: Filters,
    pub quiet: QuietWindow,
    pub active: bool,
    pub state: DecisionState,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn query_key(&self) -> QueryKey {
        QueryKey {
            origin_code: self.origin.code.clone(),
            destination_code: self.destination.code.clone(),
            travel_date: self.travel_date,
        }
    }
}

/// Validated input for creating a subscription. Starts active, unavailable,
/// with no signature and no notification history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscription {
    pub owner_id: i64,
    pub origin: Station,
    pub destination: Station,
    pub travel_date: NaiveDate,
    pub filters: Filters,
    pub quiet: QuietWindow,
}

impl NewSubscription {
    pub fn new(
        owner_id: i64,
        origin: Station,
        destination: Station,
        travel_date: NaiveDate,
        filters: Filters,
    ) -> Result<Self, ValidationError> {
        if origin.code == destination.code {
            return Err(ValidationError::SameStation(origin.label));
        }
        Ok(Self {
            owner_id,
            origin,
            destination,
            travel_date,
            filters,
            quiet: QuietWindow::default(),
        })
    }
}

/// One fare class on one run that satisfies a subscription's filters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub run_number: String,
    pub run_type: String,
    pub departure_date: String,
    pub fare_class: String,
    pub free_seats: u32,
    pub min_fare: Option<u64>,
}

/// Accepts `YYYY-MM-DD` or `DD.MM.YYYY`.
pub fn parse_travel_date(input: &str) -> Result<NaiveDate, ValidationError> {
    let raw = input.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d.%m.%Y"))
        .map_err(|_| ValidationError::TravelDate(raw.to_string()))
}

/// Accepts strictly `HH:MM` (two digits each).
pub fn parse_time_of_day(input: &str) -> Result<NaiveTime, ValidationError> {
    let raw = input.trim();
    let well_formed = raw.len() == 5
        && raw
            .char_indices()
            .all(|(i, c)| if i == 2 { c == ':' } else { c.is_ascii_digit() });
    if !well_formed {
        return Err(ValidationError::TimeOfDay(raw.to_string()));
    }
    NaiveTime::parse_from_str(raw, "%H:%M").map_err(|_| ValidationError::TimeOfDay(raw.to_string()))
}
