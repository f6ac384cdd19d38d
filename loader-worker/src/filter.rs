use std::fmt;

use chrono::{NaiveDateTime, TimeZone, Utc};

use crate::dates::{parse_date, EPOCH_MILLIS};
use crate::error::MappingError;

const BOUND_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.fZ"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterStatus {
    DoNotFilter,
    FilterTooEarly,
    FilterTooLate,
}

impl fmt::Display for FilterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterStatus::DoNotFilter => write!(f, "do_not_filter"),
            FilterStatus::FilterTooEarly => write!(f, "too_early"),
            FilterStatus::FilterTooLate => write!(f, "too_late"),
        }
    }
}

/// Classify a record version against an inclusive `[earlier_than, later_than]` window.
/// Records stamped with the epoch sentinel are never too early.
pub fn classify(timestamp: i64, earlier_than: i64, later_than: i64, epoch: i64) -> FilterStatus {
    if timestamp < earlier_than && timestamp != epoch {
        FilterStatus::FilterTooEarly
    } else if timestamp > later_than {
        FilterStatus::FilterTooLate
    } else {
        FilterStatus::DoNotFilter
    }
}

/// The window of record versions to load, in epoch milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterPolicy {
    earlier_than: i64,
    later_than: i64,
    epoch: i64,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl FilterPolicy {
    pub fn new(earlier_than: Option<i64>, later_than: Option<i64>) -> Self {
        Self {
            earlier_than: earlier_than.unwrap_or(i64::MIN),
            later_than: later_than.unwrap_or(i64::MAX),
            epoch: EPOCH_MILLIS,
        }
    }

    /// Build a policy from optional date strings. Blank bounds are treated as unset.
    pub fn from_bounds(
        earlier_than: Option<&str>,
        later_than: Option<&str>,
    ) -> Result<Self, MappingError> {
        Ok(Self::new(parse_bound(earlier_than)?, parse_bound(later_than)?))
    }

    pub fn earlier_than(&self) -> i64 {
        self.earlier_than
    }

    pub fn later_than(&self) -> i64 {
        self.later_than
    }

    pub fn classify(&self, timestamp: i64) -> FilterStatus {
        classify(timestamp, self.earlier_than, self.later_than, self.epoch)
    }
}

/// Bounds are read as UTC, with or without a trailing `Z` or an explicit offset.
fn parse_bound(bound: Option<&str>) -> Result<Option<i64>, MappingError> {
    let bound = match bound.map(str::trim) {
        None => return Ok(None),
        Some(bound) if bound.is_empty() => return Ok(None),
        Some(bound) => bound,
    };

    for format in BOUND_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(bound, format) {
            return Ok(Some(Utc.from_utc_datetime(&naive).timestamp_millis()));
        }
    }

    Ok(Some(parse_date(bound)?.timestamp_millis()))
}
