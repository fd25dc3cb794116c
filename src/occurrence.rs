//! Calendar occurrences, as read from external feeds

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use crate::calendar::CalendarId;
use crate::utils::millis_to_datetime;


/// An event, as produced by a [`FeedParser`](crate::traits::FeedParser)
///
/// Times are milliseconds since the Unix epoch, UTC.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    /// The iCal `UID`, stable across refreshes of the same feed
    pub uid: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_millis: Option<i64>,
    pub end_millis: Option<i64>,
    pub all_day: bool,
    /// The iCal `RRULE`. Events that have one are recurrence masters
    pub recurrence_rule: Option<String>,
    /// Instances excluded from the recurrence (`EXDATE`)
    pub exception_dates: Vec<i64>,
}

impl FeedEvent {
    pub fn new<S: ToString>(uid: S, start_millis: Option<i64>, end_millis: Option<i64>) -> Self {
        Self {
            uid: uid.to_string(),
            start_millis,
            end_millis,
            ..Self::default()
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.recurrence_rule.is_some()
    }
}


/// The identity of an occurrence.
///
/// Occurrences read from a feed are never persisted, and get [`OccurrenceId::Synthetic`] ids that only make sense within one refresh generation.
/// Their values are negative, so that they cannot be mistaken for ids of persisted events, which are not.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OccurrenceId {
    Synthetic(i64),
    Persisted(i64),
}

impl OccurrenceId {
    /// The id as the web layer knows it
    pub fn value(&self) -> i64 {
        match self {
            OccurrenceId::Synthetic(v) => *v,
            OccurrenceId::Persisted(v) => *v,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, OccurrenceId::Synthetic(_))
    }

    /// Tell apart synthetic and persisted ids from their raw value
    pub fn from_value(value: i64) -> Self {
        if value < 0 {
            OccurrenceId::Synthetic(value)
        } else {
            OccurrenceId::Persisted(value)
        }
    }
}

impl Display for OccurrenceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.value())
    }
}

/// Hands out synthetic ids for one refresh: -1, -2, -3...
#[derive(Debug)]
pub struct SyntheticIds {
    next: i64,
}

impl SyntheticIds {
    pub fn new() -> Self {
        Self { next: -1 }
    }
}

impl Default for SyntheticIds {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for SyntheticIds {
    type Item = OccurrenceId;

    fn next(&mut self) -> Option<OccurrenceId> {
        let id = OccurrenceId::Synthetic(self.next);
        self.next = self.next.checked_sub(1)?;
        Some(id)
    }
}


/// A singular event or a recurrence master, cached for a subscribed calendar.
///
/// Occurrences are immutable. A refresh replaces the whole set of occurrences of its calendar.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Occurrence {
    id: OccurrenceId,
    /// The calendar this occurrence has been read for. This is only an identity, used for display purposes
    calendar_id: CalendarId,
    uid: String,
    summary: Option<String>,
    description: Option<String>,
    location: Option<String>,
    start_millis: Option<i64>,
    end_millis: Option<i64>,
    all_day: bool,
    recurrence_rule: Option<String>,
    exception_dates: Vec<i64>,
    /// Whether sensitive fields have been stripped
    redacted: bool,
}

impl Occurrence {
    pub fn from_feed_event(event: FeedEvent, id: OccurrenceId, calendar_id: CalendarId) -> Self {
        Self {
            id,
            calendar_id,
            uid: event.uid,
            summary: event.summary,
            description: event.description,
            location: event.location,
            start_millis: event.start_millis,
            end_millis: event.end_millis,
            all_day: event.all_day,
            recurrence_rule: event.recurrence_rule,
            exception_dates: event.exception_dates,
            redacted: false,
        }
    }

    pub fn id(&self) -> OccurrenceId             { self.id }
    pub fn calendar_id(&self) -> CalendarId      { self.calendar_id }
    pub fn uid(&self) -> &str                    { &self.uid }
    pub fn summary(&self) -> Option<&str>        { self.summary.as_deref() }
    pub fn description(&self) -> Option<&str>    { self.description.as_deref() }
    pub fn location(&self) -> Option<&str>       { self.location.as_deref() }
    pub fn start_millis(&self) -> Option<i64>    { self.start_millis }
    pub fn end_millis(&self) -> Option<i64>      { self.end_millis }
    pub fn all_day(&self) -> bool                { self.all_day }
    pub fn recurrence_rule(&self) -> Option<&str> { self.recurrence_rule.as_deref() }
    pub fn exception_dates(&self) -> &[i64]      { &self.exception_dates }
    pub fn is_redacted(&self) -> bool            { self.redacted }

    pub fn is_recurring(&self) -> bool {
        self.recurrence_rule.is_some()
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start_millis.and_then(millis_to_datetime)
    }
    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end_millis.and_then(millis_to_datetime)
    }

    /// A copy that only tells when this occurrence is busy.
    ///
    /// Scheduling fields (times, recurrence) are kept so that recurrences can still be expanded, everything a user typed is dropped.
    pub fn redacted(&self) -> Self {
        Self {
            id: self.id,
            calendar_id: self.calendar_id,
            uid: self.uid.clone(),
            summary: None,
            description: None,
            location: None,
            start_millis: self.start_millis,
            end_millis: self.end_millis,
            all_day: self.all_day,
            recurrence_rule: self.recurrence_rule.clone(),
            exception_dates: self.exception_dates.clone(),
            redacted: true,
        }
    }
}
