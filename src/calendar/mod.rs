//! Calendars that are subscribed to an external feed, and the records that describe them

pub mod occurrence_index;
pub mod subscription;

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use bitflags::bitflags;

bitflags! {
    #[derive(Default, Serialize, Deserialize)]
    pub struct RecordFlags: u8 {
        /// The owner wants this calendar to mirror its external URL
        const SUBSCRIBED = 1;
        /// The stored feed content changed since the flag was last cleared by the directory
        const LAST_MODIFIED = 2;
    }
}


/// The identity of a calendar in the directory
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CalendarId(pub i64);

impl From<i64> for CalendarId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}
impl Display for CalendarId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "calendar#{}", self.0)
    }
}

/// The identity of a user account
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}
impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "user#{}", self.0)
    }
}


/// What a user may see of a calendar
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessLevel {
    /// The calendar is invisible to this user
    None,
    /// Only busy slots: start, end and UID of each occurrence
    Minimal,
    ReadOnly,
    Full,
}

impl AccessLevel {
    pub fn can_see(&self) -> bool {
        *self != AccessLevel::None
    }

    /// Whether results must be stripped of their sensitive fields
    pub fn requires_redaction(&self) -> bool {
        *self == AccessLevel::Minimal
    }
}

impl Default for AccessLevel {
    fn default() -> Self {
        AccessLevel::None
    }
}


/// A calendar as stored by the [`CalendarDirectory`](crate::traits::CalendarDirectory).
///
/// This crate never owns these records: it reads them at every refresh, and only writes back the feed content through a [`CalendarPersister`](crate::traits::CalendarPersister).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalendarSubscriptionRecord {
    pub calendar_id: CalendarId,
    pub owner: UserId,
    pub external_url: Option<String>,
    /// `None` means [`Config::default_refresh_interval_secs`](crate::config::Config)
    pub refresh_interval_secs: Option<u64>,
    /// Hash of the last content that was persisted
    pub content_hash: Option<String>,
    /// The last content that was persisted
    pub content_blob: Option<Vec<u8>>,
    pub flags: RecordFlags,
}

impl CalendarSubscriptionRecord {
    /// Create a record for a calendar that is subscribed to `url`
    pub fn new<S: ToString>(calendar_id: CalendarId, owner: UserId, url: S) -> Self {
        Self {
            calendar_id,
            owner,
            external_url: Some(url.to_string()),
            refresh_interval_secs: None,
            content_hash: None,
            content_blob: None,
            flags: RecordFlags::SUBSCRIBED,
        }
    }

    pub fn with_refresh_interval(mut self, secs: u64) -> Self {
        self.refresh_interval_secs = Some(secs);
        self
    }

    /// The external URL, unless it is missing or blank
    pub fn url(&self) -> Option<&str> {
        self.external_url
            .as_deref()
            .map(str::trim)
            .filter(|url| url.is_empty() == false)
    }

    /// Only records that pass this test may enter a registry
    pub fn is_subscription(&self) -> bool {
        self.flags.contains(RecordFlags::SUBSCRIBED) && self.url().is_some()
    }
}
