//! The collaborators a [`SubscriptionRegistry`](crate::registry::SubscriptionRegistry) relies on.
//!
//! This crate does not store calendars, decide who may read them, or speak HTTP by itself.
//! The embedding application provides these through the following traits.
//! [`HttpFeedFetcher`](crate::client::HttpFeedFetcher) and [`IcalFeedParser`](crate::ical::IcalFeedParser) are ready-made implementations of the network-facing ones,
//! and the [`memory`](crate::memory) module provides in-memory implementations of the others.

use std::error::Error;

use async_trait::async_trait;
use url::Url;

use crate::calendar::{AccessLevel, CalendarId, CalendarSubscriptionRecord, UserId};
use crate::occurrence::FeedEvent;

/// The error type returned by collaborators
pub type BoxError = Box<dyn Error + Send + Sync>;


/// Where calendar records are stored
#[async_trait]
pub trait CalendarDirectory: Send + Sync {
    /// Returns every calendar that has an external subscription.
    /// Records that have no URL are ignored by the registry, even if they are returned here.
    async fn list_subscribed_calendars(&self) -> Result<Vec<CalendarSubscriptionRecord>, BoxError>;

    /// Returns a single calendar record, or `None` in case it does not exist (anymore)
    async fn load_calendar(&self, id: CalendarId) -> Result<Option<CalendarSubscriptionRecord>, BoxError>;
}

/// Stores the last fetched content of a subscription, so that it survives a restart
#[async_trait]
pub trait CalendarPersister: Send + Sync {
    async fn persist_hash_and_blob(&self, record: &CalendarSubscriptionRecord, hash: &str, bytes: &[u8]) -> Result<(), BoxError>;
}

/// Tells whether user accounts are still in use
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Returns `false` for disabled and deleted accounts
    async fn is_active(&self, user: UserId) -> Result<bool, BoxError>;
}

/// Decides what a user may see of a calendar
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn access_level(&self, calendar: CalendarId, user: UserId) -> AccessLevel;
}


/// The raw reply of a feed server
#[derive(Clone, Debug, PartialEq)]
pub struct FetchedFeed {
    /// The HTTP status code
    pub status: u16,
    pub bytes: Vec<u8>,
}

impl FetchedFeed {
    pub fn ok(bytes: Vec<u8>) -> Self {
        Self { status: 200, bytes }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Downloads feeds
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    /// Returns an error only when no reply could be obtained at all.
    /// Replies with an unsuccessful status code are returned as such.
    async fn fetch(&self, url: &Url) -> Result<FetchedFeed, BoxError>;
}

/// Turns feed content into events.
///
/// Parsing is CPU-bound, and is run on a blocking thread.
pub trait FeedParser: Send + Sync {
    /// Parse the whole content. A single malformed part should make the whole parse fail.
    fn parse(&self, bytes: &[u8]) -> Result<Vec<FeedEvent>, BoxError>;
}


/// Tells the time, in milliseconds since the Unix epoch
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// The wall clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}
