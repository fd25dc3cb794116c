//! In-memory collaborators.
//!
//! These are used by the tests of this crate, and can be used by applications that do not keep their calendars in a database.
//! Each of them can be given a shared [`MockBehaviour`] to make some calls fail.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use url::Url;

use crate::calendar::{AccessLevel, CalendarId, CalendarSubscriptionRecord, RecordFlags, UserId};
use crate::mock_behaviour::MockBehaviour;
use crate::occurrence::FeedEvent;
use crate::traits::{AccessPolicy, BoxError, CalendarDirectory, CalendarPersister, Clock, FeedFetcher, FeedParser, FetchedFeed, UserDirectory};

/// A behaviour that can be shared between several collaborators, and tweaked while a test runs
pub type SharedBehaviour = Arc<Mutex<MockBehaviour>>;

fn check(behaviour: &Option<SharedBehaviour>, f: impl FnOnce(&mut MockBehaviour) -> Result<(), BoxError>) -> Result<(), BoxError> {
    match behaviour {
        None => Ok(()),
        Some(b) => {
            let mut b = b.lock().map_err(|_| "mock behaviour lock is poisoned")?;
            f(&mut *b)
        },
    }
}


/// Calendar records, and the users that own them.
///
/// Users are active unless they have been [deactivated](Self::set_user_active).
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    records: Mutex<HashMap<CalendarId, CalendarSubscriptionRecord>>,
    inactive_users: Mutex<HashSet<UserId>>,
    persist_count: AtomicUsize,
    behaviour: Option<SharedBehaviour>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behaviour(behaviour: SharedBehaviour) -> Self {
        Self { behaviour: Some(behaviour), ..Self::default() }
    }

    /// Add or replace a record
    pub fn insert(&self, record: CalendarSubscriptionRecord) {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).insert(record.calendar_id, record);
    }

    pub fn remove(&self, id: CalendarId) -> Option<CalendarSubscriptionRecord> {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).remove(&id)
    }

    pub fn record(&self, id: CalendarId) -> Option<CalendarSubscriptionRecord> {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).get(&id).cloned()
    }

    /// Change a record in place
    pub fn update<F: FnOnce(&mut CalendarSubscriptionRecord)>(&self, id: CalendarId, f: F) -> bool {
        match self.records.lock().unwrap_or_else(|p| p.into_inner()).get_mut(&id) {
            None => false,
            Some(record) => {
                f(record);
                true
            },
        }
    }

    pub fn set_user_active(&self, user: UserId, active: bool) {
        let mut inactive = self.inactive_users.lock().unwrap_or_else(|p| p.into_inner());
        if active {
            inactive.remove(&user);
        } else {
            inactive.insert(user);
        }
    }

    /// How many times some content has been persisted
    pub fn persist_count(&self) -> usize {
        self.persist_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CalendarDirectory for MemoryDirectory {
    async fn list_subscribed_calendars(&self) -> Result<Vec<CalendarSubscriptionRecord>, BoxError> {
        check(&self.behaviour, MockBehaviour::can_list_calendars)?;
        let records = self.records.lock().map_err(|_| "directory lock is poisoned")?;
        let mut subscribed: Vec<_> = records.values()
            .filter(|record| record.is_subscription())
            .cloned()
            .collect();
        subscribed.sort_by_key(|record| record.calendar_id);
        Ok(subscribed)
    }

    async fn load_calendar(&self, id: CalendarId) -> Result<Option<CalendarSubscriptionRecord>, BoxError> {
        Ok(self.record(id))
    }
}

#[async_trait]
impl CalendarPersister for MemoryDirectory {
    async fn persist_hash_and_blob(&self, record: &CalendarSubscriptionRecord, hash: &str, bytes: &[u8]) -> Result<(), BoxError> {
        check(&self.behaviour, MockBehaviour::can_persist)?;
        let updated = self.update(record.calendar_id, |stored| {
            stored.content_hash = Some(hash.to_string());
            stored.content_blob = Some(bytes.to_vec());
            stored.flags.insert(RecordFlags::LAST_MODIFIED);
        });
        if updated == false {
            return Err(format!("No record for {}", record.calendar_id).into());
        }
        self.persist_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn is_active(&self, user: UserId) -> Result<bool, BoxError> {
        check(&self.behaviour, MockBehaviour::can_check_user)?;
        let inactive = self.inactive_users.lock().map_err(|_| "directory lock is poisoned")?;
        Ok(inactive.contains(&user) == false)
    }
}


/// Serves feeds from memory, keyed by URL.
///
/// Unknown URLs behave like unreachable servers.
/// The fetcher can also be [closed](Self::close), so that fetches wait until it is [opened](Self::open) again.
#[derive(Debug)]
pub struct MemoryFetcher {
    feeds: Mutex<HashMap<String, FetchedFeed>>,
    fetch_count: AtomicUsize,
    gate: tokio::sync::watch::Sender<bool>,
    behaviour: Option<SharedBehaviour>,
}

impl Default for MemoryFetcher {
    fn default() -> Self {
        let (gate, _) = tokio::sync::watch::channel(true);
        Self {
            feeds: Mutex::new(HashMap::new()),
            fetch_count: AtomicUsize::new(0),
            gate,
            behaviour: None,
        }
    }
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behaviour(behaviour: SharedBehaviour) -> Self {
        Self { behaviour: Some(behaviour), ..Self::default() }
    }

    /// Serve `bytes` with a `200` status
    pub fn set_feed<S: ToString, B: Into<Vec<u8>>>(&self, url: S, bytes: B) {
        self.set_reply(url, FetchedFeed::ok(bytes.into()));
    }

    pub fn set_reply<S: ToString>(&self, url: S, reply: FetchedFeed) {
        self.feeds.lock().unwrap_or_else(|p| p.into_inner()).insert(url.to_string(), reply);
    }

    pub fn remove_feed(&self, url: &str) {
        self.feeds.lock().unwrap_or_else(|p| p.into_inner()).remove(url);
    }

    /// How many fetches have been attempted
    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// Make every fetch wait until [`Self::open`] is called
    pub fn close(&self) {
        self.gate.send_replace(false);
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }
}

#[async_trait]
impl FeedFetcher for MemoryFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedFeed, BoxError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        let mut gate = self.gate.subscribe();
        while *gate.borrow() == false {
            gate.changed().await?;
        }

        check(&self.behaviour, MockBehaviour::can_fetch)?;
        let feeds = self.feeds.lock().map_err(|_| "fetcher lock is poisoned")?;
        match feeds.get(url.as_str()) {
            None => Err(format!("Unable to connect to {}", url).into()),
            Some(reply) => Ok(reply.clone()),
        }
    }
}


/// Parses feeds that are JSON arrays of [`FeedEvent`]s. This is handy to build feeds in tests
#[derive(Debug, Default)]
pub struct JsonFeedParser {
    parse_count: AtomicUsize,
    behaviour: Option<SharedBehaviour>,
}

impl JsonFeedParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behaviour(behaviour: SharedBehaviour) -> Self {
        Self { behaviour: Some(behaviour), ..Self::default() }
    }

    /// Build the content of a feed that contains these events
    pub fn feed(events: &[FeedEvent]) -> Vec<u8> {
        serde_json::to_vec(events).unwrap_or_default()
    }

    /// How many times a parse has been attempted
    pub fn parse_count(&self) -> usize {
        self.parse_count.load(Ordering::SeqCst)
    }
}

impl FeedParser for JsonFeedParser {
    fn parse(&self, bytes: &[u8]) -> Result<Vec<FeedEvent>, BoxError> {
        self.parse_count.fetch_add(1, Ordering::SeqCst);
        check(&self.behaviour, MockBehaviour::can_parse)?;
        Ok(serde_json::from_slice(bytes)?)
    }
}


/// Grants access levels that have been set explicitly, and `default_level` otherwise
#[derive(Debug, Default)]
pub struct StaticAccessPolicy {
    levels: Mutex<HashMap<(CalendarId, UserId), AccessLevel>>,
    default_level: AccessLevel,
}

impl StaticAccessPolicy {
    pub fn new(default_level: AccessLevel) -> Self {
        Self { levels: Mutex::new(HashMap::new()), default_level }
    }

    pub fn set(&self, calendar: CalendarId, user: UserId, level: AccessLevel) {
        self.levels.lock().unwrap_or_else(|p| p.into_inner()).insert((calendar, user), level);
    }
}

#[async_trait]
impl AccessPolicy for StaticAccessPolicy {
    async fn access_level(&self, calendar: CalendarId, user: UserId) -> AccessLevel {
        self.levels.lock().unwrap_or_else(|p| p.into_inner())
            .get(&(calendar, user))
            .copied()
            .unwrap_or(self.default_level)
    }
}


/// A clock that only moves when it is told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_millis: i64) -> Self {
        Self { now: AtomicI64::new(now_millis) }
    }

    pub fn set(&self, now_millis: i64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn directory_persists_and_lists() {
        let directory = MemoryDirectory::new();
        directory.insert(CalendarSubscriptionRecord::new(CalendarId(2), UserId(1), "https://example.com/b.ics"));
        directory.insert(CalendarSubscriptionRecord::new(CalendarId(1), UserId(1), "https://example.com/a.ics"));
        let mut not_subscribed = CalendarSubscriptionRecord::new(CalendarId(3), UserId(1), "");
        not_subscribed.external_url = None;
        directory.insert(not_subscribed);

        let listed: Vec<CalendarId> = directory.list_subscribed_calendars().await.unwrap()
            .iter().map(|r| r.calendar_id).collect();
        assert_eq!(listed, vec![CalendarId(1), CalendarId(2)]);

        let record = directory.record(CalendarId(1)).unwrap();
        directory.persist_hash_and_blob(&record, "abc", b"content").await.unwrap();
        let record = directory.record(CalendarId(1)).unwrap();
        assert_eq!(record.content_hash.as_deref(), Some("abc"));
        assert_eq!(record.content_blob.as_deref(), Some(&b"content"[..]));
        assert!(record.flags.contains(RecordFlags::LAST_MODIFIED));
        assert_eq!(directory.persist_count(), 1);
    }

    #[tokio::test]
    async fn fetcher_serves_known_urls_only() {
        let fetcher = MemoryFetcher::new();
        fetcher.set_feed("https://example.com/a.ics", "hello");

        let feed = fetcher.fetch(&"https://example.com/a.ics".parse().unwrap()).await.unwrap();
        assert!(feed.is_success());
        assert_eq!(feed.bytes, b"hello".to_vec());
        assert!(fetcher.fetch(&"https://example.com/b.ics".parse().unwrap()).await.is_err());
        assert_eq!(fetcher.fetch_count(), 2);
    }

    #[test]
    fn json_parser() {
        let parser = JsonFeedParser::new();
        let bytes = JsonFeedParser::feed(&[FeedEvent::new("a", Some(1), Some(2))]);
        let events = parser.parse(&bytes).unwrap();
        assert_eq!(events, vec![FeedEvent::new("a", Some(1), Some(2))]);
        assert!(parser.parse(b"not json").is_err());
        assert_eq!(parser.parse_count(), 2);
    }
}
