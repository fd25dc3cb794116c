//! The cached content of one subscribed calendar, and the fetch-hash-parse cycle that refreshes it

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use url::Url;

use crate::calendar::occurrence_index::OccurrenceIndex;
use crate::calendar::{CalendarId, CalendarSubscriptionRecord};
use crate::config::{secs_to_millis, Config};
use crate::occurrence::{FeedEvent, Occurrence, SyntheticIds};
use crate::registry::Backends;
use crate::traits::FeedParser;
use crate::utils::content_hash;


/// Everything a refresh publishes. It is replaced as a whole, never modified
#[derive(Debug, Default)]
struct Published {
    index: Arc<OccurrenceIndex>,
    recurring: Arc<Vec<Occurrence>>,
    content_hash: Option<String>,
}


/// The health of a subscription, as the web layer may display it
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RefreshStatus {
    /// Whether a refresh has been attempted already
    pub initialized: bool,
    /// The last time a refresh was skipped because the owner of the calendar is inactive
    pub last_skipped_at: Option<i64>,
    pub last_updated_at: Option<i64>,
    pub last_failed_at: Option<i64>,
    /// Failures since the last successful refresh
    pub failed_update_count: u32,
    pub last_error: Option<String>,
    pub last_applied_content_hash: Option<String>,
    pub singular_count: usize,
    pub recurring_count: usize,
}

impl RefreshStatus {
    /// The last time a refresh was attempted, successful or not
    pub fn last_run(&self) -> Option<i64> {
        match (self.last_updated_at, self.last_failed_at) {
            (Some(u), Some(f)) => Some(u.max(f)),
            (u, f) => u.or(f),
        }
    }
}


/// What a call to [`SubscriptionState::refresh`] did
#[derive(Clone, Debug, PartialEq)]
pub enum RefreshOutcome {
    /// The record has no subscription (anymore). The state has been emptied
    Cleared,
    /// The owner of the calendar is disabled. Nothing has been done
    OwnerInactive,
    /// The feed did not change since it was last applied
    Unchanged,
    /// A new content has been published
    Updated { singular: usize, recurring: usize },
    /// Something went wrong. The previous content is still served
    Failed(String),
}

impl RefreshOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RefreshOutcome::Failed(_))
    }
}


/// The cached occurrences of one subscribed calendar.
///
/// Queries are served from the last published content, while a refresh builds the next one on the side.
pub struct SubscriptionState {
    calendar_id: CalendarId,
    published: RwLock<Arc<Published>>,
    status: Mutex<RefreshStatus>,
    /// Held for the whole duration of a refresh
    refresh_lock: tokio::sync::Mutex<()>,
}

impl SubscriptionState {
    /// An empty, not yet refreshed state
    pub fn new(calendar_id: CalendarId) -> Self {
        Self {
            calendar_id,
            published: RwLock::new(Arc::new(Published::default())),
            status: Mutex::new(RefreshStatus::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn calendar_id(&self) -> CalendarId {
        self.calendar_id
    }

    pub(crate) fn refresh_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.refresh_lock
    }

    pub fn status(&self) -> RefreshStatus {
        let published = self.snapshot();
        let mut status = self.lock_status().clone();
        status.last_applied_content_hash = published.content_hash.clone();
        status.singular_count = published.index.len();
        status.recurring_count = published.recurring.len();
        status
    }

    /// Whether this calendar should be refreshed at `now`.
    ///
    /// Failing feeds are retried less and less often: after `n` failures in a row, the next attempt waits `n` intervals.
    /// Whatever the failure count, an attempt is made once the ceiling of silence is reached.
    pub fn is_refresh_due(&self, record: &CalendarSubscriptionRecord, config: &Config, now: i64, force: bool) -> bool {
        if force {
            return true;
        }
        let status = self.lock_status().clone();
        let interval = record.refresh_interval_secs
            .map(secs_to_millis)
            .unwrap_or_else(|| config.default_refresh_interval_millis())
            .saturating_add(jitter_millis(self.calendar_id, config));

        if status.initialized == false {
            // Calendars of inactive owners are checked again once per interval
            return match status.last_skipped_at {
                None => true,
                Some(last_skip) => now >= last_skip.saturating_add(interval),
            };
        }

        if status.failed_update_count == 0 {
            return match status.last_updated_at {
                None => true,
                Some(last_update) => now >= last_update.saturating_add(interval),
            };
        }

        let last_run = match status.last_run() {
            None => return true,
            Some(last_run) => last_run,
        };
        if now.saturating_sub(last_run) >= config.backoff_ceiling_millis() {
            return true;
        }
        let backoff = interval.saturating_mul(i64::from(status.failed_update_count));
        now >= last_run.saturating_add(backoff)
    }

    /// Fetch the feed of `record`, and publish its content in case it has changed.
    ///
    /// Failures are recorded in the [status](Self::status) and never remove the content that is currently served.
    pub async fn refresh(&self, record: &CalendarSubscriptionRecord, backends: &Backends, config: &Config, force: bool) -> RefreshOutcome {
        let now = backends.clock.now_millis();
        let url = match record.url() {
            Some(url) if record.is_subscription() => url,
            _ => {
                log::debug!("{} is not subscribed to any feed, clearing it", self.calendar_id);
                self.clear();
                return RefreshOutcome::Cleared;
            },
        };

        match backends.users.is_active(record.owner).await {
            Ok(true) => {},
            Ok(false) => {
                log::debug!("Owner {} of {} is inactive, not refreshing it", record.owner, self.calendar_id);
                self.lock_status().last_skipped_at = Some(now);
                return RefreshOutcome::OwnerInactive;
            },
            Err(err) => {
                return self.fail(format!("Unable to check whether {} is active: {}", record.owner, err), now);
            },
        }

        log::debug!("Refreshing {} from {}{}", self.calendar_id, url, if force { " (forced)" } else { "" });
        let bytes = match fetch(url, backends, config).await {
            Ok(bytes) => bytes,
            Err(message) => {
                let outcome = self.fail(format!("Unable to refresh {}: {}", self.calendar_id, message), now);
                self.fall_back_to_stored_content(record, backends, config, now).await;
                return outcome;
            },
        };

        let hash = content_hash(&bytes);
        let already_stored = record.content_hash.as_deref() == Some(hash.as_str());
        if self.snapshot().content_hash.as_deref() == Some(hash.as_str()) {
            log::debug!("{} has not changed since it was last applied", self.calendar_id);
            if already_stored == false {
                if let Err(message) = self.store(record, &hash, &bytes, backends).await {
                    return self.fail(message, now);
                }
            }
            self.succeed(now);
            return RefreshOutcome::Unchanged;
        }

        // The stored content is the fallback, and is only replaced by content that parses
        let events = match parse_in_background(backends.parser.clone(), bytes.clone(), config.parse_timeout()).await {
            Ok(events) => events,
            Err(message) => {
                return self.fail(format!("Unable to parse the feed of {}: {}", self.calendar_id, message), now);
            },
        };

        let published = self.build(events, hash.clone(), config, now);
        let singular = published.index.len();
        let recurring = published.recurring.len();
        self.publish(published);
        self.succeed(now);
        log::info!("{} now caches {} singular and {} recurring occurrences", self.calendar_id, singular, recurring);

        if already_stored == false {
            if let Err(message) = self.store(record, &hash, &bytes, backends).await {
                // The new content is served anyway. Storing it is attempted again on the next refresh
                return self.fail(message, now);
            }
        }
        RefreshOutcome::Updated { singular, recurring }
    }

    /// Occurrences that overlap the (widened) window. See [`OccurrenceIndex::query`]
    pub fn get_events(&self, start_millis: i64, end_millis: i64, redact: bool) -> Vec<Occurrence> {
        self.snapshot().index.query(start_millis, end_millis, redact)
    }

    /// Looks for a singular occurrence first, then for a recurrence master
    pub fn get_event(&self, uid: &str) -> Option<Occurrence> {
        if uid.trim().is_empty() {
            return None;
        }
        let published = self.snapshot();
        published.index.lookup_by_uid(uid)
            .or_else(|| published.recurring.iter().find(|occurrence| occurrence.uid() == uid).cloned())
    }

    pub fn recurring_occurrences(&self, redact: bool) -> Vec<Occurrence> {
        let published = self.snapshot();
        if redact {
            published.recurring.iter().map(Occurrence::redacted).collect()
        } else {
            published.recurring.as_ref().clone()
        }
    }

    /// Record a failure that happened outside of [`Self::refresh`]
    pub(crate) fn record_failure(&self, message: String, now: i64) {
        self.fail(message, now);
    }

    /// Drop every cached occurrence and forget past failures
    pub fn clear(&self) {
        self.publish(Published::default());
        *self.lock_status() = RefreshStatus {
            initialized: true,
            ..RefreshStatus::default()
        };
    }

    async fn store(&self, record: &CalendarSubscriptionRecord, hash: &str, bytes: &[u8], backends: &Backends) -> Result<(), String> {
        backends.persister.persist_hash_and_blob(record, hash, bytes).await
            .map_err(|err| format!("Unable to store the content of {}: {}", self.calendar_id, err))
    }

    /// A stale content is better than no content at all.
    /// In case nothing has been published yet, serve the content that was stored by a previous run.
    async fn fall_back_to_stored_content(&self, record: &CalendarSubscriptionRecord, backends: &Backends, config: &Config, now: i64) {
        if self.snapshot().content_hash.is_some() {
            return;
        }
        let blob = match &record.content_blob {
            Some(blob) if blob.is_empty() == false => blob.clone(),
            _ => return,
        };

        let hash = content_hash(&blob);
        match parse_in_background(backends.parser.clone(), blob, config.parse_timeout()).await {
            Err(message) => {
                log::warn!("Unable to parse the stored content of {} either: {}", self.calendar_id, message);
            },
            Ok(events) => {
                log::info!("Serving the stored content of {} until its feed is reachable again", self.calendar_id);
                let published = self.build(events, hash, config, now);
                self.publish(published);
            },
        }
    }

    fn build(&self, events: Vec<FeedEvent>, hash: String, config: &Config, now: i64) -> Published {
        let oldest_singular_start = now.saturating_sub(config.stale_singular_age_millis());
        let index = OccurrenceIndex::with_widening(config.window_widening_millis);
        let mut recurring = Vec::new();
        let mut ids = SyntheticIds::new();
        let mut pruned = 0;

        for event in events {
            // Recurrence masters are kept whatever their age, since their next instances still matter
            let is_stale = event.is_recurring() == false
                && event.start_millis.map_or(false, |start| start < oldest_singular_start);
            if is_stale {
                pruned += 1;
                continue;
            }

            let id = match ids.next() {
                Some(id) => id,
                None => break,
            };
            let occurrence = Occurrence::from_feed_event(event, id, self.calendar_id);
            if occurrence.is_recurring() {
                recurring.push(occurrence);
            } else {
                index.add(occurrence);
            }
        }
        index.sort();

        if pruned > 0 {
            log::debug!("Skipped {} occurrences of {} that started more than {} days ago", pruned, self.calendar_id, config.stale_singular_age_days);
        }
        Published {
            index: Arc::new(index),
            recurring: Arc::new(recurring),
            content_hash: Some(hash),
        }
    }

    fn snapshot(&self) -> Arc<Published> {
        self.published.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn publish(&self, published: Published) {
        *self.published.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(published);
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, RefreshStatus> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn succeed(&self, now: i64) {
        let mut status = self.lock_status();
        status.initialized = true;
        status.last_updated_at = Some(now);
        status.last_failed_at = None;
        status.failed_update_count = 0;
        status.last_error = None;
    }

    fn fail(&self, message: String, now: i64) -> RefreshOutcome {
        log::warn!("{}", message);
        let mut status = self.lock_status();
        status.initialized = true;
        status.last_failed_at = Some(now);
        status.failed_update_count = status.failed_update_count.saturating_add(1);
        status.last_error = Some(message.clone());
        RefreshOutcome::Failed(message)
    }
}


/// A deterministic offset in `[0, refresh_jitter_secs]`, so that calendars created together do not always refresh together
fn jitter_millis(calendar_id: CalendarId, config: &Config) -> i64 {
    if config.refresh_jitter_secs == 0 {
        return 0;
    }
    let span = secs_to_millis(config.refresh_jitter_secs).saturating_add(1);
    calendar_id.0.wrapping_mul(2_654_435_761).rem_euclid(span)
}

async fn fetch(url: &str, backends: &Backends, config: &Config) -> Result<Vec<u8>, String> {
    let url = Url::parse(url).map_err(|err| format!("invalid URL {:?}: {}", url, err))?;

    match tokio::time::timeout(config.fetch_timeout(), backends.fetcher.fetch(&url)).await {
        Err(_) => Err(format!("fetching {} timed out after {}s", url, config.fetch_timeout_secs)),
        Ok(Err(err)) => Err(format!("unable to fetch {}: {}", url, err)),
        Ok(Ok(feed)) => {
            if feed.is_success() == false {
                return Err(format!("unexpected HTTP status code {} for {}", feed.status, url));
            }
            Ok(feed.bytes)
        },
    }
}

/// Parse on a blocking thread.
/// In case of a timeout, the thread is left to finish on its own and its result is dropped
async fn parse_in_background(parser: Arc<dyn FeedParser>, bytes: Vec<u8>, timeout: Duration) -> Result<Vec<FeedEvent>, String> {
    let task = tokio::task::spawn_blocking(move || {
        parser.parse(&bytes).map_err(|err| err.to_string())
    });

    match tokio::time::timeout(timeout, task).await {
        Err(_) => Err(format!("parsing timed out after {}s", timeout.as_secs())),
        Ok(Err(err)) => Err(format!("the parser crashed: {}", err)),
        Ok(Ok(result)) => result,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use crate::calendar::{AccessLevel, UserId};
    use crate::memory::{JsonFeedParser, ManualClock, MemoryDirectory, MemoryFetcher, StaticAccessPolicy};
    use crate::traits::FetchedFeed;

    const URL: &str = "https://feeds.example.com/team.ics";
    const DAY: i64 = 24 * 60 * 60 * 1000;
    const NOW: i64 = 1_717_977_600_000;

    struct Fixture {
        directory: Arc<MemoryDirectory>,
        fetcher: Arc<MemoryFetcher>,
        parser: Arc<JsonFeedParser>,
        clock: Arc<ManualClock>,
        backends: Backends,
        config: Config,
        state: SubscriptionState,
    }

    impl Fixture {
        fn new() -> Self {
            let _ = env_logger::builder().is_test(true).try_init();

            let directory = Arc::new(MemoryDirectory::new());
            directory.insert(CalendarSubscriptionRecord::new(CalendarId(1), UserId(10), URL));
            let fetcher = Arc::new(MemoryFetcher::new());
            let parser = Arc::new(JsonFeedParser::new());
            let clock = Arc::new(ManualClock::new(NOW));
            let backends = Backends {
                directory: directory.clone(),
                persister: directory.clone(),
                users: directory.clone(),
                access: Arc::new(StaticAccessPolicy::new(AccessLevel::Full)),
                fetcher: fetcher.clone(),
                parser: parser.clone(),
                clock: clock.clone(),
            };
            Self { directory, fetcher, parser, clock, backends, config: Config::default(), state: SubscriptionState::new(CalendarId(1)) }
        }

        fn record(&self) -> CalendarSubscriptionRecord {
            self.directory.record(CalendarId(1)).unwrap()
        }

        fn serve(&self, events: &[FeedEvent]) {
            self.fetcher.set_feed(URL, JsonFeedParser::feed(events));
        }

        async fn refresh(&self) -> RefreshOutcome {
            self.state.refresh(&self.record(), &self.backends, &self.config, false).await
        }

        fn uids_in(&self, start: i64, end: i64) -> Vec<String> {
            let mut uids: Vec<String> = self.state.get_events(start, end, false).iter().map(|o| o.uid().to_string()).collect();
            uids.sort();
            uids
        }
    }

    fn event(uid: &str, start: i64) -> FeedEvent {
        FeedEvent::new(uid, Some(start), Some(start + 3_600_000))
    }

    fn weekly(uid: &str, start: i64) -> FeedEvent {
        let mut event = event(uid, start);
        event.recurrence_rule = Some(String::from("FREQ=WEEKLY"));
        event
    }

    #[tokio::test]
    async fn publishes_a_new_feed() {
        let fx = Fixture::new();
        fx.serve(&[event("a", NOW + DAY), event("b", NOW + 2 * DAY), weekly("c", NOW)]);

        assert_eq!(fx.refresh().await, RefreshOutcome::Updated { singular: 2, recurring: 1 });
        assert_eq!(fx.uids_in(NOW, NOW + 3 * DAY), vec!["a", "b"]);

        let status = fx.state.status();
        assert!(status.initialized);
        assert_eq!(status.last_updated_at, Some(NOW));
        assert_eq!(status.failed_update_count, 0);
        assert_eq!(status.singular_count, 2);
        assert_eq!(status.recurring_count, 1);
        assert_eq!(status.last_applied_content_hash, fx.record().content_hash);
        assert_eq!(fx.directory.persist_count(), 1);

        // Ids are synthetic and unique within this generation
        let mut ids: Vec<i64> = fx.state.get_events(NOW, NOW + 3 * DAY, false).iter().map(|o| o.id().value()).collect();
        ids.push(fx.state.get_event("c").unwrap().id().value());
        ids.sort();
        assert_eq!(ids, vec![-3, -2, -1]);
    }

    #[tokio::test]
    async fn failed_fetch_keeps_the_previous_content() {
        let fx = Fixture::new();
        fx.serve(&[event("a", NOW + DAY), event("b", NOW + 2 * DAY)]);
        fx.refresh().await;

        fx.fetcher.remove_feed(URL);
        fx.clock.advance(10 * 60 * 1000);
        assert!(fx.refresh().await.is_failure());

        assert_eq!(fx.uids_in(NOW, NOW + 3 * DAY), vec!["a", "b"]);
        let status = fx.state.status();
        assert_eq!(status.failed_update_count, 1);
        assert_eq!(status.last_failed_at, Some(NOW + 10 * 60 * 1000));
        assert_eq!(status.last_updated_at, Some(NOW));
        assert!(status.last_error.unwrap().contains("Unable to connect"));
    }

    #[tokio::test]
    async fn unsuccessful_status_is_a_soft_failure() {
        let fx = Fixture::new();
        fx.serve(&[event("a", NOW + DAY)]);
        fx.refresh().await;

        fx.fetcher.set_reply(URL, FetchedFeed { status: 503, bytes: b"try later".to_vec() });
        assert!(fx.refresh().await.is_failure());
        assert!(fx.state.status().last_error.unwrap().contains("503"));
        assert_eq!(fx.uids_in(NOW, NOW + 2 * DAY), vec!["a"]);
        assert_eq!(fx.parser.parse_count(), 1);
    }

    #[tokio::test]
    async fn unchanged_feed_is_not_parsed_again() {
        let fx = Fixture::new();
        fx.serve(&[event("a", NOW + DAY)]);
        fx.refresh().await;
        assert_eq!(fx.parser.parse_count(), 1);

        fx.clock.advance(DAY);
        assert_eq!(fx.refresh().await, RefreshOutcome::Unchanged);
        assert_eq!(fx.parser.parse_count(), 1);
        assert_eq!(fx.directory.persist_count(), 1);
        assert_eq!(fx.uids_in(NOW, NOW + 2 * DAY), vec!["a"]);
        assert_eq!(fx.state.status().last_updated_at, Some(NOW + DAY));
    }

    #[tokio::test]
    async fn stored_but_not_applied_content_is_parsed_without_storing_it_again() {
        let fx = Fixture::new();
        let feed = JsonFeedParser::feed(&[event("a", NOW + DAY)]);
        fx.directory.update(CalendarId(1), |record| record.content_hash = Some(content_hash(&feed)));
        fx.fetcher.set_feed(URL, feed);

        assert_eq!(fx.refresh().await, RefreshOutcome::Updated { singular: 1, recurring: 0 });
        assert_eq!(fx.parser.parse_count(), 1);
        assert_eq!(fx.directory.persist_count(), 0);
    }

    #[tokio::test]
    async fn failed_parse_keeps_the_previous_content() {
        let fx = Fixture::new();
        fx.serve(&[event("a", NOW + DAY)]);
        fx.refresh().await;

        let good_feed = fx.record().content_blob;
        assert!(good_feed.is_some());

        fx.fetcher.set_feed(URL, "BEGIN:garbage");
        assert!(fx.refresh().await.is_failure());
        assert_eq!(fx.uids_in(NOW, NOW + 2 * DAY), vec!["a"]);
        assert_eq!(fx.state.status().failed_update_count, 1);
        // The stored content is still the last one that could be parsed
        assert_eq!(fx.record().content_blob, good_feed);
        assert_eq!(fx.directory.persist_count(), 1);

        // ...so that a restarted process can still serve it while the feed is unreachable
        let restarted = SubscriptionState::new(CalendarId(1));
        fx.fetcher.remove_feed(URL);
        assert!(restarted.refresh(&fx.record(), &fx.backends, &fx.config, false).await.is_failure());
        let uids: Vec<String> = restarted.get_events(NOW, NOW + 2 * DAY, false).iter().map(|o| o.uid().to_string()).collect();
        assert_eq!(uids, vec!["a"]);
    }

    #[tokio::test]
    async fn failed_persistence_still_publishes() {
        let behaviour = Arc::new(Mutex::new(crate::mock_behaviour::MockBehaviour {
            persist_behaviour: (0, 1),
            ..Default::default()
        }));
        let mut fx = Fixture::new();
        let failing = Arc::new(MemoryDirectory::with_behaviour(behaviour));
        failing.insert(fx.record());
        fx.backends = fx.backends.clone().with_persister(failing.clone());

        fx.serve(&[event("a", NOW + DAY)]);
        assert!(fx.refresh().await.is_failure());
        assert_eq!(fx.uids_in(NOW, NOW + 2 * DAY), vec!["a"]);
        let status = fx.state.status();
        assert_eq!(status.failed_update_count, 1);
        assert_eq!(status.last_updated_at, Some(NOW));
        assert_eq!(fx.parser.parse_count(), 1);

        // The same feed is not parsed again, only stored
        fx.clock.advance(DAY);
        assert_eq!(fx.refresh().await, RefreshOutcome::Unchanged);
        assert_eq!(fx.parser.parse_count(), 1);
        assert_eq!(failing.persist_count(), 1);
        let status = fx.state.status();
        assert_eq!(status.failed_update_count, 0);
        assert_eq!(status.last_updated_at, Some(NOW + DAY));
    }

    #[tokio::test]
    async fn applied_feed_is_not_parsed_again_for_an_outdated_record() {
        let fx = Fixture::new();
        let outdated = fx.record();
        fx.serve(&[event("a", NOW + DAY)]);
        fx.refresh().await;

        assert_eq!(fx.state.refresh(&outdated, &fx.backends, &fx.config, true).await, RefreshOutcome::Unchanged);
        assert_eq!(fx.parser.parse_count(), 1);
    }

    #[tokio::test]
    async fn stale_singular_occurrences_are_pruned() {
        let fx = Fixture::new();
        fx.serve(&[event("old", NOW - 61 * DAY), weekly("old-weekly", NOW - 61 * DAY), event("recent", NOW - 59 * DAY)]);

        assert_eq!(fx.refresh().await, RefreshOutcome::Updated { singular: 1, recurring: 1 });
        assert!(fx.state.get_event("old").is_none());
        assert_eq!(fx.uids_in(NOW - 70 * DAY, NOW), vec!["recent"]);
        let recurring = fx.state.recurring_occurrences(false);
        assert_eq!(recurring.len(), 1);
        assert_eq!(recurring[0].uid(), "old-weekly");
    }

    #[tokio::test]
    async fn unsubscribed_record_clears_the_state() {
        let fx = Fixture::new();
        fx.serve(&[event("a", NOW + DAY)]);
        fx.refresh().await;

        fx.directory.update(CalendarId(1), |record| record.external_url = Some(String::from(" ")));
        assert_eq!(fx.refresh().await, RefreshOutcome::Cleared);
        assert!(fx.uids_in(NOW, NOW + 2 * DAY).is_empty());
        let status = fx.state.status();
        assert!(status.initialized);
        assert_eq!(status.failed_update_count, 0);
    }

    #[tokio::test]
    async fn inactive_owner_is_skipped_silently() {
        let fx = Fixture::new();
        fx.serve(&[event("a", NOW + DAY)]);
        fx.directory.set_user_active(UserId(10), false);

        assert_eq!(fx.refresh().await, RefreshOutcome::OwnerInactive);
        assert_eq!(fx.fetcher.fetch_count(), 0);
        let status = fx.state.status();
        assert_eq!(status.failed_update_count, 0);
        assert!(status.last_error.is_none());
        assert!(status.initialized == false);
        assert_eq!(status.last_skipped_at, Some(NOW));

        // The owner is not looked up again before the next interval
        let record = fx.record();
        assert!(fx.state.is_refresh_due(&record, &fx.config, NOW + 299_999, false) == false);
        assert!(fx.state.is_refresh_due(&record, &fx.config, NOW + 300_000, false));

        fx.directory.set_user_active(UserId(10), true);
        fx.clock.advance(300_000);
        assert_eq!(fx.refresh().await, RefreshOutcome::Updated { singular: 1, recurring: 0 });
    }

    #[tokio::test]
    async fn stored_content_is_served_when_the_feed_is_unreachable() {
        let fx = Fixture::new();
        fx.directory.update(CalendarId(1), |record| record.content_blob = Some(JsonFeedParser::feed(&[event("stored", NOW + DAY)])));

        assert!(fx.refresh().await.is_failure());
        assert_eq!(fx.uids_in(NOW, NOW + 2 * DAY), vec!["stored"]);
        assert_eq!(fx.state.status().failed_update_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_feeds_time_out() {
        let fx = Fixture::new();
        fx.serve(&[event("a", NOW + DAY)]);
        fx.fetcher.close();

        let outcome = fx.refresh().await;
        match outcome {
            RefreshOutcome::Failed(message) => assert!(message.contains("timed out")),
            other => panic!("Unexpected outcome {:?}", other),
        }
        assert_eq!(fx.state.status().failed_update_count, 1);
    }

    #[test]
    fn refresh_is_due_after_the_interval() {
        let fx = Fixture::new();
        let record = fx.record().with_refresh_interval(300);
        let config = Config::default();
        let state = SubscriptionState::new(CalendarId(1));

        assert!(state.is_refresh_due(&record, &config, NOW, false));
        state.succeed(NOW);
        assert!(state.is_refresh_due(&record, &config, NOW + 299_999, false) == false);
        assert!(state.is_refresh_due(&record, &config, NOW + 299_999, true));
        assert!(state.is_refresh_due(&record, &config, NOW + 300_000, false));

        let default_interval = fx.record();
        assert!(state.is_refresh_due(&default_interval, &config, NOW + 299_999, false) == false);
        assert!(state.is_refresh_due(&default_interval, &config, NOW + 300_000, false));
    }

    #[test]
    fn failing_feeds_back_off() {
        let fx = Fixture::new();
        let record = fx.record().with_refresh_interval(300);
        let config = Config::default();
        let state = SubscriptionState::new(CalendarId(1));

        state.succeed(NOW - DAY);
        let last_run = NOW;
        for _ in 0..3 {
            state.fail(String::from("unreachable"), last_run);
        }
        assert_eq!(state.status().failed_update_count, 3);
        assert!(state.is_refresh_due(&record, &config, last_run + 2 * 300_000, false) == false);
        assert!(state.is_refresh_due(&record, &config, last_run + 3 * 300_000, false));

        // A very long backoff is capped
        for _ in 0..1000 {
            state.fail(String::from("unreachable"), last_run);
        }
        assert!(state.is_refresh_due(&record, &config, last_run + DAY - 1, false) == false);
        assert!(state.is_refresh_due(&record, &config, last_run + DAY, false));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut config = Config::default();
        assert_eq!(jitter_millis(CalendarId(42), &config), 0);

        config.refresh_jitter_secs = 60;
        for id in -50..50 {
            let jitter = jitter_millis(CalendarId(id), &config);
            assert!((0..=60_000).contains(&jitter));
            assert_eq!(jitter, jitter_millis(CalendarId(id), &config));
        }
    }
}
