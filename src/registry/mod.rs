//! The registry of every subscribed calendar of the process.
//!
//! A [`SubscriptionRegistry`] owns one [`SubscriptionState`] per subscribed calendar, decides when each of them should be refreshed,
//! and gates every query through the [`AccessPolicy`].
//!
//! It is an explicit, cheaply clonable handle: applications create one at startup and share it between their request handlers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinHandle;

pub mod refresh_progress;
use refresh_progress::{feedback_channel, FeedbackReceiver, FeedbackSender, RefreshEvent, RefreshProgress};

use crate::calendar::subscription::{RefreshOutcome, RefreshStatus, SubscriptionState};
use crate::calendar::{CalendarId, CalendarSubscriptionRecord, UserId};
use crate::client::HttpFeedFetcher;
use crate::config::Config;
use crate::ical::IcalFeedParser;
use crate::occurrence::Occurrence;
use crate::traits::{AccessPolicy, BoxError, CalendarDirectory, CalendarPersister, Clock, FeedFetcher, FeedParser, SystemClock, UserDirectory};
use crate::trigger::RefreshTrigger;


/// The collaborators a registry works with
#[derive(Clone)]
pub struct Backends {
    pub directory: Arc<dyn CalendarDirectory>,
    pub persister: Arc<dyn CalendarPersister>,
    pub users: Arc<dyn UserDirectory>,
    pub access: Arc<dyn AccessPolicy>,
    pub fetcher: Arc<dyn FeedFetcher>,
    pub parser: Arc<dyn FeedParser>,
    pub clock: Arc<dyn Clock>,
}

impl Backends {
    /// Use `store` for calendar records and users, fetch feeds over HTTP and parse them as iCalendar
    pub fn new<S, A>(store: Arc<S>, access: Arc<A>) -> Self
    where
        S: CalendarDirectory + CalendarPersister + UserDirectory + 'static,
        A: AccessPolicy + 'static,
    {
        Self {
            directory: store.clone(),
            persister: store.clone(),
            users: store,
            access,
            fetcher: Arc::new(HttpFeedFetcher::new()),
            parser: Arc::new(IcalFeedParser::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_persister<P: CalendarPersister + 'static>(mut self, persister: Arc<P>) -> Self {
        self.persister = persister;
        self
    }

    pub fn with_users<U: UserDirectory + 'static>(mut self, users: Arc<U>) -> Self {
        self.users = users;
        self
    }

    pub fn with_fetcher<F: FeedFetcher + 'static>(mut self, fetcher: Arc<F>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_parser<P: FeedParser + 'static>(mut self, parser: Arc<P>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: Arc<C>) -> Self {
        self.clock = clock;
        self
    }
}


struct RegistryInner {
    backends: Backends,
    config: Config,
    states: RwLock<HashMap<CalendarId, Arc<SubscriptionState>>>,
    initialized: OnceCell<()>,
    feedback: FeedbackSender,
    /// Background tasks, aborted on close
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// The subscribed calendars of the process, and their cached occurrences.
///
/// Queries never wait for the network: until a calendar has been refreshed, it simply has no occurrences.
/// Refreshes happen in background tasks, and must be triggered by [`Self::refresh_all`], [`Self::refresh_one`]
/// or a [periodic trigger](Self::start_periodic_refresh).
///
/// Background tasks keep a handle to the registry. Call [`Self::close`] to stop them.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    /// Create a registry. Nothing is loaded until the first query (or [`Self::ensure_initialized`])
    pub fn new(backends: Backends, config: Config) -> Self {
        let (feedback, _) = feedback_channel();
        Self {
            inner: Arc::new(RegistryInner {
                backends,
                config,
                states: RwLock::new(HashMap::new()),
                initialized: OnceCell::new(),
                feedback,
                tasks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a registry, and initialize it at once in a background task.
    ///
    /// This must be called from within a tokio runtime.
    pub fn start(backends: Backends, config: Config) -> Self {
        let registry = Self::new(backends, config);
        let initializing = registry.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = initializing.ensure_initialized().await {
                log::error!("Unable to load the subscribed calendars: {}", err);
            }
        });
        registry.track(handle);
        registry
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Load the subscribed calendars, in case this has not been done yet.
    ///
    /// The first successful call seeds an empty state for every subscribed calendar, and starts refreshing them in a background task.
    /// It does not wait for this refresh.
    /// Concurrent callers wait for the same listing. In case it fails, the next call tries again.
    pub async fn ensure_initialized(&self) -> Result<(), BoxError> {
        self.inner.initialized.get_or_try_init(|| async move {
            let records = self.inner.backends.directory.list_subscribed_calendars().await?;
            let n_calendars = {
                let mut states = self.write_states();
                for record in records.iter().filter(|record| record.is_subscription()) {
                    states.entry(record.calendar_id)
                        .or_insert_with(|| Arc::new(SubscriptionState::new(record.calendar_id)));
                }
                states.len()
            };
            log::info!("Tracking {} subscribed calendars", n_calendars);
            self.spawn_refresh_all();
            Ok::<(), BoxError>(())
        }).await?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.initialized()
    }

    /// Refresh every subscribed calendar that is due, and forget the calendars that are not subscribed anymore.
    ///
    /// At most [`Config::max_concurrent_refreshes`] calendars are refreshed at the same time.
    /// Returns `true` in case no refresh failed.
    pub async fn refresh_all(&self) -> bool {
        if self.is_closed() {
            log::debug!("Registry is closed, not refreshing");
            return false;
        }

        let mut progress = RefreshProgress::new_with_feedback_channel(&self.inner.feedback);
        progress.feedback(RefreshEvent::Started);

        let records = match self.inner.backends.directory.list_subscribed_calendars().await {
            Ok(records) => records,
            Err(err) => {
                progress.error(&format!("Unable to list the subscribed calendars: {}", err));
                progress.feedback(RefreshEvent::Finished{ success: false });
                return false;
            },
        };
        let records: Vec<CalendarSubscriptionRecord> = records.into_iter().filter(|record| record.is_subscription()).collect();
        progress.debug(&format!("Refreshing {} subscribed calendars", records.len()));

        // Calendars that start being tracked during this cycle were not part of this listing, and must be kept
        let tracked_before: Vec<CalendarId> = self.read_states().keys().copied().collect();

        let semaphore = Arc::new(Semaphore::new(self.inner.config.max_concurrent_refreshes.max(1)));
        let mut handles = Vec::with_capacity(records.len());
        for record in &records {
            let registry = self.clone();
            let semaphore = semaphore.clone();
            let record = record.clone();
            let calendar_id = record.calendar_id;
            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                registry.update_one(&record, false).await
            });
            handles.push((calendar_id, handle));
        }

        for (calendar_id, handle) in handles {
            match handle.await {
                Ok(None) => {},
                Ok(Some(RefreshOutcome::Failed(message))) => progress.failed(calendar_id, &message),
                Ok(Some(outcome)) => progress.refreshed(calendar_id, &format!("{:?}", outcome)),
                Err(err) => {
                    // A panic in one calendar must not stop the others
                    let message = format!("The refresh of {} crashed: {}", calendar_id, err);
                    if let Some(state) = self.state(calendar_id) {
                        state.record_failure(message.clone(), self.inner.backends.clock.now_millis());
                    }
                    progress.failed(calendar_id, &message);
                },
            }
        }

        let subscribed: HashSet<CalendarId> = records.iter().map(|record| record.calendar_id).collect();
        let removed: Vec<Arc<SubscriptionState>> = {
            let mut states = self.write_states();
            tracked_before.iter()
                .filter(|id| subscribed.contains(id) == false)
                .filter_map(|id| states.remove(id))
                .collect()
        };
        for state in removed {
            progress.debug(&format!("{} is not subscribed anymore, forgetting it", state.calendar_id()));
            state.clear();
        }

        let success = progress.is_success();
        progress.feedback(RefreshEvent::Finished{ success });
        if success {
            progress.info(&format!("Refresh cycle finished ({} calendars refreshed)", progress.n_refreshed()));
        } else {
            progress.info(&format!("Refresh cycle finished with {} errors", progress.n_errors()));
        }
        success
    }

    /// Refresh a calendar in case it is due (or `force` is set).
    ///
    /// Refreshes of a given calendar never overlap. In case one is already running,
    /// a forced update waits for it and then refreshes again, while a regular update is skipped.
    ///
    /// Returns `None` when no refresh has been attempted.
    pub async fn update_one(&self, record: &CalendarSubscriptionRecord, force: bool) -> Option<RefreshOutcome> {
        if self.is_closed() {
            return None;
        }
        if record.is_subscription() == false {
            self.forget(record.calendar_id);
            return Some(RefreshOutcome::Cleared);
        }

        let state = self.state_or_insert(record.calendar_id);
        let _guard = if force {
            state.refresh_lock().lock().await
        } else {
            match state.refresh_lock().try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    log::debug!("A refresh of {} is already running", record.calendar_id);
                    return None;
                },
            }
        };

        let now = self.inner.backends.clock.now_millis();
        if state.is_refresh_due(record, &self.inner.config, now, force) == false {
            log::trace!("{} is not due for a refresh", record.calendar_id);
            return None;
        }
        Some(state.refresh(record, &self.inner.backends, &self.inner.config, force).await)
    }

    /// Reload the record of a calendar, and refresh it in case it is due (or `force` is set).
    ///
    /// This is what a "refresh now" button should call.
    pub async fn refresh_one(&self, calendar_id: CalendarId, force: bool) -> Result<Option<RefreshOutcome>, BoxError> {
        if self.is_closed() {
            return Ok(None);
        }
        match self.inner.backends.directory.load_calendar(calendar_id).await? {
            None => {
                self.forget(calendar_id);
                Ok(Some(RefreshOutcome::Cleared))
            },
            Some(record) => Ok(self.update_one(&record, force).await),
        }
    }

    pub async fn is_externally_subscribed(&self, calendar_id: CalendarId) -> bool {
        self.initialize_for_query().await;
        self.state(calendar_id).is_some()
    }

    /// The occurrences of a calendar that overlap a time window (widened by [`Config::window_widening_millis`]).
    ///
    /// Returns `None` in case `user` may not see this calendar, and an empty list in case it simply has no occurrence there.
    /// Users with [minimal access](crate::calendar::AccessLevel::Minimal) get redacted occurrences.
    pub async fn get_events(&self, calendar_id: CalendarId, start_millis: i64, end_millis: i64, user: UserId) -> Option<Vec<Occurrence>> {
        self.initialize_for_query().await;
        let level = self.inner.backends.access.access_level(calendar_id, user).await;
        if level.can_see() == false {
            return None;
        }
        let events = match self.state(calendar_id) {
            None => Vec::new(),
            Some(state) => state.get_events(start_millis, end_millis, level.requires_redaction()),
        };
        Some(events)
    }

    /// A single occurrence (singular or recurring), by UID. Gated like [`Self::get_events`]
    pub async fn get_event(&self, calendar_id: CalendarId, uid: &str, user: UserId) -> Option<Occurrence> {
        self.initialize_for_query().await;
        let level = self.inner.backends.access.access_level(calendar_id, user).await;
        if level.can_see() == false {
            return None;
        }
        let occurrence = self.state(calendar_id)?.get_event(uid)?;
        if level.requires_redaction() {
            Some(occurrence.redacted())
        } else {
            Some(occurrence)
        }
    }

    /// The recurring occurrences of several calendars.
    ///
    /// Calendars `user` may not see are skipped, and each calendar is redacted according to the access `user` has to it.
    pub async fn get_recurring_events(&self, calendar_ids: &[CalendarId], fallback: Option<CalendarId>, user: UserId) -> Vec<Occurrence> {
        self.initialize_for_query().await;

        let mut candidates: Vec<CalendarId> = Vec::with_capacity(calendar_ids.len() + 1);
        for id in calendar_ids.iter().copied().chain(fallback) {
            if candidates.contains(&id) == false {
                candidates.push(id);
            }
        }

        let mut result = Vec::new();
        for calendar_id in candidates {
            let state = match self.state(calendar_id) {
                None => continue,
                Some(state) => state,
            };
            let level = self.inner.backends.access.access_level(calendar_id, user).await;
            if level.can_see() == false {
                continue;
            }
            result.extend(state.recurring_occurrences(level.requires_redaction()));
        }
        result
    }

    /// The health of a calendar, or `None` in case it is not tracked by this registry
    pub fn status(&self, calendar_id: CalendarId) -> Option<RefreshStatus> {
        self.state(calendar_id).map(|state| state.status())
    }

    /// The calendars this registry currently tracks
    pub fn calendar_ids(&self) -> Vec<CalendarId> {
        let mut ids: Vec<CalendarId> = self.read_states().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Follow the progress of refresh cycles
    pub fn feedback_receiver(&self) -> FeedbackReceiver {
        self.inner.feedback.subscribe()
    }

    /// Refresh every calendar every [`Config::trigger_period_secs`], until this registry is closed
    pub fn start_periodic_refresh(&self) {
        if self.is_closed() {
            return;
        }
        let trigger = RefreshTrigger::new(self.clone(), self.inner.config.trigger_period());
        self.track(trigger.spawn());
    }

    /// Stop every background task. Later refreshes are no-ops, while queries keep serving the cached content
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..).collect();
        for task in tasks {
            task.abort();
        }
        log::debug!("Registry closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    async fn initialize_for_query(&self) {
        if let Err(err) = self.ensure_initialized().await {
            log::warn!("Unable to load the subscribed calendars: {}", err);
        }
    }

    fn spawn_refresh_all(&self) {
        if self.is_closed() {
            return;
        }
        let registry = self.clone();
        let handle = tokio::spawn(async move {
            registry.refresh_all().await;
        });
        self.track(handle);
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.retain(|task| task.is_finished() == false);
        if self.is_closed() {
            handle.abort();
        } else {
            tasks.push(handle);
        }
    }

    fn state(&self, calendar_id: CalendarId) -> Option<Arc<SubscriptionState>> {
        self.read_states().get(&calendar_id).cloned()
    }

    fn state_or_insert(&self, calendar_id: CalendarId) -> Arc<SubscriptionState> {
        if let Some(state) = self.state(calendar_id) {
            return state;
        }
        self.write_states()
            .entry(calendar_id)
            .or_insert_with(|| Arc::new(SubscriptionState::new(calendar_id)))
            .clone()
    }

    fn forget(&self, calendar_id: CalendarId) {
        let removed = self.write_states().remove(&calendar_id);
        if let Some(state) = removed {
            log::debug!("{} is not subscribed anymore, forgetting it", calendar_id);
            state.clear();
        }
    }

    fn read_states(&self) -> std::sync::RwLockReadGuard<'_, HashMap<CalendarId, Arc<SubscriptionState>>> {
        self.inner.states.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_states(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<CalendarId, Arc<SubscriptionState>>> {
        self.inner.states.write().unwrap_or_else(|p| p.into_inner())
    }
}
