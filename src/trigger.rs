//! A periodic task that keeps a registry fresh

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::registry::SubscriptionRegistry;

/// Calls [`SubscriptionRegistry::refresh_all`] every `period`, until the registry is closed.
///
/// The first tick happens at once. Cycles never overlap: a cycle that lasts longer than `period` delays the next one.
pub struct RefreshTrigger {
    registry: SubscriptionRegistry,
    period: Duration,
}

impl RefreshTrigger {
    pub fn new(registry: SubscriptionRegistry, period: Duration) -> Self {
        Self { registry, period }
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if self.registry.is_closed() {
                break;
            }

            if self.registry.is_initialized() {
                self.registry.refresh_all().await;
            } else if let Err(err) = self.registry.ensure_initialized().await {
                // Initializing starts its own refresh. In case it failed, the next tick tries again
                log::warn!("Unable to load the subscribed calendars: {}", err);
            }
        }
        log::debug!("Refresh trigger stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::calendar::{AccessLevel, CalendarId, CalendarSubscriptionRecord, UserId};
    use crate::config::Config;
    use crate::memory::{JsonFeedParser, ManualClock, MemoryDirectory, MemoryFetcher, StaticAccessPolicy};
    use crate::registry::Backends;

    #[tokio::test]
    async fn ticks_until_closed() {
        let _ = env_logger::builder().is_test(true).try_init();
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert(CalendarSubscriptionRecord::new(CalendarId(1), UserId(1), "https://example.com/a.ics").with_refresh_interval(1));
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.set_feed("https://example.com/a.ics", JsonFeedParser::feed(&[]));
        let clock = Arc::new(ManualClock::new(0));

        let backends = Backends::new(directory, Arc::new(StaticAccessPolicy::new(AccessLevel::Full)))
            .with_fetcher(fetcher.clone())
            .with_parser(Arc::new(JsonFeedParser::new()))
            .with_clock(clock.clone());
        let config = Config { trigger_period_secs: 1, ..Config::default() };
        let registry = SubscriptionRegistry::new(backends, config);

        let mut feedback = registry.feedback_receiver();
        registry.start_periodic_refresh();

        // The first tick initializes the registry, which refreshes everything once
        feedback.changed().await.unwrap();
        while fetcher.fetch_count() < 1 {
            feedback.changed().await.unwrap();
        }
        assert!(registry.is_initialized());

        // Later ticks refresh what is due
        clock.advance(1_000);
        while fetcher.fetch_count() < 2 {
            feedback.changed().await.unwrap();
        }

        registry.close();
        assert_eq!(registry.status(CalendarId(1)).unwrap().failed_update_count, 0);
    }
}
