//! Subscribe to a feed, refresh it once and print what it contains.
//!
//! Usage: `pantry-peek <url> [days]`

use std::sync::Arc;

use webcal_pantry::calendar::{AccessLevel, CalendarId, CalendarSubscriptionRecord, UserId};
use webcal_pantry::calendar::subscription::RefreshOutcome;
use webcal_pantry::memory::{MemoryDirectory, StaticAccessPolicy};
use webcal_pantry::registry::{Backends, SubscriptionRegistry};
use webcal_pantry::traits::{BoxError, Clock, SystemClock};
use webcal_pantry::utils::print_occurrences;
use webcal_pantry::Config;

const CALENDAR: CalendarId = CalendarId(1);
const USER: UserId = UserId(1);

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let url = match args.next() {
        Some(url) => url,
        None => return Err("Usage: pantry-peek <url> [days]".into()),
    };
    let days: i64 = match args.next() {
        None => 30,
        Some(days) => days.parse().map_err(|err| format!("Invalid number of days {:?}: {}", days, err))?,
    };

    let directory = Arc::new(MemoryDirectory::new());
    directory.insert(CalendarSubscriptionRecord::new(CALENDAR, USER, &url));
    let backends = Backends::new(directory, Arc::new(StaticAccessPolicy::new(AccessLevel::Full)));
    let registry = SubscriptionRegistry::new(backends, Config::default());

    match registry.refresh_one(CALENDAR, true).await? {
        Some(RefreshOutcome::Failed(message)) => return Err(message.into()),
        outcome => log::debug!("Refresh outcome: {:?}", outcome),
    }

    let now = SystemClock.now_millis();
    let end = now.saturating_add(days.saturating_mul(24 * 60 * 60 * 1000));
    let singular = registry.get_events(CALENDAR, now, end, USER).await.unwrap_or_default();
    let recurring = registry.get_recurring_events(&[CALENDAR], None, USER).await;

    println!("{} ({} days)", url, days);
    println!("  {} occurrences:", singular.len());
    print_occurrences(&singular);
    println!("  {} recurring:", recurring.len());
    print_occurrences(&recurring);

    if let Some(status) = registry.status(CALENDAR) {
        println!("  content hash: {}", status.last_applied_content_hash.unwrap_or_default());
    }
    registry.close();
    Ok(())
}
