//! This crate keeps an in-memory cache of external calendar subscriptions (iCalendar feeds, often shared as `webcal://` links).
//!
//! Feeds are downloaded and parsed in the background, and their occurrences are served from memory.
//! A feed that cannot be reached or parsed never blanks the cache: the last content that was successfully parsed is kept, and the feed is retried less and less often.
//!
//! The entry point is the [`SubscriptionRegistry`](registry::SubscriptionRegistry). It relies on collaborators that the embedding application provides (see the [`traits`] module):
//! where calendar records are stored, who may see them, and whether their owners are still active. \
//! Default implementations are provided to fetch feeds over HTTP (in the [`client`] module) and to parse iCalendar data (in the [`ical`] module). \
//! In-memory collaborators are provided in the [`memory`] module.

pub mod traits;

pub mod calendar;
pub mod occurrence;
pub use occurrence::{FeedEvent, Occurrence, OccurrenceId};
pub mod registry;
pub use registry::{Backends, SubscriptionRegistry};
pub mod trigger;

pub mod client;
pub mod ical;
pub mod memory;

pub mod config;
pub use config::Config;
pub mod utils;

pub mod mock_behaviour;
