//! This module turns iCal feeds into [`FeedEvent`](crate::occurrence::FeedEvent)s
//!
//! It is a wrapper around the `ical` crate, that only reads what a subscription needs: the events, their times and their recurrence.

mod parser;
pub use parser::{parse, IcalFeedParser};
