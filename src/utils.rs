//! Some utility functions

use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};

use crate::occurrence::Occurrence;

/// Hash of a feed content, used to tell whether a feed changed since it was last applied
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

pub fn datetime_to_millis<Tz: TimeZone>(dt: &DateTime<Tz>) -> i64 {
    dt.timestamp_millis()
}

fn format_millis(millis: Option<i64>) -> String {
    match millis.and_then(millis_to_datetime) {
        None => String::from("?"),
        Some(dt) => dt.format("%Y-%m-%d %H:%M").to_string(),
    }
}

/// A debug utility that pretty-prints occurrences
pub fn print_occurrences(occurrences: &[Occurrence]) {
    for occurrence in occurrences {
        print_occurrence(occurrence);
    }
}

pub fn print_occurrence(occurrence: &Occurrence) {
    let recurrence = if occurrence.is_recurring() { "↻" } else { " " };
    let span = if occurrence.all_day() {
        format!("{} (all day)", format_millis(occurrence.start_millis()))
    } else {
        format!("{} → {}", format_millis(occurrence.start_millis()), format_millis(occurrence.end_millis()))
    };
    println!("    {} {}\t{}\t{}", recurrence, span, occurrence.summary().unwrap_or("<busy>"), occurrence.uid());
}
