//! Singular occurrences of a calendar, sorted by start time so that time windows can be queried

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::config::WINDOW_WIDENING_MILLIS;
use crate::occurrence::Occurrence;

/// 1800-01-01T00:00:00Z, stands for a missing start
pub const OPEN_START_MILLIS: i64 = -5_364_662_400_000;
/// 3000-01-01T00:00:00Z, stands for a missing end
pub const OPEN_END_MILLIS: i64 = 32_503_680_000_000;

/// The non-recurring occurrences of one calendar.
///
/// An index is filled while a refresh builds it, then only read.
/// Adding an occurrence marks the index as unsorted, and the next query sorts it again.
///
/// Sorting takes the write lock, but nothing prevents an `add` from slipping in between a sort and the scan that follows it.
/// Such a late occurrence may be missed by this one query. This is tolerated: published indexes are sorted before they are shared, and are never added to afterwards.
#[derive(Debug)]
pub struct OccurrenceIndex {
    occurrences: RwLock<Vec<Occurrence>>,
    sorted: AtomicBool,
    widening_millis: i64,
}

impl OccurrenceIndex {
    pub fn new() -> Self {
        Self::with_widening(WINDOW_WIDENING_MILLIS)
    }

    /// Create an index whose query windows are widened by `widening_millis` on both sides
    pub fn with_widening(widening_millis: i64) -> Self {
        Self {
            occurrences: RwLock::new(Vec::new()),
            sorted: AtomicBool::new(true),
            widening_millis,
        }
    }

    pub fn add(&self, occurrence: Occurrence) {
        let mut occurrences = self.occurrences.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        occurrences.push(occurrence);
        self.sorted.store(false, Ordering::Release);
    }

    /// Sort by ascending start. Missing starts come first
    pub fn sort(&self) {
        let mut occurrences = self.occurrences.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        // `None < Some(_)` for `Option`'s ordering
        occurrences.sort_by_key(|occurrence| occurrence.start_millis());
        self.sorted.store(true, Ordering::Release);
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the occurrences that overlap `[start_millis, end_millis]`, once this window is widened.
    ///
    /// In case `redact` is true, the returned occurrences are [redacted copies](Occurrence::redacted).
    pub fn query(&self, start_millis: i64, end_millis: i64, redact: bool) -> Vec<Occurrence> {
        let mut result = Vec::new();
        self.scan(start_millis, end_millis, |occurrence, overlaps| {
            if overlaps {
                if redact {
                    result.push(occurrence.redacted());
                } else {
                    result.push(occurrence.clone());
                }
            }
        });
        result
    }

    /// Visits occurrences in start order, telling for each one whether it overlaps the widened window.
    /// The scan stops at the first occurrence that starts after the widened window.
    fn scan<F>(&self, start_millis: i64, end_millis: i64, mut visit: F)
    where
        F: FnMut(&Occurrence, bool),
    {
        if self.is_sorted() == false {
            self.sort();
        }

        let window_start = start_millis.saturating_sub(self.widening_millis);
        let window_end = end_millis.saturating_add(self.widening_millis);

        let occurrences = self.read();
        for occurrence in occurrences.iter() {
            let start = occurrence.start_millis().unwrap_or(OPEN_START_MILLIS);
            if start > window_end {
                break;
            }
            let end = occurrence.end_millis().unwrap_or(OPEN_END_MILLIS);

            let starts_inside = window_start <= start && start <= window_end;
            let ends_inside = window_start <= end && end <= window_end;
            let spans_window = start <= window_start && end >= window_end;
            visit(occurrence, starts_inside || ends_inside || spans_window);
        }
    }

    /// Returns the first occurrence with this UID. Blank UIDs never match
    pub fn lookup_by_uid(&self, uid: &str) -> Option<Occurrence> {
        if uid.trim().is_empty() {
            return None;
        }
        self.read()
            .iter()
            .find(|occurrence| occurrence.uid() == uid)
            .cloned()
    }

    /// Every occurrence, in the current order of the index
    pub fn all(&self) -> Vec<Occurrence> {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Occurrence>> {
        self.occurrences.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for OccurrenceIndex {
    fn default() -> Self {
        Self::new()
    }
}
