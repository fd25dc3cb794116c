//! Utilities to track the progression of a refresh cycle

use std::fmt::{Display, Error, Formatter};

use crate::calendar::CalendarId;

/// An event that happens during a refresh cycle
#[derive(Clone, Debug, PartialEq)]
pub enum RefreshEvent {
    /// No refresh cycle has run yet
    NotStarted,
    /// A cycle has just started but no calendar is handled yet
    Started,
    /// A cycle is in progress
    InProgress{ calendar: CalendarId, details: String },
    /// A cycle is finished
    Finished{ success: bool },
}

impl Display for RefreshEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        match self {
            RefreshEvent::NotStarted => write!(f, "Not started"),
            RefreshEvent::Started => write!(f, "Refresh has started..."),
            RefreshEvent::InProgress{calendar, details} => write!(f, "[{}] {}...", calendar, details),
            RefreshEvent::Finished{success} => match success {
                true => write!(f, "Refresh successfully finished"),
                false => write!(f, "Refresh finished with errors"),
            }
        }
    }
}

impl Default for RefreshEvent {
    fn default() -> Self {
        Self::NotStarted
    }
}



/// See [`feedback_channel`]
pub type FeedbackSender = tokio::sync::watch::Sender<RefreshEvent>;
/// See [`feedback_channel`]
pub type FeedbackReceiver = tokio::sync::watch::Receiver<RefreshEvent>;

/// Create a feeback channel, that can be used to follow the progress of refresh cycles
pub fn feedback_channel() -> (FeedbackSender, FeedbackReceiver) {
    tokio::sync::watch::channel(RefreshEvent::default())
}



/// Tracks the progression and the failures of a refresh cycle
pub struct RefreshProgress<'a> {
    n_errors: u32,
    n_refreshed: u32,
    feedback_channel: Option<&'a FeedbackSender>,
}

impl<'a> RefreshProgress<'a> {
    pub fn new() -> Self {
        Self { n_errors: 0, n_refreshed: 0, feedback_channel: None }
    }
    pub fn new_with_feedback_channel(channel: &'a FeedbackSender) -> Self {
        Self { n_errors: 0, n_refreshed: 0, feedback_channel: Some(channel) }
    }

    pub fn is_success(&self) -> bool {
        self.n_errors == 0
    }

    pub fn n_errors(&self) -> u32 {
        self.n_errors
    }

    /// How many calendars have actually been refreshed (not skipped) so far
    pub fn n_refreshed(&self) -> u32 {
        self.n_refreshed
    }

    /// Log an error
    pub fn error(&mut self, text: &str) {
        log::error!("{}", text);
        self.n_errors += 1;
    }
    /// Count a calendar whose refresh failed. The failure itself has been logged already
    pub fn failed(&mut self, calendar: CalendarId, details: &str) {
        self.n_errors += 1;
        self.n_refreshed += 1;
        self.feedback(RefreshEvent::InProgress{ calendar, details: details.to_string() });
    }
    /// Count a calendar whose refresh went fine
    pub fn refreshed(&mut self, calendar: CalendarId, details: &str) {
        self.n_refreshed += 1;
        self.feedback(RefreshEvent::InProgress{ calendar, details: details.to_string() });
    }
    /// Log an info
    pub fn info(&mut self, text: &str) {
        log::info!("{}", text);
    }
    /// Log a debug message
    pub fn debug(&mut self, text: &str) {
        log::debug!("{}", text);
    }
    /// Send an event as a feedback to the listener (if any).
    pub fn feedback(&mut self, event: RefreshEvent) {
        if let Some(sender) = self.feedback_channel {
            sender.send_replace(event);
        }
    }
}

impl<'a> Default for RefreshProgress<'a> {
    fn default() -> Self {
        Self::new()
    }
}
