//! This module provides ways to tweak the in-memory collaborators, so that they can return errors on some tests

use crate::traits::BoxError;

/// This stores some behaviour tweaks, that describe how a mocked collaborator will behave during a given test
///
/// So that a functions fails _n_ times after _m_ initial successes, set `(m, n)` for the suited parameter
#[derive(Default, Clone, Debug)]
pub struct MockBehaviour {
    /// If this is true, every action will be allowed
    pub is_suspended: bool,

    // From the CalendarDirectory trait
    pub list_calendars_behaviour: (u32, u32),
    // From the CalendarPersister trait
    pub persist_behaviour: (u32, u32),
    // From the UserDirectory trait
    pub check_user_behaviour: (u32, u32),

    // From the FeedFetcher trait
    pub fetch_behaviour: (u32, u32),
    // From the FeedParser trait
    pub parse_behaviour: (u32, u32),
}

impl MockBehaviour {
    pub fn new() -> Self {
        Self::default()
    }

    /// All actions will fail at once, for `n_fails` times
    pub fn fail_now(n_fails: u32) -> Self {
        Self {
            is_suspended: false,
            list_calendars_behaviour: (0, n_fails),
            persist_behaviour: (0, n_fails),
            check_user_behaviour: (0, n_fails),
            fetch_behaviour: (0, n_fails),
            parse_behaviour: (0, n_fails),
        }
    }

    /// Suspend this mock behaviour until you call `resume`
    pub fn suspend(&mut self) {
        self.is_suspended = true;
    }
    /// Make this behaviour active again
    pub fn resume(&mut self) {
        self.is_suspended = false;
    }

    pub fn can_list_calendars(&mut self) -> Result<(), BoxError> {
        if self.is_suspended { return Ok(()) }
        decrement(&mut self.list_calendars_behaviour, "list_calendars")
    }
    pub fn can_persist(&mut self) -> Result<(), BoxError> {
        if self.is_suspended { return Ok(()) }
        decrement(&mut self.persist_behaviour, "persist")
    }
    pub fn can_check_user(&mut self) -> Result<(), BoxError> {
        if self.is_suspended { return Ok(()) }
        decrement(&mut self.check_user_behaviour, "check_user")
    }
    pub fn can_fetch(&mut self) -> Result<(), BoxError> {
        if self.is_suspended { return Ok(()) }
        decrement(&mut self.fetch_behaviour, "fetch")
    }
    pub fn can_parse(&mut self) -> Result<(), BoxError> {
        if self.is_suspended { return Ok(()) }
        decrement(&mut self.parse_behaviour, "parse")
    }
}


/// Return Ok(()) in case the value is `(1+, _)` or `(_, 0)`, or return Err and decrement otherwise
fn decrement(value: &mut (u32, u32), descr: &str) -> Result<(), BoxError> {
    let remaining_successes = value.0;
    let remaining_failures = value.1;

    if remaining_successes > 0 {
        value.0 -= 1;
        log::debug!("Mock behaviour: allowing a {} ({:?})", descr, value);
        Ok(())
    } else if remaining_failures > 0 {
        value.1 -= 1;
        log::debug!("Mock behaviour: failing a {} ({:?})", descr, value);
        Err(format!("Mocked behaviour requires this {} to fail this time. ({:?})", descr, value).into())
    } else {
        log::debug!("Mock behaviour: allowing a {} ({:?})", descr, value);
        Ok(())
    }
}
