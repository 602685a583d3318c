//! Execution-window guard: decides from the weekly schedule and the
//! persisted day marker whether a watering cycle is permitted to run now.
//!
//! The guard never writes the marker inside `is_due` — reads and writes are
//! split so a "not yet due" tick cannot clobber the day's finished flag:
//!
//! - `roll_day` is the only day-change commit point: it resets the marker
//!   exactly once when the date stored on disk differs from today.
//! - `mark_finished` is the only completion commit point: invoked solely by
//!   the control loop after a watering cycle actually ran to the end.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;

use crate::persist::{MarkerStore, PersistError};

#[derive(Debug, Error)]
pub enum GuardError {
    /// Configuration error, not transient: the schedule has no entry for
    /// this weekday.
    #[error("no schedule entry for weekday {0}")]
    NoScheduleForDay(u8),
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// One weekly schedule entry. `weekday_code` is 0–6 with Monday = 0.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleDay {
    pub weekday_code: u8,
    pub start_hour: u8,
    pub start_minute: u8,
    pub enabled: bool,
}

/// Persisted "has today's cycle already completed" record. At most one
/// exists; it is overwritten in place. It records the full calendar date,
/// not just a weekday: a weekday would alias across downtime of a whole
/// week and silently skip that day's cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMarker {
    pub year: i32,
    pub ordinal: u16,
    pub finished: bool,
}

impl ExecutionMarker {
    pub fn for_day(now: OffsetDateTime, finished: bool) -> Self {
        Self {
            year: now.year(),
            ordinal: now.ordinal(),
            finished,
        }
    }

    /// Whether this record was written on `now`'s calendar day. The default
    /// (ordinal 0) matches no real date.
    fn covers(&self, now: OffsetDateTime) -> bool {
        self.year == now.year() && self.ordinal == now.ordinal()
    }
}

pub struct ExecutionWindowGuard {
    schedule: Vec<ScheduleDay>,
    store: MarkerStore<ExecutionMarker>,
    marker: ExecutionMarker,
}

/// Weekday code for a timestamp, Monday = 0.
pub fn weekday_code(now: OffsetDateTime) -> u8 {
    now.weekday().number_days_from_monday()
}

impl ExecutionWindowGuard {
    /// The in-memory marker is a cache of the durable record, refreshed
    /// here at startup.
    pub fn new(schedule: Vec<ScheduleDay>, store: MarkerStore<ExecutionMarker>) -> Self {
        let marker = store.load();
        Self {
            schedule,
            store,
            marker,
        }
    }

    fn day_for(&self, code: u8) -> Result<&ScheduleDay, GuardError> {
        self.schedule
            .iter()
            .find(|d| d.weekday_code == code)
            .ok_or(GuardError::NoScheduleForDay(code))
    }

    /// Reset the marker for a new day. Writes only when the stored date
    /// differs from today's, so repeated calls within one day are no-ops.
    pub fn roll_day(&mut self, now: OffsetDateTime) -> Result<(), GuardError> {
        if !self.marker.covers(now) {
            let fresh = ExecutionMarker::for_day(now, false);
            self.store.save(&fresh)?;
            info!(date = %now.date(), "day rolled over, execution marker reset");
            self.marker = fresh;
        }
        Ok(())
    }

    /// Whether a cycle may start now. Pure read — never touches the marker.
    pub fn is_due(&self, now: OffsetDateTime) -> Result<bool, GuardError> {
        let today = weekday_code(now);
        let day = self.day_for(today)?;

        let window_open = day.start_hour < now.hour()
            || (day.start_hour == now.hour() && day.start_minute <= now.minute());
        let finished_today = self.marker.finished && self.marker.covers(now);

        Ok(window_open && day.enabled && !finished_today)
    }

    /// Record that today's cycle ran to completion.
    pub fn mark_finished(&mut self, now: OffsetDateTime) -> Result<(), GuardError> {
        let done = ExecutionMarker::for_day(now, true);
        self.store.save(&done)?;
        self.marker = done;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
