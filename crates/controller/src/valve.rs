//! Valve sequencing with crash-safe persisted state. Valves are activated
//! one at a time in round-robin order over indices `1..=valve_count`; the
//! durable `ValveMarker` is written *before* each physical assertion so the
//! observed output state after a crash is always at or behind the record,
//! and a reboot mid-cycle resumes at the interrupted valve.
//!
//! The physical outputs sit behind `ValveDriver`; the `gpio` feature gates
//! the real rppal board, and a mock board logs state changes without it.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::persist::{MarkerStore, PersistError};

#[derive(Debug, Error)]
#[error("valve driver fault: {0}")]
pub struct DriverError(pub String);

#[derive(Debug, Error)]
pub enum ValveError {
    /// The output could not be asserted. Fatal for the current tick; the
    /// control loop must attempt an emergency all-off.
    #[error("failed to activate valve {index}: {source}")]
    ActivationFailed {
        index: u32,
        #[source]
        source: DriverError,
    },
    /// The output still reads ON after a successful de-assert — a flooding
    /// hazard, escalated to a device reset.
    #[error("valve {index} still reads on after deactivation")]
    StuckValve { index: u32 },
    /// None of this tick's eligible zones maps to a valve index.
    #[error("no eligible valve to activate")]
    NoEligibleValve,
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Physical valve outputs. `set` asserts or de-asserts one output; `read`
/// reports the output's current level for stuck-valve verification.
pub trait ValveDriver {
    fn set(&mut self, index: u32, on: bool) -> Result<(), DriverError>;
    fn read(&self, index: u32) -> bool;
}

/// Persisted "which valve did I last start" record. `finished = false` on
/// read means the sequencer was interrupted and must resume (not restart)
/// at `last_valve_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValveMarker {
    pub last_valve_index: u32,
    pub finished: bool,
}

impl Default for ValveMarker {
    /// No prior state: the sequence starts at index 1.
    fn default() -> Self {
        Self {
            last_valve_index: 0,
            finished: true,
        }
    }
}

pub struct ValveSequencer<D: ValveDriver> {
    valve_count: u32,
    driver: D,
    store: MarkerStore<ValveMarker>,
    marker: ValveMarker,
    /// Per-valve asserted flags for this process lifetime (index 1 maps to
    /// slot 0). Reset on reboot — durable truth lives in the marker.
    asserted: Vec<bool>,
}

impl<D: ValveDriver> ValveSequencer<D> {
    pub fn new(driver: D, valve_count: u32, store: MarkerStore<ValveMarker>) -> Self {
        let mut marker = store.load();
        if marker.last_valve_index > valve_count {
            warn!(
                last_valve_index = marker.last_valve_index,
                valve_count, "valve marker out of range, starting sequence over"
            );
            marker = ValveMarker::default();
        }
        Self {
            valve_count,
            driver,
            store,
            marker,
            asserted: vec![false; valve_count as usize],
        }
    }

    pub fn valve_count(&self) -> u32 {
        self.valve_count
    }

    /// The valve the next `activate_next` call will assert, restricted to
    /// `eligible`. An interrupted activation is always resumed first,
    /// eligible or not: that valve may be physically open and must complete
    /// its pulse before the finished marker can be committed.
    fn next_target(&self, eligible: &[u32]) -> Option<u32> {
        if !self.marker.finished && self.marker.last_valve_index >= 1 {
            return Some(self.marker.last_valve_index);
        }
        let start = if self.marker.last_valve_index >= self.valve_count {
            // End of the round: wrap back to the first valve.
            0
        } else {
            self.marker.last_valve_index
        };
        (0..self.valve_count)
            .map(|step| (start + step) % self.valve_count + 1)
            .find(|index| eligible.contains(index))
    }

    /// Activate the next eligible valve in round-robin order and return its
    /// index. `eligible` carries the valve indices of the zones that may be
    /// watered this tick; the sequence position advances past the rest so a
    /// disabled or rain-covered zone is never the one physically opened.
    ///
    /// The marker is made durable before the output is asserted, so a crash
    /// between the write and the assertion is recoverable: re-entry finds
    /// the unfinished marker and retries the same index.
    pub fn activate_next(&mut self, eligible: &[u32]) -> Result<u32, ValveError> {
        let target = self
            .next_target(eligible)
            .ok_or(ValveError::NoEligibleValve)?;
        let slot = (target - 1) as usize;

        if self.asserted[slot] {
            // Already on in this process — idempotent re-entry.
            return Ok(target);
        }

        self.store.save(&ValveMarker {
            last_valve_index: target,
            finished: false,
        })?;
        self.marker = ValveMarker {
            last_valve_index: target,
            finished: false,
        };

        if let Err(e) = self.driver.set(target, true) {
            // Leave the output de-asserted; the unfinished marker lets the
            // next attempt retry this index.
            let _ = self.driver.set(target, false);
            return Err(ValveError::ActivationFailed {
                index: target,
                source: e,
            });
        }
        self.asserted[slot] = true;

        info!(valve = target, "valve activated");
        Ok(target)
    }

    /// De-assert a valve, commit the finished marker, and verify read-back.
    pub fn deactivate(&mut self, index: u32) -> Result<(), ValveError> {
        if let Err(e) = self.driver.set(index, false) {
            error!(valve = index, "de-assert failed: {e}");
            return Err(ValveError::StuckValve { index });
        }
        if let Some(slot) = self.asserted.get_mut((index - 1) as usize) {
            *slot = false;
        }

        let done = ValveMarker {
            last_valve_index: index,
            finished: true,
        };
        self.store.save(&done)?;
        self.marker = done;

        if self.driver.read(index) {
            return Err(ValveError::StuckValve { index });
        }

        info!(valve = index, "valve deactivated");
        Ok(())
    }

    /// Emergency de-assert of every output. Best-effort: individual driver
    /// failures are logged and skipped so the remaining valves still close.
    pub fn all_off(&mut self) {
        for index in 1..=self.valve_count {
            if let Err(e) = self.driver.set(index, false) {
                error!(valve = index, "emergency off failed: {e}");
            }
            self.asserted[(index - 1) as usize] = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Real GPIO valve board (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct GpioValveBoard {
    pins: Vec<rppal::gpio::OutputPin>, // slot i drives valve index i+1
    active_low: bool,                  // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl GpioValveBoard {
    pub fn new(pin_numbers: &[u8], active_low: bool) -> anyhow::Result<Self> {
        let gpio = rppal::gpio::Gpio::new()?;
        let mut pins = Vec::with_capacity(pin_numbers.len());

        for &pin_num in pin_numbers {
            let mut pin = gpio.get(pin_num)?.into_output();
            // Fail-safe: ensure "OFF" at startup
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }
            pins.push(pin);
        }

        Ok(Self { pins, active_low })
    }
}

#[cfg(feature = "gpio")]
impl ValveDriver for GpioValveBoard {
    fn set(&mut self, index: u32, on: bool) -> Result<(), DriverError> {
        let pin = self
            .pins
            .get_mut((index - 1) as usize)
            .ok_or_else(|| DriverError(format!("unknown valve index {index}")))?;
        let level_high = on != self.active_low;
        if level_high {
            pin.set_high();
        } else {
            pin.set_low();
        }
        Ok(())
    }

    fn read(&self, index: u32) -> bool {
        self.pins
            .get((index - 1) as usize)
            .map(|pin| pin.is_set_high() != self.active_low)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Mock valve board (development — no hardware, logs state changes)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "gpio"))]
pub struct MockValveBoard {
    states: Vec<bool>,
}

#[cfg(not(feature = "gpio"))]
impl MockValveBoard {
    pub fn new(valve_count: u32) -> Self {
        info!(valve_count, "mock valve board initialised (no hardware)");
        Self {
            states: vec![false; valve_count as usize],
        }
    }
}

#[cfg(not(feature = "gpio"))]
impl ValveDriver for MockValveBoard {
    fn set(&mut self, index: u32, on: bool) -> Result<(), DriverError> {
        let slot = self
            .states
            .get_mut((index - 1) as usize)
            .ok_or_else(|| DriverError(format!("unknown valve index {index}")))?;
        *slot = on;
        info!(valve = index, on, "mock valve set");
        Ok(())
    }

    fn read(&self, index: u32) -> bool {
        self.states
            .get((index - 1) as usize)
            .copied()
            .unwrap_or(false)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Scripted driver that records every assertion and can be told to
    /// fail activations or report a stuck output.
    #[derive(Default)]
    struct FakeState {
        levels: Vec<bool>,
        assert_log: Vec<u32>,
        fail_set_on: bool,
        stuck: bool,
    }

    #[derive(Clone)]
    struct FakeDriver(Rc<RefCell<FakeState>>);

    impl FakeDriver {
        fn new(valve_count: u32) -> Self {
            FakeDriver(Rc::new(RefCell::new(FakeState {
                levels: vec![false; valve_count as usize],
                ..FakeState::default()
            })))
        }
    }

    impl ValveDriver for FakeDriver {
        fn set(&mut self, index: u32, on: bool) -> Result<(), DriverError> {
            let mut st = self.0.borrow_mut();
            if on && st.fail_set_on {
                return Err(DriverError("relay refused".into()));
            }
            st.levels[(index - 1) as usize] = on;
            if on {
                st.assert_log.push(index);
            }
            Ok(())
        }

        fn read(&self, index: u32) -> bool {
            let st = self.0.borrow();
            if st.stuck {
                return true;
            }
            st.levels[(index - 1) as usize]
        }
    }

    fn sequencer_with(
        dir: &tempfile::TempDir,
        driver: FakeDriver,
        valve_count: u32,
        marker: Option<ValveMarker>,
    ) -> ValveSequencer<FakeDriver> {
        let store = MarkerStore::new(dir.path().join("valve.json"));
        if let Some(m) = marker {
            store.save(&m).unwrap();
        }
        ValveSequencer::new(driver, valve_count, store)
    }

    // -- round-robin --------------------------------------------------------

    #[test]
    fn fresh_sequence_starts_at_one() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver::new(3);
        let mut seq = sequencer_with(&dir, driver, 3, None);
        assert_eq!(seq.activate_next(&[1, 2, 3]).unwrap(), 1);
    }

    #[test]
    fn last_index_wraps_to_one_not_zero() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver::new(3);
        let mut seq = sequencer_with(
            &dir,
            driver,
            3,
            Some(ValveMarker {
                last_valve_index: 3,
                finished: true,
            }),
        );
        assert_eq!(seq.activate_next(&[1, 2, 3]).unwrap(), 1);
    }

    #[test]
    fn full_round_visits_every_valve_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver::new(3);
        let mut seq = sequencer_with(&dir, driver.clone(), 3, None);
        for expected in [1, 2, 3, 1] {
            let idx = seq.activate_next(&[1, 2, 3]).unwrap();
            assert_eq!(idx, expected);
            seq.deactivate(idx).unwrap();
        }
        assert_eq!(driver.0.borrow().assert_log, vec![1, 2, 3, 1]);
    }

    // -- crash recovery -----------------------------------------------------

    #[test]
    fn unfinished_marker_resumes_at_same_index() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver::new(4);
        // Crash happened after persisting index 2 but before/during the
        // physical assertion.
        let mut seq = sequencer_with(
            &dir,
            driver.clone(),
            4,
            Some(ValveMarker {
                last_valve_index: 2,
                finished: false,
            }),
        );
        assert_eq!(seq.activate_next(&[1, 2, 3, 4]).unwrap(), 2);
        // Exactly one physical assertion, at the resumed index.
        assert_eq!(driver.0.borrow().assert_log, vec![2]);
    }

    #[test]
    fn finished_marker_advances_to_next_index() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver::new(4);
        let mut seq = sequencer_with(
            &dir,
            driver,
            4,
            Some(ValveMarker {
                last_valve_index: 2,
                finished: true,
            }),
        );
        assert_eq!(seq.activate_next(&[1, 2, 3, 4]).unwrap(), 3);
    }

    #[test]
    fn repeated_activation_is_idempotent_in_process() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver::new(2);
        let mut seq = sequencer_with(&dir, driver.clone(), 2, None);
        assert_eq!(seq.activate_next(&[1, 2]).unwrap(), 1);
        // Second call without a deactivate: same index, no second assert.
        assert_eq!(seq.activate_next(&[1, 2]).unwrap(), 1);
        assert_eq!(driver.0.borrow().assert_log, vec![1]);
    }

    #[test]
    fn marker_is_durable_before_assertion() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver::new(2);
        let mut seq = sequencer_with(&dir, driver, 2, None);
        seq.activate_next(&[1, 2]).unwrap();

        let store: MarkerStore<ValveMarker> = MarkerStore::new(dir.path().join("valve.json"));
        assert_eq!(
            store.load(),
            ValveMarker {
                last_valve_index: 1,
                finished: false
            }
        );
    }

    #[test]
    fn out_of_range_marker_restarts_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver::new(2);
        let mut seq = sequencer_with(
            &dir,
            driver,
            2,
            Some(ValveMarker {
                last_valve_index: 9,
                finished: false,
            }),
        );
        assert_eq!(seq.activate_next(&[1, 2]).unwrap(), 1);
    }

    // -- eligibility --------------------------------------------------------

    #[test]
    fn ineligible_indices_are_passed_over() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver::new(3);
        let mut seq = sequencer_with(&dir, driver.clone(), 3, None);
        // Zone 1 is out this tick: the first pulse must land on valve 2.
        assert_eq!(seq.activate_next(&[2, 3]).unwrap(), 2);
        assert_eq!(driver.0.borrow().assert_log, vec![2]);
    }

    #[test]
    fn wrap_lands_on_first_eligible_valve() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver::new(3);
        let mut seq = sequencer_with(
            &dir,
            driver,
            3,
            Some(ValveMarker {
                last_valve_index: 3,
                finished: true,
            }),
        );
        assert_eq!(seq.activate_next(&[2]).unwrap(), 2);
    }

    #[test]
    fn interrupted_activation_resumes_even_when_no_longer_eligible() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver::new(3);
        // Valve 2 may still be physically open from before the crash; it
        // must complete its pulse whatever this tick's eligibility says.
        let mut seq = sequencer_with(
            &dir,
            driver,
            3,
            Some(ValveMarker {
                last_valve_index: 2,
                finished: false,
            }),
        );
        assert_eq!(seq.activate_next(&[1, 3]).unwrap(), 2);
    }

    #[test]
    fn no_eligible_valve_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver::new(2);
        let mut seq = sequencer_with(&dir, driver.clone(), 2, None);
        assert!(matches!(
            seq.activate_next(&[]),
            Err(ValveError::NoEligibleValve)
        ));
        assert!(driver.0.borrow().assert_log.is_empty());
    }

    // -- failures -----------------------------------------------------------

    #[test]
    fn activation_failure_deasserts_and_reports_index() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver::new(2);
        driver.0.borrow_mut().fail_set_on = true;
        let mut seq = sequencer_with(&dir, driver.clone(), 2, None);

        match seq.activate_next(&[1, 2]) {
            Err(ValveError::ActivationFailed { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected ActivationFailed, got {other:?}"),
        }
        assert!(!driver.0.borrow().levels[0]);
        // Marker stays unfinished so the next attempt retries index 1.
        driver.0.borrow_mut().fail_set_on = false;
        assert_eq!(seq.activate_next(&[1, 2]).unwrap(), 1);
    }

    #[test]
    fn deactivate_commits_finished_marker() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver::new(2);
        let mut seq = sequencer_with(&dir, driver, 2, None);
        let idx = seq.activate_next(&[1, 2]).unwrap();
        seq.deactivate(idx).unwrap();

        let store: MarkerStore<ValveMarker> = MarkerStore::new(dir.path().join("valve.json"));
        assert_eq!(
            store.load(),
            ValveMarker {
                last_valve_index: 1,
                finished: true
            }
        );
    }

    #[test]
    fn stuck_readback_raises_stuck_valve() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver::new(2);
        let mut seq = sequencer_with(&dir, driver.clone(), 2, None);
        let idx = seq.activate_next(&[1, 2]).unwrap();

        driver.0.borrow_mut().stuck = true;
        match seq.deactivate(idx) {
            Err(ValveError::StuckValve { index }) => assert_eq!(index, 1),
            other => panic!("expected StuckValve, got {other:?}"),
        }
    }

    #[test]
    fn all_off_clears_every_output() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver::new(3);
        let mut seq = sequencer_with(&dir, driver.clone(), 3, None);
        seq.activate_next(&[1, 2, 3]).unwrap();
        seq.all_off();
        assert!(driver.0.borrow().levels.iter().all(|&on| !on));
    }

    // -- mock board ---------------------------------------------------------

    #[cfg(not(feature = "gpio"))]
    #[test]
    fn mock_board_tracks_levels() {
        let mut board = MockValveBoard::new(2);
        board.set(1, true).unwrap();
        assert!(board.read(1));
        assert!(!board.read(2));
        board.set(1, false).unwrap();
        assert!(!board.read(1));
    }

    #[cfg(not(feature = "gpio"))]
    #[test]
    fn mock_board_rejects_unknown_index() {
        let mut board = MockValveBoard::new(1);
        assert!(board.set(5, true).is_err());
        assert!(!board.read(5));
    }
}
