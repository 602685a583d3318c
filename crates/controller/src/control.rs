//! The control loop: one tick walks Idle → Sampling → Evaluating →
//! Watering → PersistSleep and back, with Recovering as the only way out.
//!
//! ```text
//! Idle ──tick──▶ Sampling ──▶ Evaluating ──[moisture low or due]──▶ Watering
//!   ▲                             │                                    │
//!   │                             └──[neither]──▶ PersistSleep ◀───────┘
//!   └───────────────[tick_interval elapsed]───────────┘
//!
//! Watering ──[stuck valve / repeated activation failure]──▶ Recovering
//! ```
//!
//! Recovering never returns control: all valves are forced off and the
//! process exits so the supervisor restart becomes the recovery path. The
//! persisted markers put the next boot back where this one stopped.

use std::time::Duration;

use thiserror::Error;
use time::{OffsetDateTime, UtcOffset};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::forecast::{self, WaterDemand};
use crate::guard::{ExecutionWindowGuard, GuardError};
use crate::notify::NotificationRouter;
use crate::sensor::{self, MoistureProbe, SensorCalibrationConfig};
use crate::valve::{ValveDriver, ValveError, ValveSequencer};
use crate::weather::WeatherProvider;

/// Re-sample attempts after each valve's soak interval.
const MOISTURE_RECHECK_ATTEMPTS: u32 = 5;

/// Consecutive activation failures tolerated before the device is reset.
const MAX_ACTIVATION_FAILURES: u32 = 3;

/// Hazards that force the Recovering transition: all valves off, then a
/// full restart. Resume comes from the persisted markers, not from memory.
#[derive(Debug, Error)]
pub enum FatalFault {
    #[error("valve {index} is stuck on after deactivation")]
    StuckValve { index: u32 },
    #[error("valve {index} failed to activate {MAX_ACTIVATION_FAILURES} ticks in a row")]
    RepeatedActivationFailure { index: u32 },
}

/// Timing knobs for one tick, pre-converted to `Duration`s.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub tick_interval: Duration,
    pub sample_count: u32,
    pub sample_interval: Duration,
    pub valve_on: Duration,
    pub soak: Duration,
    pub utc_offset: UtcOffset,
}

/// What one tick did, for logging and the notification summary.
#[derive(Debug, Default)]
pub struct TickReport {
    pub moisture_pct: Option<f64>,
    pub due: bool,
    pub watered: Vec<u32>,
    pub cycle_completed: bool,
}

pub struct ControlLoop<P, D, W>
where
    P: MoistureProbe,
    D: ValveDriver,
    W: WeatherProvider,
{
    cfg: LoopConfig,
    calibration: SensorCalibrationConfig,
    /// Per-zone baselines; cloned at the start of each tick so forecast
    /// adjustments never accumulate across ticks.
    base_demands: Vec<WaterDemand>,
    probe: P,
    sequencer: ValveSequencer<D>,
    guard: ExecutionWindowGuard,
    weather: Option<W>,
    router: NotificationRouter,
    consecutive_activation_failures: u32,
}

impl<P, D, W> ControlLoop<P, D, W>
where
    P: MoistureProbe,
    D: ValveDriver,
    W: WeatherProvider,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: LoopConfig,
        calibration: SensorCalibrationConfig,
        base_demands: Vec<WaterDemand>,
        probe: P,
        sequencer: ValveSequencer<D>,
        guard: ExecutionWindowGuard,
        weather: Option<W>,
        router: NotificationRouter,
    ) -> Self {
        Self {
            cfg,
            calibration,
            base_demands,
            probe,
            sequencer,
            guard,
            weather,
            router,
            consecutive_activation_failures: 0,
        }
    }

    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.cfg.utc_offset)
    }

    /// Run ticks until a fatal fault forces Recovering. Returns the fault
    /// after all valves have been forced off; the caller restarts the
    /// process.
    pub async fn run(&mut self) -> FatalFault {
        info!(
            valves = self.sequencer.valve_count(),
            tick_sec = self.cfg.tick_interval.as_secs(),
            channels = self.router.channel_count(),
            "control loop started"
        );
        self.router.broadcast("irrigation controller started").await;

        loop {
            match self.tick().await {
                Ok(report) => debug!(?report, "tick complete"),
                Err(fault) => {
                    // Recovering: unconditional all-off before restart.
                    error!("fatal device fault: {fault}");
                    self.sequencer.all_off();
                    self.router
                        .broadcast(&format!("FATAL: {fault} — all valves forced off, restarting"))
                        .await;
                    return fault;
                }
            }
            sleep(self.cfg.tick_interval).await;
        }
    }

    /// One full tick. Everything short of a fatal device fault is handled
    /// inside: transient and configuration errors degrade and log.
    pub async fn tick(&mut self) -> Result<TickReport, FatalFault> {
        let now = self.now();

        // ── Sampling ─────────────────────────────────────────────────
        let moisture_pct = match self.sample_moisture().await {
            Ok(pct) => Some(pct),
            Err(e) => {
                warn!("moisture sampling failed, skipping threshold check: {e:#}");
                None
            }
        };
        if let Some(pct) = moisture_pct {
            self.router.publish_moisture(pct).await;
        }
        let demands = self.adjusted_demands().await;

        // ── Evaluating ───────────────────────────────────────────────
        if let Err(e) = self.guard.roll_day(now) {
            warn!("day rollover not persisted: {e:#}");
        }
        let due = match self.guard.is_due(now) {
            Ok(due) => due,
            Err(GuardError::NoScheduleForDay(code)) => {
                warn!(weekday = code, "no schedule entry for today — treating tick as not due");
                false
            }
            Err(e) => {
                warn!("guard evaluation failed — treating tick as not due: {e:#}");
                false
            }
        };
        let moisture_low = moisture_pct
            .map(|pct| pct <= self.calibration.water_threshold_pct)
            .unwrap_or(false);

        let mut report = TickReport {
            moisture_pct,
            due,
            ..TickReport::default()
        };

        // ── Watering ─────────────────────────────────────────────────
        if moisture_low || due {
            let eligible: Vec<WaterDemand> = demands
                .into_iter()
                .filter(|d| d.enabled && d.amount_mm > 0.0)
                .collect();

            if eligible.is_empty() {
                // Rain covers the demand (or all zones disabled) — a skip,
                // not an error.
                info!("no zone has positive net demand — skipping watering");
            } else {
                self.water_cycle(&eligible, &mut report).await?;
            }
        }

        // ── PersistSleep (commit + notify; the sleep lives in run) ───
        if report.cycle_completed && !report.watered.is_empty() {
            if let Err(e) = self.guard.mark_finished(now) {
                warn!("could not persist finished marker: {e:#}");
            }
        }
        self.router.broadcast(&summary(&report)).await;

        Ok(report)
    }

    /// Take N raw probe samples at the configured interval, average them,
    /// and calibrate to a percentage.
    async fn sample_moisture(&mut self) -> anyhow::Result<f64> {
        let mut raws = Vec::with_capacity(self.cfg.sample_count as usize);
        for i in 0..self.cfg.sample_count {
            raws.push(f64::from(self.probe.read_raw()?));
            if i + 1 < self.cfg.sample_count {
                sleep(self.cfg.sample_interval).await;
            }
        }

        let raw_average = sensor::average(&raws)?;
        let pct = sensor::map_to_percentage(
            raw_average,
            self.calibration.dry_raw,
            self.calibration.wet_raw,
        );
        debug!(
            raw_average = format!("{raw_average:.1}"),
            moisture_pct = format!("{pct:.1}"),
            "moisture sampled"
        );
        Ok(pct)
    }

    /// Clone the baselines and fold in the freshest forecast sample. Any
    /// weather failure is transient: log and fall back to base demand.
    async fn adjusted_demands(&self) -> Vec<WaterDemand> {
        let mut demands = self.base_demands.clone();
        let Some(weather) = &self.weather else {
            return demands;
        };

        match weather.fetch().await {
            Ok(samples) => match samples.first() {
                Some(sample) => {
                    for demand in &mut demands {
                        forecast::adjust_demand(demand, sample);
                    }
                    debug!(
                        et0 = format!("{:.2}", forecast::reference_et0(sample)),
                        pop = sample.precipitation_probability,
                        "forecast adjustment applied"
                    );
                }
                None => warn!("weather returned no samples — using base demand"),
            },
            Err(e) => warn!("weather fetch failed — using base demand: {e:#}"),
        }
        demands
    }

    /// Drive the valve sequence: each eligible zone gets one pulse, then a
    /// soak and a bounded moisture re-check. The cycle stops early once
    /// moisture recovers above the threshold.
    async fn water_cycle(
        &mut self,
        eligible: &[WaterDemand],
        report: &mut TickReport,
    ) -> Result<(), FatalFault> {
        // Only these zones' valves may open this tick; the sequencer skips
        // the rest so the round-robin position cannot hand the pulse to a
        // disabled or rain-covered zone.
        let targets: Vec<u32> = eligible.iter().map(|d| d.index).collect();
        info!(zones = targets.len(), "starting watering cycle");

        for _ in &targets {
            let index = match self.sequencer.activate_next(&targets) {
                Ok(index) => {
                    self.consecutive_activation_failures = 0;
                    index
                }
                Err(ValveError::ActivationFailed { index, source }) => {
                    self.consecutive_activation_failures += 1;
                    error!(
                        valve = index,
                        consecutive = self.consecutive_activation_failures,
                        "activation failed: {source}"
                    );
                    // Emergency de-assert; the unfinished marker retries
                    // this index next tick.
                    self.sequencer.all_off();
                    if self.consecutive_activation_failures >= MAX_ACTIVATION_FAILURES {
                        return Err(FatalFault::RepeatedActivationFailure { index });
                    }
                    return Ok(());
                }
                Err(e) => {
                    error!("sequencer state not persisted, aborting cycle: {e:#}");
                    self.sequencer.all_off();
                    return Ok(());
                }
            };
            report.watered.push(index);

            sleep(self.cfg.valve_on).await;

            match self.sequencer.deactivate(index) {
                Ok(()) => {}
                Err(ValveError::StuckValve { index }) => {
                    return Err(FatalFault::StuckValve { index });
                }
                Err(e) => {
                    error!("deactivation bookkeeping failed, aborting cycle: {e:#}");
                    self.sequencer.all_off();
                    return Ok(());
                }
            }

            if self.moisture_recovered().await {
                info!(valve = index, "moisture recovered — cycle complete");
                report.cycle_completed = true;
                return Ok(());
            }
        }

        // Every eligible zone got its pulse this tick.
        report.cycle_completed = true;
        Ok(())
    }

    /// Soak, then re-sample up to the retry limit. True once the reading
    /// climbs above the watering threshold.
    async fn moisture_recovered(&mut self) -> bool {
        sleep(self.cfg.soak).await;
        for attempt in 1..=MOISTURE_RECHECK_ATTEMPTS {
            match self.sample_moisture().await {
                Ok(pct) if pct > self.calibration.water_threshold_pct => return true,
                Ok(pct) => debug!(attempt, moisture_pct = format!("{pct:.1}"), "still below threshold"),
                Err(e) => warn!(attempt, "re-sample failed: {e:#}"),
            }
            if attempt < MOISTURE_RECHECK_ATTEMPTS {
                sleep(self.cfg.soak).await;
            }
        }
        false
    }
}

fn summary(report: &TickReport) -> String {
    let moisture = match report.moisture_pct {
        Some(pct) => format!("{pct:.1}%"),
        None => "unknown".to_string(),
    };
    if report.watered.is_empty() {
        format!("tick: moisture {moisture}, due={}, no watering", report.due)
    } else {
        format!(
            "tick: moisture {moisture}, due={}, watered valves {:?}, completed={}",
            report.due, report.watered, report.cycle_completed
        )
    }
}

// ===========================================================================
// Tests
// ===========================================================================
