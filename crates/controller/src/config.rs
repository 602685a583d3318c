//! TOML config file loading and validation. All runtime knobs are named,
//! statically-typed fields; a bad value is reported at load time with every
//! violation listed, never discovered mid-tick.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;

use crate::forecast::WaterDemand;
use crate::guard::ScheduleDay;
use crate::sensor::SensorCalibrationConfig;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    pub controller: ControllerConfig,
    pub calibration: SensorCalibrationConfig,
    pub location: LocationConfig,
    #[serde(default)]
    pub weather: Option<WeatherConfig>,
    #[serde(default)]
    pub schedule: Vec<ScheduleDay>,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub slack: Option<SlackConfig>,
    #[serde(default)]
    pub ubidots: Option<UbidotsConfig>,
    #[serde(default)]
    pub persist: PersistConfig,
}

#[derive(Debug, Deserialize)]
pub struct ControllerConfig {
    pub tick_interval_sec: u64,
    pub sample_count: u32,
    pub sample_interval_ms: u64,
    pub valve_on_sec: u64,
    pub soak_sec: u64,
    /// Fixed offset applied to UTC when evaluating the schedule; the
    /// device has no timezone database.
    #[serde(default)]
    pub utc_offset_hours: i8,
}

#[derive(Debug, Deserialize)]
pub struct LocationConfig {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Deserialize)]
pub struct WeatherConfig {
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
pub struct ZoneEntry {
    pub index: u32,
    pub base_demand_mm: f64,
    pub enabled: bool,
    pub gpio_pin: u8,
}

#[derive(Debug, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub topic: String,
}

#[derive(Debug, Deserialize)]
pub struct SlackConfig {
    pub webhook_url: String,
}

#[derive(Debug, Deserialize)]
pub struct UbidotsConfig {
    pub token: String,
    pub device: String,
}

#[derive(Debug, Deserialize)]
pub struct PersistConfig {
    pub state_dir: PathBuf,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
        }
    }
}

fn default_mqtt_port() -> u16 {
    1883
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_controller(&mut errors);
        self.validate_calibration(&mut errors);
        self.validate_location(&mut errors);
        self.validate_schedule(&mut errors);
        self.validate_zones(&mut errors);
        self.validate_transports(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_controller(&self, errors: &mut Vec<String>) {
        let c = &self.controller;
        if c.tick_interval_sec == 0 {
            errors.push("controller: tick_interval_sec must be positive".into());
        }
        if c.sample_count == 0 {
            errors.push("controller: sample_count must be positive".into());
        }
        if c.valve_on_sec == 0 {
            errors.push("controller: valve_on_sec must be positive".into());
        }
        if c.soak_sec == 0 {
            errors.push("controller: soak_sec must be positive".into());
        }
        if !(-12..=14).contains(&c.utc_offset_hours) {
            errors.push(format!(
                "controller: utc_offset_hours {} out of range [-12, 14]",
                c.utc_offset_hours
            ));
        }
    }

    fn validate_calibration(&self, errors: &mut Vec<String>) {
        let cal = &self.calibration;
        if cal.dry_raw == cal.wet_raw {
            errors.push(format!(
                "calibration: dry_raw and wet_raw are both {} — calibration range is zero",
                cal.dry_raw
            ));
        }
        if !(0.0..=100.0).contains(&cal.water_threshold_pct) {
            errors.push(format!(
                "calibration: water_threshold_pct {} out of range [0, 100]",
                cal.water_threshold_pct
            ));
        }
    }

    fn validate_location(&self, errors: &mut Vec<String>) {
        if !(-90.0..=90.0).contains(&self.location.latitude) {
            errors.push(format!(
                "location: latitude {} out of range [-90, 90]",
                self.location.latitude
            ));
        }
        if !(-180.0..=180.0).contains(&self.location.longitude) {
            errors.push(format!(
                "location: longitude {} out of range [-180, 180]",
                self.location.longitude
            ));
        }
    }

    fn validate_schedule(&self, errors: &mut Vec<String>) {
        let mut seen_days: HashSet<u8> = HashSet::new();

        for (i, d) in self.schedule.iter().enumerate() {
            if d.weekday_code > 6 {
                errors.push(format!(
                    "schedule[{i}]: weekday_code {} out of range 0-6 (Monday = 0)",
                    d.weekday_code
                ));
            } else if !seen_days.insert(d.weekday_code) {
                errors.push(format!(
                    "schedule[{i}]: duplicate entry for weekday_code {}",
                    d.weekday_code
                ));
            }
            if d.start_hour > 23 {
                errors.push(format!(
                    "schedule[{i}]: start_hour {} out of range 0-23",
                    d.start_hour
                ));
            }
            if d.start_minute > 59 {
                errors.push(format!(
                    "schedule[{i}]: start_minute {} out of range 0-59",
                    d.start_minute
                ));
            }
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        if self.zones.is_empty() {
            errors.push("zones: at least one zone must be configured".into());
            return;
        }

        let count = self.zones.len() as u32;
        let mut seen_indices: HashSet<u32> = HashSet::new();
        let mut seen_pins: HashSet<u8> = HashSet::new();

        for z in &self.zones {
            let ctx = format!("zone {}", z.index);

            if z.index == 0 || z.index > count {
                errors.push(format!(
                    "{ctx}: index must be in 1..={count} with no gaps"
                ));
            } else if !seen_indices.insert(z.index) {
                errors.push(format!("{ctx}: duplicate index"));
            }

            if !z.base_demand_mm.is_finite() || z.base_demand_mm < 0.0 {
                errors.push(format!(
                    "{ctx}: base_demand_mm {} must be a non-negative number",
                    z.base_demand_mm
                ));
            }

            if !VALID_GPIO_PINS.contains(&z.gpio_pin) {
                errors.push(format!(
                    "{ctx}: gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    z.gpio_pin
                ));
            } else if !seen_pins.insert(z.gpio_pin) {
                errors.push(format!(
                    "{ctx}: gpio_pin {} is already used by another zone",
                    z.gpio_pin
                ));
            }
        }
    }

    fn validate_transports(&self, errors: &mut Vec<String>) {
        if let Some(w) = &self.weather {
            if w.api_key.trim().is_empty() {
                errors.push("weather: api_key is empty".into());
            }
        }
        if let Some(m) = &self.mqtt {
            if m.host.trim().is_empty() {
                errors.push("mqtt: host is empty".into());
            }
            if m.topic.trim().is_empty() {
                errors.push("mqtt: topic is empty".into());
            }
        }
        if let Some(s) = &self.slack {
            if !s.webhook_url.starts_with("https://") {
                errors.push(format!(
                    "slack: webhook_url '{}' must be an https URL",
                    s.webhook_url
                ));
            }
        }
        if let Some(u) = &self.ubidots {
            if u.token.trim().is_empty() {
                errors.push("ubidots: token is empty".into());
            }
            if u.device.trim().is_empty() {
                errors.push("ubidots: device is empty".into());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Derived views
    // -----------------------------------------------------------------------

    /// Baseline per-zone demands, ordered by valve index.
    pub fn base_demands(&self) -> Vec<WaterDemand> {
        let mut demands: Vec<WaterDemand> = self
            .zones
            .iter()
            .map(|z| WaterDemand {
                index: z.index,
                amount_mm: z.base_demand_mm,
                enabled: z.enabled,
            })
            .collect();
        demands.sort_by_key(|d| d.index);
        demands
    }

    /// GPIO pin for each valve, ordered by valve index.
    pub fn gpio_pins(&self) -> Vec<u8> {
        let mut zones: Vec<&ZoneEntry> = self.zones.iter().collect();
        zones.sort_by_key(|z| z.index);
        zones.iter().map(|z| z.gpio_pin).collect()
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
