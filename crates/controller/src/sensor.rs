//! Soil moisture sensing: raw ADC averaging and calibration to a 0–100
//! percentage. Calibration endpoints come from placing the probe in dry air
//! and in water and recording the raw readings — they vary per sensor.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SensorError {
    #[error("cannot average an empty sample set")]
    EmptySampleSet,
}

/// Dry/wet calibration endpoints and the moisture level below which
/// watering is considered.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorCalibrationConfig {
    pub dry_raw: u16,
    pub wet_raw: u16,
    pub water_threshold_pct: f64,
}

/// Arithmetic mean of raw samples. A negative mean is sensor noise floor
/// and reads as 0.
pub fn average(samples: &[f64]) -> Result<f64, SensorError> {
    if samples.is_empty() {
        return Err(SensorError::EmptySampleSet);
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    Ok(if mean < 0.0 { 0.0 } else { mean })
}

/// Linear re-map of `raw_average` from `[dry_raw, wet_raw]` onto `[0, 100]`.
///
/// Deliberately unclamped: a reading outside the calibration range maps
/// outside [0, 100] and tells the operator the sensor is miscalibrated.
pub fn map_to_percentage(raw_average: f64, dry_raw: u16, wet_raw: u16) -> f64 {
    let dry = f64::from(dry_raw);
    let wet = f64::from(wet_raw);
    (raw_average - dry) * 100.0 / (wet - dry)
}

/// Raw analog read from whatever the device wires up as its moisture probe.
pub trait MoistureProbe {
    fn read_raw(&mut self) -> anyhow::Result<u16>;
}

/// Simulated probe for development builds: raw values wander inside the
/// calibration band.
#[cfg(feature = "sim")]
pub struct SimProbe {
    dry_raw: u16,
    wet_raw: u16,
}

#[cfg(feature = "sim")]
impl SimProbe {
    pub fn new(dry_raw: u16, wet_raw: u16) -> Self {
        Self { dry_raw, wet_raw }
    }
}

#[cfg(feature = "sim")]
impl MoistureProbe for SimProbe {
    fn read_raw(&mut self) -> anyhow::Result<u16> {
        let lo = self.dry_raw.min(self.wet_raw);
        let hi = self.dry_raw.max(self.wet_raw);
        Ok(fastrand::u16(lo..=hi))
    }
}

// ---------------------------------------------------------------------------
// ADS1115 probe (production — requires rppal + I2C wiring)
// ---------------------------------------------------------------------------

/// ADS1115 16-bit ADC over I2C, read single-ended at PGA ±4.096 V, 128 SPS,
/// single-shot mode. Typical capacitive probes powered from 3.3 V land
/// around raw 800 dry and raw 400 wet at this gain.
#[cfg(feature = "gpio")]
pub struct AdcProbe {
    i2c: rppal::i2c::I2c,
    channel: usize,
}

#[cfg(feature = "gpio")]
impl AdcProbe {
    const ADDR: u16 = 0x48;
    const REG_CONVERSION: u8 = 0x00;
    const REG_CONFIG: u8 = 0x01;
    /// OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot), DR=100
    /// (128 SPS), comparator off.
    const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;
    /// MUX values for single-ended reads AIN0..AIN3 vs GND.
    const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];
    const MUX_SHIFT: u8 = 12;
    /// Conversion at 128 SPS takes ~7.8 ms; wait 9 ms for margin.
    const CONVERSION_WAIT: std::time::Duration = std::time::Duration::from_millis(9);

    /// Open I2C bus 1 for the ADS1115 at the default address. `channel`
    /// selects AIN0–AIN3.
    pub fn new(channel: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(channel <= 3, "ADS1115 channel {channel} out of range");
        let mut i2c = rppal::i2c::I2c::new()?;
        i2c.set_slave_address(Self::ADDR)?;
        Ok(Self { i2c, channel })
    }
}

#[cfg(feature = "gpio")]
impl MoistureProbe for AdcProbe {
    fn read_raw(&mut self) -> anyhow::Result<u16> {
        let config = Self::CONFIG_BASE | (Self::MUX_SINGLE_ENDED[self.channel] << Self::MUX_SHIFT);
        self.i2c
            .write(&[Self::REG_CONFIG, (config >> 8) as u8, config as u8])?;
        std::thread::sleep(Self::CONVERSION_WAIT);

        let mut buf = [0u8; 2];
        self.i2c.write_read(&[Self::REG_CONVERSION], &mut buf)?;
        let raw = i16::from_be_bytes(buf);
        // Negative counts mean the input floated below GND — clamp.
        Ok(raw.max(0) as u16)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
