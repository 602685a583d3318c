//! Forecast-adjusted water demand. Reference evapotranspiration (ET0) is
//! estimated per forecast sample with the Hargreaves equation driven by the
//! FAO-56 solar geometry (Allen et al 1998, equations 21/23/24/25/52), then
//! folded into each zone's baseline demand together with expected rain.

use std::f64::consts::PI;

/// Solar constant in MJ m-2 min-1 (FAO-56).
const SOLAR_CONSTANT: f64 = 0.0820;

/// Rain is only credited against demand when the forecast is this confident.
const RAIN_PROBABILITY_CUTOFF: f64 = 0.8;

/// Per-zone water demand in mm/m² (1 mm/m² = 1 litre per m²).
#[derive(Debug, Clone, PartialEq)]
pub struct WaterDemand {
    pub index: u32,
    pub amount_mm: f64,
    pub enabled: bool,
}

/// One parsed forecast entry. Immutable once constructed; consumed each
/// tick and discarded.
#[derive(Debug, Clone)]
pub struct ForecastSample {
    /// Whole days between now and the forecast timestamp.
    pub day_offset: i32,
    pub temp_min: f64,
    pub temp_max: f64,
    pub day_length_hours: f64,
    /// Degrees north.
    pub latitude: f64,
    pub day_of_year: u16,
    /// Probability of precipitation, 0.0–1.0.
    pub precipitation_probability: f64,
    /// Forecast rain amount in mm, when the provider reports one.
    pub precipitation_mm: Option<f64>,
}

/// Solar declination [radians] from day of the year (FAO eq. 24).
fn solar_declination(day_of_year: u16) -> f64 {
    0.409 * ((2.0 * PI / 365.0) * f64::from(day_of_year) - 1.39).sin()
}

/// Sunset hour angle [radians] from latitude and declination (FAO eq. 25).
/// The cosine argument is clamped to [-1, 1] so extreme latitudes and
/// seasons (polar day/night) stay inside the acos domain.
fn sunset_hour_angle(latitude_rad: f64, declination: f64) -> f64 {
    let cos_sha = -latitude_rad.tan() * declination.tan();
    cos_sha.clamp(-1.0, 1.0).acos()
}

/// Inverse relative earth–sun distance from day of the year (FAO eq. 23).
fn inv_rel_dist_earth_sun(day_of_year: u16) -> f64 {
    1.0 + 0.033 * ((2.0 * PI / 365.0) * f64::from(day_of_year)).cos()
}

/// Daily extraterrestrial radiation [MJ m-2 day-1] (FAO eq. 21).
fn extraterrestrial_radiation(latitude_rad: f64, day_of_year: u16) -> f64 {
    let declination = solar_declination(day_of_year);
    let sha = sunset_hour_angle(latitude_rad, declination);
    let ird = inv_rel_dist_earth_sun(day_of_year);
    let geometry = sha * latitude_rad.sin() * declination.sin()
        + latitude_rad.cos() * declination.cos() * sha.sin();
    (24.0 * 60.0 / PI) * SOLAR_CONSTANT * ird * geometry
}

/// Reference evapotranspiration over grass [mm day-1] via Hargreaves
/// (FAO eq. 52), forced non-negative. The 0.408 factor converts radiation
/// from MJ m-2 day-1 to equivalent evaporation.
pub fn reference_et0(sample: &ForecastSample) -> f64 {
    let latitude_rad = sample.latitude.to_radians();
    let radiation = extraterrestrial_radiation(latitude_rad, sample.day_of_year);
    let temp_mean = (sample.temp_min + sample.temp_max) / 2.0;
    let spread = (sample.temp_min - sample.temp_max).abs().sqrt();
    let et0 = 0.0023 * (temp_mean + 17.8) * spread * radiation * 0.408;
    et0.max(0.0)
}

/// Fold one forecast sample into a zone's baseline demand: add the
/// estimated evapotranspiration, subtract confidently-forecast rain.
///
/// The net demand can legitimately go negative — that means the rain covers
/// the loss and the zone needs no watering, not that an error occurred.
pub fn adjust_demand(base: &mut WaterDemand, sample: &ForecastSample) {
    let et0 = reference_et0(sample);
    base.amount_mm += et0;

    if sample.precipitation_probability >= RAIN_PROBABILITY_CUTOFF {
        if let Some(rain_mm) = sample.precipitation_mm {
            base.amount_mm -= rain_mm;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ForecastSample {
        ForecastSample {
            day_offset: 0,
            temp_min: 12.0,
            temp_max: 24.0,
            day_length_hours: 14.0,
            latitude: 51.10749,
            day_of_year: 180,
            precipitation_probability: 0.0,
            precipitation_mm: None,
        }
    }

    fn demand() -> WaterDemand {
        WaterDemand {
            index: 1,
            amount_mm: 10.0,
            enabled: true,
        }
    }

    // -- solar geometry -----------------------------------------------------

    #[test]
    fn declination_peaks_near_solstices() {
        // Max positive declination near the June solstice (~0.409 rad).
        let summer = solar_declination(172);
        assert!((summer - 0.409).abs() < 0.01, "got {summer}");
        // Strongly negative near the December solstice.
        assert!(solar_declination(355) < -0.40);
    }

    #[test]
    fn sunset_hour_angle_clamps_polar_night() {
        // 80°N in midwinter: cos(sha) > 1 without clamping.
        let lat = 80.0_f64.to_radians();
        let sha = sunset_hour_angle(lat, solar_declination(355));
        assert!(sha.is_finite());
        assert_eq!(sha, 0.0); // sun never rises
    }

    #[test]
    fn sunset_hour_angle_clamps_polar_day() {
        let lat = 80.0_f64.to_radians();
        let sha = sunset_hour_angle(lat, solar_declination(172));
        assert!((sha - PI).abs() < 1e-9); // sun never sets
    }

    #[test]
    fn inverse_distance_oscillates_around_one() {
        // Perihelion in early January, aphelion in early July.
        assert!(inv_rel_dist_earth_sun(3) > 1.03);
        assert!(inv_rel_dist_earth_sun(185) < 0.97);
        for doy in [1u16, 90, 180, 270, 365] {
            let ird = inv_rel_dist_earth_sun(doy);
            assert!((0.96..=1.04).contains(&ird), "doy {doy}: {ird}");
        }
    }

    #[test]
    fn radiation_positive_at_temperate_summer() {
        let ra = extraterrestrial_radiation(51.1_f64.to_radians(), 180);
        // FAO tables put mid-latitude summer Ra around 40 MJ m-2 day-1.
        assert!((30.0..=45.0).contains(&ra), "got {ra}");
    }

    // -- Hargreaves ---------------------------------------------------------

    #[test]
    fn et0_is_non_negative_for_either_temperature_order() {
        let mut s = sample();
        assert!(reference_et0(&s) >= 0.0);

        std::mem::swap(&mut s.temp_min, &mut s.temp_max);
        assert!(reference_et0(&s) >= 0.0);
    }

    #[test]
    fn et0_non_negative_in_extreme_cold() {
        let s = ForecastSample {
            temp_min: -40.0,
            temp_max: -25.0,
            day_of_year: 10,
            ..sample()
        };
        assert!(reference_et0(&s) >= 0.0);
    }

    #[test]
    fn et0_plausible_for_temperate_summer_day() {
        // Hargreaves for a warm mid-latitude day lands in single-digit mm.
        let et0 = reference_et0(&sample());
        assert!((1.0..=10.0).contains(&et0), "got {et0}");
    }

    #[test]
    fn et0_zero_temperature_spread_gives_zero() {
        let s = ForecastSample {
            temp_min: 18.0,
            temp_max: 18.0,
            ..sample()
        };
        assert_eq!(reference_et0(&s), 0.0);
    }

    // -- adjust_demand ------------------------------------------------------

    #[test]
    fn adjustment_adds_evapotranspiration() {
        let mut d = demand();
        let s = sample();
        adjust_demand(&mut d, &s);
        assert!((d.amount_mm - (10.0 + reference_et0(&s))).abs() < 1e-12);
    }

    #[test]
    fn confident_rain_is_subtracted() {
        let mut d = demand();
        let s = ForecastSample {
            precipitation_probability: 0.9,
            precipitation_mm: Some(8.0),
            ..sample()
        };
        let expected = 10.0 + reference_et0(&s) - 8.0;
        adjust_demand(&mut d, &s);
        assert!((d.amount_mm - expected).abs() < 1e-12);
    }

    #[test]
    fn uncertain_rain_is_ignored() {
        let mut d = demand();
        let s = ForecastSample {
            precipitation_probability: 0.5,
            precipitation_mm: Some(8.0),
            ..sample()
        };
        adjust_demand(&mut d, &s);
        assert!(d.amount_mm > 10.0);
    }

    #[test]
    fn confident_rain_without_amount_is_ignored() {
        let mut d = demand();
        let s = ForecastSample {
            precipitation_probability: 1.0,
            precipitation_mm: None,
            ..sample()
        };
        adjust_demand(&mut d, &s);
        assert!(d.amount_mm >= 10.0);
    }

    #[test]
    fn heavy_rain_drives_demand_negative() {
        let mut d = demand();
        let s = ForecastSample {
            precipitation_probability: 1.0,
            precipitation_mm: Some(100.0),
            ..sample()
        };
        adjust_demand(&mut d, &s);
        // Negative net demand means "skip watering", not an error.
        assert!(d.amount_mm < 0.0);
    }
}
