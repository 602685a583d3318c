//! OpenWeatherMap forecast collaborator. Fetches the 5-day/3-hour forecast
//! (limited to the next two entries) and maps each entry into a
//! `ForecastSample` for the forecast engine.
//!
//! Failures here are always transient: the control loop logs them and falls
//! back to the configured base demand for the tick.

use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use time::OffsetDateTime;

use crate::forecast::ForecastSample;

const OWM_URL: &str = "http://api.openweathermap.org/data/2.5/forecast";

/// Forecast entries fetched per refresh.
const FORECAST_COUNT: u8 = 2;

/// Typical day length in hours by month, used when the payload carries no
/// sunrise/sunset pair.
const DAY_LENGTH_BY_MONTH: [f64; 12] = [
    8.0, 9.2, 11.0, 13.0, 15.0, 16.5, 16.4, 15.4, 13.7, 11.7, 10.0, 8.3,
];

/// Supplies parsed forecast samples for the device's location.
pub trait WeatherProvider {
    fn fetch(&self) -> impl std::future::Future<Output = Result<Vec<ForecastSample>>>;
}

// ---------------------------------------------------------------------------
// OWM payload shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct ForecastResponse {
    list: Vec<ForecastEntry>,
    city: Option<CityBlock>,
}

#[derive(Debug, Deserialize)]
struct ForecastEntry {
    dt: i64,
    main: MainBlock,
    #[serde(default)]
    pop: f64,
    rain: Option<RainBlock>,
}

#[derive(Debug, Deserialize)]
struct MainBlock {
    temp_min: f64,
    temp_max: f64,
}

#[derive(Debug, Deserialize)]
struct RainBlock {
    #[serde(rename = "3h")]
    three_hour_mm: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CityBlock {
    sunrise: Option<i64>,
    sunset: Option<i64>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct OwmClient {
    http: reqwest::Client,
    api_key: String,
    latitude: f64,
    longitude: f64,
}

impl OwmClient {
    pub fn new(api_key: String, latitude: f64, longitude: f64) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            latitude,
            longitude,
        }
    }
}

impl WeatherProvider for OwmClient {
    async fn fetch(&self) -> Result<Vec<ForecastSample>> {
        let response = self
            .http
            .get(OWM_URL)
            .query(&[
                ("lat", self.latitude.to_string()),
                ("lon", self.longitude.to_string()),
                ("appid", self.api_key.clone()),
                ("cnt", FORECAST_COUNT.to_string()),
                ("units", "metric".to_string()),
            ])
            .send()
            .await
            .context("weather request failed")?;

        let status = response.status();
        ensure!(
            status.is_success(),
            "weather API returned {status} — check the API key"
        );

        let payload: ForecastResponse = response
            .json()
            .await
            .context("weather payload was not valid forecast JSON")?;

        let now_unix = OffsetDateTime::now_utc().unix_timestamp();
        Ok(samples_from_response(payload, self.latitude, now_unix))
    }
}

/// Map the raw payload into forecast samples. Split from the HTTP path so
/// payload handling is testable without a network.
pub(crate) fn samples_from_response(
    payload: ForecastResponse,
    latitude: f64,
    now_unix: i64,
) -> Vec<ForecastSample> {
    let day_length_from_city = payload.city.as_ref().and_then(|c| match (c.sunrise, c.sunset) {
        (Some(rise), Some(set)) if set > rise => Some((set - rise) as f64 / 3600.0),
        _ => None,
    });

    payload
        .list
        .into_iter()
        .filter_map(|entry| {
            let when = OffsetDateTime::from_unix_timestamp(entry.dt).ok()?;
            let day_length_hours = day_length_from_city
                .unwrap_or_else(|| DAY_LENGTH_BY_MONTH[when.month() as usize - 1]);

            Some(ForecastSample {
                day_offset: ((entry.dt - now_unix) / 86_400) as i32,
                temp_min: entry.main.temp_min,
                temp_max: entry.main.temp_max,
                day_length_hours,
                latitude,
                day_of_year: when.ordinal(),
                precipitation_probability: entry.pop,
                precipitation_mm: entry.rain.and_then(|r| r.three_hour_mm),
            })
        })
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
