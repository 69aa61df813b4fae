//! Weather lookup
//!
//! Current conditions from Open-Meteo (free, no API key required). The
//! monitor only ever shows weather as a side panel, so [`WeatherProvider::status`]
//! turns every failure into `WeatherStatus::Unavailable` instead of an error.
use crate::{Result, SosError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const CURRENT_FIELDS: &str = "temperature_2m,relative_humidity_2m,apparent_temperature,wind_speed_10m,weather_code,surface_pressure,cloud_cover,visibility,dew_point_2m,uv_index";

/// Used when no position is known.
pub const DEFAULT_LOCATION: (f64, f64) = (40.7128, -74.0060);

/// Configuration for weather provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    /// API endpoint (default: Open-Meteo)
    pub api_endpoint: String,
    /// Geocoding API endpoint
    pub geocoding_endpoint: String,
    /// Timeout for API requests in milliseconds
    pub timeout_ms: u64,
    pub user_agent: String,
    /// How often the `run` command refreshes, in seconds
    pub refresh_secs: u64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            api_endpoint: std::env::var("SOS_WEATHER_ENDPOINT")
                .unwrap_or_else(|_| "https://api.open-meteo.com/v1/forecast".to_string()),
            geocoding_endpoint: std::env::var("SOS_GEOCODING_ENDPOINT")
                .unwrap_or_else(|_| "https://geocoding-api.open-meteo.com/v1/search".to_string()),
            timeout_ms: std::env::var("SOS_WEATHER_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(10_000),
            user_agent: "sos-monitor/0.1".to_string(),
            refresh_secs: 600,
        }
    }
}

/// Current conditions at one place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    pub location: String,
    pub latitude: f64,
    pub longitude: f64,
    pub temperature_c: f64,
    pub apparent_temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub wind_speed_kmh: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub cloud_cover_pct: Option<f64>,
    pub visibility_km: Option<f64>,
    pub dew_point_c: Option<f64>,
    pub uv_index: Option<f64>,
    pub weather_code: i32,
    pub icon: String,
    pub conditions: String,
}

impl WeatherReport {
    /// One line for the terminal.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} {}: {:.0}°C, {}",
            self.icon, self.location, self.temperature_c, self.conditions
        );
        if let Some(h) = self.humidity_pct {
            line.push_str(&format!(", humidity {:.0}%", h));
        }
        if let Some(w) = self.wind_speed_kmh {
            line.push_str(&format!(", wind {:.0} km/h", w));
        }
        if let Some(uv) = self.uv_index {
            line.push_str(&format!(", UV {:.1} ({})", uv, uv_level(uv)));
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WeatherStatus {
    Available(WeatherReport),
    Unavailable(String),
}

/// Geocoding response from Open-Meteo
#[derive(Debug, Deserialize)]
struct GeocodingResponse {
    results: Option<Vec<GeoLocation>>,
}

#[derive(Debug, Deserialize)]
struct GeoLocation {
    name: String,
    latitude: f64,
    longitude: f64,
    country: Option<String>,
}

/// Weather response from Open-Meteo
#[derive(Debug, Deserialize)]
struct WeatherResponse {
    current: CurrentWeather,
}

#[derive(Debug, Deserialize)]
struct CurrentWeather {
    temperature_2m: f64,
    weather_code: i32,
    #[serde(default)]
    relative_humidity_2m: Option<f64>,
    #[serde(default)]
    apparent_temperature: Option<f64>,
    #[serde(default)]
    wind_speed_10m: Option<f64>,
    #[serde(default)]
    surface_pressure: Option<f64>,
    #[serde(default)]
    cloud_cover: Option<f64>,
    /// Meters.
    #[serde(default)]
    visibility: Option<f64>,
    #[serde(default)]
    dew_point_2m: Option<f64>,
    #[serde(default)]
    uv_index: Option<f64>,
}

pub struct WeatherProvider {
    config: WeatherConfig,
    http_client: reqwest::Client,
}

impl WeatherProvider {
    pub fn new() -> Self {
        Self::with_config(WeatherConfig::default())
    }

    pub fn with_config(config: WeatherConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(&config.user_agent)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            config,
            http_client,
        }
    }

    pub fn config(&self) -> &WeatherConfig {
        &self.config
    }

    /// Geocode location name to coordinates
    async fn geocode(&self, location: &str) -> Result<(f64, f64, String)> {
        debug!(target: "weather", location=%location, "Geocoding location");

        let response = self
            .http_client
            .get(&self.config.geocoding_endpoint)
            .query(&[
                ("name", location),
                ("count", "1"),
                ("language", "en"),
                ("format", "json"),
            ])
            .send()
            .await
            .map_err(|e| {
                warn!(target: "weather", error=%e, "Geocoding API request failed");
                SosError::WeatherError(format!("Geocoding request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(target: "weather", status=%status, "Geocoding API returned error");
            return Err(SosError::WeatherError(format!(
                "Geocoding API returned status: {}",
                status
            )));
        }

        let geo_response: GeocodingResponse = response.json().await.map_err(|e| {
            warn!(target: "weather", error=%e, "Failed to parse geocoding response");
            SosError::WeatherError(format!("Failed to parse geocoding response: {}", e))
        })?;

        let found = geo_response
            .results
            .and_then(|mut r| r.pop())
            .ok_or_else(|| SosError::NotFound(format!("Location not found: {}", location)))?;

        let display_name = match found.country {
            Some(country) => format!("{}, {}", found.name, country),
            None => found.name,
        };

        Ok((found.latitude, found.longitude, display_name))
    }

    async fn fetch_current(&self, lat: f64, lon: f64) -> Result<CurrentWeather> {
        debug!(target: "weather", lat=%lat, lon=%lon, "Fetching weather data");

        let response = self
            .http_client
            .get(&self.config.api_endpoint)
            .query(&[
                ("latitude", lat.to_string()),
                ("longitude", lon.to_string()),
                ("current", CURRENT_FIELDS.to_string()),
                ("timezone", "auto".to_string()),
            ])
            .send()
            .await
            .map_err(|e| {
                warn!(target: "weather", error=%e, "Weather API request failed");
                SosError::WeatherError(format!("Weather API request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(target: "weather", status=%status, "Weather API returned error");
            return Err(SosError::WeatherError(format!(
                "Weather API returned status: {}",
                status
            )));
        }

        let weather: WeatherResponse = response.json().await.map_err(|e| {
            warn!(target: "weather", error=%e, "Failed to parse weather response");
            SosError::WeatherError(format!("Failed to parse weather response: {}", e))
        })?;
        Ok(weather.current)
    }

    /// Conditions at known coordinates, labelled `name`.
    pub async fn report_at(&self, lat: f64, lon: f64, name: &str) -> Result<WeatherReport> {
        let current = self.fetch_current(lat, lon).await?;
        Ok(build_report(name, lat, lon, current))
    }

    /// Conditions for a place name.
    pub async fn get_weather(&self, location: &str) -> Result<WeatherReport> {
        if location.trim().is_empty() {
            return Err(SosError::InvalidInput(
                "Location parameter cannot be empty".to_string(),
            ));
        }
        let (lat, lon, display_name) = self.geocode(location).await?;
        self.report_at(lat, lon, &display_name).await
    }

    /// Like [`get_weather`](Self::get_weather), but never fails.
    pub async fn status(&self, location: &str) -> WeatherStatus {
        match self.get_weather(location).await {
            Ok(report) => WeatherStatus::Available(report),
            Err(e) => {
                warn!(target: "weather", location, error = %e, "Weather unavailable");
                WeatherStatus::Unavailable(e.to_string())
            }
        }
    }

    /// Status at coordinates, falling back to [`DEFAULT_LOCATION`].
    pub async fn status_at(&self, position: Option<(f64, f64)>, name: &str) -> WeatherStatus {
        let (lat, lon) = position.unwrap_or(DEFAULT_LOCATION);
        match self.report_at(lat, lon, name).await {
            Ok(report) => WeatherStatus::Available(report),
            Err(e) => {
                warn!(target: "weather", error = %e, "Weather unavailable");
                WeatherStatus::Unavailable(e.to_string())
            }
        }
    }
}

impl Default for WeatherProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn build_report(name: &str, lat: f64, lon: f64, c: CurrentWeather) -> WeatherReport {
    let (icon, conditions) = weather_code_info(c.weather_code);
    WeatherReport {
        location: name.to_string(),
        latitude: lat,
        longitude: lon,
        temperature_c: c.temperature_2m,
        apparent_temperature_c: c.apparent_temperature,
        humidity_pct: c.relative_humidity_2m,
        wind_speed_kmh: c.wind_speed_10m,
        pressure_hpa: c.surface_pressure,
        cloud_cover_pct: c.cloud_cover,
        visibility_km: c.visibility.map(|m| m / 1000.0),
        dew_point_c: c.dew_point_2m,
        uv_index: c.uv_index,
        weather_code: c.weather_code,
        icon: icon.to_string(),
        conditions: conditions.to_string(),
    }
}

/// Icon and description for a WMO weather code.
pub fn weather_code_info(code: i32) -> (&'static str, &'static str) {
    match code {
        0 => ("☀️", "Clear sky"),
        1 => ("🌤️", "Mainly clear"),
        2 => ("⛅", "Partly cloudy"),
        3 => ("☁️", "Overcast"),
        45 | 48 => ("🌫️", "Foggy"),
        51 => ("🌦️", "Light drizzle"),
        53 => ("🌦️", "Drizzle"),
        55 => ("🌧️", "Heavy drizzle"),
        61 => ("🌧️", "Light rain"),
        63 => ("🌧️", "Rain"),
        65 => ("🌧️", "Heavy rain"),
        71 => ("🌨️", "Light snow"),
        73 => ("🌨️", "Snow"),
        75 => ("🌨️", "Heavy snow"),
        77 => ("🌨️", "Snow grains"),
        80 => ("🌦️", "Light showers"),
        81 => ("🌧️", "Showers"),
        82 => ("🌧️", "Heavy showers"),
        85 => ("🌨️", "Light snow showers"),
        86 => ("🌨️", "Snow showers"),
        95 => ("⛈️", "Thunderstorm"),
        96 | 99 => ("⛈️", "Thunderstorm with hail"),
        _ => ("🌤️", "Unknown"),
    }
}

/// Convert WMO weather code to human-readable description
pub fn weather_code_to_description(code: i32) -> String {
    weather_code_info(code).1.to_string()
}

pub fn uv_level(uv_index: f64) -> &'static str {
    if uv_index <= 2.0 {
        "Low"
    } else if uv_index <= 5.0 {
        "Moderate"
    } else if uv_index <= 7.0 {
        "High"
    } else if uv_index <= 10.0 {
        "Very High"
    } else {
        "Extreme"
    }
}
