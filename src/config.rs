use std::path::PathBuf;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::location::{Address, LocationAccuracy};
use crate::models::{Coordinates, IncludeMap, Prayer};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub network: NetworkConfig,
    pub location: LocationConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub monitoring: MonitoringConfig,
    pub refresh: RefreshConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    /// Calculation method id understood by the source (e.g. 2 = ISNA, 4 = Umm al-Qura).
    pub method: u8,
    /// Juristic school for Asr: 0 = Shafi, 1 = Hanafi.
    pub school: u8,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.aladhan.com/v1".to_string(),
            method: 2,
            school: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

/// Fixed device position. Without it the location provider reports that
/// permission was never granted.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LocationConfig {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Place names reported for the configured position.
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
}

impl LocationConfig {
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates::new(latitude, longitude)),
            _ => None,
        }
    }

    pub fn address(&self) -> Address {
        Address {
            city: self.city.clone(),
            region: self.region.clone(),
            country: self.country.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("prayer-times")
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    pub drift_threshold_degrees: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            drift_threshold_degrees: 0.01,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub distance_filter_meters: f64,
    pub accuracy: LocationAccuracy,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            distance_filter_meters: 5000.0,
            accuracy: LocationAccuracy::Lowest,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RefreshConfig {
    /// How often the daemon re-checks the cache, which picks up the local
    /// midnight rollover.
    pub cache_check_interval_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            cache_check_interval_secs: 900,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotificationConfig {
    pub enabled: bool,
    /// IANA zone the device runs in. Falls back to the system zone.
    pub device_timezone: Option<String>,
    pub include: IncludeConfig,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device_timezone: None,
            include: IncludeConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct IncludeConfig {
    pub fajr: bool,
    pub sunrise: bool,
    pub dhuhr: bool,
    pub asr: bool,
    pub maghrib: bool,
    pub isha: bool,
}

impl Default for IncludeConfig {
    fn default() -> Self {
        Self {
            fajr: true,
            sunrise: false,
            dhuhr: true,
            asr: true,
            maghrib: true,
            isha: true,
        }
    }
}

impl IncludeConfig {
    pub fn to_include_map(&self) -> IncludeMap {
        Prayer::ALL
            .into_iter()
            .map(|prayer| {
                let enabled = match prayer {
                    Prayer::Fajr => self.fajr,
                    Prayer::Sunrise => self.sunrise,
                    Prayer::Dhuhr => self.dhuhr,
                    Prayer::Asr => self.asr,
                    Prayer::Maghrib => self.maghrib,
                    Prayer::Isha => self.isha,
                };
                (prayer, enabled)
            })
            .collect()
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        // Load .env file (silently ignore if not present)
        let _ = dotenvy::dotenv();

        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("prayer-times");

        let builder = Config::builder()
            // 1. Load default values
            // API
            .set_default("api.base_url", "https://api.aladhan.com/v1")?
            .set_default("api.method", 2)?
            .set_default("api.school", 0)?
            // Network
            .set_default("network.request_timeout_secs", 30)?
            .set_default("network.connect_timeout_secs", 10)?
            // Location
            .set_default("location.latitude", None::<f64>)?
            .set_default("location.longitude", None::<f64>)?
            .set_default("location.city", None::<String>)?
            .set_default("location.region", None::<String>)?
            .set_default("location.country", None::<String>)?
            // Storage
            .set_default("storage.data_dir", None::<String>)?
            // Cache
            .set_default("cache.drift_threshold_degrees", 0.01)?
            // Monitoring
            .set_default("monitoring.enabled", true)?
            .set_default("monitoring.interval_secs", 300)?
            .set_default("monitoring.distance_filter_meters", 5000.0)?
            .set_default("monitoring.accuracy", "lowest")?
            // Refresh
            .set_default("refresh.cache_check_interval_secs", 900)?
            // Notifications
            .set_default("notifications.enabled", true)?
            .set_default("notifications.device_timezone", None::<String>)?
            .set_default("notifications.include.fajr", true)?
            .set_default("notifications.include.sunrise", false)?
            .set_default("notifications.include.dhuhr", true)?
            .set_default("notifications.include.asr", true)?
            .set_default("notifications.include.maghrib", true)?
            .set_default("notifications.include.isha", true)?

            // 2. Load from local config file (optional, lowest priority)
            .add_source(File::from(PathBuf::from("config.toml")).required(false))

            // 3. Load from user config directory (optional, overrides local)
            .add_source(File::from(config_dir.join("config.toml")).required(false))

            // 4. Load from Environment variables (PRAYER__API__METHOD=3)
            .add_source(Environment::with_prefix("PRAYER").separator("__"));

        let s = builder.build().context("Failed to build configuration")?;
        Ok(s.try_deserialize()?)
    }
}
