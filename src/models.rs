use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Mean Earth radius used for haversine distances.
const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// The six daily prayer/time markers, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Prayer {
    Fajr,
    Sunrise,
    Dhuhr,
    Asr,
    Maghrib,
    Isha,
}

impl Prayer {
    /// Fixed order used for "next prayer" wraparound and scheduling.
    pub const ALL: [Prayer; 6] = [
        Prayer::Fajr,
        Prayer::Sunrise,
        Prayer::Dhuhr,
        Prayer::Asr,
        Prayer::Maghrib,
        Prayer::Isha,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Prayer::Fajr => "Fajr",
            Prayer::Sunrise => "Sunrise",
            Prayer::Dhuhr => "Dhuhr",
            Prayer::Asr => "Asr",
            Prayer::Maghrib => "Maghrib",
            Prayer::Isha => "Isha",
        }
    }
}

impl fmt::Display for Prayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Prayer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Prayer::ALL
            .into_iter()
            .find(|prayer| prayer.name().eq_ignore_ascii_case(s.trim()))
            .with_context(|| format!("Unknown prayer name: {s}"))
    }
}

/// Per-prayer "should this be scheduled" flags. Absent means false.
pub type IncludeMap = BTreeMap<Prayer, bool>;

/// Prayer -> notification identifier, as issued by the local notification system.
pub type NotificationScheduleMap = BTreeMap<Prayer, String>;

/// Wall-clock `HH:MM` strings for each prayer of one day at one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PrayerTiming {
    pub fajr: String,
    pub sunrise: String,
    pub dhuhr: String,
    pub asr: String,
    pub maghrib: String,
    pub isha: String,
}

impl PrayerTiming {
    pub fn get(&self, prayer: Prayer) -> &str {
        match prayer {
            Prayer::Fajr => &self.fajr,
            Prayer::Sunrise => &self.sunrise,
            Prayer::Dhuhr => &self.dhuhr,
            Prayer::Asr => &self.asr,
            Prayer::Maghrib => &self.maghrib,
            Prayer::Isha => &self.isha,
        }
    }

    /// Parse the time of day for one prayer.
    pub fn time_of(&self, prayer: Prayer) -> Result<NaiveTime> {
        parse_time_of_day(self.get(prayer))
            .with_context(|| format!("Invalid time for {prayer}: {:?}", self.get(prayer)))
    }

    /// Iterate over `(prayer, "HH:MM")` in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (Prayer, &str)> {
        Prayer::ALL.into_iter().map(move |prayer| (prayer, self.get(prayer)))
    }
}

/// Parse `HH:MM`, ignoring any trailing annotation such as `"05:12 (EET)"`.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
    let head = value
        .split_whitespace()
        .next()
        .context("Empty time string")?;
    NaiveTime::parse_from_str(head, "%H:%M").context("Expected HH:MM")
}

/// Date information returned alongside the timings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PrayerDate {
    pub readable: String,
    /// `DD-MM-YYYY` as reported by the source.
    pub gregorian: String,
    pub hijri: Option<String>,
}

/// One day of prayer times for one location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrayerTimesResult {
    pub timings: PrayerTiming,
    /// IANA timezone of the location the timings were calculated for.
    pub timezone: String,
    #[serde(default)]
    pub date: PrayerDate,
    #[serde(default)]
    pub method: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Whether either axis moved by more than `threshold_degrees`.
    pub fn has_drifted(&self, other: &Coordinates, threshold_degrees: f64) -> bool {
        (self.latitude - other.latitude).abs() > threshold_degrees
            || (self.longitude - other.longitude).abs() > threshold_degrees
    }

    /// Great-circle distance in meters.
    pub fn distance_meters(&self, other: &Coordinates) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let d_lat = lat2 - lat1;
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_METERS * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

/// Persisted cache record. Valid only on the local date it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub data: PrayerTimesResult,
    pub location: Coordinates,
    pub timestamp: DateTime<Utc>,
    pub date_key: String,
}

impl CacheEntry {
    pub fn new(
        data: PrayerTimesResult,
        location: Coordinates,
        timestamp: DateTime<Utc>,
        today: NaiveDate,
    ) -> Self {
        Self {
            data,
            location,
            timestamp,
            date_key: date_key(today),
        }
    }

    pub fn is_valid_for(&self, today: NaiveDate) -> bool {
        self.date_key == date_key(today)
    }
}

/// `YYYY-MM-DD` key for a local date.
pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
