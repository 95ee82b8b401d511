//! Geolocation provider abstraction.
//!
//! Nothing in here ever asks the user for permission. Callers check
//! `has_permission` first; a provider without permission fails with
//! `LocationError::PermissionDenied`.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::config::MonitoringConfig;
use crate::models::Coordinates;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocationError {
    #[error("Location permission not granted")]
    PermissionDenied,
    #[error("Location services are disabled")]
    ServicesDisabled,
    #[error("Location unavailable: {0}")]
    Unavailable(String),
}

/// Shortest poll period of the background watch.
const MIN_WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// GPS accuracy tiers, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationAccuracy {
    #[default]
    Lowest,
    Low,
    Balanced,
    High,
}

/// Parameters of the background location watch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchOptions {
    pub accuracy: LocationAccuracy,
    pub interval: Duration,
    pub distance_filter_meters: f64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            accuracy: LocationAccuracy::Lowest,
            interval: Duration::from_secs(300),
            distance_filter_meters: 5000.0,
        }
    }
}

impl WatchOptions {
    /// Poll period actually used; a zero interval is raised to one second.
    pub fn poll_interval(&self) -> Duration {
        self.interval.max(MIN_WATCH_INTERVAL)
    }
}

impl From<&MonitoringConfig> for WatchOptions {
    fn from(config: &MonitoringConfig) -> Self {
        Self {
            accuracy: config.accuracy,
            interval: Duration::from_secs(config.interval_secs).max(MIN_WATCH_INTERVAL),
            distance_filter_meters: config.distance_filter_meters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Address {
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
}

impl Address {
    pub fn is_empty(&self) -> bool {
        self.city.is_none() && self.region.is_none() && self.country.is_none()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = [&self.city, &self.region, &self.country]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect();
        f.write_str(&parts.join(", "))
    }
}

#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_coordinates(&self) -> Result<Coordinates, LocationError>;

    async fn current_coordinates_with_accuracy(
        &self,
        _accuracy: LocationAccuracy,
    ) -> Result<Coordinates, LocationError> {
        self.current_coordinates().await
    }

    async fn has_permission(&self) -> bool;

    async fn services_enabled(&self) -> bool {
        true
    }

    async fn reverse_geocode(&self, _coordinates: Coordinates) -> Result<Option<Address>, LocationError> {
        Ok(None)
    }
}

/// How close a lookup must be to the configured position to get its address.
const ADDRESS_MATCH_DEGREES: f64 = 0.01;

/// Position taken from configuration. No position means no permission.
#[derive(Debug, Clone)]
pub struct FixedLocationProvider {
    coordinates: Option<Coordinates>,
    address: Address,
}

impl FixedLocationProvider {
    pub fn new(coordinates: Option<Coordinates>) -> Self {
        Self {
            coordinates,
            address: Address::default(),
        }
    }

    /// Place name reported by `reverse_geocode` for the configured position.
    pub fn with_address(mut self, address: Address) -> Self {
        self.address = address;
        self
    }
}

#[async_trait]
impl LocationProvider for FixedLocationProvider {
    async fn current_coordinates(&self) -> Result<Coordinates, LocationError> {
        self.coordinates.ok_or(LocationError::PermissionDenied)
    }

    async fn has_permission(&self) -> bool {
        self.coordinates.is_some()
    }

    async fn reverse_geocode(&self, coordinates: Coordinates) -> Result<Option<Address>, LocationError> {
        let configured = self.coordinates.ok_or(LocationError::PermissionDenied)?;
        if self.address.is_empty() || configured.has_drifted(&coordinates, ADDRESS_MATCH_DEGREES) {
            return Ok(None);
        }
        Ok(Some(self.address.clone()))
    }
}

#[derive(Debug)]
struct MockLocationState {
    coordinates: Result<Coordinates, LocationError>,
    permission: bool,
    services_enabled: bool,
    calls: usize,
}

/// Mock provider with controllable position, permission and failure.
#[derive(Debug, Clone)]
pub struct MockLocationProvider {
    state: Arc<Mutex<MockLocationState>>,
}

impl MockLocationProvider {
    /// A provider with permission granted, reporting `coordinates`.
    pub fn new(coordinates: Coordinates) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockLocationState {
                coordinates: Ok(coordinates),
                permission: true,
                services_enabled: true,
                calls: 0,
            })),
        }
    }

    /// A provider that was never granted permission.
    pub fn denied() -> Self {
        let provider = Self::new(Coordinates::new(0.0, 0.0));
        provider.set_permission(false);
        provider.fail_with(LocationError::PermissionDenied);
        provider
    }

    pub fn set_coordinates(&self, coordinates: Coordinates) {
        self.state.lock().unwrap().coordinates = Ok(coordinates);
    }

    pub fn fail_with(&self, error: LocationError) {
        self.state.lock().unwrap().coordinates = Err(error);
    }

    pub fn set_permission(&self, granted: bool) {
        self.state.lock().unwrap().permission = granted;
    }

    pub fn set_services_enabled(&self, enabled: bool) {
        self.state.lock().unwrap().services_enabled = enabled;
    }

    /// Number of position reads so far.
    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls
    }
}

#[async_trait]
impl LocationProvider for MockLocationProvider {
    async fn current_coordinates(&self) -> Result<Coordinates, LocationError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.coordinates.clone()
    }

    async fn has_permission(&self) -> bool {
        self.state.lock().unwrap().permission
    }

    async fn services_enabled(&self) -> bool {
        self.state.lock().unwrap().services_enabled
    }
}
