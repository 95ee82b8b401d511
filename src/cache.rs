//! Prayer times cache manager.
//!
//! Owns the single in-memory `CacheEntry`, decides when the remote source is
//! consulted, persists what it fetches, and publishes every state change.
//! Public operations never return errors: failures reach consumers through
//! the publisher's error channel.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::api::PrayerTimeSource;
use crate::config::AppConfig;
use crate::location::{LocationError, LocationProvider, WatchOptions};
use crate::models::{CacheEntry, Coordinates, PrayerTimesResult};
use crate::publisher::{Publisher, SubscriberCallback, Subscription};
use crate::store::{self, KeyValueStore, PRAYER_TIMES_CACHE_KEY};
use crate::traits::Clock;

/// Failure of a single fetch attempt. `Display` is what subscribers see.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error(transparent)]
    Location(#[from] LocationError),
    #[error("Failed to fetch prayer times: {0}")]
    Source(String),
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub drift_threshold_degrees: f64,
    pub method: u8,
    pub school: u8,
    pub watch: WatchOptions,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            drift_threshold_degrees: 0.01,
            method: 2,
            school: 0,
            watch: WatchOptions::default(),
        }
    }
}

impl From<&AppConfig> for CacheSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            drift_threshold_degrees: config.cache.drift_threshold_degrees,
            method: config.api.method,
            school: config.api.school,
            watch: WatchOptions::from(&config.monitoring),
        }
    }
}

pub struct PrayerTimesCacheManager {
    store: Arc<dyn KeyValueStore>,
    source: Arc<dyn PrayerTimeSource>,
    location: Arc<dyn LocationProvider>,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
    cache: Mutex<Option<CacheEntry>>,
    publisher: Publisher,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl PrayerTimesCacheManager {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        source: Arc<dyn PrayerTimeSource>,
        location: Arc<dyn LocationProvider>,
        clock: Arc<dyn Clock>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            store,
            source,
            location,
            clock,
            settings,
            cache: Mutex::new(None),
            publisher: Publisher::new(),
            monitor: Mutex::new(None),
        }
    }

    /// Today's prayer times, from cache when possible.
    ///
    /// Without `force_refresh`, a same-day persisted entry is returned without
    /// touching location or network. Returns `None` on failure; the error
    /// has already been published.
    pub async fn get_prayer_times(&self, force_refresh: bool) -> Option<PrayerTimesResult> {
        if !force_refresh {
            if let Some(entry) = self.load_valid_entry().await {
                tracing::debug!("Using persisted prayer times for {}", entry.date_key);
                return Some(self.adopt(entry));
            }
        }

        self.publisher.notify(None, true, None);

        let result = match self.current_location().await {
            Ok(coordinates) => self.resolve(coordinates).await,
            Err(e) => Err(FetchError::from(e)),
        };
        self.finish(result)
    }

    /// Same contract as `get_prayer_times`, for coordinates the caller
    /// already knows. The persisted entry must be for today and for roughly
    /// this position to be reused.
    pub async fn get_prayer_times_with_location(
        &self,
        latitude: f64,
        longitude: f64,
        force_refresh: bool,
    ) -> Option<PrayerTimesResult> {
        let coordinates = Coordinates::new(latitude, longitude);

        if !force_refresh {
            if let Some(entry) = self.load_valid_entry().await {
                if !entry
                    .location
                    .has_drifted(&coordinates, self.settings.drift_threshold_degrees)
                {
                    return Some(self.adopt(entry));
                }
                tracing::debug!("Persisted prayer times are for a different location");
            }
        }

        self.publisher.notify(None, true, None);
        let result = self.resolve(coordinates).await;
        self.finish(result)
    }

    pub async fn refresh_prayer_times(&self) -> Option<PrayerTimesResult> {
        self.get_prayer_times(true).await
    }

    /// Drop both the persisted and the in-memory cache.
    pub async fn clear_cache(&self) {
        *self.lock_cache() = None;
        if let Err(e) = self.store.remove(PRAYER_TIMES_CACHE_KEY).await {
            tracing::warn!("Failed to remove persisted prayer times: {:#}", e);
        }
    }

    /// Whether storage holds an entry for today. Does not touch the in-memory cache.
    pub async fn has_valid_cached_data(&self) -> bool {
        self.load_valid_entry().await.is_some()
    }

    /// Snapshot of the in-memory cache.
    pub fn cached(&self) -> Option<PrayerTimesResult> {
        self.lock_cache().as_ref().map(|entry| entry.data.clone())
    }

    /// Register a state listener. If data is already resident, the listener
    /// is invoked with it before this returns.
    pub fn subscribe(&self, callback: SubscriberCallback) -> Subscription {
        let subscription = self.publisher.subscribe(callback.clone());
        if let Some(data) = self.cached() {
            callback(Some(&data), false, None);
        }
        subscription
    }

    /// Begin a low-accuracy background location watch that refreshes the
    /// prayer times on movement. Returns whether a watch was started.
    ///
    /// Only starts when location services are on, permission was already
    /// granted, and there is no valid same-day cache.
    pub async fn start_location_monitoring(self: &Arc<Self>) -> bool {
        if !self.location.services_enabled().await {
            tracing::debug!("Location services disabled, not monitoring");
            return false;
        }
        if !self.location.has_permission().await {
            tracing::debug!("Location permission not granted, not monitoring");
            return false;
        }
        if self.has_valid_cached_data().await {
            tracing::debug!("Valid prayer times cached for today, not monitoring");
            return false;
        }

        let options = self.settings.watch;
        let manager = Arc::downgrade(self);
        let handle = tokio::spawn(watch_location(manager, self.location.clone(), options));

        if let Some(previous) = self.lock_monitor().replace(handle) {
            previous.abort();
        }
        tracing::info!(
            "Location monitoring started (every {:?}, {:.0} m filter)",
            options.poll_interval(),
            options.distance_filter_meters
        );
        true
    }

    pub fn stop_location_monitoring(&self) {
        if let Some(handle) = self.lock_monitor().take() {
            handle.abort();
            tracing::info!("Location monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.lock_monitor()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    async fn current_location(&self) -> Result<Coordinates, LocationError> {
        if !self.location.services_enabled().await {
            return Err(LocationError::ServicesDisabled);
        }
        self.location.current_coordinates().await
    }

    /// Reuse the in-memory entry when it is for today and the position has
    /// not drifted; otherwise fetch, persist and replace it.
    async fn resolve(&self, coordinates: Coordinates) -> Result<PrayerTimesResult, FetchError> {
        let today = self.clock.today_local();

        let reusable = self.lock_cache().as_ref().and_then(|entry| {
            let fresh = entry.is_valid_for(today)
                && !entry
                    .location
                    .has_drifted(&coordinates, self.settings.drift_threshold_degrees);
            fresh.then(|| entry.data.clone())
        });
        if let Some(data) = reusable {
            tracing::debug!("Location unchanged, reusing in-memory prayer times");
            return Ok(data);
        }

        tracing::info!(
            "Fetching prayer times for {:.4}, {:.4}",
            coordinates.latitude,
            coordinates.longitude
        );
        let data = self
            .source
            .fetch_timings(coordinates, self.settings.method, self.settings.school)
            .await
            .map_err(|e| FetchError::Source(format!("{e:#}")))?;

        let entry = CacheEntry::new(data.clone(), coordinates, self.clock.now_utc(), today);
        if let Err(e) = store::save_json(self.store.as_ref(), PRAYER_TIMES_CACHE_KEY, &entry).await {
            tracing::warn!("Failed to persist prayer times: {:#}", e);
        }
        *self.lock_cache() = Some(entry);

        Ok(data)
    }

    /// Publish the outcome of a fetch attempt.
    fn finish(&self, result: Result<PrayerTimesResult, FetchError>) -> Option<PrayerTimesResult> {
        match result {
            Ok(data) => {
                self.publisher.notify(Some(&data), false, None);
                Some(data)
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!("Prayer times unavailable: {}", message);
                self.publisher.notify(None, false, Some(&message));
                None
            }
        }
    }

    /// Make a persisted entry the in-memory cache and publish it.
    fn adopt(&self, entry: CacheEntry) -> PrayerTimesResult {
        let data = entry.data.clone();
        *self.lock_cache() = Some(entry);
        self.publisher.notify(Some(&data), false, None);
        data
    }

    async fn load_valid_entry(&self) -> Option<CacheEntry> {
        let entry: CacheEntry = match store::load_json(self.store.as_ref(), PRAYER_TIMES_CACHE_KEY).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Failed to read persisted prayer times: {:#}", e);
                return None;
            }
        };

        let today = self.clock.today_local();
        if entry.is_valid_for(today) {
            Some(entry)
        } else {
            tracing::debug!("Persisted prayer times are from {}, ignoring", entry.date_key);
            None
        }
    }

    fn lock_cache(&self) -> MutexGuard<'_, Option<CacheEntry>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_monitor(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PrayerTimesCacheManager {
    fn drop(&mut self) {
        self.stop_location_monitoring();
    }
}

impl std::fmt::Debug for PrayerTimesCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrayerTimesCacheManager")
            .field("settings", &self.settings)
            .field("cached", &self.lock_cache().as_ref().map(|e| e.date_key.clone()))
            .field("publisher", &self.publisher)
            .finish()
    }
}

/// Poll the provider and refresh on the first fix and on every fix that has
/// moved at least the distance filter from the last reported one.
async fn watch_location(
    manager: Weak<PrayerTimesCacheManager>,
    location: Arc<dyn LocationProvider>,
    options: WatchOptions,
) {
    let mut interval = tokio::time::interval(options.poll_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_reported: Option<Coordinates> = None;

    loop {
        interval.tick().await;

        let coordinates = match location.current_coordinates_with_accuracy(options.accuracy).await {
            Ok(coordinates) => coordinates,
            Err(e) => {
                tracing::debug!("Location watch read failed: {}", e);
                continue;
            }
        };

        let moved_enough = last_reported
            .is_none_or(|last| last.distance_meters(&coordinates) >= options.distance_filter_meters);
        if !moved_enough {
            continue;
        }
        last_reported = Some(coordinates);

        let Some(manager) = manager.upgrade() else {
            break;
        };
        tracing::info!("Location update received, refreshing prayer times");
        manager.get_prayer_times(true).await;
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Local, TimeZone, Utc};

    use super::*;
    use crate::api::MockPrayerTimeSource;
    use crate::location::MockLocationProvider;
    use crate::models::{PrayerDate, PrayerTiming};
    use crate::store::MemoryStore;
    use crate::traits::MockClock;

    fn sample_result(fajr: &str) -> PrayerTimesResult {
        PrayerTimesResult {
            timings: PrayerTiming {
                fajr: fajr.into(),
                sunrise: "05:30".into(),
                dhuhr: "12:00".into(),
                asr: "15:30".into(),
                maghrib: "18:30".into(),
                isha: "20:00".into(),
            },
            timezone: "UTC".into(),
            date: PrayerDate::default(),
            method: None,
        }
    }

    fn make_manager(
        store: MemoryStore,
        source: MockPrayerTimeSource,
        location: MockLocationProvider,
    ) -> PrayerTimesCacheManager {
        let noon = Local.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        PrayerTimesCacheManager::new(
            Arc::new(store),
            Arc::new(source),
            Arc::new(location),
            Arc::new(MockClock::new(noon.with_timezone(&Utc))),
            CacheSettings::default(),
        )
    }

    #[test]
    fn test_fetch_error_messages() {
        assert_eq!(
            FetchError::from(LocationError::PermissionDenied).to_string(),
            "Location permission not granted"
        );
        assert_eq!(
            FetchError::Source("timeout".into()).to_string(),
            "Failed to fetch prayer times: timeout"
        );
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = AppConfig::default();
        config.api.method = 4;
        config.cache.drift_threshold_degrees = 0.05;
        let settings = CacheSettings::from(&config);
        assert_eq!(settings.drift_threshold_degrees, 0.05);
        assert_eq!(settings.method, 4);
        assert_eq!(settings.watch.interval, std::time::Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_resolve_reuses_fresh_in_memory_entry() {
        let source = MockPrayerTimeSource::new(sample_result("04:00"));
        let location = MockLocationProvider::new(Coordinates::new(10.0, 10.0));
        let manager = make_manager(MemoryStore::new(), source.clone(), location);

        manager.resolve(Coordinates::new(10.0, 10.0)).await.unwrap();
        manager.resolve(Coordinates::new(10.005, 9.995)).await.unwrap();
        assert_eq!(source.call_count(), 1);

        manager.resolve(Coordinates::new(10.02, 10.0)).await.unwrap();
        assert_eq!(source.call_count(), 2);
    }

    #[tokio::test]
    async fn test_clear_cache_is_idempotent() {
        let store = MemoryStore::new();
        let source = MockPrayerTimeSource::new(sample_result("04:00"));
        let location = MockLocationProvider::new(Coordinates::new(10.0, 10.0));
        let manager = make_manager(store.clone(), source, location);

        manager.get_prayer_times(false).await.unwrap();
        assert!(store.contains(PRAYER_TIMES_CACHE_KEY));

        manager.clear_cache().await;
        manager.clear_cache().await;
        assert!(!store.contains(PRAYER_TIMES_CACHE_KEY));
        assert!(manager.cached().is_none());
    }

    #[tokio::test]
    async fn test_zero_watch_interval_keeps_monitoring_alive() {
        let source = MockPrayerTimeSource::new(sample_result("04:00"));
        let location = MockLocationProvider::new(Coordinates::new(10.0, 10.0));
        let noon = Local.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let settings = CacheSettings {
            watch: WatchOptions {
                interval: std::time::Duration::ZERO,
                ..WatchOptions::default()
            },
            ..CacheSettings::default()
        };
        let manager = Arc::new(PrayerTimesCacheManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(source.clone()),
            Arc::new(location),
            Arc::new(MockClock::new(noon.with_timezone(&Utc))),
            settings,
        ));

        assert!(manager.start_location_monitoring().await);
        let fetched = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while source.call_count() == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(fetched.is_ok(), "First fix should trigger a fetch");

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(manager.is_monitoring());
        manager.stop_location_monitoring();
    }

    #[tokio::test]
    async fn test_services_disabled_is_reported() {
        let source = MockPrayerTimeSource::new(sample_result("04:00"));
        let location = MockLocationProvider::new(Coordinates::new(10.0, 10.0));
        location.set_services_enabled(false);
        let manager = make_manager(MemoryStore::new(), source.clone(), location.clone());

        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let _subscription = manager.subscribe(Arc::new(move |_, _, error| {
            if let Some(error) = error {
                sink.lock().unwrap().push(error.to_string());
            }
        }));

        assert!(manager.get_prayer_times(false).await.is_none());
        assert_eq!(location.call_count(), 0);
        assert_eq!(source.call_count(), 0);
        assert_eq!(*errors.lock().unwrap(), vec!["Location services are disabled".to_string()]);
    }

    #[tokio::test]
    async fn test_monitoring_refused_without_permission() {
        let source = MockPrayerTimeSource::new(sample_result("04:00"));
        let location = MockLocationProvider::new(Coordinates::new(10.0, 10.0));
        location.set_permission(false);
        let manager = Arc::new(make_manager(MemoryStore::new(), source, location));

        assert!(!manager.start_location_monitoring().await);
        assert!(!manager.is_monitoring());
    }
}
