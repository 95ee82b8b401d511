//! Composition root: wires configuration and collaborators into the cache
//! manager and the notification scheduler, and runs the daemon loop.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono_tz::Tz;
use tokio::sync::mpsc;

use crate::api::{AladhanClient, PrayerTimeSource};
use crate::cache::{CacheSettings, PrayerTimesCacheManager};
use crate::config::AppConfig;
use crate::countdown::{Countdown, CountdownTicker, next_prayer};
use crate::location::{Address, FixedLocationProvider, LocationProvider};
use crate::models::{Coordinates, IncludeMap, Prayer, PrayerTimesResult};
use crate::notifications::{DesktopNotificationSystem, LocalNotificationSystem};
use crate::publisher::PrayerTimesState;
use crate::schedule::{self, PrayerNotificationScheduler, ScheduleOutcome};
use crate::store::{JsonFileStore, KeyValueStore};
use crate::traits::{Clock, Notifier, SystemClock};

/// Which prayer times a one-shot request wants.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FetchRequest {
    pub force_refresh: bool,
    pub coordinates: Option<Coordinates>,
}

pub struct PrayerTimesApp {
    config: Arc<AppConfig>,
    store: Arc<dyn KeyValueStore>,
    location: Arc<dyn LocationProvider>,
    clock: Arc<dyn Clock>,
    manager: Arc<PrayerTimesCacheManager>,
    scheduler: PrayerNotificationScheduler,
}

impl PrayerTimesApp {
    /// Production wiring: file store, HTTP source, configured location,
    /// in-process daily notifications.
    pub fn from_config(config: Arc<AppConfig>) -> Result<Self> {
        let store = Arc::new(JsonFileStore::new(config.storage.resolved_data_dir()));
        let source = Arc::new(AladhanClient::new(config.api.base_url.clone(), &config.network)?);
        let location = Arc::new(
            FixedLocationProvider::new(config.location.coordinates())
                .with_address(config.location.address()),
        );
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let notifications = Arc::new(DesktopNotificationSystem::new(default_notifier(), clock.clone()));

        Self::new(config, store, source, location, notifications, clock)
    }

    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn KeyValueStore>,
        source: Arc<dyn PrayerTimeSource>,
        location: Arc<dyn LocationProvider>,
        notifications: Arc<dyn LocalNotificationSystem>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let manager = Arc::new(PrayerTimesCacheManager::new(
            store.clone(),
            source,
            location.clone(),
            clock.clone(),
            CacheSettings::from(config.as_ref()),
        ));

        let mut scheduler = PrayerNotificationScheduler::new(notifications, store.clone(), clock.clone());
        if let Some(name) = &config.notifications.device_timezone {
            let tz: Tz = name
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid notifications.device_timezone '{name}': {e}"))?;
            scheduler = scheduler.with_device_timezone(tz);
        }

        Ok(Self {
            config,
            store,
            location,
            clock,
            manager,
            scheduler,
        })
    }

    pub fn manager(&self) -> &Arc<PrayerTimesCacheManager> {
        &self.manager
    }

    pub fn store(&self) -> &dyn KeyValueStore {
        self.store.as_ref()
    }

    /// Fetch once, turning the published error into an `Err`.
    pub async fn fetch(&self, request: FetchRequest) -> Result<PrayerTimesResult> {
        let state = Arc::new(Mutex::new(PrayerTimesState::default()));
        let subscription = {
            let state = state.clone();
            self.manager.subscribe(Arc::new(move |data, loading, error| {
                state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .apply(data, loading, error);
            }))
        };

        let result = match request.coordinates {
            Some(c) => {
                self.manager
                    .get_prayer_times_with_location(c.latitude, c.longitude, request.force_refresh)
                    .await
            }
            None => self.manager.get_prayer_times(request.force_refresh).await,
        };
        subscription.unsubscribe();

        result.ok_or_else(|| {
            let error = state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .error
                .clone();
            anyhow::anyhow!(error.unwrap_or_else(|| "Prayer times unavailable".to_string()))
        })
    }

    /// Place name for `coordinates`, or for the current position when `None`.
    /// Lookup failures are logged and give `None`.
    pub async fn describe_location(&self, coordinates: Option<Coordinates>) -> Option<Address> {
        let coordinates = match coordinates {
            Some(c) => c,
            None => self.location.current_coordinates().await.ok()?,
        };
        match self.location.reverse_geocode(coordinates).await {
            Ok(address) => address,
            Err(e) => {
                tracing::debug!("Reverse geocoding failed: {}", e);
                None
            }
        }
    }

    /// Countdown to the next prayer as of now.
    pub fn countdown(&self, result: &PrayerTimesResult) -> Option<Countdown> {
        next_prayer(&result.timings, self.clock.now_local().time())
    }

    /// Saved include flags, falling back to the configured defaults.
    pub async fn include_map(&self) -> IncludeMap {
        let defaults = self.config.notifications.include.to_include_map();
        schedule::load_include_map(self.store.as_ref(), &defaults).await
    }

    pub async fn set_included(&self, prayer: Prayer, included: bool) -> Result<IncludeMap> {
        let mut include = self.include_map().await;
        include.insert(prayer, included);
        schedule::save_include_map(self.store.as_ref(), &include).await?;
        Ok(include)
    }

    /// Schedule notifications for `result`. Disabled notifications mean an
    /// empty include map, which cancels everything.
    pub async fn apply_notifications(&self, result: &PrayerTimesResult) -> ScheduleOutcome {
        let include = if self.config.notifications.enabled {
            self.include_map().await
        } else {
            IncludeMap::new()
        };
        self.scheduler
            .apply(&result.timings, &result.timezone, &include)
            .await
    }

    /// Long-running mode. Returns on Ctrl-C.
    pub async fn run_daemon(&self) -> Result<()> {
        tracing::info!("Starting prayer times daemon");

        let (tx, mut rx) = mpsc::unbounded_channel::<PrayerTimesResult>();
        let _subscription = self.manager.subscribe(Arc::new(move |data, loading, error| {
            if let Some(data) = data {
                let _ = tx.send(data.clone());
            } else if let Some(error) = error {
                tracing::warn!("Prayer times error: {}", error);
            } else if loading {
                tracing::debug!("Loading prayer times...");
            }
        }));

        let ticker = CountdownTicker::spawn(self.clock.clone());
        let mut countdown_rx = ticker.subscribe();
        let mut announced: Option<Prayer> = None;

        self.manager.get_prayer_times(false).await;

        if self.config.monitoring.enabled && self.manager.start_location_monitoring().await {
            tracing::info!("Watching for location changes");
        }

        let check_secs = self.config.refresh.cache_check_interval_secs.max(1);
        let mut check = tokio::time::interval(Duration::from_secs(check_secs));
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        check.tick().await;

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(data) = rx.recv() => {
                    ticker.set_timings(Some(data.timings.clone()));
                    match self.apply_notifications(&data).await {
                        ScheduleOutcome::Failed(e) => tracing::error!("Notification scheduling failed: {}", e),
                        outcome => tracing::debug!("Notification scheduling: {:?}", outcome),
                    }
                }
                _ = check.tick() => {
                    // Picks up the local-midnight rollover
                    self.manager.get_prayer_times(false).await;
                }
                Ok(()) = countdown_rx.changed() => {
                    let current = countdown_rx.borrow_and_update().clone();
                    if let Some(countdown) = current.filter(|c| announced != Some(c.next_prayer)) {
                        tracing::info!(
                            "Next prayer: {} at {} (in {})",
                            countdown.next_prayer,
                            countdown.time,
                            countdown.formatted()
                        );
                        announced = Some(countdown.next_prayer);
                    }
                }
                result = &mut shutdown => {
                    result.context("Failed to listen for shutdown signal")?;
                    tracing::info!("Shutting down");
                    break;
                }
            }
        }

        self.manager.stop_location_monitoring();
        Ok(())
    }
}

impl std::fmt::Debug for PrayerTimesApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrayerTimesApp")
            .field("manager", &self.manager)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

#[cfg(feature = "desktop")]
fn default_notifier() -> Arc<dyn Notifier> {
    Arc::new(crate::traits::SystemNotifier)
}

#[cfg(not(feature = "desktop"))]
fn default_notifier() -> Arc<dyn Notifier> {
    Arc::new(crate::traits::LogNotifier)
}
