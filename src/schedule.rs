//! Prayer notification scheduling.
//!
//! Each pass cancels every scheduled notification, then issues one daily
//! trigger per included prayer and persists the issued identifiers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Days, Local, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::models::{IncludeMap, NotificationScheduleMap, Prayer, PrayerTiming};
use crate::notifications::{LocalNotificationSystem, NotificationContent};
use crate::store::{self, KeyValueStore, NOTIFICATION_IDS_KEY, NOTIFICATION_SETTINGS_KEY};
use crate::traits::Clock;

/// Result of one `apply` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Same inputs as the last successful pass; nothing was touched.
    Unchanged,
    /// Another pass was running; this call was dropped.
    Busy,
    /// Everything was cancelled and no prayer is included.
    Cleared,
    Scheduled(NotificationScheduleMap),
    Failed(String),
}

pub struct PrayerNotificationScheduler {
    notifications: Arc<dyn LocalNotificationSystem>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    /// `None` means the system zone.
    device_timezone: Option<Tz>,
    last_applied: Mutex<Option<String>>,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag however the pass ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PrayerNotificationScheduler {
    pub fn new(
        notifications: Arc<dyn LocalNotificationSystem>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            notifications,
            store,
            clock,
            device_timezone: None,
            last_applied: Mutex::new(None),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Compute trigger times in `timezone` instead of the system zone.
    pub fn with_device_timezone(mut self, timezone: Tz) -> Self {
        self.device_timezone = Some(timezone);
        self
    }

    /// Bring the scheduled notifications in line with `timings` and `include`.
    ///
    /// Never returns an error; a failed pass is logged and reported as
    /// `ScheduleOutcome::Failed`, and the next call runs again even with the
    /// same inputs.
    pub async fn apply(&self, timings: &PrayerTiming, timezone: &str, include: &IncludeMap) -> ScheduleOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            tracing::debug!("Notification scheduling already in progress, dropping request");
            return ScheduleOutcome::Busy;
        }
        let _guard = InFlightGuard(&self.in_flight);

        let key = match serde_json::to_string(&(timings, timezone, include)) {
            Ok(key) => key,
            Err(e) => return ScheduleOutcome::Failed(e.to_string()),
        };
        if self.lock_last_applied().as_deref() == Some(key.as_str()) {
            return ScheduleOutcome::Unchanged;
        }
        *self.lock_last_applied() = Some(key);

        match self.run_pass(timings, timezone, include).await {
            Ok(map) if map.is_empty() => {
                tracing::info!("All prayer notifications cancelled");
                ScheduleOutcome::Cleared
            }
            Ok(map) => {
                tracing::info!("Scheduled {} prayer notifications", map.len());
                ScheduleOutcome::Scheduled(map)
            }
            Err(e) => {
                tracing::error!("Failed to schedule prayer notifications: {:#}", e);
                *self.lock_last_applied() = None;
                ScheduleOutcome::Failed(format!("{e:#}"))
            }
        }
    }

    async fn run_pass(&self, timings: &PrayerTiming, timezone: &str, include: &IncludeMap) -> Result<NotificationScheduleMap> {
        self.notifications
            .cancel_all()
            .await
            .context("Failed to cancel scheduled notifications")?;
        self.store
            .remove(NOTIFICATION_IDS_KEY)
            .await
            .context("Failed to clear notification ids")?;

        let included: Vec<Prayer> = Prayer::ALL
            .into_iter()
            .filter(|prayer| include.get(prayer).copied().unwrap_or(false))
            .collect();
        if included.is_empty() {
            return Ok(NotificationScheduleMap::new());
        }

        let source_tz: Tz = timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("Unknown timezone '{timezone}': {e}"))?;
        let now = self.clock.now_utc();

        let mut ids = NotificationScheduleMap::new();
        for prayer in included {
            let time = timings.time_of(prayer)?;
            let (hour, minute) = self.trigger_time(source_tz, time, now)?;
            let content = NotificationContent::for_prayer(prayer, timings.get(prayer));

            let id = self
                .notifications
                .schedule_daily(content, hour, minute)
                .await
                .with_context(|| format!("Failed to schedule {prayer} notification"))?;
            tracing::debug!("{} notification {} at {:02}:{:02}", prayer, id, hour, minute);
            ids.insert(prayer, id);
        }

        store::save_json(self.store.as_ref(), NOTIFICATION_IDS_KEY, &ids)
            .await
            .context("Failed to persist notification ids")?;
        Ok(ids)
    }

    /// Device wall-clock hour and minute for a prayer at `time` in `source_tz`.
    fn trigger_time(&self, source_tz: Tz, time: NaiveTime, now: DateTime<Utc>) -> Result<(u32, u32)> {
        let instant = next_prayer_instant(source_tz, time, now)?;
        Ok(match self.device_timezone {
            Some(device) => {
                let local = instant.with_timezone(&device);
                (local.hour(), local.minute())
            }
            None => {
                let local = instant.with_timezone(&Local);
                (local.hour(), local.minute())
            }
        })
    }

    fn lock_last_applied(&self) -> MutexGuard<'_, Option<String>> {
        self.last_applied.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PrayerNotificationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrayerNotificationScheduler")
            .field("device_timezone", &self.device_timezone)
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

/// Today's occurrence of `time` in `tz`, or tomorrow's if today's is not in
/// the future or does not exist.
pub fn next_prayer_instant(tz: Tz, time: NaiveTime, now: DateTime<Utc>) -> Result<DateTime<Tz>> {
    let today = now.with_timezone(&tz).date_naive();
    // A wall time skipped by a DST change today still exists tomorrow
    if let Ok(instant) = instant_on(tz, today, time) {
        if instant > now {
            return Ok(instant);
        }
    }
    let tomorrow = today
        .checked_add_days(Days::new(1))
        .context("Date out of range")?;
    instant_on(tz, tomorrow, time)
}

fn instant_on(tz: Tz, date: NaiveDate, time: NaiveTime) -> Result<DateTime<Tz>> {
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .with_context(|| format!("{date} {time} does not exist in {tz}"))
}

/// Identifiers issued by the last successful pass. Empty when absent or corrupt.
pub async fn load_schedule_map(store: &dyn KeyValueStore) -> NotificationScheduleMap {
    match store::load_json(store, NOTIFICATION_IDS_KEY).await {
        Ok(map) => map.unwrap_or_default(),
        Err(e) => {
            tracing::warn!("Failed to read notification ids: {:#}", e);
            NotificationScheduleMap::new()
        }
    }
}

/// The user's saved include flags, or `fallback` if none were saved.
pub async fn load_include_map(store: &dyn KeyValueStore, fallback: &IncludeMap) -> IncludeMap {
    match store::load_json(store, NOTIFICATION_SETTINGS_KEY).await {
        Ok(Some(map)) => map,
        Ok(None) => fallback.clone(),
        Err(e) => {
            tracing::warn!("Failed to read notification settings: {:#}", e);
            fallback.clone()
        }
    }
}

pub async fn save_include_map(store: &dyn KeyValueStore, include: &IncludeMap) -> Result<()> {
    store::save_json(store, NOTIFICATION_SETTINGS_KEY, include)
        .await
        .context("Failed to save notification settings")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use chrono_tz::{America::New_York, Asia::Riyadh, Europe::London};

    use super::*;
    use crate::notifications::MockNotificationSystem;
    use crate::store::MemoryStore;
    use crate::traits::MockClock;

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_next_instant_later_today() {
        // 09:00 in Riyadh (UTC+3)
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 6, 0, 0).unwrap();
        let instant = next_prayer_instant(Riyadh, time(12, 10), now).unwrap();
        assert_eq!(instant.date_naive(), NaiveDate::from_ymd_opt(2024, 6, 15).unwrap());
        assert_eq!((instant.hour(), instant.minute()), (12, 10));
    }

    #[test]
    fn test_next_instant_rolls_over_when_passed() {
        // 20:00 in Riyadh, Fajr already passed
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 17, 0, 0).unwrap();
        let instant = next_prayer_instant(Riyadh, time(4, 0), now).unwrap();
        assert_eq!(instant.date_naive(), NaiveDate::from_ymd_opt(2024, 6, 16).unwrap());
        assert_eq!((instant.hour(), instant.minute()), (4, 0));
    }

    #[test]
    fn test_source_date_is_taken_in_source_zone() {
        // 23:30 UTC on the 15th is already the 16th in Riyadh
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 23, 30, 0).unwrap();
        let instant = next_prayer_instant(Riyadh, time(4, 0), now).unwrap();
        assert_eq!(instant.date_naive(), NaiveDate::from_ymd_opt(2024, 6, 16).unwrap());
    }

    #[test]
    fn test_trigger_converts_to_device_zone() {
        let scheduler = PrayerNotificationScheduler::new(
            Arc::new(MockNotificationSystem::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(MockClock::new(Utc::now())),
        )
        .with_device_timezone(London);

        // 13:00 in New York in June is 18:00 in London
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        assert_eq!(scheduler.trigger_time(New_York, time(13, 0), now).unwrap(), (18, 0));
    }

    #[test]
    fn test_nonexistent_local_time_is_an_error() {
        // Clocks jump from 02:00 to 03:00 in New York on 2024-03-10
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        assert!(instant_on(New_York, date, time(2, 30)).is_err());
    }

    #[test]
    fn test_time_in_todays_dst_gap_rolls_to_tomorrow() {
        // Midnight in New York on the day 02:00 jumps to 03:00
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 5, 0, 0).unwrap();
        let instant = next_prayer_instant(New_York, time(2, 30), now).unwrap();
        assert_eq!(instant.date_naive(), NaiveDate::from_ymd_opt(2024, 3, 11).unwrap());
        assert_eq!((instant.hour(), instant.minute()), (2, 30));
    }

    #[tokio::test]
    async fn test_dst_gap_today_still_schedules() {
        let notifications = MockNotificationSystem::new();
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 5, 0, 0).unwrap();
        let scheduler = PrayerNotificationScheduler::new(
            Arc::new(notifications.clone()),
            Arc::new(MemoryStore::new()),
            Arc::new(MockClock::new(now)),
        )
        .with_device_timezone(New_York);

        let timings = PrayerTiming {
            fajr: "02:30".to_string(),
            sunrise: "06:10".to_string(),
            dhuhr: "12:10".to_string(),
            asr: "15:20".to_string(),
            maghrib: "18:00".to_string(),
            isha: "19:20".to_string(),
        };
        let include: IncludeMap = [(Prayer::Fajr, true)].into_iter().collect();

        let outcome = scheduler.apply(&timings, "America/New_York", &include).await;
        assert!(matches!(outcome, ScheduleOutcome::Scheduled(_)), "{outcome:?}");
        let scheduled = notifications.scheduled();
        assert_eq!((scheduled[0].hour, scheduled[0].minute), (2, 30));
    }

    #[tokio::test]
    async fn test_include_map_falls_back_until_saved() {
        let store = MemoryStore::new();
        let fallback: IncludeMap = [(Prayer::Fajr, true)].into_iter().collect();
        assert_eq!(load_include_map(&store, &fallback).await, fallback);

        let saved: IncludeMap = [(Prayer::Isha, true), (Prayer::Fajr, false)].into_iter().collect();
        save_include_map(&store, &saved).await.unwrap();
        assert_eq!(load_include_map(&store, &fallback).await, saved);
    }

    #[tokio::test]
    async fn test_schedule_map_empty_when_corrupt() {
        let store = MemoryStore::new();
        store.set(NOTIFICATION_IDS_KEY, "[1,2".to_string()).await.unwrap();
        assert!(load_schedule_map(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_busy_flag_drops_concurrent_call() {
        let scheduler = PrayerNotificationScheduler::new(
            Arc::new(MockNotificationSystem::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(MockClock::new(Utc::now())),
        );
        scheduler.in_flight.store(true, Ordering::SeqCst);

        let timings = PrayerTiming {
            fajr: "04:00".into(),
            sunrise: "05:30".into(),
            dhuhr: "12:00".into(),
            asr: "15:30".into(),
            maghrib: "18:30".into(),
            isha: "20:00".into(),
        };
        let outcome = scheduler.apply(&timings, "UTC", &IncludeMap::new()).await;
        assert_eq!(outcome, ScheduleOutcome::Busy);
        // The dropped call must not clear a flag it does not own
        assert!(scheduler.in_flight.load(Ordering::SeqCst));
    }
}
