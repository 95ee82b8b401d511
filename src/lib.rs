//! Prayer Times Library
//!
//! Caching, change notification, countdown and notification scheduling for
//! daily prayer times. The binary wires these together; the pieces are
//! exposed here for testing and reuse.

pub mod api;
pub mod app;
pub mod cache;
pub mod config;
pub mod countdown;
pub mod location;
pub mod models;
pub mod notifications;
pub mod publisher;
pub mod schedule;
pub mod store;
pub mod traits;

// Re-export commonly used types
pub use api::{AladhanClient, MockPrayerTimeSource, PrayerTimeSource};
pub use app::{FetchRequest, PrayerTimesApp};
pub use cache::{CacheSettings, FetchError, PrayerTimesCacheManager};
pub use config::AppConfig;
pub use countdown::{Countdown, CountdownTicker, next_prayer};
pub use location::{
    Address, FixedLocationProvider, LocationError, LocationProvider, MockLocationProvider, WatchOptions,
};
pub use models::{
    CacheEntry, Coordinates, IncludeMap, NotificationScheduleMap, Prayer, PrayerTimesResult,
    PrayerTiming,
};
pub use notifications::{
    DesktopNotificationSystem, LocalNotificationSystem, MockNotificationSystem,
    NotificationContent,
};
pub use publisher::{PrayerTimesState, Publisher, SubscriberCallback, Subscription};
pub use schedule::{PrayerNotificationScheduler, ScheduleOutcome};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};
pub use traits::{Clock, LogNotifier, MockClock, MockNotifier, Notifier, SystemClock};
#[cfg(feature = "desktop")]
pub use traits::SystemNotifier;
