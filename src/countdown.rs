//! Next-prayer countdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveTime, Timelike};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::models::{Prayer, PrayerTiming};
use crate::traits::Clock;

const SECONDS_PER_DAY: i64 = 86_400;

/// Remaining time at or below which the next prayer counts as imminent.
const IMMINENT_SECONDS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Countdown {
    pub next_prayer: Prayer,
    /// Nominal `HH:MM` of the next prayer.
    pub time: String,
    pub seconds_remaining: i64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
    /// UI emphasis only; notifications are delivered by the scheduler.
    pub is_imminent: bool,
}

impl Countdown {
    /// `HH:MM:SS` until the next prayer.
    pub fn formatted(&self) -> String {
        format!("{:02}:{:02}:{:02}", self.hours, self.minutes, self.seconds)
    }
}

/// The next prayer after `now` and the time remaining until it.
///
/// A prayer whose time has passed today (or is exactly now) counts as
/// tomorrow's occurrence. Ties keep the first prayer in canonical order.
/// Entries that fail to parse are skipped.
pub fn next_prayer(timings: &PrayerTiming, now: NaiveTime) -> Option<Countdown> {
    let now_seconds = i64::from(now.num_seconds_from_midnight());

    let mut best: Option<(Prayer, i64)> = None;
    for prayer in Prayer::ALL {
        let Ok(time) = timings.time_of(prayer) else {
            continue;
        };

        let mut delta = i64::from(time.num_seconds_from_midnight()) - now_seconds;
        if delta <= 0 {
            delta += SECONDS_PER_DAY;
        }

        if best.is_none_or(|(_, best_delta)| delta < best_delta) {
            best = Some((prayer, delta));
        }
    }

    best.map(|(prayer, delta)| Countdown {
        next_prayer: prayer,
        time: timings.get(prayer).chars().take(5).collect(),
        seconds_remaining: delta,
        hours: delta / 3600,
        minutes: (delta % 3600) / 60,
        seconds: delta % 60,
        is_imminent: delta <= IMMINENT_SECONDS,
    })
}

/// Recomputes the countdown once per second on a background task.
///
/// The task stops when the ticker is dropped.
#[derive(Debug)]
pub struct CountdownTicker {
    timings: watch::Sender<Option<PrayerTiming>>,
    countdown: watch::Receiver<Option<Countdown>>,
    handle: JoinHandle<()>,
}

impl CountdownTicker {
    pub fn spawn(clock: Arc<dyn Clock>) -> Self {
        let (timings_tx, timings_rx) = watch::channel(None);
        let (countdown_tx, countdown_rx) = watch::channel(None);
        let handle = tokio::spawn(tick(clock, timings_rx, countdown_tx));

        Self {
            timings: timings_tx,
            countdown: countdown_rx,
            handle,
        }
    }

    /// Replace the timings the countdown is computed from.
    pub fn set_timings(&self, timings: Option<PrayerTiming>) {
        self.timings.send_replace(timings);
    }

    pub fn current(&self) -> Option<Countdown> {
        self.countdown.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Countdown>> {
        self.countdown.clone()
    }
}

impl Drop for CountdownTicker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn tick(
    clock: Arc<dyn Clock>,
    mut timings: watch::Receiver<Option<PrayerTiming>>,
    countdown: watch::Sender<Option<Countdown>>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = timings.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let now = clock.now_local().time();
        let next = timings
            .borrow_and_update()
            .as_ref()
            .and_then(|t| next_prayer(t, now));
        countdown.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
