//! Local notification system: daily repeating triggers at a wall-clock time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Days, Local, LocalResult, NaiveTime, TimeZone};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::models::Prayer;
use crate::traits::{Clock, Notifier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
}

impl NotificationContent {
    pub fn for_prayer(prayer: Prayer, time: &str) -> Self {
        Self {
            title: format!("{prayer} Prayer Time"),
            body: format!("It's time for {prayer} prayer ({time})"),
        }
    }
}

#[async_trait]
pub trait LocalNotificationSystem: Send + Sync {
    /// Schedule `content` to fire every day at `hour:minute` device time.
    /// Returns the identifier of the new trigger.
    async fn schedule_daily(&self, content: NotificationContent, hour: u32, minute: u32) -> Result<String>;

    /// Cancel every notification this application has scheduled.
    async fn cancel_all(&self) -> Result<()>;

    async fn scheduled_count(&self) -> usize;
}

/// In-process daily triggers: one tokio task per trigger, delivering through
/// a `Notifier` while the process is alive.
pub struct DesktopNotificationSystem {
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl DesktopNotificationSystem {
    pub fn new(notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            notifier,
            clock,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DesktopNotificationSystem {
    fn drop(&mut self) {
        for (_, handle) in self.lock_tasks().drain() {
            handle.abort();
        }
    }
}

#[async_trait]
impl LocalNotificationSystem for DesktopNotificationSystem {
    async fn schedule_daily(&self, content: NotificationContent, hour: u32, minute: u32) -> Result<String> {
        let at = NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or_else(|| anyhow::anyhow!("Invalid trigger time {hour:02}:{minute:02}"))?;

        let id = Uuid::new_v4().to_string();
        let handle = tokio::spawn(fire_daily(
            self.notifier.clone(),
            self.clock.clone(),
            content,
            at,
        ));
        self.lock_tasks().insert(id.clone(), handle);

        tracing::debug!("Scheduled daily notification {} at {}", id, at.format("%H:%M"));
        Ok(id)
    }

    async fn cancel_all(&self) -> Result<()> {
        let mut tasks = self.lock_tasks();
        let count = tasks.len();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
        tracing::debug!("Cancelled {} scheduled notifications", count);
        Ok(())
    }

    async fn scheduled_count(&self) -> usize {
        self.lock_tasks().len()
    }
}

/// Next local occurrence of `at` strictly after `now`.
pub fn next_daily_occurrence(now: DateTime<Local>, at: NaiveTime) -> DateTime<Local> {
    let mut date = now.date_naive();
    loop {
        let candidate = match Local.from_local_datetime(&date.and_time(at)) {
            LocalResult::Single(t) => Some(t),
            LocalResult::Ambiguous(earliest, _) => Some(earliest),
            // Skipped by a DST jump; fire at the first valid time that day
            LocalResult::None => Local
                .from_local_datetime(&date.and_time(at + chrono::Duration::hours(1)))
                .earliest(),
        };
        if let Some(candidate) = candidate.filter(|t| *t > now) {
            return candidate;
        }
        date = date + Days::new(1);
    }
}

async fn fire_daily(notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>, content: NotificationContent, at: NaiveTime) {
    loop {
        let now = clock.now_local();
        let next = next_daily_occurrence(now, at);
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        if let Err(e) = notifier.notify(&content.title, &content.body) {
            tracing::error!("Failed to deliver notification '{}': {:#}", content.title, e);
        }
        // Step past the trigger minute so the next iteration targets tomorrow
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledNotification {
    pub id: String,
    pub content: NotificationContent,
    pub hour: u32,
    pub minute: u32,
}

#[derive(Debug, Default)]
struct MockNotificationState {
    scheduled: Vec<ScheduledNotification>,
    schedule_calls: usize,
    cancel_all_calls: usize,
    fail_on_schedule: Option<String>,
    next_id: usize,
}

/// Mock notification system that records triggers and call counts.
#[derive(Debug, Clone, Default)]
pub struct MockNotificationSystem {
    state: Arc<Mutex<MockNotificationState>>,
}

impl MockNotificationSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled(&self) -> Vec<ScheduledNotification> {
        self.state.lock().unwrap().scheduled.clone()
    }

    pub fn schedule_calls(&self) -> usize {
        self.state.lock().unwrap().schedule_calls
    }

    pub fn cancel_all_calls(&self) -> usize {
        self.state.lock().unwrap().cancel_all_calls
    }

    /// Make `schedule_daily` fail with `message` until cleared with `None`.
    pub fn fail_on_schedule(&self, message: Option<&str>) {
        self.state.lock().unwrap().fail_on_schedule = message.map(str::to_string);
    }
}

#[async_trait]
impl LocalNotificationSystem for MockNotificationSystem {
    async fn schedule_daily(&self, content: NotificationContent, hour: u32, minute: u32) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.schedule_calls += 1;
        if let Some(message) = state.fail_on_schedule.clone() {
            anyhow::bail!(message);
        }

        state.next_id += 1;
        let id = format!("notification-{}", state.next_id);
        state.scheduled.push(ScheduledNotification {
            id: id.clone(),
            content,
            hour,
            minute,
        });
        Ok(id)
    }

    async fn cancel_all(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.cancel_all_calls += 1;
        state.scheduled.clear();
        Ok(())
    }

    async fn scheduled_count(&self) -> usize {
        self.state.lock().unwrap().scheduled.len()
    }
}
