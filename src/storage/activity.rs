use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::probe::WindowSnapshot;

/// One continuous stretch of focus on a single `(app_name, window_title)` pair.
/// Owned and mutated by the monitor while open; the store only ever sees
/// serialized copies.
///
/// Invariants: `end_time >= start_time` when set, and both time buckets only
/// grow while the activity is open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(default)]
    pub id: String,
    pub app_name: Arc<str>,
    pub window_title: Arc<str>,
    pub process_id: u32,
    pub executable_path: Arc<str>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds spent with the user active, accrued tick by tick.
    #[serde(default)]
    pub active_time: f64,
    /// Seconds spent idle while this window kept focus.
    #[serde(default)]
    pub idle_time: f64,
}

impl Activity {
    pub fn begin(window: &WindowSnapshot, start_time: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            app_name: window.app_name.clone(),
            window_title: window.window_title.clone(),
            process_id: window.process_id,
            executable_path: window.executable_path.clone(),
            start_time,
            end_time: None,
            active_time: 0.0,
            idle_time: 0.0,
        }
    }

    /// Accrues the wall time not yet accounted for into the bucket selected by
    /// `is_idle`. Keeps `active_time + idle_time` equal to the elapsed time at
    /// every call, so rapid idle/active toggling can't skew the totals or drive
    /// a bucket negative.
    pub fn update_times(&mut self, now: DateTime<Utc>, is_idle: bool) {
        let elapsed = (now - self.start_time).num_milliseconds() as f64 / 1000.0;
        let unaccounted = (elapsed - self.active_time - self.idle_time).max(0.0);
        if is_idle {
            self.idle_time += unaccounted;
        } else {
            self.active_time += unaccounted;
        }
    }

    /// End of the interval this activity occupies, falling back to `now` while
    /// it is still open.
    pub fn end_or(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.end_time.unwrap_or(now)
    }

    pub fn matches_window(&self, window: &WindowSnapshot) -> bool {
        self.app_name == window.app_name && self.window_title == window.window_title
    }
}
