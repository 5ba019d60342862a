//! The activity state machine: turns the periodically sampled focus/idle
//! signal into [Activity] records and lifecycle events. `tick` is strictly
//! single-threaded; the run loop is the only intended caller.

pub mod idle;

use std::{sync::Arc, time::Duration as StdDuration};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use idle::IdleEvaluator;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    events::{dispatcher::EventDispatcher, types::Event},
    probe::{FocusProbe, WindowSnapshot},
    storage::{activity::Activity, day_store::ActivityStore},
    utils::clock::Clock,
};

pub struct ActivityMonitor<P: FocusProbe, S: ActivityStore> {
    probe: P,
    store: S,
    dispatcher: Arc<EventDispatcher>,
    clock: Arc<dyn Clock>,
    idle_evaluator: IdleEvaluator,
    poll_interval: StdDuration,
    current_activity: Option<Activity>,
    is_idle: bool,
    idle_start_time: Option<DateTime<Utc>>,
}

impl<P: FocusProbe, S: ActivityStore> ActivityMonitor<P, S> {
    pub fn new(
        probe: P,
        store: S,
        dispatcher: Arc<EventDispatcher>,
        clock: Arc<dyn Clock>,
        idle_evaluator: IdleEvaluator,
        poll_interval: StdDuration,
    ) -> Self {
        Self {
            probe,
            store,
            dispatcher,
            clock,
            idle_evaluator,
            poll_interval,
            current_activity: None,
            is_idle: false,
            idle_start_time: None,
        }
    }

    /// One sampling step. Reads the probe, settles the idle state, accrues
    /// time on the open activity and rolls it over on a focus change.
    pub async fn tick(&mut self) -> Result<()> {
        let now = self.clock.time();
        let idle_secs = self.probe.idle_seconds()?;
        let idle_now = self.idle_evaluator.is_idle(idle_secs);
        let window = self.probe.current_window()?;

        debug!(
            "Tick: app {:?}, idle {idle_secs:.1}s ({idle_now})",
            window.app_name
        );

        if idle_now != self.is_idle {
            self.handle_idle_transition(idle_now, now)?;
        }

        if let Some(current) = self.current_activity.as_mut() {
            current.update_times(now, idle_now);
        }

        let focus_changed = self
            .current_activity
            .as_ref()
            .map_or(false, |current| !current.matches_window(&window));
        // Nothing gets started while the user is away and nothing was open.
        if focus_changed || (self.current_activity.is_none() && !idle_now) {
            self.switch_activity(&window, now).await?;
        }

        Ok(())
    }

    fn handle_idle_transition(&mut self, idle_now: bool, now: DateTime<Utc>) -> Result<()> {
        self.is_idle = idle_now;
        if idle_now {
            self.idle_start_time = Some(now);
            info!("User became idle");
            self.dispatcher.dispatch(&Event::IdleStart {
                last_activity: self.current_activity.clone(),
                timestamp: now,
            })?;
        } else if let Some(started) = self.idle_start_time.take() {
            let idle_duration = seconds_between(started, now);
            info!("User returned after {idle_duration:.1}s idle");
            self.dispatcher.dispatch(&Event::IdleEnd {
                idle_duration,
                timestamp: now,
            })?;
        }
        Ok(())
    }

    /// Finalizes and persists the open activity, then opens a new one for
    /// `window`.
    async fn switch_activity(&mut self, window: &WindowSnapshot, now: DateTime<Utc>) -> Result<()> {
        if let Some(mut finished) = self.current_activity.take() {
            finished.end_time = Some(now);
            let duration = seconds_between(finished.start_time, now);
            info!(
                "Ending activity {} after {duration:.1}s (active {:.1}s, idle {:.1}s)",
                finished.app_name, finished.active_time, finished.idle_time
            );
            self.store.update(&finished).await?;
            self.dispatcher.dispatch(&Event::ActivityEnd {
                activity: finished,
                duration,
                timestamp: now,
            })?;
        }

        let mut activity = Activity::begin(window, now);
        info!(
            "Starting activity {} ({})",
            activity.app_name, activity.window_title
        );
        self.store.add(&mut activity).await?;
        self.dispatcher.dispatch(&Event::ActivityStart {
            activity: activity.clone(),
            timestamp: now,
        })?;
        self.current_activity = Some(activity);
        Ok(())
    }

    /// Drops day partitions older than the retention window and reports the
    /// outcome as a status event.
    pub async fn cleanup_old_data(&self, retention_days: u32) {
        let cutoff = self.clock.time() - Duration::days(i64::from(retention_days));
        match self.store.cleanup_old_activities(cutoff).await {
            Ok(deleted) => self.emit_status(
                "cleanup_completed",
                json!({
                    "deleted_count": deleted,
                    "retention_days": retention_days,
                    "cutoff_date": cutoff.to_rfc3339(),
                }),
            ),
            Err(e) => self.emit_status(
                "cleanup_failed",
                json!({
                    "error": e.to_string(),
                    "retention_days": retention_days,
                }),
            ),
        }
    }

    /// Executes the sampling loop until `shutdown` fires. Errors inside a tick
    /// are reported as `monitoring_error` status events and the loop keeps
    /// going; only cancellation stops it, after which the open activity is
    /// finalized and persisted.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        self.emit_status(
            "monitoring_started",
            json!({
                "idle_threshold": self.idle_evaluator.threshold_secs(),
                "poll_interval_ms": self.poll_interval.as_millis() as u64,
            }),
        );

        let mut tick_point = self.clock.instant();
        loop {
            tick_point += self.poll_interval;

            if let Err(e) = self.tick().await {
                error!("Monitoring tick failed: {e:?}");
                self.emit_status("monitoring_error", json!({ "error": format!("{e:#}") }));
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.clock.sleep_until(tick_point) => (),
            }
        }

        self.finalize().await?;
        self.emit_status("monitoring_stopped", json!({ "reason": "shutdown" }));
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        if let Some(mut open) = self.current_activity.take() {
            open.end_time = Some(self.clock.time());
            self.store.update(&open).await?;
        }
        Ok(())
    }

    fn emit_status(&self, status: &str, details: serde_json::Value) {
        let event = Event::SystemStatus {
            status: status.into(),
            details: Some(details),
            timestamp: self.clock.time(),
        };
        if let Err(e) = self.dispatcher.dispatch(&event) {
            error!("Failed to dispatch {status} status event: {e}");
        }
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}
