use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use shutdown::detect_shutdown;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    events::{
        dispatcher::{EventDispatcher, EventHandler},
        types::Event,
    },
    monitor::{idle::IdleEvaluator, ActivityMonitor},
    probe::FocusProbe,
    storage::day_store::DayPartitionedStore,
    utils::clock::{Clock, SystemClock},
};

pub mod args;
pub mod shutdown;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_IDLE_THRESHOLD_SECS: f64 = 300.0;

pub struct DaemonConfig {
    pub idle_threshold_secs: f64,
    pub poll_interval: Duration,
    pub retention_days: Option<u32>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            idle_threshold_secs: DEFAULT_IDLE_THRESHOLD_SECS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retention_days: None,
        }
    }
}

impl From<&args::DaemonArgs> for DaemonConfig {
    fn from(args: &args::DaemonArgs) -> Self {
        Self {
            idle_threshold_secs: args.idle_threshold,
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            retention_days: args.retention_days,
        }
    }
}

/// Represents the starting point for the daemon: wires probe, store,
/// dispatcher and monitor together and runs until a shutdown signal arrives.
pub async fn start_daemon(
    app_dir: PathBuf,
    probe: impl FocusProbe,
    config: DaemonConfig,
) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let shutdown_token = CancellationToken::new();

    let (monitor, _dispatcher) = build_monitor(probe, app_dir.join("activities"), &config, clock)?;

    if let Some(retention_days) = config.retention_days {
        monitor.cleanup_old_data(retention_days).await;
    }

    run_with_shutdown(
        monitor,
        shutdown_token.clone(),
        detect_shutdown(shutdown_token),
    )
    .await
}

type BuiltMonitor<P> = ActivityMonitor<P, Arc<DayPartitionedStore>>;

/// Runs the monitor alongside whatever future flips the cancellation token.
/// The monitor's result is the daemon's result.
async fn run_with_shutdown<P: FocusProbe>(
    monitor: BuiltMonitor<P>,
    shutdown: CancellationToken,
    signal: impl Future<Output = ()>,
) -> Result<()> {
    let (_, run_result) = tokio::join!(signal, monitor.run(shutdown));
    run_result
}

fn build_monitor<P: FocusProbe>(
    probe: P,
    store_dir: PathBuf,
    config: &DaemonConfig,
    clock: Arc<dyn Clock>,
) -> Result<(BuiltMonitor<P>, Arc<EventDispatcher>)> {
    let dispatcher = Arc::new(EventDispatcher::new(clock.clone()));
    dispatcher.subscribe(Arc::new(LogHandler), None);

    let store = Arc::new(DayPartitionedStore::new(store_dir, clock.clone())?);

    let monitor = ActivityMonitor::new(
        probe,
        store,
        dispatcher.clone(),
        clock,
        IdleEvaluator::from_seconds(config.idle_threshold_secs),
        config.poll_interval,
    );
    Ok((monitor, dispatcher))
}

/// Global subscriber mirroring the event stream into the daemon log.
struct LogHandler;

impl EventHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    fn handle(&self, event: &Event) -> Result<()> {
        match event {
            Event::ActivityStart { activity, .. } => {
                info!("Activity started: {}", activity.app_name)
            }
            Event::ActivityEnd {
                activity, duration, ..
            } => info!(
                "Activity ended: {} (duration: {duration:.1}s)",
                activity.app_name
            ),
            Event::IdleStart { .. } => info!("User became idle"),
            Event::IdleEnd { idle_duration, .. } => {
                info!("User returned from idle (duration: {idle_duration:.1}s)")
            }
            Event::SystemStatus {
                status, details, ..
            } => info!("System status: {status} {details:?}"),
            Event::Error {
                error_type,
                error_message,
                ..
            } => error!("System error ({error_type}): {error_message}"),
            other => debug!("Event: {}", other.event_type()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod daemon_tests {
    use std::{sync::Arc, time::Duration};

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::tempdir;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use crate::{
        probe::{MockFocusProbe, WindowSnapshot},
        storage::day_store::{ActivityStore, DayPartitionedStore},
        utils::{clock::Clock, logging::TEST_LOGGING},
    };

    use super::{build_monitor, run_with_shutdown, DaemonConfig};

    #[derive(Clone)]
    struct TestClock {
        start_time: DateTime<Utc>,
        reference: Instant,
    }

    #[async_trait]
    impl Clock for TestClock {
        fn time(&self) -> DateTime<Utc> {
            self.start_time + self.reference.elapsed()
        }

        fn instant(&self) -> Instant {
            Instant::now()
        }

        async fn sleep_until(&self, instant: Instant) {
            tokio::time::sleep_until(instant).await;
        }
    }

    fn test_windows() -> Vec<WindowSnapshot> {
        ["alpha", "alpha", "beta"]
            .into_iter()
            .map(|app| WindowSnapshot {
                app_name: app.into(),
                window_title: format!("{app} window").into(),
                process_id: 1,
                executable_path: format!("/usr/bin/{app}").into(),
            })
            .collect()
    }

    /// Very simple smoke test to check that the wired-up daemon samples,
    /// persists and shuts down cleanly.
    #[tokio::test]
    async fn smoke_test_daemon() -> Result<()> {
        *TEST_LOGGING;

        let mut probe = MockFocusProbe::new();
        probe.expect_idle_seconds().returning(|| Ok(0.0));
        let mut windows = test_windows().into_iter().cycle();
        probe
            .expect_current_window()
            .returning(move || Ok(windows.next().unwrap()));

        let start_time = Utc.with_ymd_and_hms(2024, 3, 7, 12, 0, 0).unwrap();
        let clock = Arc::new(TestClock {
            start_time,
            reference: Instant::now(),
        });

        let dir = tempdir()?;
        let config = DaemonConfig {
            poll_interval: Duration::from_millis(200),
            ..DaemonConfig::default()
        };
        let (monitor, dispatcher) =
            build_monitor(probe, dir.path().to_path_buf(), &config, clock.clone())?;

        let shutdown_token = CancellationToken::new();
        let stopper = shutdown_token.clone();
        run_with_shutdown(monitor, shutdown_token, async {
            tokio::time::sleep(Duration::from_millis(1100)).await;
            stopper.cancel();
        })
        .await?;

        // One partition file plus the key file.
        let files = std::fs::read_dir(dir.path())?.count();
        assert_eq!(files, 2);

        let store = DayPartitionedStore::new(dir.path().to_path_buf(), clock.clone())?;
        let stored = store
            .get_by_timerange(start_time, clock.time())
            .await?;
        assert!(!stored.is_empty());
        // Shutdown finalized whatever was still open.
        assert!(stored.iter().all(|a| a.end_time.is_some()));

        assert!(!dispatcher.get_recent_events(None, 1000).is_empty());

        Ok(())
    }
}
