//! Crash detection across test executions.
//!
//! The debug service delivers at most one fault notification per
//! connection, so the monitor cycles its connection after every test. Each
//! connection gets a supervised watch task that blocks on the notification
//! and hands it over through a one-slot channel.

use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vxfuzz_common::{ConnectionId, CrashReport, DebugChannel, DebugError, DebugSession, Result};

/// Default wait after a test for an in-flight notification.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Health monitor configuration.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Delay between the end of a test and the crash check.
    pub settle_delay: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

/// What the end of a test produced.
///
/// `crash` is kept even when re-arming failed.
#[derive(Debug)]
pub struct TestEnd {
    pub crash: Option<CrashReport>,
    pub rearm: Result<ConnectionId>,
}

/// One armed connection plus the task watching it.
///
/// The task is the only writer of `report_rx`'s sender; the control flow is
/// the only reader.
struct WatchLoop<S> {
    connection: ConnectionId,
    stop_tx: Option<oneshot::Sender<()>>,
    report_rx: oneshot::Receiver<serde_json::Value>,
    task: Option<JoinHandle<S>>,
}

impl<S: DebugSession> WatchLoop<S> {
    fn start(mut session: S) -> Self {
        let connection = session.id();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let (report_tx, report_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            tokio::select! {
                // A notification that is already there wins over a stop request.
                biased;
                result = session.monitor() => match result {
                    Ok(context) => {
                        debug!("Fault notification on {}", connection);
                        let _ = report_tx.send(context);
                    }
                    Err(DebugError::Closed) => debug!("{} closed while watching", connection),
                    Err(e) => warn!("Watch loop on {} ended: {}", connection, e),
                },
                _ = &mut stop_rx => {}
            }
            session
        });

        Self {
            connection,
            stop_tx: Some(stop_tx),
            report_rx,
            task: Some(task),
        }
    }

    /// Stop the task, wait for it, and release its connection.
    ///
    /// Returns the notification if one was delivered before the stop.
    async fn finish(mut self) -> Option<serde_json::Value> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(session) => session.disconnect().await,
                Err(e) => warn!("Watch task for {} did not exit cleanly: {}", self.connection, e),
            }
        }
        self.report_rx.try_recv().ok()
    }
}

impl<S> Drop for WatchLoop<S> {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Keeps a fresh one-shot fault notification armed for every test.
pub struct HealthMonitor<D: DebugChannel> {
    channel: D,
    config: HealthConfig,
    watch: Option<WatchLoop<D::Session>>,
    current_test: Option<u64>,
}

impl<D: DebugChannel> HealthMonitor<D> {
    pub fn new(channel: D, config: HealthConfig) -> Self {
        Self {
            channel,
            config,
            watch: None,
            current_test: None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.watch.is_some()
    }

    /// Connection currently armed, if any.
    pub fn current_connection(&self) -> Option<ConnectionId> {
        self.watch.as_ref().map(|w| w.connection)
    }

    async fn arm(&mut self) -> Result<ConnectionId> {
        let mut session = self.channel.connect().await?;
        session.begin_monitoring().await?;
        let watch = WatchLoop::start(session);
        let connection = watch.connection;
        self.watch = Some(watch);
        Ok(connection)
    }

    /// Connect and start watching. Re-arms when already set up.
    pub async fn setup(&mut self) -> Result<ConnectionId> {
        if let Some(old) = self.watch.take() {
            debug!("Re-arming health monitor, dropping {}", old.connection);
            if let Some(context) = old.finish().await {
                warn!("Discarding fault notified before re-arm: {}", context);
            }
        }
        let connection = self.arm().await?;
        info!("Health monitor armed on {}", connection);
        Ok(connection)
    }

    pub fn on_test_start(&mut self, test_number: u64) {
        debug!("Test {} in flight", test_number);
        self.current_test = Some(test_number);
    }

    /// Collect a crash for the test that just ran, then re-arm on a new
    /// connection whether or not anything was caught.
    ///
    /// Errors only when the monitor was never set up; a failed re-arm is
    /// carried in [`TestEnd::rearm`] next to the collected crash.
    pub async fn on_test_end(&mut self) -> Result<TestEnd> {
        let watch = self.watch.take().ok_or_else(|| {
            DebugError::Protocol("health monitor is not set up".to_string())
        })?;
        tokio::time::sleep(self.config.settle_delay).await;

        let connection = watch.connection;
        let report = watch.finish().await.map(|context| {
            let test_number = self.current_test.unwrap_or_else(|| {
                warn!("Fault on {} with no test in flight", connection);
                0
            });
            info!("Crash detected during test {}", test_number);
            CrashReport::new(test_number, connection, context)
        });

        let rearm = self.arm().await;
        if let Err(e) = &rearm {
            warn!("Could not re-arm crash detection after {}: {}", connection, e);
        }
        Ok(TestEnd {
            crash: report,
            rearm,
        })
    }

    /// Stop watching and disconnect. Safe to call more than once.
    pub async fn teardown(&mut self) {
        if let Some(watch) = self.watch.take() {
            let connection = watch.connection;
            if let Some(context) = watch.finish().await {
                warn!("Fault notified on {} after the last test: {}", connection, context);
            }
            debug!("Health monitor released {}", connection);
        }
        self.current_test = None;
    }
}
