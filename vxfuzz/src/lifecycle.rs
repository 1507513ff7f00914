//! Per-test lifecycle: setup, health checks, recovery, crash collection.
//!
//! ```text
//! Uninitialized -> Starting -> Ready -> [Probing -> Executing -> Reporting] -> Ready ... -> TornDown
//!                                        Probing -> Recovering -> Ready
//! ```
//!
//! `Starting` and `Recovering` mean the VM may have been powered on without
//! being confirmed healthy. Teardown from either stops it without treating
//! its state as outside interference.
//!
//! Within one test the ordering is strict: health check, transport open,
//! payload, transport close, crash collection. An unhealthy environment at
//! `pre_test` gets exactly one restart-and-rearm cycle; if that cycle cannot
//! restore health the session is over.

use crate::health::{HealthMonitor, TestEnd};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vxfuzz_common::liveness::DEFAULT_PROBE_TIMEOUT;
use vxfuzz_common::transport::DEFAULT_TRANSPORT_TIMEOUT;
use vxfuzz_common::{
    ControlProgram, CrashReport, DebugChannel, EnvironmentController, HarnessError, LivenessProbe,
    ReportSink, Result, TargetEndpoint, TransportError, TransportSession,
};

/// Where the orchestrator is in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Starting,
    Recovering,
    Ready,
    Probing,
    Executing,
    Reporting,
    TornDown,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Recovering => "recovering",
            Self::Ready => "ready",
            Self::Probing => "probing",
            Self::Executing => "executing",
            Self::Reporting => "reporting",
            Self::TornDown => "torn down",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Connect timeout for liveness probes.
    pub probe_timeout: Duration,
    /// Connect/send/receive timeout for test traffic.
    pub transport_timeout: Option<Duration>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            transport_timeout: Some(DEFAULT_TRANSPORT_TIMEOUT),
        }
    }
}

/// Result of one completed test.
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub test_number: u64,
    pub crash: Option<CrashReport>,
}

impl TestOutcome {
    pub fn failed(&self) -> bool {
        self.crash.is_some()
    }
}

/// Drives one fuzzing session against one VM.
pub struct TestLifecycle<C: ControlProgram, D: DebugChannel, P: LivenessProbe> {
    env: EnvironmentController<C>,
    probe: P,
    monitor: HealthMonitor<D>,
    endpoint: TargetEndpoint,
    transport: TransportSession,
    config: LifecycleConfig,
    phase: Phase,
    current_test: Option<u64>,
    recoveries: u64,
}

impl<C: ControlProgram, D: DebugChannel, P: LivenessProbe> TestLifecycle<C, D, P> {
    pub fn new(
        env: EnvironmentController<C>,
        probe: P,
        monitor: HealthMonitor<D>,
        endpoint: TargetEndpoint,
        config: LifecycleConfig,
    ) -> Self {
        let transport = TransportSession::new(endpoint.clone(), config.transport_timeout);
        Self {
            env,
            probe,
            monitor,
            endpoint,
            transport,
            config,
            phase: Phase::Uninitialized,
            current_test: None,
            recoveries: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn monitor(&self) -> &HealthMonitor<D> {
        &self.monitor
    }

    /// Number of restart-and-rearm cycles so far.
    pub fn recoveries(&self) -> u64 {
        self.recoveries
    }

    #[cfg(test)]
    pub fn current_test(&self) -> Option<u64> {
        self.current_test
    }

    async fn is_target_alive(&self) -> bool {
        self.probe
            .is_alive(&self.endpoint, self.config.probe_timeout)
            .await
    }

    /// Bring the environment to a known-good state and arm crash detection.
    pub async fn setup(&mut self) -> Result<()> {
        if self.phase == Phase::TornDown {
            return Err(HarnessError::SetupFailure(
                "session already torn down".to_string(),
            ));
        }
        if self.phase == Phase::Uninitialized {
            self.phase = Phase::Starting;
        }

        self.env.revert_snapshot().await?;
        self.env.start().await?;
        if !self.env.is_running().await? {
            return Err(HarnessError::SetupFailure("Cannot start the VM".to_string()));
        }
        if !self.is_target_alive().await {
            return Err(HarnessError::SetupFailure(
                "Targeted service is not available".to_string(),
            ));
        }

        let connection = self.monitor.setup().await?;
        debug!("Environment ready, crash detection on {}", connection);
        self.phase = Phase::Ready;
        Ok(())
    }

    /// Restart the VM from its snapshot, then run [`setup`](Self::setup) again.
    pub async fn restart_and_rearm(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.recoveries += 1;
        self.phase = Phase::Recovering;
        self.transport.close().await;
        self.env.restart(cancel).await?;
        self.setup().await?;
        info!("Environment recovered (recovery #{})", self.recoveries);
        Ok(())
    }

    /// Check health, recover once if needed, then open the transport.
    ///
    /// A transport error here is a per-test failure; [`post_test`](Self::post_test)
    /// must still be called to collect crash evidence.
    pub async fn pre_test(&mut self, test_number: u64, cancel: &CancellationToken) -> Result<()> {
        match self.phase {
            Phase::Ready => {}
            Phase::Uninitialized | Phase::Starting | Phase::Recovering | Phase::TornDown => {
                return Err(HarnessError::SetupFailure(format!(
                    "cannot start test {} while {}",
                    test_number, self.phase
                )));
            }
            other => {
                warn!(
                    "pre_test({}) called while {}, dropping the previous connection",
                    test_number, other
                );
                self.transport.close().await;
            }
        }
        self.phase = Phase::Probing;

        let running = self.env.is_running().await?;
        let healthy = running && self.is_target_alive().await;
        if !healthy {
            error!("VM is not running or service is down");
            self.restart_and_rearm(cancel).await?;
        }

        self.current_test = Some(test_number);
        let opened = self.transport.open().await;
        self.monitor.on_test_start(test_number);
        self.phase = Phase::Executing;
        opened?;
        Ok(())
    }

    /// Send one payload and read back whatever the target answers.
    pub async fn execute(
        &mut self,
        payload: &[u8],
        receive_limit: usize,
    ) -> std::result::Result<Vec<u8>, TransportError> {
        self.transport.send(payload).await?;
        self.transport.receive(receive_limit).await
    }

    /// Close the transport, collect crash evidence, and report it.
    pub async fn post_test(&mut self, sink: &mut dyn ReportSink) -> Result<TestOutcome> {
        self.phase = Phase::Reporting;
        self.transport.close().await;

        let test_number = self.current_test.take().unwrap_or_default();
        let TestEnd { crash, rearm } = self.monitor.on_test_end().await?;
        if let Some(report) = &crash
            && let Err(e) = sink.report_crash(report)
        {
            error!("Failed to record crash for test {}: {}", test_number, e);
        }
        rearm?;

        self.phase = Phase::Ready;
        Ok(TestOutcome { test_number, crash })
    }

    /// Release everything and stop the VM. Runs once; later calls are no-ops.
    ///
    /// Before setup nothing was started, so nothing is stopped. While the VM
    /// is starting or recovering its state is unknown: a stop is attempted
    /// and a failure is only logged.
    pub async fn teardown(&mut self) -> Result<()> {
        let previous = std::mem::replace(&mut self.phase, Phase::TornDown);
        if previous == Phase::TornDown {
            debug!("Teardown already done");
            return Ok(());
        }
        self.current_test = None;
        self.transport.close().await;
        if self.monitor.is_armed() {
            self.monitor.teardown().await;
        }

        match previous {
            Phase::Uninitialized => return Ok(()),
            Phase::Starting | Phase::Recovering => {
                let vm = self.env.handle().image_name();
                warn!("Tearing down while {}, VM {} may still be booting", previous, vm);
                if let Err(e) = self.env.stop().await {
                    warn!("Could not stop VM {}, check it by hand: {}", vm, e);
                }
                return Ok(());
            }
            _ => {}
        }

        if !self.env.is_running().await? {
            return Err(HarnessError::UnexpectedTeardownState);
        }
        self.env.stop().await
    }
}
