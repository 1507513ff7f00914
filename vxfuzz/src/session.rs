//! Session driver: feeds test cases through the lifecycle until done.

use crate::lifecycle::TestLifecycle;
use crate::model::TestCaseSource;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vxfuzz_common::transport::DEFAULT_RECEIVE_LIMIT;
use vxfuzz_common::{
    ControlProgram, DebugChannel, HarnessError, LivenessProbe, ReportSink, Result, TestCase,
};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Stop after this many tests.
    pub max_tests: Option<u64>,
    /// Pause between two tests.
    pub delay_between_tests: Duration,
    /// Upper bound for one response read.
    pub receive_limit: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_tests: None,
            delay_between_tests: Duration::ZERO,
            receive_limit: DEFAULT_RECEIVE_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model produced no more cases.
    Exhausted,
    /// `max_tests` reached.
    MaxTests,
    /// Cancellation token fired (interrupt or deadline).
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub tests_run: u64,
    pub transport_failures: u64,
    pub crashes: u64,
    pub recoveries: u64,
    #[serde(with = "elapsed_secs")]
    pub elapsed: Duration,
    pub stop_reason: StopReason,
}

mod elapsed_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}

impl std::fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} tests in {}, {} crashes, {} transport failures, {} recoveries ({:?})",
            self.tests_run,
            humantime::format_duration(Duration::from_secs(self.elapsed.as_secs())),
            self.crashes,
            self.transport_failures,
            self.recoveries,
            self.stop_reason
        )
    }
}

#[derive(Debug, Default)]
struct Counters {
    tests_run: u64,
    transport_failures: u64,
    crashes: u64,
}

pub struct FuzzSession<C, D, P, M>
where
    C: ControlProgram,
    D: DebugChannel,
    P: LivenessProbe,
    M: TestCaseSource,
{
    lifecycle: TestLifecycle<C, D, P>,
    model: M,
    sink: Box<dyn ReportSink>,
    options: SessionOptions,
    counters: Counters,
}

impl<C, D, P, M> FuzzSession<C, D, P, M>
where
    C: ControlProgram,
    D: DebugChannel,
    P: LivenessProbe,
    M: TestCaseSource,
{
    pub fn new(
        lifecycle: TestLifecycle<C, D, P>,
        model: M,
        sink: Box<dyn ReportSink>,
        options: SessionOptions,
    ) -> Self {
        Self {
            lifecycle,
            model,
            sink,
            options,
            counters: Counters::default(),
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Run the whole session.
    ///
    /// Teardown runs exactly once whenever setup succeeded or was
    /// interrupted. A teardown error is returned only if the session itself
    /// ended cleanly.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<SessionSummary> {
        let started = Instant::now();
        if let Some(total) = self.model.total() {
            info!("Model provides {} test cases", total);
        }

        let setup = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HarnessError::Cancelled),
            result = self.lifecycle.setup() => result,
        };
        if let Err(e) = setup {
            if matches!(e, HarnessError::Cancelled) {
                info!("Session interrupted during setup");
                if let Err(teardown_err) = self.lifecycle.teardown().await {
                    error!("Teardown after interrupted setup failed: {}", teardown_err);
                }
            }
            return Err(e);
        }

        let outcome = self.test_loop(cancel).await;
        let teardown = self.lifecycle.teardown().await;

        let stop_reason = match (outcome, teardown) {
            (Ok(reason), Ok(())) => reason,
            (Ok(_), Err(e)) => return Err(e),
            (Err(e), Ok(())) => return Err(e),
            (Err(e), Err(teardown_err)) => {
                error!("Teardown after failure also failed: {}", teardown_err);
                return Err(e);
            }
        };

        let summary = SessionSummary {
            tests_run: self.counters.tests_run,
            transport_failures: self.counters.transport_failures,
            crashes: self.counters.crashes,
            recoveries: self.lifecycle.recoveries(),
            elapsed: started.elapsed(),
            stop_reason,
        };
        info!("Session finished: {}", summary);
        if let Ok(json) = serde_json::to_string(&summary) {
            debug!(target: "vxfuzz::summary", "{}", json);
        }
        Ok(summary)
    }

    async fn test_loop(&mut self, cancel: &CancellationToken) -> Result<StopReason> {
        loop {
            if cancel.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }
            if self
                .options
                .max_tests
                .is_some_and(|max| self.counters.tests_run >= max)
            {
                return Ok(StopReason::MaxTests);
            }
            let Some(case) = self.model.next_case() else {
                return Ok(StopReason::Exhausted);
            };

            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(HarnessError::Cancelled),
                result = self.run_case(&case, cancel) => result,
            };
            match step {
                Ok(()) => {}
                Err(HarnessError::Cancelled) => {
                    info!("Session interrupted during test {}", case.number);
                    return Ok(StopReason::Cancelled);
                }
                Err(e) => {
                    error!(
                        "Test {} aborted the session while {}: {}",
                        case.number,
                        self.lifecycle.phase(),
                        e
                    );
                    return Err(e);
                }
            }

            if !self.options.delay_between_tests.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.options.delay_between_tests) => {}
                }
            }
        }
    }

    async fn run_case(&mut self, case: &TestCase, cancel: &CancellationToken) -> Result<()> {
        let number = case.number;
        match self.lifecycle.pre_test(number, cancel).await {
            Ok(()) => {
                match self
                    .lifecycle
                    .execute(&case.payload, self.options.receive_limit)
                    .await
                {
                    Ok(response) => debug!("Test {}: {} bytes back", number, response.len()),
                    Err(e) => {
                        warn!("Test {}: {}", number, e);
                        self.counters.transport_failures += 1;
                        self.model.record_failure(number, &e.to_string());
                    }
                }
            }
            Err(HarnessError::Transport(e)) => {
                warn!("Test {}: {}", number, e);
                self.counters.transport_failures += 1;
                self.model.record_failure(number, &e.to_string());
            }
            Err(e) => return Err(e),
        }

        let outcome = self.lifecycle.post_test(self.sink.as_mut()).await?;
        self.counters.tests_run += 1;
        if outcome.failed() {
            self.counters.crashes += 1;
            self.model
                .record_failure(outcome.test_number, "crash detected by debug agent");
        }
        Ok(())
    }
}
