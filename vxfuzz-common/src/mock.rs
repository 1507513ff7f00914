//! Deterministic stand-ins for the external collaborators.
//!
//! - [`MockControlProgram`]: simulated VM power state behind a fake `vmrun`.
//! - [`MockProbe`]: scripted liveness answers.
//! - [`MockDebugChannel`]: one-shot crash notifications per connection.
//!
//! All of them are cheap to clone; clones share state so a test can keep a
//! handle and flip the simulated world while the code under test runs.

use crate::debug::{DebugChannel, DebugSession, next_connection_id};
use crate::errors::DebugError;
use crate::liveness::LivenessProbe;
use crate::types::{ConnectionId, TargetEndpoint};
use crate::vm::{CommandOutput, ControlProgram, VmCommand};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Control program ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MockVmState {
    running: bool,
    boot_polls: u32,
    pending_boot_polls: u32,
    failing: HashSet<VmCommand>,
    calls: Vec<(VmCommand, Vec<String>)>,
}

/// Fake control program that keeps a simulated VM power state.
#[derive(Debug, Clone)]
pub struct MockControlProgram {
    image: String,
    state: Arc<Mutex<MockVmState>>,
}

impl MockControlProgram {
    /// `image` is what `list` prints while the VM runs.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            state: Arc::new(Mutex::new(MockVmState::default())),
        }
    }

    /// Number of `list` calls after `start` that still report the VM as down.
    #[must_use]
    pub fn with_boot_polls(self, polls: u32) -> Self {
        lock(&self.state).boot_polls = polls;
        self
    }

    /// Flip the simulated power state from outside the harness.
    pub fn set_running(&self, running: bool) {
        let mut state = lock(&self.state);
        state.running = running;
        state.pending_boot_polls = 0;
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    /// Make every future invocation of `command` exit non-zero.
    pub fn fail_command(&self, command: VmCommand) {
        lock(&self.state).failing.insert(command);
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failing.clear();
    }

    /// Every invocation so far, in order.
    pub fn calls(&self) -> Vec<(VmCommand, Vec<String>)> {
        lock(&self.state).calls.clone()
    }

    /// Commands only, in order.
    pub fn commands(&self) -> Vec<VmCommand> {
        lock(&self.state).calls.iter().map(|(c, _)| *c).collect()
    }

    pub fn count(&self, command: VmCommand) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|(c, _)| *c == command)
            .count()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }
}

impl ControlProgram for MockControlProgram {
    async fn run(&self, command: VmCommand, args: &[String]) -> std::io::Result<CommandOutput> {
        let mut state = lock(&self.state);
        state.calls.push((command, args.to_vec()));

        if state.failing.contains(&command) {
            return Ok(CommandOutput {
                exit_code: Some(255),
                stdout: String::new(),
                stderr: format!("Error: {} failed", command),
            });
        }

        match command {
            VmCommand::Start => {
                if !state.running {
                    state.running = true;
                    state.pending_boot_polls = state.boot_polls;
                }
                Ok(CommandOutput::success(""))
            }
            VmCommand::Stop | VmCommand::Suspend | VmCommand::RevertToSnapshot => {
                // Reverting to a powered-off snapshot leaves the VM stopped.
                state.running = false;
                state.pending_boot_polls = 0;
                Ok(CommandOutput::success(""))
            }
            VmCommand::List => {
                let visible = state.running && state.pending_boot_polls == 0;
                if state.running && state.pending_boot_polls > 0 {
                    state.pending_boot_polls -= 1;
                }
                if visible {
                    Ok(CommandOutput::success(format!(
                        "Total running VMs: 1\n{}\n",
                        self.image
                    )))
                } else {
                    Ok(CommandOutput::success("Total running VMs: 0\n"))
                }
            }
        }
    }
}

// ── Liveness ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct MockProbeState {
    script: VecDeque<bool>,
    fallback: bool,
    probes: usize,
    delay: Duration,
}

/// Liveness probe that replays a script, then answers `fallback`.
#[derive(Debug, Clone)]
pub struct MockProbe {
    state: Arc<Mutex<MockProbeState>>,
}

impl MockProbe {
    pub fn always(alive: bool) -> Self {
        Self::scripted([], alive)
    }

    pub fn scripted(script: impl IntoIterator<Item = bool>, fallback: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockProbeState {
                script: script.into_iter().collect(),
                fallback,
                probes: 0,
                delay: Duration::ZERO,
            })),
        }
    }

    pub fn set_alive(&self, alive: bool) {
        let mut state = lock(&self.state);
        state.script.clear();
        state.fallback = alive;
    }

    /// Queue answers ahead of the fallback.
    pub fn push(&self, alive: bool) {
        lock(&self.state).script.push_back(alive);
    }

    pub fn probes(&self) -> usize {
        lock(&self.state).probes
    }

    /// Make every probe take this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        lock(&self.state).delay = delay;
    }
}

impl LivenessProbe for MockProbe {
    async fn is_alive(&self, _endpoint: &TargetEndpoint, _timeout: Duration) -> bool {
        let (alive, delay) = {
            let mut state = lock(&self.state);
            state.probes += 1;
            let alive = state.script.pop_front().unwrap_or(state.fallback);
            (alive, state.delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        alive
    }
}

// ── Debug channel ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MockDebugState {
    connects: usize,
    disconnects: usize,
    fail_connect: bool,
    /// Notification slot of the connection that is currently monitoring.
    armed: Option<(ConnectionId, oneshot::Sender<serde_json::Value>)>,
}

/// Debug channel whose sessions each deliver at most one crash.
#[derive(Debug, Clone, Default)]
pub struct MockDebugChannel {
    state: Arc<Mutex<MockDebugState>>,
}

impl MockDebugChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a crash to the armed connection.
    ///
    /// Returns `false` when nothing is armed: the notification is lost, just
    /// like a real session that already fired once.
    pub fn inject_crash(&self, context: serde_json::Value) -> bool {
        let armed = lock(&self.state).armed.take();
        match armed {
            Some((_, tx)) => tx.send(context).is_ok(),
            None => false,
        }
    }

    /// Connection currently able to receive a notification.
    pub fn armed_connection(&self) -> Option<ConnectionId> {
        lock(&self.state).armed.as_ref().map(|(id, _)| *id)
    }

    pub fn set_fail_connect(&self, fail: bool) {
        lock(&self.state).fail_connect = fail;
    }

    pub fn connects(&self) -> usize {
        lock(&self.state).connects
    }

    pub fn disconnects(&self) -> usize {
        lock(&self.state).disconnects
    }
}

impl DebugChannel for MockDebugChannel {
    type Session = MockDebugSession;

    async fn connect(&self) -> Result<MockDebugSession, DebugError> {
        let mut state = lock(&self.state);
        if state.fail_connect {
            return Err(DebugError::Connect("mock connection refused".to_string()));
        }
        let id = next_connection_id();
        state.connects += 1;
        Ok(MockDebugSession {
            id,
            state: Arc::clone(&self.state),
            notification: None,
        })
    }
}

/// Session handed out by [`MockDebugChannel`].
#[derive(Debug)]
pub struct MockDebugSession {
    id: ConnectionId,
    state: Arc<Mutex<MockDebugState>>,
    notification: Option<oneshot::Receiver<serde_json::Value>>,
}

impl DebugSession for MockDebugSession {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn begin_monitoring(&mut self) -> Result<(), DebugError> {
        let (tx, rx) = oneshot::channel();
        lock(&self.state).armed = Some((self.id, tx));
        self.notification = Some(rx);
        Ok(())
    }

    async fn monitor(&mut self) -> Result<serde_json::Value, DebugError> {
        let rx = self
            .notification
            .take()
            .ok_or_else(|| DebugError::Protocol("monitoring not started".to_string()))?;
        rx.await.map_err(|_| DebugError::Closed)
    }

    async fn disconnect(self) {
        {
            let mut state = lock(&self.state);
            state.disconnects += 1;
            if state.armed.as_ref().is_some_and(|(id, _)| *id == self.id) {
                state.armed = None;
            }
        }
        drop(self);
    }
}

impl Drop for MockDebugSession {
    fn drop(&mut self) {
        // A session dropped without disconnect (aborted task) stops being armed too.
        let mut state = lock(&self.state);
        if state.armed.as_ref().is_some_and(|(id, _)| *id == self.id) {
            state.armed = None;
        }
    }
}
