//! VM power and snapshot control through an external control program.
//!
//! The controller never remembers what it last did to the VM. Every state
//! query re-runs the control program's listing, because the VM can be
//! stopped, suspended or crashed by things outside this process.

use crate::errors::{HarnessError, Result};
use crate::types::{EnvironmentState, VmHandle};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Default interval between `list` polls while waiting for boot.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Sub-commands understood by the control program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmCommand {
    Start,
    RevertToSnapshot,
    Stop,
    Suspend,
    List,
}

impl VmCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::RevertToSnapshot => "revertToSnapshot",
            Self::Stop => "stop",
            Self::Suspend => "suspend",
            Self::List => "list",
        }
    }
}

impl std::fmt::Display for VmCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captured result of one control-program invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs the virtualization control program.
///
/// `Err` means the program could not be launched at all; a launched program
/// that exits non-zero is reported through [`CommandOutput::exit_code`].
pub trait ControlProgram: Send + Sync {
    fn run(
        &self,
        command: VmCommand,
        args: &[String],
    ) -> impl Future<Output = std::io::Result<CommandOutput>> + Send;
}

/// `vmrun`-style control program executed with `tokio::process`.
#[derive(Debug, Clone)]
pub struct Vmrun {
    path: PathBuf,
}

impl Vmrun {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ControlProgram for Vmrun {
    async fn run(&self, command: VmCommand, args: &[String]) -> std::io::Result<CommandOutput> {
        let output = tokio::process::Command::new(&self.path)
            .arg(command.as_str())
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Whether `listing` (output of `list`) names the VM image.
pub fn listing_contains(listing: &str, image: &str) -> bool {
    !image.is_empty() && listing.contains(image)
}

/// Drives VM power/snapshot state for one [`VmHandle`].
#[derive(Debug)]
pub struct EnvironmentController<C> {
    handle: VmHandle,
    program: C,
    poll_interval: Duration,
}

impl<C: ControlProgram> EnvironmentController<C> {
    pub fn new(handle: VmHandle, program: C) -> Self {
        Self {
            handle,
            program,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn handle(&self) -> &VmHandle {
        &self.handle
    }

    /// Run one command; non-zero exit or launch failure is fatal.
    async fn invoke(&self, command: VmCommand, args: Vec<String>) -> Result<CommandOutput> {
        trace!(
            "{} {} {}",
            self.handle.control_program().display(),
            command,
            args.join(" ")
        );
        let output = self
            .program
            .run(command, &args)
            .await
            .map_err(|e| HarnessError::ToolingFailure {
                command: command.to_string(),
                reason: format!(
                    "cannot execute {}: {}",
                    self.handle.control_program().display(),
                    e
                ),
            })?;

        if !output.is_success() {
            let reason = match output.exit_code {
                Some(code) => format!("exit status {}: {}", code, output.stderr.trim()),
                None => "terminated by signal".to_string(),
            };
            return Err(HarnessError::ToolingFailure {
                command: command.to_string(),
                reason,
            });
        }
        Ok(output)
    }

    /// Reset the VM to the configured snapshot.
    pub async fn revert_snapshot(&self) -> Result<()> {
        debug!("Reloading VM snapshot: {}", self.handle.snapshot());
        self.invoke(
            VmCommand::RevertToSnapshot,
            vec![self.handle.image_str(), self.handle.snapshot().to_string()],
        )
        .await?;
        Ok(())
    }

    /// Power on without an interactive console.
    pub async fn start(&self) -> Result<()> {
        debug!("Starting the virtual machine {}", self.handle.image_name());
        self.invoke(
            VmCommand::Start,
            vec![self.handle.image_str(), "nogui".to_string()],
        )
        .await?;
        Ok(())
    }

    /// Forceful power off.
    pub async fn stop(&self) -> Result<()> {
        debug!("Stopping the virtual machine {}", self.handle.image_name());
        self.invoke(
            VmCommand::Stop,
            vec![self.handle.image_str(), "hard".to_string()],
        )
        .await?;
        Ok(())
    }

    /// Forceful suspend.
    pub async fn suspend(&self) -> Result<()> {
        debug!("Suspending the virtual machine {}", self.handle.image_name());
        self.invoke(
            VmCommand::Suspend,
            vec![self.handle.image_str(), "hard".to_string()],
        )
        .await?;
        Ok(())
    }

    /// Re-derive the VM power state from the live listing.
    pub async fn state(&self) -> Result<EnvironmentState> {
        let output = self.invoke(VmCommand::List, Vec::new()).await?;
        if listing_contains(&output.stdout, &self.handle.image_str()) {
            Ok(EnvironmentState::Running)
        } else {
            Ok(EnvironmentState::Stopped)
        }
    }

    pub async fn is_running(&self) -> Result<bool> {
        Ok(self.state().await? == EnvironmentState::Running)
    }

    /// Poll until the VM shows up as running.
    ///
    /// No upper bound on its own; `cancel` is the only way out besides the
    /// VM appearing or the control program failing.
    pub async fn wait_until_running(&self, cancel: &CancellationToken) -> Result<()> {
        let mut polls: u64 = 0;
        loop {
            if self.is_running().await? {
                debug!("VM {} running after {} polls", self.handle.image_name(), polls);
                return Ok(());
            }
            polls += 1;
            tokio::select! {
                _ = cancel.cancelled() => return Err(HarnessError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Revert, start, then wait for the VM to come up.
    ///
    /// The lifecycle layer re-arms its own collaborators afterwards.
    pub async fn restart(&self, cancel: &CancellationToken) -> Result<()> {
        info!("Restarting VM {} from snapshot {}", self.handle.image_name(), self.handle.snapshot());
        self.revert_snapshot().await?;
        self.start().await?;
        self.wait_until_running(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockControlProgram;
    use proptest::prelude::*;

    fn handle() -> VmHandle {
        VmHandle::new("/opt/vmware/bin/vmrun", "/vms/vx6/vx6.vmx", "baseline")
    }

    fn controller(mock: &MockControlProgram) -> EnvironmentController<MockControlProgram> {
        EnvironmentController::new(handle(), mock.clone())
            .with_poll_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_is_running_rederives_every_call() {
        let mock = MockControlProgram::new("/vms/vx6/vx6.vmx");
        let env = controller(&mock);

        assert!(!env.is_running().await.unwrap());
        mock.set_running(true);
        assert!(env.is_running().await.unwrap());
        mock.set_running(false);
        assert!(!env.is_running().await.unwrap());
        assert_eq!(mock.count(VmCommand::List), 3);
    }

    #[tokio::test]
    async fn test_command_arguments() {
        let mock = MockControlProgram::new("/vms/vx6/vx6.vmx");
        let env = controller(&mock);

        env.revert_snapshot().await.unwrap();
        env.start().await.unwrap();
        env.suspend().await.unwrap();
        env.stop().await.unwrap();

        let calls = mock.calls();
        assert_eq!(
            calls[0],
            (
                VmCommand::RevertToSnapshot,
                vec!["/vms/vx6/vx6.vmx".to_string(), "baseline".to_string()]
            )
        );
        assert_eq!(
            calls[1],
            (
                VmCommand::Start,
                vec!["/vms/vx6/vx6.vmx".to_string(), "nogui".to_string()]
            )
        );
        assert_eq!(calls[2].1[1], "hard");
        assert_eq!(calls[3].1[1], "hard");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_tooling_failure() {
        let mock = MockControlProgram::new("/vms/vx6/vx6.vmx");
        mock.fail_command(VmCommand::Start);
        let env = controller(&mock);

        let err = env.start().await.unwrap_err();
        assert!(matches!(err, HarnessError::ToolingFailure { ref command, .. } if command == "start"));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_missing_binary_is_tooling_failure() {
        let env = EnvironmentController::new(
            VmHandle::new("/nonexistent/vmrun", "/vms/x.vmx", "s"),
            Vmrun::new("/nonexistent/vmrun"),
        );
        let err = env.is_running().await.unwrap_err();
        assert!(matches!(err, HarnessError::ToolingFailure { .. }));
    }

    #[tokio::test]
    async fn test_wait_until_running_polls_until_boot() {
        let mock = MockControlProgram::new("/vms/vx6/vx6.vmx").with_boot_polls(3);
        let env = controller(&mock);

        env.start().await.unwrap();
        env.wait_until_running(&CancellationToken::new()).await.unwrap();
        assert_eq!(mock.count(VmCommand::List), 4);
    }

    #[tokio::test]
    async fn test_wait_until_running_is_cancellable() {
        let mock = MockControlProgram::new("/vms/vx6/vx6.vmx");
        let env = controller(&mock);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let err = env.wait_until_running(&cancel).await.unwrap_err();
        assert!(matches!(err, HarnessError::Cancelled));
    }

    #[tokio::test]
    async fn test_restart_sequence() {
        let mock = MockControlProgram::new("/vms/vx6/vx6.vmx");
        let env = controller(&mock);

        env.restart(&CancellationToken::new()).await.unwrap();
        let commands: Vec<VmCommand> = mock.calls().into_iter().map(|(c, _)| c).collect();
        assert_eq!(
            commands,
            vec![VmCommand::RevertToSnapshot, VmCommand::Start, VmCommand::List]
        );
    }

    proptest! {
        #[test]
        fn prop_listing_detects_image_anywhere(prefix in "[a-zA-Z0-9 /\n]{0,40}", suffix in "[a-zA-Z0-9 /\n]{0,40}") {
            let image = "/vms/vx6/vx6.vmx";
            let listing = format!("Total running VMs: 1\n{prefix}{image}{suffix}");
            prop_assert!(listing_contains(&listing, image));
        }

        #[test]
        fn prop_listing_without_image_is_stopped(listing in "[a-zA-Z0-9 \n]{0,80}") {
            prop_assert!(!listing_contains(&listing, "/vms/vx6/vx6.vmx"));
        }
    }

    #[test]
    fn test_empty_image_never_matches() {
        assert!(!listing_contains("anything", ""));
    }
}
