//! vxfuzz - VM-backed fault-injection harness
//!
//! Drives a VxWorks target inside a VMware VM through a fuzzing session:
//! restores the VM from a snapshot, keeps the target service reachable,
//! and attributes every crash seen by the debug agent to the test that
//! caused it.

#![forbid(unsafe_code)]

mod health;
mod lifecycle;
mod model;
mod session;

use anyhow::{Context, Result};
use clap::Parser;
use health::{HealthConfig, HealthMonitor};
use lifecycle::{LifecycleConfig, TestLifecycle};
use model::PortmapNullModel;
use session::{FuzzSession, SessionOptions, StopReason};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vxfuzz_common::config::ConfigError;
use vxfuzz_common::{
    AgentChannel, EnvironmentController, HarnessConfig, HarnessError, JsonlReportSink, LogConfig,
    TcpProbe, Vmrun, init_logging,
};

/// Exit code for an operator interrupt.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "vxfuzz")]
#[command(author, version, about = "VxWorks network service fuzzer backed by a VMware VM")]
#[command(after_help = "Returns 0 when the session completes, non-zero otherwise")]
struct Cli {
    /// Target IP address
    #[arg(short = 't', long, value_name = "ADDR")]
    target_addr: Option<String>,

    /// Target TCP port
    #[arg(short = 'p', long, value_name = "PORT")]
    target_port: Option<u16>,

    /// Target VxWorks major version
    #[arg(short = 'v', long, value_name = "5|6", value_parser = clap::value_parser!(u8).range(5..=6))]
    target_version: Option<u8>,

    /// Console log level (the session log always records debug)
    #[arg(short = 'l', long, value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,

    /// Configuration file (default: $VXFUZZ_CONFIG, ./vxfuzz.toml, then the user config dir)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Stop after this many tests
    #[arg(long)]
    max_tests: Option<u64>,

    /// Overall session deadline (e.g. "8h", "30m")
    #[arg(long, value_parser = humantime::parse_duration)]
    session_timeout: Option<Duration>,
}

/// File, then environment, then command line.
fn load_config(cli: &Cli) -> Result<(PathBuf, HarnessConfig)> {
    let (path, mut config) =
        HarnessConfig::discover(cli.config.as_deref()).map_err(HarnessError::from)?;
    config
        .apply_env()
        .map_err(HarnessError::from)
        .with_context(|| format!("applying VXFUZZ_* overrides to {}", path.display()))?;

    if let Some(addr) = &cli.target_addr {
        config.target.address = Some(addr.clone());
    }
    if let Some(port) = cli.target_port {
        config.target.port = Some(port);
    }
    if let Some(version) = cli.target_version {
        config.target.version = Some(version);
    }
    if let Some(max) = cli.max_tests {
        config.session.max_tests = Some(max);
    }

    config.validate().map_err(HarnessError::from)?;
    Ok((path, config))
}

fn exit_code(err: &anyhow::Error) -> ExitCode {
    let code = err
        .downcast_ref::<HarnessError>()
        .map_or(1, HarnessError::exit_code);
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let (config_path, config) = match load_config(&cli) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("vxfuzz: {e:#}");
            return exit_code(&e);
        }
    };

    let mut log_config = LogConfig::from_env("error")
        .with_stderr()
        .with_file(&config.session.log_file);
    if let Some(level) = &cli.log_level {
        log_config = log_config.with_level(level.as_str());
    }
    let _logging_guards = match init_logging(&log_config) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("vxfuzz: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("Loaded configuration from {}", config_path.display());

    match run(config, cli.session_timeout).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            exit_code(&e)
        }
    }
}

async fn run(config: HarnessConfig, session_timeout: Option<Duration>) -> Result<ExitCode> {
    let endpoint = config.endpoint();
    let version = config
        .target
        .version
        .ok_or(HarnessError::Config(ConfigError::Missing("target.version")))?;
    let agent = config
        .debug
        .agent
        .clone()
        .ok_or(HarnessError::Config(ConfigError::Missing("debug.agent")))?;
    let handle = config.vm_handle();

    info!(
        "Started VxWorks {}.x fuzzing session | target {} | VM {} | snapshot {}",
        version,
        endpoint,
        handle.image().display(),
        handle.snapshot()
    );

    let cancel = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Session interrupted by user...");
                interrupted.store(true, Ordering::SeqCst);
                cancel.cancel();
            }
        });
    }
    if let Some(deadline) = session_timeout {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            info!(
                "Session deadline of {} reached",
                humantime::format_duration(deadline)
            );
            cancel.cancel();
        });
    }

    let env = EnvironmentController::new(handle, Vmrun::new(&config.vmware.vmrun))
        .with_poll_interval(config.session.poll_interval);
    let channel = AgentChannel::new(agent, config.debug.args.clone(), endpoint.host.clone(), version)
        .with_connect_timeout(config.debug.connect_timeout);
    let monitor = HealthMonitor::new(
        channel,
        HealthConfig {
            settle_delay: config.session.settle_delay,
        },
    );
    let lifecycle = TestLifecycle::new(
        env,
        TcpProbe,
        monitor,
        endpoint,
        LifecycleConfig {
            probe_timeout: config.session.probe_timeout,
            transport_timeout: Some(config.target.transport_timeout),
        },
    );
    let sink = JsonlReportSink::new(&config.session.crash_log);
    if sink.path().exists() {
        match JsonlReportSink::load(sink.path()) {
            Ok(previous) if !previous.is_empty() => info!(
                "{} crash report(s) from earlier sessions already in {}",
                previous.len(),
                sink.path().display()
            ),
            Ok(_) => {}
            Err(e) => warn!("Cannot read crash log {}: {}", sink.path().display(), e),
        }
    }
    let options = SessionOptions {
        max_tests: config.session.max_tests,
        delay_between_tests: config.session.delay_between_tests,
        receive_limit: config.target.receive_limit,
    };

    let mut session = FuzzSession::new(lifecycle, PortmapNullModel::new(), Box::new(sink), options);
    let summary = match session.run(&cancel).await {
        Ok(summary) => summary,
        Err(HarnessError::Cancelled) => return Ok(ExitCode::from(EXIT_INTERRUPTED)),
        Err(e) => return Err(e.into()),
    };

    if summary.crashes > 0 {
        info!(
            "{} crash report(s) written to {}",
            summary.crashes,
            config.session.crash_log.display()
        );
    }
    let failures = session.model().failures();
    if !failures.is_empty() {
        let numbers: Vec<String> = failures.iter().map(|(n, _)| n.to_string()).collect();
        info!("Failed tests: {}", numbers.join(", "));
    }
    if summary.stop_reason == StopReason::Cancelled && interrupted.load(Ordering::SeqCst) {
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    Ok(ExitCode::SUCCESS)
}
