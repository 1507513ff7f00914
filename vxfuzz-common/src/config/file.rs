//! TOML configuration file.
//!
//! ```toml
//! [vmware]
//! vmrun = "/usr/bin/vmrun"
//! vm_path = "~/vmware/vxworks6/vxworks6.vmx"
//! snapshot = "portmap-ready"
//!
//! [target]
//! address = "192.168.56.101"
//! port = 111
//! version = 6
//!
//! [debug]
//! agent = "/usr/local/bin/wdb-agent"
//!
//! [session]
//! settle_delay = "500ms"
//! ```

use super::env::{EnvError, EnvParser, expand_home};
use crate::debug::agent::DEFAULT_CONNECT_TIMEOUT;
use crate::liveness::DEFAULT_PROBE_TIMEOUT;
use crate::transport::{DEFAULT_RECEIVE_LIMIT, DEFAULT_TRANSPORT_TIMEOUT};
use crate::types::{TargetEndpoint, VmHandle};
use crate::vm::DEFAULT_POLL_INTERVAL;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File name looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "vxfuzz.toml";

/// Errors while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("no configuration file found (searched: {})", .searched.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    NotFound { searched: Vec<PathBuf> },

    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("`{field}` points to a missing path: {}", .path.display())]
    PathNotFound { field: &'static str, path: PathBuf },

    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid environment overrides: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Env(Vec<EnvError>),
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

/// `[vmware]`: the control program and the VM it drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmwareConfig {
    /// Path to the `vmrun` executable.
    pub vmrun: PathBuf,
    /// Path to the target VM's `.vmx`.
    pub vm_path: PathBuf,
    /// Snapshot restored before each session and every recovery.
    pub snapshot: String,
}

/// `[target]`: the network service under test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Target OS major version (5 or 6).
    #[serde(default)]
    pub version: Option<u8>,
    #[serde(default = "default_transport_timeout", with = "duration_str")]
    pub transport_timeout: Duration,
    #[serde(default = "default_receive_limit")]
    pub receive_limit: usize,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            address: None,
            port: None,
            version: None,
            transport_timeout: default_transport_timeout(),
            receive_limit: default_receive_limit(),
        }
    }
}

/// `[debug]`: external debug agent providing crash notifications.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugConfig {
    #[serde(default)]
    pub agent: Option<PathBuf>,
    /// Extra arguments placed before `--target`/`--version`.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_agent_connect_timeout", with = "duration_str")]
    pub connect_timeout: Duration,
}

/// `[session]`: timing and output knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_probe_timeout", with = "duration_str")]
    pub probe_timeout: Duration,
    #[serde(default = "default_poll_interval", with = "duration_str")]
    pub poll_interval: Duration,
    #[serde(default = "default_settle_delay", with = "duration_str")]
    pub settle_delay: Duration,
    #[serde(default = "default_delay_between_tests", with = "duration_str")]
    pub delay_between_tests: Duration,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    #[serde(default = "default_crash_log")]
    pub crash_log: PathBuf,
    #[serde(default)]
    pub max_tests: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            probe_timeout: default_probe_timeout(),
            poll_interval: default_poll_interval(),
            settle_delay: default_settle_delay(),
            delay_between_tests: default_delay_between_tests(),
            log_file: default_log_file(),
            crash_log: default_crash_log(),
            max_tests: None,
        }
    }
}

/// Complete harness configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    pub vmware: VmwareConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub debug: DebugConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_transport_timeout() -> Duration {
    DEFAULT_TRANSPORT_TIMEOUT
}

fn default_receive_limit() -> usize {
    DEFAULT_RECEIVE_LIMIT
}

fn default_agent_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_probe_timeout() -> Duration {
    DEFAULT_PROBE_TIMEOUT
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_delay_between_tests() -> Duration {
    Duration::ZERO
}

fn default_log_file() -> PathBuf {
    PathBuf::from("session.log")
}

fn default_crash_log() -> PathBuf {
    PathBuf::from("crashes.jsonl")
}

/// Per-user config location (`~/.config/vxfuzz/config.toml` on Linux).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("vxfuzz").join("config.toml"))
}

impl HarnessConfig {
    pub fn from_toml_str(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.expand_paths();
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw, path)
    }

    /// Find and load the configuration.
    ///
    /// Order: `explicit`, `VXFUZZ_CONFIG`, `./vxfuzz.toml`, per-user config.
    pub fn discover(explicit: Option<&Path>) -> Result<(PathBuf, Self), ConfigError> {
        if let Some(path) = explicit {
            return Ok((path.to_path_buf(), Self::load(path)?));
        }

        let mut searched = Vec::new();
        let mut candidates = Vec::new();
        if let Some(path) = EnvParser::new().get_path("CONFIG") {
            candidates.push(path);
        }
        candidates.push(PathBuf::from(LOCAL_CONFIG_FILE));
        if let Some(path) = default_config_path() {
            candidates.push(path);
        }

        for candidate in candidates {
            if candidate.is_file() {
                let config = Self::load(&candidate)?;
                return Ok((candidate, config));
            }
            searched.push(candidate);
        }
        Err(ConfigError::NotFound { searched })
    }

    fn expand_paths(&mut self) {
        self.vmware.vmrun = expand_home(&self.vmware.vmrun.to_string_lossy());
        self.vmware.vm_path = expand_home(&self.vmware.vm_path.to_string_lossy());
        if let Some(agent) = &self.debug.agent {
            self.debug.agent = Some(expand_home(&agent.to_string_lossy()));
        }
    }

    /// Apply `VXFUZZ_*` overrides. All parse errors are reported together.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        let mut env = EnvParser::new();

        if let Some(path) = env.get_path("VMRUN") {
            self.vmware.vmrun = path;
        }
        if let Some(path) = env.get_path("VM_PATH") {
            self.vmware.vm_path = path;
        }
        if let Some(snapshot) = env.get_string("SNAPSHOT") {
            self.vmware.snapshot = snapshot;
        }
        if let Some(address) = env.get_string("TARGET_ADDR") {
            self.target.address = Some(address);
        }
        if let Some(port) = env.get_u16("TARGET_PORT") {
            self.target.port = Some(port);
        }
        if let Some(version) = env.get_u16("TARGET_VERSION") {
            // Out-of-range values are left for validate() to reject.
            self.target.version = Some(u8::try_from(version).unwrap_or(0));
        }
        if let Some(agent) = env.get_path("DEBUG_AGENT") {
            self.debug.agent = Some(agent);
        }
        if let Some(delay) = env.get_duration("SETTLE_DELAY") {
            self.session.settle_delay = delay;
        }
        if let Some(interval) = env.get_duration("POLL_INTERVAL") {
            self.session.poll_interval = interval;
        }
        if let Some(timeout) = env.get_duration("PROBE_TIMEOUT") {
            self.session.probe_timeout = timeout;
        }
        if let Some(max) = env.get_u64("MAX_TESTS") {
            self.session.max_tests = Some(max);
        }

        if env.has_errors() {
            return Err(ConfigError::Env(env.take_errors()));
        }
        Ok(())
    }

    /// Check everything once, before any VM is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.vmware.vmrun.exists() {
            return Err(ConfigError::PathNotFound {
                field: "vmware.vmrun",
                path: self.vmware.vmrun.clone(),
            });
        }
        if !self.vmware.vm_path.exists() {
            return Err(ConfigError::PathNotFound {
                field: "vmware.vm_path",
                path: self.vmware.vm_path.clone(),
            });
        }
        if self.vmware.snapshot.trim().is_empty() {
            return Err(ConfigError::Missing("vmware.snapshot"));
        }

        match self.target.address.as_deref() {
            None => return Err(ConfigError::Missing("target.address")),
            Some(a) if a.trim().is_empty() => return Err(ConfigError::Missing("target.address")),
            Some(_) => {}
        }
        match self.target.port {
            None => return Err(ConfigError::Missing("target.port")),
            Some(0) => {
                return Err(ConfigError::Invalid {
                    field: "target.port",
                    reason: "port must be non-zero".to_string(),
                });
            }
            Some(_) => {}
        }
        match self.target.version {
            None => return Err(ConfigError::Missing("target.version")),
            Some(5 | 6) => {}
            Some(v) => {
                return Err(ConfigError::Invalid {
                    field: "target.version",
                    reason: format!("expected 5 or 6, got {v}"),
                });
            }
        }
        if self.target.receive_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "target.receive_limit",
                reason: "must be at least 1 byte".to_string(),
            });
        }

        let agent = self
            .debug
            .agent
            .as_ref()
            .ok_or(ConfigError::Missing("debug.agent"))?;
        if !agent.exists() {
            return Err(ConfigError::PathNotFound {
                field: "debug.agent",
                path: agent.clone(),
            });
        }

        for (field, value) in [
            ("session.probe_timeout", self.session.probe_timeout),
            ("session.poll_interval", self.session.poll_interval),
            ("target.transport_timeout", self.target.transport_timeout),
            ("debug.connect_timeout", self.debug.connect_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "duration must be non-zero".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn vm_handle(&self) -> VmHandle {
        VmHandle::new(
            self.vmware.vmrun.clone(),
            self.vmware.vm_path.clone(),
            self.vmware.snapshot.clone(),
        )
    }

    /// Target endpoint; only meaningful after [`validate`](Self::validate).
    pub fn endpoint(&self) -> TargetEndpoint {
        TargetEndpoint::new(
            self.target.address.clone().unwrap_or_default(),
            self.target.port.unwrap_or_default(),
        )
    }
}
