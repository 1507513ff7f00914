//! Configuration system for vxfuzz.
//!
//! - TOML file with `[vmware]`, `[target]`, `[debug]` and `[session]` tables
//! - `VXFUZZ_*` environment overrides with type-safe parsing
//! - One validation pass at startup (paths exist, values in range)

pub mod env;
pub mod file;

pub use env::{EnvError, EnvParser};
pub use file::{
    ConfigError, DebugConfig, HarnessConfig, SessionConfig, TargetConfig, VmwareConfig,
    default_config_path,
};
