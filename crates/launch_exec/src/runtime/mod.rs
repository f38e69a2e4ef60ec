//! Runtime components for process supervision

pub mod descendants;
pub mod escalation;
pub mod launcher;
pub mod monitor;
pub mod output;
#[cfg(unix)]
pub mod pty;
pub mod relay;
pub mod respawn;

pub use escalation::{ShutdownTimers, DEFAULT_ESCALATION_TIMEOUT};
pub use launcher::{LaunchError, SpawnedProcess};
pub use monitor::*;
pub use output::{LineSink, LoggerFactory, OutputConfigError, OutputDestination, OutputSinks, StandardLoggers};
pub use relay::{OutputFormat, OutputRelay, RelayMode};
pub use respawn::RespawnPolicy;
