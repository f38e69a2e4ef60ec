//! launch_exec: supervised execution of local processes
//!
//! The unit of execution of a launch host. A unit spawns one process,
//! relays its output, escalates signals on shutdown and optionally respawns
//! the process or waits for descendants that inherited its stdio.
//!
//! # Overview
//!
//! - [`ExecutionContext`] carries the event bus, the shutdown flag and the
//!   launch configurations shared by every unit of a launch
//! - [`ManagedProcess`] supervises one process and reports completion once
//! - [`UnitFile`] describes a unit in YAML
//!
//! Shutdown escalates SIGINT, then SIGTERM after `sigterm_timeout`, then
//! SIGKILL after a further `sigkill_timeout`.
//!
//! # Example Unit File
//!
//! ```yaml
//! args:
//!   rate:
//!     default: "10"
//!
//! name: talker
//! cmd: ["talker", "--rate", "$(arg rate)"]
//! additional_env:
//!   RUST_LOG: "$(env RUST_LOG info)"
//! output: both
//! sigterm_timeout: 2
//! respawn: true
//! respawn_delay: 1.0
//! respawn_max_retries: 3
//! ```

pub mod cli;
pub mod config;
pub mod context;
pub mod description;
pub mod events;
pub mod runtime;

pub use cli::LaunchArgs;
pub use config::{SubstitutionContext, SubstitutionError, UnitFile, UnitFileError};
pub use context::{EventBus, ExecutionContext, HandlerId};
pub use description::{DescriptionError, ProcessDescription, ProcessSpec};
pub use events::{
    Event, EventKind, OutputStream, ProcessDetails, ProcessSignal, UnitId, UnitMatcher,
};
pub use runtime::{
    Completion, ExecuteOptions, LaunchError, LifecycleState, LineSink, LoggerFactory,
    ManagedProcess, OutputDestination, OutputSinks, ProcessError, RespawnSetting,
    StandardLoggers, UnitOutcome,
};
