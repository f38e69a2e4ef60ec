//! Output destinations and the logger factory handed to each unit

use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;

/// Environment variable overriding every unit's configured output destination
pub const OUTPUT_OVERRIDE_ENV: &str = "OVERRIDE_LAUNCH_PROCESS_OUTPUT";

/// Where relayed process output goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputDestination {
    /// Straight to the host's stdout/stderr
    Screen,
    /// Through the `log` facade (stdout at info, stderr at warn)
    Log,
    /// Both of the above
    Both,
}

impl FromStr for OutputDestination {
    type Err = OutputConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "screen" => Ok(OutputDestination::Screen),
            "log" => Ok(OutputDestination::Log),
            "both" => Ok(OutputDestination::Both),
            other => Err(OutputConfigError::UnknownDestination(other.to_string())),
        }
    }
}

impl OutputDestination {
    /// Resolve the effective destination: the override variable wins over
    /// the per-unit configuration.
    pub fn resolve(configured: &str) -> Result<Self, OutputConfigError> {
        match std::env::var(OUTPUT_OVERRIDE_ENV) {
            Ok(value) if !value.trim().is_empty() => value.parse(),
            _ => configured.parse(),
        }
    }
}

/// Receives fully formatted output lines
pub trait LineSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Per-stream sinks for one unit
#[derive(Clone)]
pub struct OutputSinks {
    pub stdout: Arc<dyn LineSink>,
    pub stderr: Arc<dyn LineSink>,
}

/// Creates the output sinks for a unit. Passed to each unit at construction.
pub trait LoggerFactory: Send + Sync {
    fn output_sinks(&self, unit_name: &str, destination: OutputDestination) -> OutputSinks;
}

/// Default factory writing to the terminal and/or the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardLoggers;

impl LoggerFactory for StandardLoggers {
    fn output_sinks(&self, _unit_name: &str, destination: OutputDestination) -> OutputSinks {
        let stdout: Arc<dyn LineSink> = match destination {
            OutputDestination::Screen => Arc::new(ScreenSink { stderr: false }),
            OutputDestination::Log => Arc::new(LogSink { level: log::Level::Info }),
            OutputDestination::Both => Arc::new(TeeSink(vec![
                Arc::new(ScreenSink { stderr: false }),
                Arc::new(LogSink { level: log::Level::Info }),
            ])),
        };
        let stderr: Arc<dyn LineSink> = match destination {
            OutputDestination::Screen => Arc::new(ScreenSink { stderr: true }),
            OutputDestination::Log => Arc::new(LogSink { level: log::Level::Warn }),
            OutputDestination::Both => Arc::new(TeeSink(vec![
                Arc::new(ScreenSink { stderr: true }),
                Arc::new(LogSink { level: log::Level::Warn }),
            ])),
        };
        OutputSinks { stdout, stderr }
    }
}

struct ScreenSink {
    stderr: bool,
}

impl LineSink for ScreenSink {
    fn write_line(&self, line: &str) {
        // A closed terminal must not take the supervisor down
        if self.stderr {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
        } else {
            let _ = writeln!(std::io::stdout().lock(), "{}", line);
        }
    }
}

struct LogSink {
    level: log::Level,
}

impl LineSink for LogSink {
    fn write_line(&self, line: &str) {
        log::log!(self.level, "{}", line);
    }
}

struct TeeSink(Vec<Arc<dyn LineSink>>);

impl LineSink for TeeSink {
    fn write_line(&self, line: &str) {
        for sink in &self.0 {
            sink.write_line(line);
        }
    }
}

/// Errors in output configuration
#[derive(Debug, thiserror::Error)]
pub enum OutputConfigError {
    #[error("Unknown output destination '{0}' (expected screen, log or both)")]
    UnknownDestination(String),
}
