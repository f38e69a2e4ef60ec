//! Events exchanged between supervised units and the host context

use indexmap::IndexMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one supervised unit, unique within the host process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u64);

impl UnitId {
    /// Allocate a fresh unit id
    pub fn next() -> Self {
        UnitId(NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// Selects which units a request event is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitMatcher {
    /// Every unit
    Any,
    /// A single unit by id
    Unit(UnitId),
    /// Every unit whose process name matches exactly
    Name(String),
}

impl UnitMatcher {
    /// Check whether a unit is addressed by this matcher
    pub fn matches(&self, unit: UnitId, name: &str) -> bool {
        match self {
            UnitMatcher::Any => true,
            UnitMatcher::Unit(id) => *id == unit,
            UnitMatcher::Name(n) => n == name,
        }
    }
}

/// Signals that can be delivered to a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessSignal {
    Interrupt,
    Terminate,
    Kill,
    Hangup,
    User1,
    User2,
}

impl ProcessSignal {
    /// Conventional signal name, e.g. `SIGINT`
    pub fn name(&self) -> &'static str {
        match self {
            ProcessSignal::Interrupt => "SIGINT",
            ProcessSignal::Terminate => "SIGTERM",
            ProcessSignal::Kill => "SIGKILL",
            ProcessSignal::Hangup => "SIGHUP",
            ProcessSignal::User1 => "SIGUSR1",
            ProcessSignal::User2 => "SIGUSR2",
        }
    }

    #[cfg(unix)]
    pub fn as_nix(&self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            ProcessSignal::Interrupt => Signal::SIGINT,
            ProcessSignal::Terminate => Signal::SIGTERM,
            ProcessSignal::Kill => Signal::SIGKILL,
            ProcessSignal::Hangup => Signal::SIGHUP,
            ProcessSignal::User1 => Signal::SIGUSR1,
            ProcessSignal::User2 => Signal::SIGUSR2,
        }
    }
}

impl fmt::Display for ProcessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ProcessSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        match bare {
            "INT" => Ok(ProcessSignal::Interrupt),
            "TERM" => Ok(ProcessSignal::Terminate),
            "KILL" => Ok(ProcessSignal::Kill),
            "HUP" => Ok(ProcessSignal::Hangup),
            "USR1" => Ok(ProcessSignal::User1),
            "USR2" => Ok(ProcessSignal::User2),
            _ => Err(format!("Unknown signal '{}'", s)),
        }
    }
}

/// Which standard stream a chunk of output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Runtime details of a spawned process, carried by process events
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessDetails {
    pub unit: UnitId,
    pub name: String,
    pub pid: u32,
    pub cmd: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Full environment of the child, `None` when inherited unchanged
    pub env: Option<IndexMap<String, String>>,
}

/// Events flowing through the context's event bus
#[derive(Debug, Clone)]
pub enum Event {
    /// A unit's process has been spawned
    ProcessStarted(ProcessDetails),
    /// A unit's process has exited and its output has been relayed
    ProcessExited {
        details: ProcessDetails,
        returncode: Option<i32>,
    },
    /// A chunk of raw output
    ProcessOutput {
        unit: UnitId,
        name: String,
        pid: u32,
        stream: OutputStream,
        data: Vec<u8>,
    },
    /// Begin the graceful shutdown of the addressed units
    RequestShutdown { target: UnitMatcher },
    /// Deliver a raw signal to the addressed units
    RequestSignal {
        signal: ProcessSignal,
        target: UnitMatcher,
    },
    /// Write bytes to the stdin of the addressed units
    StdinData { target: UnitMatcher, data: Vec<u8> },
    /// The whole launch is shutting down
    GlobalShutdown { due_to_interrupt: bool },
}

/// Dispatch key for [`Event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ProcessStarted,
    ProcessExited,
    ProcessOutput,
    RequestShutdown,
    RequestSignal,
    StdinData,
    GlobalShutdown,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ProcessStarted(_) => EventKind::ProcessStarted,
            Event::ProcessExited { .. } => EventKind::ProcessExited,
            Event::ProcessOutput { .. } => EventKind::ProcessOutput,
            Event::RequestShutdown { .. } => EventKind::RequestShutdown,
            Event::RequestSignal { .. } => EventKind::RequestSignal,
            Event::StdinData { .. } => EventKind::StdinData,
            Event::GlobalShutdown { .. } => EventKind::GlobalShutdown,
        }
    }

    /// Unit the event originates from, for process events
    pub fn unit(&self) -> Option<UnitId> {
        match self {
            Event::ProcessStarted(details) | Event::ProcessExited { details, .. } => {
                Some(details.unit)
            }
            Event::ProcessOutput { unit, .. } => Some(*unit),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_ids_are_unique() {
        let a = UnitId::next();
        let b = UnitId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_matcher() {
        let unit = UnitId::next();
        let other = UnitId::next();

        assert!(UnitMatcher::Any.matches(unit, "talker"));
        assert!(UnitMatcher::Unit(unit).matches(unit, "talker"));
        assert!(!UnitMatcher::Unit(other).matches(unit, "talker"));
        assert!(UnitMatcher::Name("talker".into()).matches(unit, "talker"));
        assert!(!UnitMatcher::Name("listener".into()).matches(unit, "talker"));
    }

    #[test]
    fn test_parse_signal_names() {
        assert_eq!("SIGINT".parse(), Ok(ProcessSignal::Interrupt));
        assert_eq!("term".parse(), Ok(ProcessSignal::Terminate));
        assert_eq!("SigKill".parse(), Ok(ProcessSignal::Kill));
        assert!("SIGWAT".parse::<ProcessSignal>().is_err());
        assert_eq!(ProcessSignal::User1.to_string(), "SIGUSR1");
    }
}
