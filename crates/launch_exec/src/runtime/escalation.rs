//! Shutdown escalation timers (SIGINT -> SIGTERM -> SIGKILL)

use crate::events::ProcessSignal;
use std::time::Duration;
use tokio::time::Instant;

/// Default grace period before each escalation step
pub const DEFAULT_ESCALATION_TIMEOUT: Duration = Duration::from_secs(5);

/// One escalation step that came due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escalation {
    /// Signal the process failed to react to
    pub previous: ProcessSignal,
    /// Signal to deliver now
    pub next: ProcessSignal,
    /// Time since shutdown began
    pub after: Duration,
}

/// The escalate-to-terminate and escalate-to-kill deadlines of one shutdown
#[derive(Debug, Clone)]
pub struct ShutdownTimers {
    sigterm_timeout: Duration,
    sigkill_timeout: Duration,
    sigterm_at: Option<Instant>,
    sigkill_at: Option<Instant>,
}

impl ShutdownTimers {
    /// Schedule both steps relative to `now`. The kill deadline is
    /// `sigterm_timeout + sigkill_timeout` after `now`.
    pub fn schedule(now: Instant, sigterm_timeout: Duration, sigkill_timeout: Duration) -> Self {
        Self {
            sigterm_timeout,
            sigkill_timeout,
            sigterm_at: Some(now + sigterm_timeout),
            sigkill_at: Some(now + sigterm_timeout + sigkill_timeout),
        }
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.sigterm_at, self.sigkill_at) {
            (Some(term), Some(kill)) => Some(term.min(kill)),
            (term, kill) => term.or(kill),
        }
    }

    /// Pop the earliest step whose deadline has passed
    pub fn fire_due(&mut self, now: Instant) -> Option<Escalation> {
        if let Some(at) = self.sigterm_at {
            if at <= now {
                self.sigterm_at = None;
                return Some(Escalation {
                    previous: ProcessSignal::Interrupt,
                    next: ProcessSignal::Terminate,
                    after: self.sigterm_timeout,
                });
            }
        }
        if let Some(at) = self.sigkill_at {
            if at <= now {
                self.sigkill_at = None;
                return Some(Escalation {
                    previous: ProcessSignal::Terminate,
                    next: ProcessSignal::Kill,
                    after: self.sigterm_timeout + self.sigkill_timeout,
                });
            }
        }
        None
    }

    /// Drop any pending steps
    pub fn cancel(&mut self) {
        self.sigterm_at = None;
        self.sigkill_at = None;
    }
}

/// Parse a timeout given in (fractional) seconds
pub fn parse_timeout(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_fire_in_order() {
        let start = Instant::now();
        let mut timers =
            ShutdownTimers::schedule(start, Duration::from_secs(1), Duration::from_secs(2));

        assert_eq!(timers.next_deadline(), Some(start + Duration::from_secs(1)));
        assert_eq!(timers.fire_due(start), None);

        let term = timers.fire_due(start + Duration::from_secs(1)).unwrap();
        assert_eq!(term.next, ProcessSignal::Terminate);
        assert_eq!(term.after, Duration::from_secs(1));
        assert_eq!(timers.next_deadline(), Some(start + Duration::from_secs(3)));

        assert_eq!(timers.fire_due(start + Duration::from_secs(2)), None);
        let kill = timers.fire_due(start + Duration::from_secs(3)).unwrap();
        assert_eq!(kill.previous, ProcessSignal::Terminate);
        assert_eq!(kill.next, ProcessSignal::Kill);
        assert_eq!(kill.after, Duration::from_secs(3));

        assert!(timers.next_deadline().is_none());
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_late_wakeup_fires_both_steps() {
        let start = Instant::now();
        let mut timers =
            ShutdownTimers::schedule(start, Duration::from_secs(1), Duration::from_secs(1));
        let late = start + Duration::from_secs(10);

        assert_eq!(timers.fire_due(late).map(|e| e.next), Some(ProcessSignal::Terminate));
        assert_eq!(timers.fire_due(late).map(|e| e.next), Some(ProcessSignal::Kill));
        assert_eq!(timers.fire_due(late), None);
    }

    #[test]
    fn test_cancel() {
        let start = Instant::now();
        let mut timers =
            ShutdownTimers::schedule(start, Duration::from_secs(1), Duration::from_secs(1));
        timers.cancel();
        assert!(timers.next_deadline().is_none());
        assert_eq!(timers.fire_due(start + Duration::from_secs(5)), None);
    }

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_timeout(" 0.5 "), Some(Duration::from_millis(500)));
        assert_eq!(parse_timeout("-1"), None);
        assert_eq!(parse_timeout("soon"), None);
    }
}
