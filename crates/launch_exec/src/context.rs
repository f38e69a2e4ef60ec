//! Host execution context: event bus, shutdown flag and launch configurations

use crate::events::{Event, EventKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Event handler callback
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Identity of a registered handler, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Dispatch table of event handlers keyed by event kind
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<EventKind, Vec<(HandlerId, Handler)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(h, _)| *h != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Number of handlers registered for a kind
    pub fn handler_count(&self, kind: EventKind) -> usize {
        let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Deliver an event to every handler registered for its kind, in
    /// registration order.
    pub fn emit(&self, event: &Event) {
        // Snapshot so handlers may subscribe, unsubscribe or emit re-entrantly
        let targets: Vec<Handler> = {
            let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            match handlers.get(&event.kind()) {
                Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };

        for handler in targets {
            handler(event);
        }
    }
}

/// Execution context shared by every unit of a launch
pub struct ExecutionContext {
    bus: EventBus,
    shutting_down: AtomicBool,
    noninteractive: bool,
    launch_configurations: HashMap<String, String>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            bus: EventBus::new(),
            shutting_down: AtomicBool::new(false),
            noninteractive: false,
            launch_configurations: HashMap::new(),
        }
    }

    /// Mark the launch as non-interactive (no terminal delivers SIGINT to
    /// children on Ctrl+C)
    pub fn with_noninteractive(mut self, noninteractive: bool) -> Self {
        self.noninteractive = noninteractive;
        self
    }

    /// Set a launch configuration value
    pub fn with_launch_configuration(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.launch_configurations.insert(name.into(), value.into());
        self
    }

    /// Set multiple launch configuration values
    pub fn with_launch_configurations(mut self, configs: HashMap<String, String>) -> Self {
        self.launch_configurations.extend(configs);
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn noninteractive(&self) -> bool {
        self.noninteractive
    }

    pub fn launch_configuration(&self, name: &str) -> Option<&str> {
        self.launch_configurations.get(name).map(String::as_str)
    }

    pub fn launch_configurations(&self) -> &HashMap<String, String> {
        &self.launch_configurations
    }

    /// Emit an event synchronously
    pub fn emit(&self, event: Event) {
        self.bus.emit(&event);
    }

    /// Emit an event, then yield to the scheduler so other tasks observe it
    pub async fn emit_async(&self, event: Event) {
        self.bus.emit(&event);
        tokio::task::yield_now().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Start shutting down the launch. Only the first call broadcasts
    /// [`Event::GlobalShutdown`]; later calls return false.
    pub fn shutdown(&self, due_to_interrupt: bool) -> bool {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        log::info!(
            "Launch shutting down{}",
            if due_to_interrupt { " (interrupt)" } else { "" }
        );
        self.bus.emit(&Event::GlobalShutdown { due_to_interrupt });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::UnitMatcher;

    #[test]
    fn test_emit_dispatches_by_kind() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        bus.subscribe(EventKind::RequestShutdown, move |e| {
            sink.lock().unwrap().push(e.kind());
        });

        bus.emit(&Event::GlobalShutdown {
            due_to_interrupt: false,
        });
        bus.emit(&Event::RequestShutdown {
            target: UnitMatcher::Any,
        });

        assert_eq!(*seen.lock().unwrap(), vec![EventKind::RequestShutdown]);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let id = bus.subscribe(EventKind::StdinData, |_| {});
        assert_eq!(bus.handler_count(EventKind::StdinData), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.handler_count(EventKind::StdinData), 0);
    }

    #[test]
    fn test_handler_may_emit_reentrantly() {
        let ctx = Arc::new(ExecutionContext::new());
        let count = Arc::new(AtomicU64::new(0));

        let inner = ctx.clone();
        ctx.bus().subscribe(EventKind::RequestShutdown, move |_| {
            inner.emit(Event::GlobalShutdown {
                due_to_interrupt: false,
            });
        });
        let counter = count.clone();
        ctx.bus().subscribe(EventKind::GlobalShutdown, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        ctx.emit(Event::RequestShutdown {
            target: UnitMatcher::Any,
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_broadcasts_once() {
        let ctx = ExecutionContext::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        ctx.bus().subscribe(EventKind::GlobalShutdown, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!ctx.is_shutdown());
        assert!(ctx.shutdown(true));
        assert!(!ctx.shutdown(false));
        assert!(ctx.is_shutdown());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_launch_configurations() {
        let ctx = ExecutionContext::new()
            .with_launch_configuration("sigterm_timeout", "2")
            .with_noninteractive(true);
        assert_eq!(ctx.launch_configuration("sigterm_timeout"), Some("2"));
        assert_eq!(ctx.launch_configuration("missing"), None);
        assert!(ctx.noninteractive());
    }
}
