//! Typed monitor events and a synchronous listener bus.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::db::Process;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("unknown event: {0}")]
    UnknownEvent(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MonitorStart,
    MonitorShutdown,
    MonitorRestart,
    ProcessEnteredError,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::MonitorStart,
        EventKind::MonitorShutdown,
        EventKind::MonitorRestart,
        EventKind::ProcessEnteredError,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::MonitorStart => "monitor.start",
            EventKind::MonitorShutdown => "monitor.shutdown",
            EventKind::MonitorRestart => "monitor.restart",
            EventKind::ProcessEnteredError => "measurement.process.exception",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| EventError::UnknownEvent(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Start,
    Shutdown,
    Restart,
    /// A process reached its failure threshold and its monitoring was paused.
    ProcessEnteredError(Process),
}

impl MonitorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MonitorEvent::Start => EventKind::MonitorStart,
            MonitorEvent::Shutdown => EventKind::MonitorShutdown,
            MonitorEvent::Restart => EventKind::MonitorRestart,
            MonitorEvent::ProcessEnteredError(_) => EventKind::ProcessEnteredError,
        }
    }
}

pub type Listener = Arc<dyn Fn(&MonitorEvent) + Send + Sync>;

/// Delivers each published event to the listeners of its kind, in
/// subscription order, on the publishing task.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<HashMap<EventKind, Vec<Listener>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&MonitorEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.entry(kind).or_default().push(Arc::new(listener));
    }

    /// Subscribe by event name, e.g. `"monitor.start"`.
    pub fn subscribe_named<F>(&self, name: &str, listener: F) -> Result<(), EventError>
    where
        F: Fn(&MonitorEvent) + Send + Sync + 'static,
    {
        let kind: EventKind = name.parse()?;
        self.subscribe(kind, listener);
        Ok(())
    }

    pub fn publish(&self, event: &MonitorEvent) {
        let listeners: Vec<Listener> = {
            let map = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            map.get(&event.kind()).cloned().unwrap_or_default()
        };

        tracing::debug!("Events: Publishing {} to {} listeners", event.kind(), listeners.len());
        for listener in listeners {
            listener(event);
        }
    }
}
