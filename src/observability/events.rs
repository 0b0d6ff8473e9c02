/// Diagnostic event model for the out-of-process exporter boundary.
///
/// The core emits flat-attribute events (currently only `SlowTransaction`)
/// into a pluggable [`EventSink`]. Serialization and network delivery are
/// the exporter's problem; in-process the event is just a typed bag of
/// attributes with a sampling priority.
use log::info;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// A single diagnostic event with a flat attribute map.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticEvent {
    pub event_type: String,
    /// Wall-clock creation time, milliseconds since the epoch
    pub timestamp_ms: u64,
    /// Sampling priority in [0, 1); the exporter may shed low-priority
    /// events under pressure
    pub priority: f32,
    pub attributes: HashMap<String, Value>,
}

impl DiagnosticEvent {
    pub fn new(event_type: &str, attributes: HashMap<String, Value>) -> Self {
        DiagnosticEvent {
            event_type: event_type.to_string(),
            timestamp_ms: epoch_millis(),
            priority: fastrand::f32(),
            attributes,
        }
    }
}

pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Consumer boundary for diagnostic events.
pub trait EventSink: Send + Sync {
    fn record_event(&self, event: DiagnosticEvent);
}

/// Sink that writes events to the process log. Default wiring when no
/// exporter is attached.
#[derive(Debug, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn record_event(&self, event: DiagnosticEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!("Diagnostic event: {}", json),
            Err(e) => info!(
                "Diagnostic event {} (serialization failed: {})",
                event.event_type, e
            ),
        }
    }
}

/// Sink that buffers events in memory, for tests and introspection.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl CollectingEventSink {
    pub fn new() -> Self {
        CollectingEventSink::default()
    }

    pub fn drain(&self) -> Vec<DiagnosticEvent> {
        std::mem::take(
            &mut self
                .events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for CollectingEventSink {
    fn record_event(&self, event: DiagnosticEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}
