//! Diagnostic events and supportability metrics.

pub mod events;
pub mod metrics;

pub use events::{CollectingEventSink, DiagnosticEvent, EventSink, LogEventSink};
pub use metrics::{metrics, MetricsSnapshot, SupportabilityMetrics};
