//! tracelink: cross-thread execution-context propagation and diagnostics
//! core for an application-performance-monitoring agent.
//!
//! An agent attached to a running process must track one logical unit of
//! work (a request) as it hops across threads, pools, async callbacks and
//! driver internals, without leaking memory, double-counting, or touching
//! unrelated concurrent requests. This crate is that core; the hundreds of
//! per-framework adapter shims are glue calling into it at well-defined
//! extension points.
//!
//! # Architecture
//!
//! ## Execution Context ([`context`])
//! - [`context::transaction`]: the logical transaction ([`ExecutionContext`]):
//!   GUID, priority-ranked name, attribute tiers, open-segment set
//! - [`context::segment`]: one thread's slice of it ([`ContextSegment`]):
//!   thread-confined tracer frame stack with strict LIFO enforcement
//! - [`context::token`]: the one-shot continuation handle
//!   ([`ContinuationToken`]) that carries a context across an async gap
//!
//! ## Implicit Handoff ([`registry`])
//! - [`registry::ContinuationRegistry`]: TTL cache from an opaque async key
//!   to a token, with forced expiry so an unfired callback cannot leak its
//!   context
//!
//! ## Resource Attribution ([`detect`])
//! - [`detect`]: thread-local detection window correlating a connection's
//!   real network address with the long-lived handle object, behind a
//!   weak-keyed map that never extends the handle's lifetime
//!
//! ## Diagnostics ([`monitor`], [`harvest`], [`observability`])
//! - [`monitor::SlowExecutionMonitor`]: samples open transactions each
//!   harvest cycle, reporting the worst offender exactly once
//! - [`harvest::HarvestClock`]: the periodic tick every sampling check
//!   hangs off
//! - [`observability`]: diagnostic events, sinks, supportability counters
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: recognized options, shared types, error enum
//! - [`config::ConfigWatch`]: snapshot access plus reload listeners
//!
//! # Design Principles
//!
//! 1. **Fail open** - the host application is never blocked or faulted by
//!    this subsystem; worst case is degraded diagnostic data
//! 2. **Removal is the arbiter** - every exactly-once guarantee (token
//!    consumption, slow-transaction reporting, registry retrieval) rests on
//!    an atomic take/remove, never on flags checked separately
//! 3. **Thread-confined unless shared by need** - only the open-segment set
//!    and the open-transaction map are cross-thread state; frame stacks and
//!    detection windows are thread-local and lock-free
//! 4. **Leaks expire** - anything parked for "later" (tokens, registry
//!    entries, handle associations) has a TTL or weak reference ending it

pub mod config;
pub mod context;
pub mod detect;
pub mod harvest;
pub mod monitor;
pub mod observability;
pub mod registry;

pub use config::{ConfigListener, ConfigWatch, MultihostPreference, TraceConfig, TraceError};
pub use context::{
    AttributeTier, ContextObserver, ContextSegment, ContextSummary, ContinuationToken,
    ExecutionContext, FrameOutcome, FrameRecord, TracerFrame,
};
pub use harvest::{HarvestClock, HarvestListener};
pub use monitor::SlowExecutionMonitor;
pub use observability::{CollectingEventSink, DiagnosticEvent, EventSink, LogEventSink};
pub use registry::ContinuationRegistry;
