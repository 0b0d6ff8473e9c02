//! Execution-context model: the multi-thread logical transaction, each
//! thread's segment of it, and the continuation token that carries the
//! context across an async gap.
//!
//! Ownership discipline: a context is owned collectively by every thread
//! currently executing part of it, but only the open-segment set is shared
//! state. Segment-local frame stacks are thread-confined and need no
//! locking.

pub mod segment;
pub mod token;
pub mod transaction;

pub use segment::{ContextSegment, FrameOutcome, TracerFrame};
pub use token::ContinuationToken;
pub use transaction::{AttributeTier, ExecutionContext};

use std::time::Duration;

/// One finished tracer frame in the exported call tree.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub metric_name: String,
    /// Nesting depth at which the frame ran (0 = segment root)
    pub depth: usize,
    pub duration: Duration,
    /// Duration minus time spent in child frames
    pub exclusive: Duration,
    pub outcome: FrameOutcome,
}

/// Aggregated result of a finished [`ExecutionContext`], handed to
/// observers when the last segment retires.
#[derive(Debug, Clone)]
pub struct ContextSummary {
    pub guid: String,
    pub name: String,
    pub wall_clock_start_ms: u64,
    pub elapsed: Duration,
    /// Finished frames from all segments, in retirement order
    pub frames: Vec<FrameRecord>,
}

/// Lifecycle observer for logical transactions. The slow-execution monitor
/// subscribes through this; exporters may as well.
pub trait ContextObserver: Send + Sync {
    fn context_started(&self, ctx: &ExecutionContext);
    fn context_finished(&self, ctx: &ExecutionContext, summary: &ContextSummary);
}
