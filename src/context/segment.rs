/// ContextSegment: one thread's contiguous slice of an ExecutionContext.
///
/// Segments are thread-confined (`Rc`, deliberately not `Send`). Each
/// thread reaches its segment for a given context through a thread-local
/// table keyed by context GUID, so re-entrant adapters and linked
/// continuations converge on the same segment instead of opening
/// duplicates.
use crate::context::transaction::ExecutionContext;
use crate::context::FrameRecord;
use log::{debug, error};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

thread_local! {
    static ACTIVE_SEGMENTS: RefCell<HashMap<String, ContextSegment>> =
        RefCell::new(HashMap::new());
}

/// Outcome a tracer frame finished with. A frame finished with an error is
/// tagged and still popped normally; exceptions never leave the stack
/// unbalanced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Success,
    Error(String),
}

/// Handle to one open tracer frame. Finishing any frame other than the
/// innermost open one is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracerFrame {
    segment_id: u64,
    frame_seq: u64,
}

struct OpenFrame {
    metric_name: String,
    start: Instant,
    /// Total time spent in already-finished child frames, subtracted from
    /// this frame's duration to get exclusive time
    child_time: Duration,
    seq: u64,
}

struct SegmentState {
    ctx: ExecutionContext,
    id: u64,
    stack: Vec<OpenFrame>,
    finished: Vec<FrameRecord>,
    frame_seq: u64,
    retired: bool,
}

/// One thread's participation in an [`ExecutionContext`].
#[derive(Clone)]
pub struct ContextSegment {
    state: Rc<RefCell<SegmentState>>,
}

impl ContextSegment {
    /// Get or create this thread's segment for `ctx` and push a new tracer
    /// frame for `metric_name` onto its stack.
    pub fn start(ctx: &ExecutionContext, metric_name: &str) -> (ContextSegment, TracerFrame) {
        let segment = Self::attach(ctx);
        let frame = segment.start_frame(metric_name);
        (segment, frame)
    }

    /// Get or create this thread's segment for `ctx` without opening a
    /// frame. This is the merge half of token linking: the context stays
    /// open on this thread until traced work runs and completes here.
    pub(crate) fn attach(ctx: &ExecutionContext) -> ContextSegment {
        ACTIVE_SEGMENTS.with(|segments| {
            let mut segments = segments.borrow_mut();
            if let Some(existing) = segments.get(ctx.guid()) {
                return existing.clone();
            }
            let id = ctx.register_segment();
            let segment = ContextSegment {
                state: Rc::new(RefCell::new(SegmentState {
                    ctx: ctx.clone(),
                    id,
                    stack: Vec::new(),
                    finished: Vec::new(),
                    frame_seq: 0,
                    retired: false,
                })),
            };
            segments.insert(ctx.guid().to_string(), segment.clone());
            segment
        })
    }

    /// Push a nested tracer frame (method entry).
    pub fn start_frame(&self, metric_name: &str) -> TracerFrame {
        let mut state = self.state.borrow_mut();
        if state.retired {
            error!(
                "start_frame('{}') on already-retired segment {}",
                metric_name, state.id
            );
        }
        state.frame_seq += 1;
        let seq = state.frame_seq;
        state.stack.push(OpenFrame {
            metric_name: metric_name.to_string(),
            start: Instant::now(),
            child_time: Duration::ZERO,
            seq,
        });
        TracerFrame {
            segment_id: state.id,
            frame_seq: seq,
        }
    }

    /// Pop the given frame (method exit), recording duration and exclusive
    /// time. The frame must be the innermost open one: out-of-order finish
    /// is a programming error, reported and rejected rather than silently
    /// tolerated. Returns whether the frame was actually finished.
    ///
    /// When the pop empties the stack the segment retires from its
    /// context's open-segment set.
    pub fn finish_frame(&self, frame: TracerFrame, outcome: FrameOutcome) -> bool {
        let retirement = {
            let mut state = self.state.borrow_mut();
            if state.retired || frame.segment_id != state.id {
                error!(
                    "finish_frame on segment {} with stale frame handle (segment {})",
                    state.id, frame.segment_id
                );
                return false;
            }
            match state.stack.last() {
                Some(top) if top.seq == frame.frame_seq => {}
                Some(top) => {
                    error!(
                        "Out-of-order finish on segment {}: expected frame {} ('{}'), got {}",
                        state.id, top.seq, top.metric_name, frame.frame_seq
                    );
                    return false;
                }
                None => {
                    error!(
                        "finish_frame on segment {} with empty stack (frame {})",
                        state.id, frame.frame_seq
                    );
                    return false;
                }
            }

            let Some(open) = state.stack.pop() else {
                return false;
            };
            let duration = open.start.elapsed();
            let exclusive = duration.saturating_sub(open.child_time);
            if let Some(parent) = state.stack.last_mut() {
                parent.child_time += duration;
            }
            let depth = state.stack.len();
            state.finished.push(FrameRecord {
                metric_name: open.metric_name,
                depth,
                duration,
                exclusive,
                outcome,
            });

            if state.stack.is_empty() {
                state.retired = true;
                let frames = std::mem::take(&mut state.finished);
                Some((state.ctx.clone(), state.id, frames))
            } else {
                None
            }
        };

        // Retirement runs outside the RefCell borrow: observers notified by
        // the context may re-enter this thread's segment table.
        if let Some((ctx, id, frames)) = retirement {
            ACTIVE_SEGMENTS.with(|segments| {
                segments.borrow_mut().remove(ctx.guid());
            });
            debug!("Segment {} on context {} emptied, retiring", id, ctx.guid());
            ctx.retire_segment(id, frames);
        }
        true
    }

    /// Number of open frames on this segment's stack.
    pub fn depth(&self) -> usize {
        self.state.borrow().stack.len()
    }

    pub fn context(&self) -> ExecutionContext {
        self.state.borrow().ctx.clone()
    }
}

/// Whether the calling thread currently holds a live segment for the
/// context with the given GUID.
pub(crate) fn thread_has_segment(guid: &str) -> bool {
    ACTIVE_SEGMENTS.with(|segments| segments.borrow().contains_key(guid))
}
