/// ExecutionContext: one logical unit of monitored work (e.g. one inbound
/// request), spanning possibly many threads.
use crate::context::segment;
use crate::context::token::ContinuationToken;
use crate::context::{ContextObserver, ContextSummary, FrameRecord};
use crate::observability::events::epoch_millis;
use crate::observability::metrics::metrics;
use log::{debug, error};
use serde_json::Value;
use std::backtrace::Backtrace;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Attribute tiers, reported as separate namespaces by the exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeTier {
    User,
    Agent,
    Intrinsic,
}

/// Priority-ranked transaction name. A rename only takes effect when its
/// priority is at least the current one, so adapter defaults never clobber
/// an explicit user-supplied name.
#[derive(Debug, Clone)]
struct PriorityName {
    name: String,
    priority: u8,
}

/// Initiating-thread identity captured at context creation. The kernel
/// thread id is the durable handle for later /proc state lookups.
#[derive(Debug, Clone)]
pub(crate) struct InitiatingThread {
    pub name: String,
    pub os_tid: Option<i32>,
}

#[cfg(target_os = "linux")]
fn current_os_tid() -> Option<i32> {
    Some(nix::unistd::gettid().as_raw())
}

#[cfg(not(target_os = "linux"))]
fn current_os_tid() -> Option<i32> {
    None
}

struct ContextInner {
    guid: String,
    start: Instant,
    wall_clock_start_ms: u64,
    name: Mutex<PriorityName>,
    attributes: Mutex<HashMap<AttributeTier, HashMap<String, Value>>>,
    open_segments: Mutex<HashSet<u64>>,
    completed_frames: Mutex<Vec<FrameRecord>>,
    segment_seq: AtomicU64,
    finished: AtomicBool,
    observers: Vec<Arc<dyn ContextObserver>>,
    initiating_thread: InitiatingThread,
    start_backtrace: Backtrace,
}

/// A logical transaction. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl ExecutionContext {
    /// Create a new logical transaction and notify observers. Called by the
    /// entry-point adapter when the first dispatch fires; the adapter is
    /// expected to open a segment on the calling thread right after.
    pub fn start(name: &str, observers: Vec<Arc<dyn ContextObserver>>) -> Self {
        let thread = std::thread::current();
        let ctx = ExecutionContext {
            inner: Arc::new(ContextInner {
                guid: Uuid::new_v4().to_string(),
                start: Instant::now(),
                wall_clock_start_ms: epoch_millis(),
                name: Mutex::new(PriorityName {
                    name: name.to_string(),
                    priority: 0,
                }),
                attributes: Mutex::new(HashMap::new()),
                open_segments: Mutex::new(HashSet::new()),
                completed_frames: Mutex::new(Vec::new()),
                segment_seq: AtomicU64::new(0),
                finished: AtomicBool::new(false),
                observers,
                initiating_thread: InitiatingThread {
                    name: thread.name().unwrap_or("unnamed").to_string(),
                    os_tid: current_os_tid(),
                },
                start_backtrace: Backtrace::force_capture(),
            }),
        };
        debug!("Context {} started as '{}'", ctx.guid(), name);
        for observer in &ctx.inner.observers {
            observer.context_started(&ctx);
        }
        ctx
    }

    pub fn guid(&self) -> &str {
        &self.inner.guid
    }

    pub fn name(&self) -> String {
        self.lock_name().name.clone()
    }

    /// Rename the transaction. Ignored when `priority` is below the
    /// priority of the current name.
    pub fn set_name(&self, priority: u8, name: &str) {
        let mut current = self.lock_name();
        if priority >= current.priority {
            current.name = name.to_string();
            current.priority = priority;
        }
    }

    pub fn set_attribute(&self, tier: AttributeTier, key: &str, value: Value) {
        self.lock_attributes()
            .entry(tier)
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn attributes(&self, tier: AttributeTier) -> HashMap<String, Value> {
        self.lock_attributes()
            .get(&tier)
            .cloned()
            .unwrap_or_default()
    }

    pub fn wall_clock_start_ms(&self) -> u64 {
        self.inner.wall_clock_start_ms
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }

    /// True while at least one segment remains open on any thread.
    pub fn is_open(&self) -> bool {
        !self.inner.finished.load(Ordering::Acquire)
    }

    pub(crate) fn initiating_thread(&self) -> &InitiatingThread {
        &self.inner.initiating_thread
    }

    pub(crate) fn start_backtrace(&self) -> &Backtrace {
        &self.inner.start_backtrace
    }

    /// Issue a continuation token that a later thread can consume to merge
    /// into this context. Calling from a thread that holds no open segment
    /// for this context is a programming error: it is reported but the
    /// token is still issued, because refusing would fault the caller.
    pub fn create_token(&self) -> ContinuationToken {
        if !segment::thread_has_segment(self.guid()) {
            error!(
                "create_token for context {} called from a thread with no open segment",
                self.guid()
            );
        }
        metrics().token_create.inc();
        let token = ContinuationToken::new(self.clone());
        debug!("Context {} issued continuation token", self.guid());
        token
    }

    /// Register a new segment, returning its id.
    pub(crate) fn register_segment(&self) -> u64 {
        let id = self.inner.segment_seq.fetch_add(1, Ordering::Relaxed);
        self.lock_segments().insert(id);
        debug!("Context {} opened segment {}", self.guid(), id);
        id
    }

    /// Retire a segment, folding its finished frames into the call tree.
    /// When the last segment retires the context finishes and observers are
    /// notified with the aggregated summary.
    pub(crate) fn retire_segment(&self, id: u64, frames: Vec<FrameRecord>) {
        let now_empty = {
            let mut open = self.lock_segments();
            if !open.remove(&id) {
                error!(
                    "Context {} asked to retire unknown segment {}",
                    self.guid(),
                    id
                );
                return;
            }
            open.is_empty()
        };
        self.inner
            .completed_frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(frames);
        debug!("Context {} retired segment {}", self.guid(), id);

        if now_empty && !self.inner.finished.swap(true, Ordering::AcqRel) {
            let summary = self.build_summary();
            debug!(
                "Context {} finished after {}ms",
                self.guid(),
                summary.elapsed.as_millis()
            );
            for observer in &self.inner.observers {
                observer.context_finished(self, &summary);
            }
        }
    }

    fn build_summary(&self) -> ContextSummary {
        ContextSummary {
            guid: self.guid().to_string(),
            name: self.name(),
            wall_clock_start_ms: self.wall_clock_start_ms(),
            elapsed: self.elapsed(),
            frames: std::mem::take(
                &mut self
                    .inner
                    .completed_frames
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            ),
        }
    }

    fn lock_name(&self) -> std::sync::MutexGuard<'_, PriorityName> {
        self.inner
            .name
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_attributes(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<AttributeTier, HashMap<String, Value>>> {
        self.inner
            .attributes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_segments(&self) -> std::sync::MutexGuard<'_, HashSet<u64>> {
        self.inner
            .open_segments
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("guid", &self.inner.guid)
            .field("name", &self.name())
            .field("open", &self.is_open())
            .finish()
    }
}
