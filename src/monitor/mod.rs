//! Background sampler surfacing logical transactions that run past a
//! threshold, either still open on a harvest scan or just finished over it.
//!
//! Exactly-once reporting is arbitrated by map removal: both the periodic
//! scan and the completion path remove the GUID from the open map first and
//! report only when the removal succeeded, so concurrent scan/completion
//! timing can never double-report one transaction.

use crate::config::types::SlowTransactionsConfig;
use crate::config::{ConfigListener, TraceConfig};
use crate::context::{ContextObserver, ContextSummary, ExecutionContext};
use crate::harvest::{HarvestClock, HarvestListener};
use crate::observability::events::{epoch_millis, DiagnosticEvent, EventSink};
use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

pub const SLOW_TRANSACTION_EVENT: &str = "SlowTransaction";

struct OpenEntry {
    ctx: ExecutionContext,
    /// Monotonic admission order, the tie-breaker between equally slow
    /// transactions
    seq: u64,
}

/// Samples open execution contexts and reports the worst offender per
/// harvest cycle, plus over-threshold completions when configured.
pub struct SlowExecutionMonitor {
    config: RwLock<SlowTransactionsConfig>,
    open: Mutex<HashMap<String, OpenEntry>>,
    seq: AtomicU64,
    sink: Arc<dyn EventSink>,
}

impl SlowExecutionMonitor {
    pub fn new(config: SlowTransactionsConfig, sink: Arc<dyn EventSink>) -> Self {
        SlowExecutionMonitor {
            config: RwLock::new(config),
            open: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            sink,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.read_config().enabled
    }

    /// Attach to the harvest clock. No-op when the monitor is disabled, so
    /// a disabled monitor never appears in the clock's listener list.
    pub fn on_start(self: Arc<Self>, clock: &HarvestClock) {
        if self.is_enabled() {
            clock.add_listener(self as Arc<dyn HarvestListener>);
        }
    }

    pub fn on_stop(self: Arc<Self>, clock: &HarvestClock) {
        if self.is_enabled() {
            clock.remove_listener(&(self as Arc<dyn HarvestListener>));
        }
    }

    /// Periodic scan: among open transactions past the threshold, report
    /// the single worst one and drop it from the map so no later cycle or
    /// completion reports it again.
    pub fn run(&self) {
        let threshold_ms = self.read_config().threshold_ms;
        let worst = {
            let mut open = self.lock_open();
            let candidate = open
                .iter()
                .map(|(guid, entry)| (guid, entry, entry.ctx.elapsed_ms()))
                .filter(|(_, _, elapsed)| *elapsed > threshold_ms)
                // Worst = longest open; on equal elapsed the earlier-seen wins
                .max_by_key(|(_, entry, elapsed)| (*elapsed, std::cmp::Reverse(entry.seq)))
                .map(|(guid, _, _)| guid.clone());
            candidate.and_then(|guid| open.remove(&guid))
        };
        if let Some(entry) = worst {
            let elapsed_ms = entry.ctx.elapsed_ms();
            debug!(
                "Reporting still-open slow transaction {} ({}ms > {}ms)",
                entry.ctx.guid(),
                elapsed_ms,
                threshold_ms
            );
            self.report(&entry.ctx, elapsed_ms, "open");
        }
    }

    /// Open transactions currently tracked, for introspection and tests.
    pub fn open_transaction_guids(&self) -> Vec<String> {
        self.lock_open().keys().cloned().collect()
    }

    fn report(&self, ctx: &ExecutionContext, elapsed_ms: u64, state: &str) {
        let attributes = self.extract_metadata(ctx, elapsed_ms, state);
        self.sink
            .record_event(DiagnosticEvent::new(SLOW_TRANSACTION_EVENT, attributes));
    }

    /// Flatten the transaction into the event attribute map: its three
    /// attribute tiers, identity, timing, and the initiating thread's
    /// captured call site plus current kernel state.
    fn extract_metadata(
        &self,
        ctx: &ExecutionContext,
        elapsed_ms: u64,
        state: &str,
    ) -> HashMap<String, Value> {
        let max_lines = self.read_config().max_stack_trace_lines;
        let mut attributes = HashMap::new();
        for tier in [
            crate::context::AttributeTier::User,
            crate::context::AttributeTier::Agent,
            crate::context::AttributeTier::Intrinsic,
        ] {
            attributes.extend(ctx.attributes(tier));
        }
        attributes.insert("guid".to_string(), Value::from(ctx.guid()));
        attributes.insert("name".to_string(), Value::from(ctx.name()));
        attributes.insert("transaction.state".to_string(), Value::from(state));
        attributes.insert("timestamp".to_string(), Value::from(epoch_millis()));
        attributes.insert("elapsed_ms".to_string(), Value::from(elapsed_ms));

        let thread = ctx.initiating_thread();
        if let Some(tid) = thread.os_tid {
            attributes.insert("thread.id".to_string(), Value::from(tid));
        }
        attributes.insert("thread.name".to_string(), Value::from(thread.name.clone()));
        attributes.insert(
            "thread.state".to_string(),
            Value::from(thread_state(thread.os_tid)),
        );
        attributes.insert(
            "code.stacktrace".to_string(),
            Value::from(scrub_stack_trace(
                &ctx.start_backtrace().to_string(),
                max_lines,
            )),
        );
        attributes
    }

    fn read_config(&self) -> SlowTransactionsConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn lock_open(&self) -> std::sync::MutexGuard<'_, HashMap<String, OpenEntry>> {
        self.open
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ContextObserver for SlowExecutionMonitor {
    fn context_started(&self, ctx: &ExecutionContext) {
        if !self.is_enabled() {
            return;
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.lock_open().insert(
            ctx.guid().to_string(),
            OpenEntry {
                ctx: ctx.clone(),
                seq,
            },
        );
    }

    fn context_finished(&self, ctx: &ExecutionContext, summary: &ContextSummary) {
        // Remove first: if the periodic scan already claimed this GUID the
        // removal loses and the transaction is not reported again.
        let removed = self.lock_open().remove(ctx.guid()).is_some();
        if !removed {
            return;
        }
        let config = self.read_config();
        let elapsed_ms = summary.elapsed.as_millis() as u64;
        if config.evaluate_completed && elapsed_ms > config.threshold_ms {
            debug!(
                "Reporting completed slow transaction {} ({}ms > {}ms)",
                ctx.guid(),
                elapsed_ms,
                config.threshold_ms
            );
            self.report(ctx, elapsed_ms, "completed");
        }
    }
}

impl HarvestListener for SlowExecutionMonitor {
    fn before_harvest_tick(&self) {
        self.run();
    }
}

impl ConfigListener for SlowExecutionMonitor {
    fn config_changed(&self, config: &TraceConfig) {
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = config.slow_transactions.clone();
    }
}

/// Current kernel state of a thread, read from /proc. The scheduler state
/// letter is the ground truth for "what is this thread doing right now";
/// a missing task entry means the thread already exited.
fn thread_state(os_tid: Option<i32>) -> String {
    let Some(tid) = os_tid else {
        return "UNKNOWN".to_string();
    };
    let stat_path = format!("/proc/self/task/{}/stat", tid);
    let Ok(content) = std::fs::read_to_string(&stat_path) else {
        return "TERMINATED".to_string();
    };
    // Field 3 follows the parenthesized comm, which may itself contain
    // spaces and parens
    let state_char = content
        .rsplit_once(')')
        .map(|(_, rest)| rest.trim_start())
        .and_then(|rest| rest.chars().next());
    match state_char {
        Some('R') => "RUNNING".to_string(),
        Some('S') => "SLEEPING".to_string(),
        Some('D') => "DISK_SLEEP".to_string(),
        Some('T') | Some('t') => "STOPPED".to_string(),
        Some('Z') => "ZOMBIE".to_string(),
        Some('X') | Some('x') => "DEAD".to_string(),
        Some(other) => other.to_string(),
        None => "UNKNOWN".to_string(),
    }
}

/// Bound and scrub a captured backtrace: keep symbol lines, drop source
/// path lines (they can embed home directories and build paths), cap the
/// depth.
fn scrub_stack_trace(raw: &str, max_lines: usize) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("at "))
        .take(max_lines)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::segment::{ContextSegment, FrameOutcome};
    use crate::observability::events::CollectingEventSink;
    use std::time::Duration;

    fn monitor_with(
        threshold_ms: u64,
        evaluate_completed: bool,
    ) -> (Arc<SlowExecutionMonitor>, Arc<CollectingEventSink>) {
        let sink = Arc::new(CollectingEventSink::new());
        let config = SlowTransactionsConfig {
            enabled: true,
            threshold_ms,
            max_stack_trace_lines: 5,
            evaluate_completed,
        };
        (
            Arc::new(SlowExecutionMonitor::new(config, sink.clone())),
            sink,
        )
    }

    fn observers(monitor: &Arc<SlowExecutionMonitor>) -> Vec<Arc<dyn ContextObserver>> {
        vec![monitor.clone() as Arc<dyn ContextObserver>]
    }

    #[test]
    fn test_tracks_open_and_finished() {
        let (monitor, _sink) = monitor_with(1_000_000, false);
        let ctx = ExecutionContext::start("tracked", observers(&monitor));
        assert_eq!(monitor.open_transaction_guids(), vec![ctx.guid().to_string()]);

        let (segment, root) = ContextSegment::start(&ctx, "root");
        segment.finish_frame(root, FrameOutcome::Success);
        assert!(monitor.open_transaction_guids().is_empty());
    }

    #[test]
    fn test_scan_reports_nothing_under_threshold() {
        let (monitor, sink) = monitor_with(1_000_000, false);
        let _ctx = ExecutionContext::start("fast", observers(&monitor));
        monitor.run();
        assert!(sink.is_empty());
        assert_eq!(monitor.open_transaction_guids().len(), 1);
    }

    #[test]
    fn test_scan_reports_single_worst_offender() {
        let (monitor, sink) = monitor_with(10, false);
        let oldest = ExecutionContext::start("oldest", observers(&monitor));
        std::thread::sleep(Duration::from_millis(20));
        let _newer = ExecutionContext::start("newer", observers(&monitor));
        std::thread::sleep(Duration::from_millis(15));

        monitor.run();

        let events = sink.drain();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.event_type, SLOW_TRANSACTION_EVENT);
        assert_eq!(event.attributes["guid"], Value::from(oldest.guid()));
        assert_eq!(event.attributes["transaction.state"], Value::from("open"));
        // The reported transaction left the map; the other remains
        assert_eq!(monitor.open_transaction_guids().len(), 1);

        // Next cycle picks up the remaining one, never the reported one
        monitor.run();
        let events = sink.drain();
        assert_eq!(events.len(), 1);
        assert_ne!(events[0].attributes["guid"], Value::from(oldest.guid()));
    }

    #[test]
    fn test_completion_reports_once_when_enabled() {
        let (monitor, sink) = monitor_with(10, true);
        let ctx = ExecutionContext::start("slow-complete", observers(&monitor));
        let (segment, root) = ContextSegment::start(&ctx, "root");
        std::thread::sleep(Duration::from_millis(25));
        segment.finish_frame(root, FrameOutcome::Success);

        let events = sink.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].attributes["transaction.state"],
            Value::from("completed")
        );
        assert!(events[0].attributes["elapsed_ms"].as_u64().unwrap() >= 25);
    }

    #[test]
    fn test_completion_not_reported_when_disabled() {
        let (monitor, sink) = monitor_with(10, false);
        let ctx = ExecutionContext::start("quiet-complete", observers(&monitor));
        let (segment, root) = ContextSegment::start(&ctx, "root");
        std::thread::sleep(Duration::from_millis(25));
        segment.finish_frame(root, FrameOutcome::Success);
        assert!(sink.is_empty());
        assert!(monitor.open_transaction_guids().is_empty());
    }

    #[test]
    fn test_scan_then_completion_reports_exactly_once() {
        let (monitor, sink) = monitor_with(10, true);
        let ctx = ExecutionContext::start("claimed-by-scan", observers(&monitor));
        let (segment, root) = ContextSegment::start(&ctx, "root");
        std::thread::sleep(Duration::from_millis(25));

        // Scan claims the GUID first
        monitor.run();
        assert_eq!(sink.drain().len(), 1);

        // Completion loses the removal race and stays silent
        segment.finish_frame(root, FrameOutcome::Success);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_disabled_monitor_tracks_nothing() {
        let sink = Arc::new(CollectingEventSink::new());
        let config = SlowTransactionsConfig {
            enabled: false,
            ..SlowTransactionsConfig::default()
        };
        let monitor = Arc::new(SlowExecutionMonitor::new(config, sink.clone()));
        let _ctx = ExecutionContext::start("ignored", observers(&monitor));
        assert!(monitor.open_transaction_guids().is_empty());
        monitor.run();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_metadata_attributes() {
        let (monitor, sink) = monitor_with(10, false);
        let ctx = ExecutionContext::start("metadata", observers(&monitor));
        ctx.set_attribute(
            crate::context::AttributeTier::User,
            "k1",
            Value::from("v1"),
        );
        ctx.set_attribute(
            crate::context::AttributeTier::Agent,
            "k2",
            Value::from("v2"),
        );
        ctx.set_attribute(
            crate::context::AttributeTier::Intrinsic,
            "k3",
            Value::from("v3"),
        );
        std::thread::sleep(Duration::from_millis(15));

        monitor.run();
        let events = sink.drain();
        assert_eq!(events.len(), 1);
        let attributes = &events[0].attributes;
        assert_eq!(attributes["k1"], Value::from("v1"));
        assert_eq!(attributes["k2"], Value::from("v2"));
        assert_eq!(attributes["k3"], Value::from("v3"));
        assert_eq!(attributes["name"], Value::from("metadata"));
        assert!(attributes["timestamp"].as_u64().unwrap() > 0);
        assert!(attributes["elapsed_ms"].as_u64().unwrap() >= 10);
        assert!(attributes.contains_key("thread.name"));
        assert!(attributes.contains_key("thread.state"));
        let trace = attributes["code.stacktrace"].as_str().unwrap();
        assert!(trace.lines().count() <= 5);
    }

    #[test]
    fn test_scrub_stack_trace_bounds_and_strips_paths() {
        let raw = "0: alpha::beta\n   at /home/someone/src/main.rs:10\n1: gamma::delta\n2: epsilon\n";
        let scrubbed = scrub_stack_trace(raw, 2);
        assert_eq!(scrubbed, "0: alpha::beta\n1: gamma::delta");
    }

    #[test]
    fn test_thread_state_of_current_thread() {
        #[cfg(target_os = "linux")]
        {
            let tid = nix::unistd::gettid().as_raw();
            // The calling thread is on-CPU right now
            assert_eq!(thread_state(Some(tid)), "RUNNING");
        }
        assert_eq!(thread_state(None), "UNKNOWN");
    }
}
