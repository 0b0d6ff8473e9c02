//! Process-wide harvest clock: the periodic background cycle on which
//! sampling-based checks run. Components subscribe as [`HarvestListener`]s;
//! production wiring starts one clock per process, tests drive
//! [`HarvestClock::tick`] directly.

use crate::config::types::{Result, TraceError};
use crossbeam_channel::Sender;
use log::{info, warn};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Hook invoked on every harvest cycle, before aggregated data is flushed.
pub trait HarvestListener: Send + Sync {
    fn before_harvest_tick(&self);
}

type ListenerList = Arc<Mutex<Vec<Arc<dyn HarvestListener>>>>;

/// Periodic tick source driving harvest-cycle work.
pub struct HarvestClock {
    listeners: ListenerList,
    interval: Duration,
    ticker: Option<JoinHandle<()>>,
    ticker_shutdown: Option<Sender<()>>,
}

impl HarvestClock {
    pub fn new(interval: Duration) -> Self {
        HarvestClock {
            listeners: Arc::new(Mutex::new(Vec::new())),
            interval: interval.max(Duration::from_millis(10)),
            ticker: None,
            ticker_shutdown: None,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn HarvestListener>) {
        self.lock_listeners().push(listener);
    }

    /// Detach a previously-added listener, matched by identity.
    pub fn remove_listener(&self, listener: &Arc<dyn HarvestListener>) {
        let target = Arc::as_ptr(listener) as *const ();
        self.lock_listeners()
            .retain(|existing| Arc::as_ptr(existing) as *const () != target);
    }

    pub fn listener_count(&self) -> usize {
        self.lock_listeners().len()
    }

    /// Run one harvest cycle synchronously on the calling thread.
    pub fn tick(&self) {
        let listeners = self.lock_listeners().clone();
        for listener in listeners {
            listener.before_harvest_tick();
        }
    }

    /// Start the background ticker thread.
    pub fn start(&mut self) -> Result<()> {
        if self.ticker.is_some() {
            return Err(TraceError::Lifecycle(
                "Harvest clock already running".to_string(),
            ));
        }
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let listeners = Arc::clone(&self.listeners);
        let interval = self.interval;

        let ticker = thread::Builder::new()
            .name("tracelink-harvest".to_string())
            .spawn(move || {
                info!("Harvest clock started (interval {:?})", interval);
                loop {
                    if shutdown_rx.recv_timeout(interval).is_ok() {
                        break;
                    }
                    let snapshot = listeners
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .clone();
                    for listener in snapshot {
                        listener.before_harvest_tick();
                    }
                }
                info!("Harvest clock shutting down");
            })
            .map_err(|e| TraceError::Lifecycle(format!("Failed to spawn harvest clock: {}", e)))?;

        self.ticker = Some(ticker);
        self.ticker_shutdown = Some(shutdown_tx);
        Ok(())
    }

    /// Stop and join the ticker thread.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.ticker_shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.ticker.take() {
            if handle.join().is_err() {
                warn!("Harvest clock thread panicked during shutdown");
            }
        }
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn HarvestListener>>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for HarvestClock {
    fn drop(&mut self) {
        self.stop();
    }
}
