//! Configuration loading and dynamic reload plumbing.
//!
//! The core never reads config files on its own; the embedding agent hands a
//! [`TraceConfig`] to [`ConfigWatch`] and components either read a snapshot
//! synchronously or subscribe as a [`ConfigListener`] for reload events.
//! Keeping the listener interface decoupled from the synchronous API lets
//! tests inject configuration directly without a live watcher.

pub mod types;

pub use types::{
    MultihostPreference, Result, SlowTransactionsConfig, TraceConfig, TraceError,
    MIN_TOKEN_TIMEOUT,
};

use log::{debug, info};
use std::sync::{Arc, Mutex, RwLock};

/// Callback interface invoked when the agent configuration is replaced.
pub trait ConfigListener: Send + Sync {
    fn config_changed(&self, config: &TraceConfig);
}

/// Holds the current configuration and fans out reloads to listeners.
pub struct ConfigWatch {
    current: RwLock<Arc<TraceConfig>>,
    listeners: Mutex<Vec<Arc<dyn ConfigListener>>>,
}

impl ConfigWatch {
    pub fn new(config: TraceConfig) -> Self {
        ConfigWatch {
            current: RwLock::new(Arc::new(config)),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the current configuration.
    pub fn current(&self) -> Arc<TraceConfig> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConfigListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    /// Replace the configuration and notify all listeners.
    pub fn update(&self, config: TraceConfig) {
        let config = Arc::new(config);
        {
            let mut current = self
                .current
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *current = config.clone();
        }
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        debug!(
            "Configuration updated, notifying {} listener(s)",
            listeners.len()
        );
        for listener in listeners {
            listener.config_changed(&config);
        }
    }
}

impl Default for ConfigWatch {
    fn default() -> Self {
        ConfigWatch::new(TraceConfig::default())
    }
}

/// Parse a [`TraceConfig`] from a JSON document.
pub fn from_json_str(json: &str) -> Result<TraceConfig> {
    let config: TraceConfig = serde_json::from_str(json)
        .map_err(|e| TraceError::Config(format!("Failed to parse config JSON: {}", e)))?;
    info!(
        "Loaded configuration: token_timeout={:?}, multihost={:?}, slow_transactions.enabled={}",
        config.token_timeout(),
        config.datastore_multihost_preference,
        config.slow_transactions.enabled
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        seen: AtomicUsize,
        last_timeout: Mutex<u64>,
    }

    impl ConfigListener for CountingListener {
        fn config_changed(&self, config: &TraceConfig) {
            self.seen.fetch_add(1, Ordering::SeqCst);
            *self.last_timeout.lock().unwrap() = config.async_token_timeout_seconds;
        }
    }

    #[test]
    fn test_update_notifies_listeners() {
        let watch = ConfigWatch::default();
        let listener = Arc::new(CountingListener {
            seen: AtomicUsize::new(0),
            last_timeout: Mutex::new(0),
        });
        watch.add_listener(listener.clone());

        let mut config = TraceConfig::default();
        config.async_token_timeout_seconds = 7;
        watch.update(config);

        assert_eq!(listener.seen.load(Ordering::SeqCst), 1);
        assert_eq!(*listener.last_timeout.lock().unwrap(), 7);
        assert_eq!(watch.current().async_token_timeout_seconds, 7);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(from_json_str("not json").is_err());
        assert!(from_json_str("{}").is_ok());
    }
}
