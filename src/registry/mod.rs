//! Process-wide TTL cache mapping an opaque async key to a continuation
//! token, for frameworks that cannot pass the token explicitly (callback
//! objects keyed by whatever handle the framework exposes).
//!
//! Leak safety: every entry carries an enqueue time; entries past the TTL
//! are swept by a background thread and also evicted lazily on access, and
//! their tokens are force-expired without linking. A timeout eviction is
//! logged at warn (it usually means an async callback never fired) while an
//! explicit retrieval logs at debug.

use crate::config::types::{Result, TraceConfig, TraceError, MIN_TOKEN_TIMEOUT};
use crate::context::ContinuationToken;
use crate::observability::metrics::metrics;
use crossbeam_channel::Sender;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct RegistryEntry {
    token: ContinuationToken,
    enqueued: Instant,
}

type EntryMap<K> = Arc<Mutex<HashMap<K, RegistryEntry>>>;

/// TTL-backed token registry. `K` is whatever opaque key the framework
/// adapter can derive from its handle object.
pub struct ContinuationRegistry<K: Eq + Hash + Clone + Send + 'static> {
    entries: EntryMap<K>,
    timeout: Duration,
    sweeper: Option<JoinHandle<()>>,
    sweeper_shutdown: Option<Sender<()>>,
}

impl<K: Eq + Hash + Clone + Send + 'static> ContinuationRegistry<K> {
    /// Create a registry with the given token TTL, floor-clamped to
    /// [`MIN_TOKEN_TIMEOUT`] so pathological near-zero configs still leave
    /// a usable window.
    pub fn new(timeout: Duration) -> Self {
        ContinuationRegistry {
            entries: Arc::new(Mutex::new(HashMap::new())),
            timeout: timeout.max(MIN_TOKEN_TIMEOUT),
            sweeper: None,
            sweeper_shutdown: None,
        }
    }

    pub fn from_config(config: &TraceConfig) -> Self {
        Self::new(config.token_timeout())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Insert only if `key` is absent: first writer wins for racing
    /// framework callbacks. On a failed insert the caller's token is
    /// expired immediately (without linking) to avoid a leak, and false is
    /// returned. Never panics; a dropped continuation degrades to missing
    /// trace data, not a corrupted one.
    pub fn register(&self, key: K, token: ContinuationToken) -> bool {
        let mut entries = self.lock_entries();
        if let Some(existing) = entries.get(&key) {
            if existing.enqueued.elapsed() > self.timeout {
                // Lazy eviction: the stale holder lost its slot
                if let Some(stale) = entries.remove(&key) {
                    stale.token.expire_on_timeout();
                    metrics().registry_evict.inc();
                }
            } else {
                drop(entries);
                debug!("Registry key already present, dropping incoming continuation");
                metrics().registry_reject.inc();
                token.expire();
                return false;
            }
        }
        entries.insert(
            key,
            RegistryEntry {
                token,
                enqueued: Instant::now(),
            },
        );
        metrics().registry_register.inc();
        debug!("Registered continuation token (ttl {:?})", self.timeout);
        true
    }

    /// Atomically remove and return the token for `key`. Returns None if
    /// the key is absent, the entry outlived the TTL (the token is then
    /// force-expired), or the token was already expired elsewhere.
    pub fn retrieve_and_clear(&self, key: &K) -> Option<ContinuationToken> {
        let entry = self.lock_entries().remove(key)?;
        if entry.enqueued.elapsed() > self.timeout {
            entry.token.expire_on_timeout();
            metrics().registry_evict.inc();
            return None;
        }
        if !entry.token.is_active() {
            debug!("Retrieved continuation token was already expired");
            return None;
        }
        metrics().registry_retrieve.inc();
        debug!(
            "Retrieved continuation token after {}ms",
            entry.token.created().elapsed().as_millis()
        );
        Some(entry.token)
    }

    /// Evict every entry past the TTL, force-expiring its token. Returns
    /// the number of evictions. Also run periodically by the sweeper
    /// thread.
    pub fn sweep(&self) -> usize {
        Self::sweep_entries(&self.entries, self.timeout)
    }

    fn sweep_entries(entries: &Mutex<HashMap<K, RegistryEntry>>, timeout: Duration) -> usize {
        let expired: Vec<RegistryEntry> = {
            let mut entries = entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let stale_keys: Vec<K> = entries
                .iter()
                .filter(|(_, entry)| entry.enqueued.elapsed() > timeout)
                .map(|(key, _)| key.clone())
                .collect();
            stale_keys
                .into_iter()
                .filter_map(|key| entries.remove(&key))
                .collect()
        };
        // Expire outside the map lock; token expiry takes its own lock and
        // logs.
        let evicted = expired.len();
        for entry in expired {
            entry.token.expire_on_timeout();
            metrics().registry_evict.inc();
        }
        if evicted > 0 {
            warn!(
                "Registry sweep evicted {} timed-out continuation(s); \
                 an async callback likely never fired",
                evicted
            );
        }
        evicted
    }

    /// Start the background sweeper thread. Sweeps every half TTL, clamped
    /// to [250ms, 30s].
    pub fn start_sweeper(&mut self) -> Result<()> {
        if self.sweeper.is_some() {
            return Err(TraceError::Lifecycle(
                "Registry sweeper already running".to_string(),
            ));
        }
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let entries = Arc::clone(&self.entries);
        let timeout = self.timeout;
        let interval = (timeout / 2).clamp(Duration::from_millis(250), Duration::from_secs(30));

        let sweeper = thread::Builder::new()
            .name("tracelink-registry-sweeper".to_string())
            .spawn(move || {
                info!("Registry sweeper started (interval {:?})", interval);
                loop {
                    if shutdown_rx.try_recv().is_ok() {
                        break;
                    }
                    Self::sweep_entries(&entries, timeout);
                    if shutdown_rx.recv_timeout(interval).is_ok() {
                        break;
                    }
                }
                info!("Registry sweeper shutting down");
            })
            .map_err(|e| TraceError::Lifecycle(format!("Failed to spawn sweeper: {}", e)))?;

        self.sweeper = Some(sweeper);
        self.sweeper_shutdown = Some(shutdown_tx);
        Ok(())
    }

    /// Stop and join the sweeper thread.
    pub fn stop_sweeper(&mut self) {
        if let Some(shutdown) = self.sweeper_shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.sweeper.take() {
            if handle.join().is_err() {
                warn!("Registry sweeper thread panicked during shutdown");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<K, RegistryEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<K: Eq + Hash + Clone + Send + 'static> Drop for ContinuationRegistry<K> {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::segment::{ContextSegment, FrameOutcome};
    use crate::context::ExecutionContext;

    fn token_for(name: &str) -> ContinuationToken {
        let ctx = ExecutionContext::start(name, Vec::new());
        let (segment, root) = ContextSegment::start(&ctx, "root");
        let token = ctx.create_token();
        segment.finish_frame(root, FrameOutcome::Success);
        token
    }

    #[test]
    fn test_timeout_floor_clamp() {
        let registry: ContinuationRegistry<u64> = ContinuationRegistry::new(Duration::ZERO);
        assert_eq!(registry.timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_register_then_retrieve() {
        let registry: ContinuationRegistry<u64> = ContinuationRegistry::new(Duration::from_secs(5));
        let token = token_for("roundtrip");
        assert!(registry.register(7, token));
        assert_eq!(registry.len(), 1);

        let retrieved = registry.retrieve_and_clear(&7).expect("token present");
        assert!(retrieved.is_active());
        assert!(registry.is_empty());
        assert!(registry.retrieve_and_clear(&7).is_none());
    }

    #[test]
    fn test_first_writer_wins() {
        let registry: ContinuationRegistry<&str> =
            ContinuationRegistry::new(Duration::from_secs(5));
        let first = token_for("winner");
        let second = token_for("loser");
        assert!(registry.register("cb", first));
        assert!(!registry.register("cb", second.clone()));

        // Loser's token was expired without linking
        assert!(!second.is_active());
        let survivor = registry.retrieve_and_clear(&"cb").unwrap();
        assert!(survivor.is_active());
    }

    #[test]
    fn test_ttl_eviction_on_sweep() {
        let registry: ContinuationRegistry<u64> = ContinuationRegistry::new(Duration::ZERO);
        let token = token_for("stale");
        assert!(registry.register(1, token.clone()));

        std::thread::sleep(registry.timeout() + Duration::from_millis(50));
        assert_eq!(registry.sweep(), 1);
        assert!(registry.is_empty());
        assert!(!token.is_active());
        assert!(registry.retrieve_and_clear(&1).is_none());
    }

    #[test]
    fn test_ttl_eviction_lazy_on_retrieve() {
        let registry: ContinuationRegistry<u64> = ContinuationRegistry::new(Duration::ZERO);
        let token = token_for("lazy");
        assert!(registry.register(1, token.clone()));

        std::thread::sleep(registry.timeout() + Duration::from_millis(50));
        assert!(registry.retrieve_and_clear(&1).is_none());
        assert!(!token.is_active());
    }

    #[test]
    fn test_stale_entry_replaced_on_register() {
        let registry: ContinuationRegistry<u64> = ContinuationRegistry::new(Duration::ZERO);
        let stale = token_for("stale");
        assert!(registry.register(1, stale.clone()));
        std::thread::sleep(registry.timeout() + Duration::from_millis(50));

        let fresh = token_for("fresh");
        assert!(registry.register(1, fresh));
        assert!(!stale.is_active());
        assert!(registry.retrieve_and_clear(&1).unwrap().is_active());
    }

    #[test]
    fn test_sweeper_thread_evicts() {
        let mut registry: ContinuationRegistry<u64> = ContinuationRegistry::new(Duration::ZERO);
        registry.start_sweeper().unwrap();
        assert!(registry.start_sweeper().is_err());

        let token = token_for("swept");
        assert!(registry.register(1, token.clone()));
        // Floor-clamped TTL is 250ms, sweep interval 250ms
        std::thread::sleep(Duration::from_millis(700));
        assert!(registry.is_empty());
        assert!(!token.is_active());
        registry.stop_sweeper();
    }

    #[test]
    fn test_expired_token_not_returned() {
        let registry: ContinuationRegistry<u64> = ContinuationRegistry::new(Duration::from_secs(5));
        let token = token_for("expired-elsewhere");
        assert!(registry.register(1, token.clone()));
        token.expire();
        assert!(registry.retrieve_and_clear(&1).is_none());
    }
}
