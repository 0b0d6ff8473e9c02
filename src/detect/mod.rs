//! Connection address detection: correlates the real network address a
//! driver connected to with the long-lived handle object the application
//! keeps, surviving later drops of the handle.
//!
//! Per-thread state machine: `NOT_DETECTING` <-> `DETECTING`. Adapters open
//! a window around a connect call ([`begin_detection`] / [`end_detection`],
//! or the RAII [`DetectionGuard`]), hook points inside the driver call
//! [`observe`] with any address they see, and the adapter finally calls
//! [`associate`] to bind the observed address to the handle. Conflicting
//! observations within one window are resolved by the configured
//! [`MultihostPreference`].
//!
//! The handle -> address map is weak-keyed: it never extends the handle's
//! lifetime, so [`lookup`] returns None once the application drops the
//! handle. Dead entries are pruned lazily and via [`prune_dead`].

use crate::config::types::MultihostPreference;
use crate::config::{ConfigListener, TraceConfig};
use log::{debug, warn};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

/// Map size above which `associate` opportunistically prunes dead entries.
const PRUNE_THRESHOLD: usize = 64;

#[derive(Debug, Default)]
struct DetectionWindow {
    address: Option<SocketAddr>,
    /// Set when a `None`-policy conflict fired. Suppression covers the rest
    /// of the window, not just the conflicting observation.
    suppressed: bool,
}

thread_local! {
    static WINDOW: RefCell<Option<DetectionWindow>> = const { RefCell::new(None) };
}

static PREFERENCE: RwLock<MultihostPreference> = RwLock::new(MultihostPreference::None);

struct Association {
    handle: Weak<dyn Any + Send + Sync>,
    address: SocketAddr,
}

fn associations() -> &'static Mutex<HashMap<usize, Association>> {
    static ASSOCIATIONS: OnceLock<Mutex<HashMap<usize, Association>>> = OnceLock::new();
    ASSOCIATIONS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn handle_key<T: Any + Send + Sync>(handle: &Arc<T>) -> usize {
    Arc::as_ptr(handle) as *const () as usize
}

/// Set the process-wide conflict policy.
pub fn set_multihost_preference(preference: MultihostPreference) {
    *PREFERENCE
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = preference;
}

pub fn multihost_preference() -> MultihostPreference {
    *PREFERENCE
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Config-reload hook keeping the conflict policy current.
pub struct MultihostPreferenceListener;

impl ConfigListener for MultihostPreferenceListener {
    fn config_changed(&self, config: &TraceConfig) {
        set_multihost_preference(config.datastore_multihost_preference);
    }
}

/// Open this thread's detection window. A window already open is reset.
pub fn begin_detection() {
    WINDOW.with(|window| {
        *window.borrow_mut() = Some(DetectionWindow::default());
    });
}

pub fn is_detecting() -> bool {
    WINDOW.with(|window| window.borrow().is_some())
}

/// Close this thread's detection window. Always clears the last-observed
/// slot; run on every exit path (see [`DetectionGuard`]).
pub fn end_detection() {
    WINDOW.with(|window| {
        *window.borrow_mut() = None;
    });
}

/// Report an address seen during a connect attempt. Ignored outside a
/// detection window. On a conflicting second address the configured policy
/// applies: `First` keeps the earlier one, `Last` overwrites, `None` drops
/// the address and suppresses the rest of the window.
pub fn observe(address: SocketAddr) {
    WINDOW.with(|window| {
        let mut window = window.borrow_mut();
        let Some(state) = window.as_mut() else {
            debug!("observe({}) outside a detection window, ignoring", address);
            return;
        };
        if state.suppressed {
            return;
        }
        match state.address {
            None => state.address = Some(address),
            Some(previous) if previous == address => {}
            Some(previous) => match multihost_preference() {
                MultihostPreference::First => {
                    debug!(
                        "Conflicting addresses {} and {}; keeping first",
                        previous, address
                    );
                }
                MultihostPreference::Last => {
                    debug!(
                        "Conflicting addresses {} and {}; keeping last",
                        previous, address
                    );
                    state.address = Some(address);
                }
                MultihostPreference::None => {
                    warn!(
                        "Conflicting addresses {} and {} with no multihost preference; \
                         dropping both and suppressing detection for this window",
                        previous, address
                    );
                    state.address = None;
                    state.suppressed = true;
                }
            },
        }
    });
}

/// The address observed so far in this thread's window, if any.
pub fn observed_address() -> Option<SocketAddr> {
    WINDOW.with(|window| window.borrow().as_ref().and_then(|state| state.address))
}

/// Bind the currently-observed address to `handle` in the weak-keyed map.
/// Skipped (with a debug line) when no address was observed this window.
pub fn associate<T: Any + Send + Sync>(handle: &Arc<T>) {
    let Some(address) = observed_address() else {
        debug!("associate called with no observed address, skipping");
        return;
    };
    let dyn_handle: Arc<dyn Any + Send + Sync> = handle.clone();
    let mut map = lock_associations();
    map.insert(
        handle_key(handle),
        Association {
            handle: Arc::downgrade(&dyn_handle),
            address,
        },
    );
    debug!("Associated connection handle with {}", address);
    if map.len() > PRUNE_THRESHOLD {
        prune_locked(&mut map);
    }
}

/// Pure read against the weak map; safe in any detection state. Returns
/// None once the handle's allocation is gone (a dead entry found here is
/// removed on the spot).
pub fn lookup<T: Any + Send + Sync>(handle: &Arc<T>) -> Option<SocketAddr> {
    let key = handle_key(handle);
    let mut map = lock_associations();
    match map.get(&key) {
        Some(association) if association.handle.strong_count() > 0 => Some(association.address),
        Some(_) => {
            // Key collision from a reused allocation; the old entry is dead
            map.remove(&key);
            None
        }
        None => None,
    }
}

/// Drop entries whose handle has been deallocated. Returns how many were
/// removed. Suitable for harvest-tick wiring; `associate` also prunes once
/// the map grows past a threshold.
pub fn prune_dead() -> usize {
    prune_locked(&mut lock_associations())
}

fn prune_locked(map: &mut HashMap<usize, Association>) -> usize {
    let before = map.len();
    map.retain(|_, association| association.handle.strong_count() > 0);
    let pruned = before - map.len();
    if pruned > 0 {
        debug!("Pruned {} dead connection association(s)", pruned);
    }
    pruned
}

fn lock_associations() -> std::sync::MutexGuard<'static, HashMap<usize, Association>> {
    associations()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// RAII wrapper for a detection window: begins on construction, always
/// ends on drop so the window is cleared even when the connect call
/// unwinds.
pub struct DetectionGuard(());

impl DetectionGuard {
    #[must_use = "the window closes when the guard drops"]
    pub fn begin() -> Self {
        begin_detection();
        DetectionGuard(())
    }
}

impl Drop for DetectionGuard {
    fn drop(&mut self) {
        end_detection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> SocketAddr {
        format!("10.0.0.{}:5432", last).parse().unwrap()
    }

    // Windows are thread-local and the preference is process-global, so
    // each policy test runs on its own thread to avoid cross-test bleed.
    fn on_own_thread<F: FnOnce() + Send + 'static>(f: F) {
        std::thread::spawn(f).join().unwrap();
    }

    // Tests that set the global preference take this lock so the parallel
    // runner cannot interleave another test's preference change.
    fn pref_lock() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: Mutex<()> = Mutex::new(());
        LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[test]
    fn test_observe_outside_window_ignored() {
        on_own_thread(|| {
            observe(addr(1));
            assert!(!is_detecting());
            assert_eq!(observed_address(), None);
        });
    }

    #[test]
    fn test_policy_first_keeps_earliest() {
        on_own_thread(|| {
            let _lock = pref_lock();
            set_multihost_preference(MultihostPreference::First);
            let _guard = DetectionGuard::begin();
            observe(addr(1));
            observe(addr(2));
            assert_eq!(observed_address(), Some(addr(1)));
        });
    }

    #[test]
    fn test_policy_last_keeps_latest() {
        on_own_thread(|| {
            let _lock = pref_lock();
            set_multihost_preference(MultihostPreference::Last);
            let _guard = DetectionGuard::begin();
            observe(addr(1));
            observe(addr(2));
            assert_eq!(observed_address(), Some(addr(2)));
        });
    }

    #[test]
    fn test_policy_none_suppresses_window() {
        on_own_thread(|| {
            let _lock = pref_lock();
            set_multihost_preference(MultihostPreference::None);
            let _guard = DetectionGuard::begin();
            observe(addr(1));
            observe(addr(2));
            assert_eq!(observed_address(), None);
            // Later observations in the same window stay suppressed
            observe(addr(3));
            assert_eq!(observed_address(), None);
            // The window itself is still considered open until it ends
            assert!(is_detecting());
        });
    }

    #[test]
    fn test_same_address_twice_is_not_a_conflict() {
        on_own_thread(|| {
            let _lock = pref_lock();
            set_multihost_preference(MultihostPreference::None);
            let _guard = DetectionGuard::begin();
            observe(addr(1));
            observe(addr(1));
            assert_eq!(observed_address(), Some(addr(1)));
        });
    }

    #[test]
    fn test_guard_clears_window_on_drop() {
        on_own_thread(|| {
            {
                let _guard = DetectionGuard::begin();
                observe(addr(1));
                assert!(is_detecting());
            }
            assert!(!is_detecting());
            assert_eq!(observed_address(), None);
        });
    }

    #[test]
    fn test_guard_clears_window_on_unwind() {
        on_own_thread(|| {
            let result = std::panic::catch_unwind(|| {
                let _guard = DetectionGuard::begin();
                observe(addr(1));
                panic!("connect failed");
            });
            assert!(result.is_err());
            assert!(!is_detecting());
        });
    }

    #[test]
    fn test_associate_and_lookup() {
        on_own_thread(|| {
            let _lock = pref_lock();
            set_multihost_preference(MultihostPreference::Last);
            let handle = Arc::new("connection-1".to_string());
            {
                let _guard = DetectionGuard::begin();
                observe(addr(1));
                observe(addr(2));
                associate(&handle);
            }
            // Lookup works regardless of detection state
            assert_eq!(lookup(&handle), Some(addr(2)));
        });
    }

    #[test]
    fn test_associate_without_address_skips() {
        on_own_thread(|| {
            let handle = Arc::new(17_u64);
            let _guard = DetectionGuard::begin();
            associate(&handle);
            assert_eq!(lookup(&handle), None);
        });
    }

    #[test]
    fn test_weak_map_does_not_retain_handle() {
        on_own_thread(|| {
            let handle = Arc::new(vec![1_u8, 2, 3]);
            {
                let _guard = DetectionGuard::begin();
                observe(addr(9));
                associate(&handle);
            }
            assert_eq!(lookup(&handle), Some(addr(9)));

            let weak = Arc::downgrade(&handle);
            drop(handle);
            // The map held only a weak reference
            assert!(weak.upgrade().is_none());
            assert!(prune_dead() >= 1);
        });
    }
}
