/// ContinuationToken: a one-shot handle that lets a later thread resume a
/// logical transaction across an async gap.
///
/// The token's strong context reference lives in a `Mutex<Option<_>>`; the
/// first caller to `take()` it wins, which makes the ACTIVE -> EXPIRED
/// transition idempotent and race-safe by construction. Expiry drops the
/// reference, so an expired token no longer keeps its context reachable.
use crate::context::segment::ContextSegment;
use crate::context::transaction::ExecutionContext;
use crate::observability::metrics::metrics;
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use std::time::Instant;

struct TokenInner {
    slot: Mutex<Option<ExecutionContext>>,
    created: Instant,
    /// Retained for logging after the context reference is dropped
    guid: String,
}

/// One-shot continuation handle. Clones share the same one-shot slot.
#[derive(Clone)]
pub struct ContinuationToken {
    inner: Arc<TokenInner>,
}

impl ContinuationToken {
    pub(crate) fn new(ctx: ExecutionContext) -> Self {
        let guid = ctx.guid().to_string();
        ContinuationToken {
            inner: Arc::new(TokenInner {
                slot: Mutex::new(Some(ctx)),
                created: Instant::now(),
                guid,
            }),
        }
    }

    /// Merge the owning context into the calling thread (attaching a
    /// segment for it here) and expire the token. Returns true only for the
    /// single caller that performed the transition; concurrent callers race
    /// on the slot and exactly one succeeds.
    pub fn link_and_expire(&self) -> bool {
        match self.take() {
            Some(ctx) => {
                ContextSegment::attach(&ctx);
                metrics().token_link_success.inc();
                debug!(
                    "Token for context {} linked on thread '{}' after {}ms",
                    self.inner.guid,
                    std::thread::current().name().unwrap_or("unnamed"),
                    self.age_ms()
                );
                true
            }
            None => {
                metrics().token_link_ignore.inc();
                debug!(
                    "Ignored link of already-expired token for context {}",
                    self.inner.guid
                );
                false
            }
        }
    }

    /// Expire without merging, discarding an unused token. Same idempotence
    /// guarantee as [`link_and_expire`](Self::link_and_expire).
    pub fn expire(&self) -> bool {
        match self.take() {
            Some(_) => {
                metrics().token_expire.inc();
                debug!(
                    "Token for context {} expired unused after {}ms",
                    self.inner.guid,
                    self.age_ms()
                );
                true
            }
            None => false,
        }
    }

    /// Forced expiry on TTL timeout. Logged louder than an explicit expire:
    /// a timed-out token usually means an async callback never fired.
    pub(crate) fn expire_on_timeout(&self) -> bool {
        match self.take() {
            Some(_) => {
                metrics().token_timeout.inc();
                warn!(
                    "Token for context {} timed out after {}ms without being linked",
                    self.inner.guid,
                    self.age_ms()
                );
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock_slot().is_some()
    }

    /// The context this token would link, while still active.
    pub fn context(&self) -> Option<ExecutionContext> {
        self.lock_slot().clone()
    }

    pub(crate) fn created(&self) -> Instant {
        self.inner.created
    }

    fn take(&self) -> Option<ExecutionContext> {
        self.lock_slot().take()
    }

    fn age_ms(&self) -> u128 {
        self.inner.created.elapsed().as_millis()
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Option<ExecutionContext>> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ContinuationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuationToken")
            .field("context", &self.inner.guid)
            .field("active", &self.is_active())
            .finish()
    }
}
