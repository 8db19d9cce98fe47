use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, Duration, Instant};
use tracing::debug;

use crate::{ClientError, MAX_COALESCED_KEYS};

pub type SharedOutcome = Result<serde_json::Value, ClientError>;

/// Bookkeeping for one named hot-read endpoint.
struct Slot {
    epoch: u64,
    last_dispatch: Option<Instant>,
    last_success: Option<serde_json::Value>,
    in_flight: Option<watch::Receiver<Option<SharedOutcome>>>,
}

impl Slot {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            last_dispatch: None,
            last_success: None,
            in_flight: None,
        }
    }
}

/// Collapses concurrent and rapid repeat calls per endpoint key into one
/// underlying dispatch.
///
/// Waiters subscribe to a watch channel the single dispatcher resolves once;
/// within the throttle window an idle key serves the most recent successful
/// result instead of dispatching again. Failures reach every waiter of the
/// dispatch but are never served from the window, so the next caller retries.
pub struct Coalescer {
    slots: Mutex<LruCache<String, Slot>>,
    epoch: AtomicU64,
    produce_timeout: Duration,
    dispatches: AtomicU64,
}

impl Coalescer {
    #[must_use]
    pub fn new(produce_timeout: Duration) -> Self {
        let capacity = NonZeroUsize::new(MAX_COALESCED_KEYS).unwrap_or(NonZeroUsize::MIN);
        Self {
            slots: Mutex::new(LruCache::new(capacity)),
            epoch: AtomicU64::new(0),
            produce_timeout,
            dispatches: AtomicU64::new(0),
        }
    }

    /// Number of real dispatches issued over the coalescer's lifetime.
    #[must_use]
    pub fn dispatches(&self) -> u64 {
        self.dispatches.load(Ordering::SeqCst)
    }

    /// Drops all per-key bookkeeping. A dispatch already in flight still
    /// resolves its waiters, but its outcome is not recorded - stale results
    /// from before the invalidation never become the window's answer.
    pub async fn invalidate_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.slots.lock().await.clear();
    }

    pub async fn coalesce<F>(
        &self,
        key: &str,
        min_interval: Duration,
        producer: F,
    ) -> SharedOutcome
    where
        F: Future<Output = SharedOutcome>,
    {
        let epoch_now = self.epoch.load(Ordering::SeqCst);

        let publisher = {
            let mut slots = self.slots.lock().await;
            let slot = slots.get_or_insert_mut(key.to_string(), || Slot::new(epoch_now));
            if slot.epoch != epoch_now {
                *slot = Slot::new(epoch_now);
            }

            if let Some(rx) = &slot.in_flight {
                let settled = rx.borrow().is_some();
                let alive = rx.has_changed().is_ok();
                if settled || alive {
                    let rx = rx.clone();
                    drop(slots);
                    return Self::await_shared(rx).await;
                }
                // The dispatcher vanished without settling; reclaim the key.
                slot.in_flight = None;
            }

            if let (Some(dispatched), Some(value)) = (slot.last_dispatch, &slot.last_success) {
                if dispatched.elapsed() < min_interval {
                    debug!(key, "serving stale-but-recent result");
                    return Ok(value.clone());
                }
            }

            let (tx, rx) = watch::channel(None);
            slot.in_flight = Some(rx);
            slot.last_dispatch = Some(Instant::now());
            tx
        };

        self.dispatches.fetch_add(1, Ordering::SeqCst);
        let outcome = match timeout(self.produce_timeout, producer).await {
            Ok(settled) => settled,
            Err(_) => Err(ClientError::Timeout {
                elapsed_ms: self.produce_timeout.as_millis() as u64,
            }),
        };

        {
            let mut slots = self.slots.lock().await;
            if let Some(slot) = slots.get_mut(key) {
                if slot.epoch == epoch_now {
                    slot.in_flight = None;
                    if let Ok(value) = &outcome {
                        slot.last_success = Some(value.clone());
                    }
                }
            }
        }

        let _ = publisher.send(Some(outcome.clone()));
        outcome
    }

    async fn await_shared(mut rx: watch::Receiver<Option<SharedOutcome>>) -> SharedOutcome {
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(ClientError::Network(
                    "coalesced request abandoned by its dispatcher".into(),
                ));
            }
        }
    }
}

impl std::fmt::Debug for Coalescer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coalescer")
            .field("produce_timeout", &self.produce_timeout)
            .field("dispatches", &self.dispatches())
            .finish_non_exhaustive()
    }
}
