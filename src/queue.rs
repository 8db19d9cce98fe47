use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{info, instrument, warn};

use crate::store::{keys, read_json, write_json, KeyValueStore};
use crate::{ActionId, ActionKind, ClientError, Method, UnixTimeMs};

/// A pending mutating operation, replayable through the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: ActionId,
    pub kind: ActionKind,
    pub payload: ActionPayload,
    pub submitted_at: UnixTimeMs,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPayload {
    pub endpoint: String,
    pub method: Method,
    #[serde(default)]
    pub body: Value,
}

impl QueuedAction {
    pub fn new(
        kind: ActionKind,
        endpoint: impl Into<String>,
        method: Method,
        body: Value,
        submitted_at: UnixTimeMs,
    ) -> Result<Self, ClientError> {
        let endpoint = endpoint.into().trim().to_string();
        if endpoint.is_empty() {
            return Err(ClientError::Validation(
                "queued action endpoint cannot be empty".into(),
            ));
        }
        if !method.is_mutating() {
            return Err(ClientError::Validation(
                "only mutating operations can be queued for replay".into(),
            ));
        }
        Ok(Self {
            id: ActionId::generate(),
            kind,
            payload: ActionPayload {
                endpoint,
                method,
                body,
            },
            submitted_at,
            retry_count: 0,
        })
    }
}

/// Replays one action against the backing service.
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(&self, action: &QueuedAction) -> Result<(), ClientError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Completed(FlushReport),
    /// Another flush pass holds the gate; nothing was touched.
    AlreadyFlushing,
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
}

impl FlushReport {
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.requeued == 0 && self.dead_lettered == 0
    }
}

/// Persists mutating operations that could not complete and replays them
/// strictly in submission order.
///
/// Replay is sequential and best-effort: a failure collects the entry and
/// moves on, it never aborts the pass and never reorders. Failed entries go
/// back to the head of the queue in their original relative order; entries
/// over the attempt ceiling (or failing permanently) land on the dead-letter
/// list instead of retrying forever.
pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    max_entries: usize,
    max_replay_attempts: u32,
    flush_gate: Mutex<()>,
    write_gate: Mutex<()>,
    pending: watch::Sender<usize>,
}

impl OfflineQueue {
    pub async fn load(
        store: Arc<dyn KeyValueStore>,
        max_entries: usize,
        max_replay_attempts: u32,
    ) -> Result<Self, ClientError> {
        let persisted: Vec<QueuedAction> = read_json(store.as_ref(), keys::OFFLINE_QUEUE)
            .await?
            .unwrap_or_default();
        let (pending, _) = watch::channel(persisted.len());

        Ok(Self {
            store,
            max_entries,
            max_replay_attempts,
            flush_gate: Mutex::new(()),
            write_gate: Mutex::new(()),
            pending,
        })
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        *self.pending.borrow()
    }

    #[must_use]
    pub fn subscribe_pending(&self) -> watch::Receiver<usize> {
        self.pending.subscribe()
    }

    pub async fn pending_actions(&self) -> Result<Vec<QueuedAction>, ClientError> {
        Ok(read_json(self.store.as_ref(), keys::OFFLINE_QUEUE)
            .await?
            .unwrap_or_default())
    }

    pub async fn dead_letters(&self) -> Result<Vec<QueuedAction>, ClientError> {
        Ok(read_json(self.store.as_ref(), keys::DEAD_LETTER)
            .await?
            .unwrap_or_default())
    }

    /// Appends to the persisted queue. A failed write surfaces as
    /// `Persistence` - a silently dropped mutation is worse than an error.
    #[instrument(skip(self, action), fields(kind = %action.kind, id = %action.id))]
    pub async fn enqueue(&self, action: QueuedAction) -> Result<usize, ClientError> {
        let _gate = self.write_gate.lock().await;

        let mut queue: Vec<QueuedAction> = read_json(self.store.as_ref(), keys::OFFLINE_QUEUE)
            .await?
            .unwrap_or_default();
        if queue.len() >= self.max_entries {
            return Err(ClientError::Validation(format!(
                "offline queue is full ({} entries)",
                self.max_entries
            )));
        }

        queue.push(action);
        write_json(self.store.as_ref(), keys::OFFLINE_QUEUE, &queue).await?;

        let len = queue.len();
        self.pending.send_replace(len);
        info!(pending = len, "action queued for replay");
        Ok(len)
    }

    /// Replays the queued actions in order. No-op when a pass is already
    /// running or the queue is empty.
    #[instrument(skip_all)]
    pub async fn flush(&self, dispatcher: &dyn ActionDispatcher) -> Result<FlushOutcome, ClientError> {
        let Ok(_flush_guard) = self.flush_gate.try_lock() else {
            return Ok(FlushOutcome::AlreadyFlushing);
        };

        // Snapshot and clear; actions enqueued during the pass land in the
        // live queue and are appended after the survivors on restore.
        let snapshot: Vec<QueuedAction> = {
            let _gate = self.write_gate.lock().await;
            let queue: Vec<QueuedAction> = read_json(self.store.as_ref(), keys::OFFLINE_QUEUE)
                .await?
                .unwrap_or_default();
            if queue.is_empty() {
                return Ok(FlushOutcome::Empty);
            }
            write_json(
                self.store.as_ref(),
                keys::OFFLINE_QUEUE,
                &Vec::<QueuedAction>::new(),
            )
            .await?;
            self.pending.send_replace(0);
            queue
        };

        let mut report = FlushReport {
            attempted: snapshot.len(),
            ..FlushReport::default()
        };
        let mut survivors: Vec<QueuedAction> = Vec::new();
        let mut dead: Vec<QueuedAction> = Vec::new();

        for mut action in snapshot {
            match dispatcher.dispatch(&action).await {
                Ok(()) => {
                    report.succeeded += 1;
                }
                Err(e) => {
                    action.retry_count += 1;
                    let exhausted = action.retry_count >= self.max_replay_attempts;
                    warn!(
                        id = %action.id,
                        kind = %action.kind,
                        retry_count = action.retry_count,
                        error = %e,
                        "replay failed"
                    );
                    if exhausted || is_permanent_failure(&e) {
                        dead.push(action);
                        report.dead_lettered += 1;
                    } else {
                        survivors.push(action);
                        report.requeued += 1;
                    }
                }
            }
        }

        if !dead.is_empty() {
            if let Err(e) = self.append_dead_letters(&dead).await {
                // Keep them in the queue rather than lose them; the next
                // pass will attempt the dead-letter move again.
                warn!("dead-letter write failed, restoring actions to the queue: {e}");
                report.requeued += dead.len();
                report.dead_lettered = 0;
                survivors.extend(dead);
            } else {
                warn!(count = report.dead_lettered, "actions moved to dead-letter list");
            }
        }

        {
            let _gate = self.write_gate.lock().await;
            let enqueued_mid_flush: Vec<QueuedAction> =
                read_json(self.store.as_ref(), keys::OFFLINE_QUEUE)
                    .await?
                    .unwrap_or_default();
            let mut restored = survivors;
            restored.extend(enqueued_mid_flush);
            write_json(self.store.as_ref(), keys::OFFLINE_QUEUE, &restored).await?;
            self.pending.send_replace(restored.len());
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            requeued = report.requeued,
            dead_lettered = report.dead_lettered,
            "flush pass finished"
        );
        Ok(FlushOutcome::Completed(report))
    }

    /// Operator intervention: moves a dead-lettered action back to the tail
    /// of the live queue with a fresh attempt budget.
    pub async fn requeue_dead_letter(&self, id: &ActionId) -> Result<(), ClientError> {
        let mut action = {
            let _gate = self.write_gate.lock().await;
            let mut letters: Vec<QueuedAction> = read_json(self.store.as_ref(), keys::DEAD_LETTER)
                .await?
                .unwrap_or_default();
            let Some(position) = letters.iter().position(|a| &a.id == id) else {
                return Err(ClientError::Validation(format!(
                    "no dead-lettered action with id {id}"
                )));
            };
            let action = letters.remove(position);
            write_json(self.store.as_ref(), keys::DEAD_LETTER, &letters).await?;
            action
        };

        action.retry_count = 0;
        self.enqueue(action).await?;
        Ok(())
    }

    async fn append_dead_letters(&self, dead: &[QueuedAction]) -> Result<(), ClientError> {
        let _gate = self.write_gate.lock().await;
        let mut letters: Vec<QueuedAction> = read_json(self.store.as_ref(), keys::DEAD_LETTER)
            .await?
            .unwrap_or_default();
        letters.extend(dead.iter().cloned());
        write_json(self.store.as_ref(), keys::DEAD_LETTER, &letters).await
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("pending", &self.pending_len())
            .field("max_replay_attempts", &self.max_replay_attempts)
            .finish_non_exhaustive()
    }
}

/// Replaying a deterministically rejected action cannot succeed; it goes
/// straight to the dead-letter list.
fn is_permanent_failure(error: &ClientError) -> bool {
    match error {
        ClientError::Validation(_) => true,
        ClientError::Api { status, .. } => {
            (400..=499).contains(status) && *status != 408 && *status != 429
        }
        _ => false,
    }
}
