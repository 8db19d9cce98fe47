use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::coalesce::Coalescer;
use crate::config::ClientConfig;
use crate::demo::SimulatedBackend;
use crate::queue::{ActionDispatcher, FlushOutcome, OfflineQueue, QueuedAction};
use crate::store::{keys, read_json, write_json, KeyValueStore};
use crate::transport::TransportClient;
use crate::{ActionId, ActionKind, ApiResponse, ClientError, Method, UnixTimeMs};

/// Process-wide data source flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Live,
    Demo,
}

impl Mode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Demo => "demo",
        }
    }

    #[must_use]
    pub const fn is_demo(self) -> bool {
        matches!(self, Self::Demo)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call options for the public verb operations.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Domain tag recorded if the call is deferred to the offline queue.
    pub action_kind: Option<ActionKind>,
    /// Coalesce/cache key; defaults to the endpoint path.
    pub resource_key: Option<String>,
    /// Extra headers forwarded to the transport.
    pub headers: Vec<(String, String)>,
}

impl RequestOptions {
    #[must_use]
    pub fn with_kind(kind: ActionKind) -> Self {
        Self {
            action_kind: Some(kind),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_resource_key(key: impl Into<String>) -> Self {
        Self {
            resource_key: Some(key.into()),
            ..Self::default()
        }
    }
}

/// Chooses between the live transport and the simulated backend per call,
/// absorbs connectivity failures (cache fallback for reads, offline queueing
/// for mutations), and owns the mode flag.
///
/// Demo-vs-live branching lives here and only here; collaborators call
/// through the router and never consult the mode themselves.
pub struct SourceRouter {
    transport: Arc<TransportClient>,
    coalescer: Arc<Coalescer>,
    queue: Arc<OfflineQueue>,
    demo: Arc<dyn SimulatedBackend>,
    store: Arc<dyn KeyValueStore>,
    config: Arc<ClientConfig>,
    mode: watch::Sender<Mode>,
    mode_generation: AtomicU64,
}

impl SourceRouter {
    pub async fn load(
        transport: Arc<TransportClient>,
        coalescer: Arc<Coalescer>,
        queue: Arc<OfflineQueue>,
        demo: Arc<dyn SimulatedBackend>,
        store: Arc<dyn KeyValueStore>,
        config: Arc<ClientConfig>,
    ) -> Result<Self, ClientError> {
        let mode: Mode = read_json(store.as_ref(), keys::MODE)
            .await?
            .unwrap_or_default();
        let (mode_tx, _) = watch::channel(mode);

        Ok(Self {
            transport,
            coalescer,
            queue,
            demo,
            store,
            config,
            mode: mode_tx,
            mode_generation: AtomicU64::new(0),
        })
    }

    // --- status signals -------------------------------------------------

    #[must_use]
    pub fn current_mode(&self) -> Mode {
        *self.mode.borrow()
    }

    #[must_use]
    pub fn subscribe_mode(&self) -> watch::Receiver<Mode> {
        self.mode.subscribe()
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.transport.connectivity().is_online()
    }

    #[must_use]
    pub fn subscribe_online(&self) -> watch::Receiver<bool> {
        self.transport.connectivity().subscribe()
    }

    #[must_use]
    pub fn pending_queue_length(&self) -> usize {
        self.queue.pending_len()
    }

    #[must_use]
    pub fn subscribe_pending(&self) -> watch::Receiver<usize> {
        self.queue.subscribe_pending()
    }

    /// Whether the layer currently holds an access token.
    pub async fn is_authenticated(&self) -> bool {
        self.transport.auth().current_token().await.is_some()
    }

    /// Operator surface: dead letters, manual requeue.
    #[must_use]
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    // --- mode -----------------------------------------------------------

    /// Persists and switches the data source. Subsequent calls route through
    /// the new path immediately; in-flight coalescer bookkeeping from the
    /// old path is discarded so a stale result never answers for the new
    /// mode.
    #[instrument(skip(self), fields(mode = %mode))]
    pub async fn set_mode(&self, mode: Mode) -> Result<(), ClientError> {
        if self.current_mode() == mode {
            return Ok(());
        }
        write_json(self.store.as_ref(), keys::MODE, &mode).await?;
        self.mode_generation.fetch_add(1, Ordering::SeqCst);
        self.coalescer.invalidate_all().await;
        self.mode.send_replace(mode);
        info!("data source mode switched");
        Ok(())
    }

    // --- public verb operations ------------------------------------------

    pub async fn get(
        &self,
        endpoint: &str,
        opts: RequestOptions,
    ) -> Result<ApiResponse, ClientError> {
        self.request(endpoint, Method::Get, None, opts).await
    }

    pub async fn post(
        &self,
        endpoint: &str,
        body: Value,
        opts: RequestOptions,
    ) -> Result<ApiResponse, ClientError> {
        self.request(endpoint, Method::Post, Some(body), opts).await
    }

    pub async fn put(
        &self,
        endpoint: &str,
        body: Value,
        opts: RequestOptions,
    ) -> Result<ApiResponse, ClientError> {
        self.request(endpoint, Method::Put, Some(body), opts).await
    }

    pub async fn patch(
        &self,
        endpoint: &str,
        body: Value,
        opts: RequestOptions,
    ) -> Result<ApiResponse, ClientError> {
        self.request(endpoint, Method::Patch, Some(body), opts).await
    }

    pub async fn delete(
        &self,
        endpoint: &str,
        opts: RequestOptions,
    ) -> Result<ApiResponse, ClientError> {
        self.request(endpoint, Method::Delete, None, opts).await
    }

    #[instrument(skip(self, body, opts), fields(method = %method, endpoint))]
    pub async fn request(
        &self,
        endpoint: &str,
        method: Method,
        body: Option<Value>,
        opts: RequestOptions,
    ) -> Result<ApiResponse, ClientError> {
        if self.current_mode().is_demo() {
            let value = self.demo.handle(endpoint, method, body).await?;
            return Ok(ApiResponse::Fresh(value));
        }

        if method.is_mutating() {
            self.live_mutation(endpoint, method, body, &opts).await
        } else {
            self.live_read(endpoint, &opts).await
        }
    }

    /// Queues a mutating operation directly, without attempting it live.
    pub async fn enqueue_offline_action(
        &self,
        kind: ActionKind,
        endpoint: &str,
        method: Method,
        body: Value,
    ) -> Result<ActionId, ClientError> {
        let action = QueuedAction::new(kind, endpoint, method, body, UnixTimeMs::now())?;
        let action_id = action.id.clone();
        self.queue.enqueue(action).await?;
        Ok(action_id)
    }

    /// Manual flush trigger (operator button, pull-to-refresh).
    pub async fn flush_pending(&self) -> Result<FlushOutcome, ClientError> {
        self.queue.flush(self).await
    }

    /// Long-running task: replays the offline queue on every
    /// offline-to-online transition. Meant to be spawned once at startup.
    pub async fn run_reconnect_flush(&self) {
        let mut online = self.transport.connectivity().subscribe();
        let mut was_online = *online.borrow();
        while online.changed().await.is_ok() {
            let now_online = *online.borrow();
            if now_online && !was_online {
                info!("connectivity restored, flushing offline queue");
                if let Err(e) = self.flush_pending().await {
                    warn!("reconnect flush failed: {e}");
                }
            }
            was_online = now_online;
        }
    }

    // --- live paths -------------------------------------------------------

    async fn live_read(
        &self,
        endpoint: &str,
        opts: &RequestOptions,
    ) -> Result<ApiResponse, ClientError> {
        let resource_key = opts
            .resource_key
            .clone()
            .unwrap_or_else(|| endpoint.trim_matches('/').to_string());
        let window = Duration::from_millis(self.config.window_for(&resource_key));
        let generation = self.mode_generation.load(Ordering::SeqCst);
        let headers = opts.headers.clone();

        let outcome = self
            .coalescer
            .coalesce(&resource_key, window, async {
                self.transport
                    .send(endpoint, Method::Get, None, &headers)
                    .await
            })
            .await;

        match outcome {
            Ok(value) => {
                // A result that settled across a mode switch is still valid
                // for its caller but must not become the cached snapshot.
                let same_generation = self.mode_generation.load(Ordering::SeqCst) == generation;
                if same_generation && self.current_mode() == Mode::Live {
                    write_json(self.store.as_ref(), &keys::cache(&resource_key), &value).await?;
                }
                Ok(ApiResponse::Fresh(value))
            }
            Err(e) if e.is_connectivity() => {
                match read_json(self.store.as_ref(), &keys::cache(&resource_key)).await? {
                    Some(snapshot) => {
                        debug!(%resource_key, "live read failed, serving cached snapshot: {e}");
                        Ok(ApiResponse::Stale(snapshot))
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn live_mutation(
        &self,
        endpoint: &str,
        method: Method,
        body: Option<Value>,
        opts: &RequestOptions,
    ) -> Result<ApiResponse, ClientError> {
        match self
            .transport
            .send(endpoint, method, body.clone(), &opts.headers)
            .await
        {
            Ok(value) => Ok(ApiResponse::Fresh(value)),
            Err(e) if e.is_connectivity() => {
                let kind = match &opts.action_kind {
                    Some(kind) => kind.clone(),
                    None => default_action_kind(endpoint, method)?,
                };
                let action = QueuedAction::new(
                    kind,
                    endpoint,
                    method,
                    body.unwrap_or(Value::Null),
                    UnixTimeMs::now(),
                )?;
                let action_id = action.id.clone();
                self.queue.enqueue(action).await?;
                info!(%action_id, "mutation deferred to offline queue: {e}");
                Ok(ApiResponse::Queued { action_id })
            }
            Err(e) => Err(e),
        }
    }
}

/// Replays a queued action through whichever source the router currently
/// points at.
#[async_trait]
impl ActionDispatcher for SourceRouter {
    async fn dispatch(&self, action: &QueuedAction) -> Result<(), ClientError> {
        let body = if action.payload.body.is_null() {
            None
        } else {
            Some(action.payload.body.clone())
        };

        match self.current_mode() {
            Mode::Live => {
                self.transport
                    .send(&action.payload.endpoint, action.payload.method, body, &[])
                    .await?;
            }
            Mode::Demo => {
                self.demo
                    .handle(&action.payload.endpoint, action.payload.method, body)
                    .await?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SourceRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRouter")
            .field("mode", &self.current_mode())
            .field("online", &self.is_online())
            .field("pending", &self.pending_queue_length())
            .finish_non_exhaustive()
    }
}

fn default_action_kind(endpoint: &str, method: Method) -> Result<ActionKind, ClientError> {
    let slug: String = endpoint
        .trim_matches('/')
        .chars()
        .take(48)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let slug = if slug.is_empty() {
        "request".to_string()
    } else {
        slug
    };
    ActionKind::new(format!("{}-{slug}", method.as_str().to_lowercase()))
}
