use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::auth::TokenCoordinator;
use crate::config::ClientConfig;
use crate::{ClientError, Method, UnixTimeMs};

/// One HTTP-shaped request, already resolved to an absolute URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        let name_lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| n.to_lowercase() == name_lower)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    #[must_use]
    pub fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            body: serde_json::to_vec(value).unwrap_or_default(),
        }
    }

    #[must_use]
    pub const fn empty(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }
}

/// The wire. Implementations map transport-level failures (connection
/// refused, DNS, reset) to `ClientError::Network`; deadlines belong to the
/// caller, never to the backend.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ClientError>;
}

#[cfg(feature = "reqwest-backend")]
pub use reqwest_backend::ReqwestBackend;

#[cfg(feature = "reqwest-backend")]
mod reqwest_backend {
    use super::{async_trait, ClientError, HttpBackend, HttpRequest, HttpResponse, Method};

    /// Native backend over a shared `reqwest::Client`.
    #[derive(Debug, Clone, Default)]
    pub struct ReqwestBackend {
        client: reqwest::Client,
    }

    impl ReqwestBackend {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl HttpBackend for ReqwestBackend {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ClientError> {
            let method = match request.method {
                Method::Get => reqwest::Method::GET,
                Method::Post => reqwest::Method::POST,
                Method::Put => reqwest::Method::PUT,
                Method::Patch => reqwest::Method::PATCH,
                Method::Delete => reqwest::Method::DELETE,
            };

            let mut builder = self.client.request(method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder
                .send()
                .await
                .map_err(|e| ClientError::Network(e.to_string()))?;

            let status = response.status().as_u16();
            let body = response
                .bytes()
                .await
                .map_err(|e| ClientError::Network(e.to_string()))?
                .to_vec();

            Ok(HttpResponse { status, body })
        }
    }
}

/// Shared connectivity state with a debounced offline flip.
///
/// Individual network failures only count; the flag turns offline after the
/// failure threshold is reached AND a delayed health probe also fails, so a
/// single blip cannot cascade into a false offline UI state.
pub struct Connectivity {
    online: watch::Sender<bool>,
    consecutive_failures: AtomicU32,
    probing: AtomicBool,
    failure_threshold: u32,
}

impl Connectivity {
    #[must_use]
    pub fn new(failure_threshold: u32) -> Self {
        let (online, _) = watch::channel(true);
        Self {
            online,
            consecutive_failures: AtomicU32::new(0),
            probing: AtomicBool::new(false),
            failure_threshold,
        }
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// A response came back from the server (any status). Resets the failure
    /// streak and restores the online flag.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if !self.is_online() {
            info!("connectivity restored");
            self.online.send_replace(true);
        }
    }

    /// A genuine network failure. Returns true when the caller should run
    /// the health probe (threshold reached, not already probing).
    #[must_use]
    pub fn record_failure(&self) -> bool {
        let streak = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        streak >= self.failure_threshold
            && self.is_online()
            && !self.probing.swap(true, Ordering::SeqCst)
    }

    /// Waits out the debounce, then probes the health endpoint. Only a probe
    /// that also fails flips the flag offline.
    pub async fn probe(
        &self,
        backend: Arc<dyn HttpBackend>,
        health_url: String,
        debounce: Duration,
        deadline: Duration,
    ) {
        tokio::time::sleep(debounce).await;

        let reachable = matches!(
            timeout(deadline, backend.execute(HttpRequest::get(health_url))).await,
            Ok(Ok(response)) if (200..=299).contains(&response.status)
        );

        if reachable {
            debug!("health probe succeeded, staying online");
            self.record_success();
        } else {
            warn!("health probe failed, marking offline");
            self.online.send_replace(false);
        }
        self.probing.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connectivity")
            .field("online", &self.is_online())
            .field(
                "consecutive_failures",
                &self.consecutive_failures.load(Ordering::SeqCst),
            )
            .finish_non_exhaustive()
    }
}

/// Issues one request: attaches the current token, applies the bounded
/// timeout, classifies the outcome, and runs the refresh-and-retry-once
/// cycle on authorization failure.
pub struct TransportClient {
    backend: Arc<dyn HttpBackend>,
    auth: Arc<TokenCoordinator>,
    connectivity: Arc<Connectivity>,
    config: Arc<ClientConfig>,
}

impl TransportClient {
    #[must_use]
    pub fn new(
        backend: Arc<dyn HttpBackend>,
        auth: Arc<TokenCoordinator>,
        connectivity: Arc<Connectivity>,
        config: Arc<ClientConfig>,
    ) -> Self {
        Self {
            backend,
            auth,
            connectivity,
            config,
        }
    }

    #[must_use]
    pub fn connectivity(&self) -> &Arc<Connectivity> {
        &self.connectivity
    }

    #[must_use]
    pub fn auth(&self) -> &Arc<TokenCoordinator> {
        &self.auth
    }

    #[instrument(skip(self, body, extra_headers), fields(method = %method))]
    pub async fn send(
        &self,
        path: &str,
        method: Method,
        body: Option<Value>,
        extra_headers: &[(String, String)],
    ) -> Result<Value, ClientError> {
        let url = self.resolve_url(path)?;

        let generation = self.auth.generation();
        let token = self.auth.get_valid_token(UnixTimeMs::now()).await;

        let first = self
            .attempt(&url, method, body.clone(), extra_headers, token.as_deref())
            .await;

        let result = match first {
            Err(ref e) if e.is_unauthorized() => {
                debug!("authorization failure, refreshing and retrying once");
                match self.auth.handle_unauthorized(generation).await {
                    Some(retry_token) => {
                        let retried = self
                            .attempt(&url, method, body, extra_headers, Some(&retry_token))
                            .await;
                        match retried {
                            Err(e2) if e2.is_unauthorized() => Err(ClientError::Auth(
                                "request rejected again after token refresh".into(),
                            )),
                            other => other,
                        }
                    }
                    None => Err(ClientError::Auth(
                        "no credentials available to retry with".into(),
                    )),
                }
            }
            other => other,
        };

        self.note_outcome(&result);
        result
    }

    async fn attempt(
        &self,
        url: &str,
        method: Method,
        body: Option<Value>,
        extra_headers: &[(String, String)],
        token: Option<&str>,
    ) -> Result<Value, ClientError> {
        let mut headers = Vec::with_capacity(extra_headers.len() + 2);
        headers.push(("accept".to_string(), "application/json".to_string()));
        if let Some(token) = token {
            headers.push(("authorization".to_string(), format!("Bearer {token}")));
        }
        headers.extend(extra_headers.iter().cloned());

        let request = HttpRequest {
            method,
            url: url.to_string(),
            headers,
            body,
        };

        let deadline = Duration::from_millis(self.config.request_timeout_ms);
        let response = match timeout(deadline, self.backend.execute(request)).await {
            Ok(settled) => settled?,
            Err(_) => {
                return Err(ClientError::Timeout {
                    elapsed_ms: self.config.request_timeout_ms,
                })
            }
        };

        classify(&response)
    }

    /// Feeds the connectivity tracker. Any server response counts as
    /// reachability; only genuine network failures count toward the offline
    /// flip. A timeout is a deliberate client-side abort and counts as
    /// neither.
    fn note_outcome(&self, result: &Result<Value, ClientError>) {
        match result {
            Ok(_)
            | Err(ClientError::Api { .. } | ClientError::Auth(_)) => {
                self.connectivity.record_success();
            }
            Err(ClientError::Network(_)) => {
                if self.connectivity.record_failure() {
                    self.spawn_probe();
                }
            }
            Err(_) => {}
        }
    }

    fn spawn_probe(&self) {
        let Ok(health_url) = self.resolve_url(&self.config.health_endpoint) else {
            warn!("health endpoint does not resolve, skipping probe");
            return;
        };
        let connectivity = self.connectivity.clone();
        let backend = self.backend.clone();
        let debounce = Duration::from_millis(self.config.probe_debounce_ms);
        let deadline = Duration::from_millis(self.config.request_timeout_ms);

        tokio::spawn(async move {
            connectivity
                .probe(backend, health_url, debounce, deadline)
                .await;
        });
    }

    fn resolve_url(&self, path: &str) -> Result<String, ClientError> {
        let mut base = self.config.base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base = Url::parse(&base)
            .map_err(|e| ClientError::Validation(format!("invalid base_url: {e}")))?;
        let url = base
            .join(path.trim_start_matches('/'))
            .map_err(|e| ClientError::Validation(format!("invalid endpoint path '{path}': {e}")))?;
        Ok(url.to_string())
    }
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("base_url", &self.config.base_url)
            .field("online", &self.connectivity.is_online())
            .finish_non_exhaustive()
    }
}

fn classify(response: &HttpResponse) -> Result<Value, ClientError> {
    match response.status {
        200..=299 => {
            if response.body.is_empty() {
                Ok(Value::Null)
            } else {
                serde_json::from_slice(&response.body).map_err(|e| ClientError::Api {
                    status: response.status,
                    message: format!("malformed response body: {e}"),
                })
            }
        }
        status => Err(ClientError::from_status(status, &response.body)),
    }
}
