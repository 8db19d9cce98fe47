use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    ClientError, DEFAULT_COALESCE_WINDOW_MS, DEFAULT_DEMO_LATENCY_MS, DEFAULT_MAX_QUEUE_ENTRIES,
    DEFAULT_MAX_REPLAY_ATTEMPTS, DEFAULT_OFFLINE_FAILURE_THRESHOLD, DEFAULT_PROBE_DEBOUNCE_MS,
    DEFAULT_PRODUCE_TIMEOUT_MS, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_TOKEN_REFRESH_MARGIN_MS,
};

/// Environment-level configuration for the resilience layer.
///
/// Business configuration lives elsewhere; this covers only request
/// mechanics: endpoint root, timeouts, throttle windows, retry ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base endpoint root, e.g. `https://api.example.com/v1`.
    pub base_url: String,
    /// Hard deadline for a single transport call.
    pub request_timeout_ms: u64,
    /// Default throttle window for coalesced read endpoints.
    pub coalesce_window_ms: u64,
    /// Per-endpoint-key overrides of the throttle window.
    pub coalesce_windows: HashMap<String, u64>,
    /// Coalescer-owned deadline so a hung producer cannot wedge a key.
    pub coalesce_produce_timeout_ms: u64,
    /// Replay attempts per queued action before it is dead-lettered.
    pub max_replay_attempts: u32,
    /// Capacity of the persisted offline queue.
    pub max_queue_entries: usize,
    /// Consecutive network failures before the connectivity probe runs.
    pub offline_failure_threshold: u32,
    /// Wait before probing, so a single blip does not flip the app offline.
    pub probe_debounce_ms: u64,
    /// Unauthenticated health endpoint used by the connectivity probe.
    pub health_endpoint: String,
    /// Remaining validity below which a token is refreshed ahead of use.
    pub token_refresh_margin_ms: u64,
    /// Simulated latency of the demo backend.
    pub demo_latency_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            coalesce_window_ms: DEFAULT_COALESCE_WINDOW_MS,
            coalesce_windows: HashMap::new(),
            coalesce_produce_timeout_ms: DEFAULT_PRODUCE_TIMEOUT_MS,
            max_replay_attempts: DEFAULT_MAX_REPLAY_ATTEMPTS,
            max_queue_entries: DEFAULT_MAX_QUEUE_ENTRIES,
            offline_failure_threshold: DEFAULT_OFFLINE_FAILURE_THRESHOLD,
            probe_debounce_ms: DEFAULT_PROBE_DEBOUNCE_MS,
            health_endpoint: "/health".into(),
            token_refresh_margin_ms: DEFAULT_TOKEN_REFRESH_MARGIN_MS,
            demo_latency_ms: DEFAULT_DEMO_LATENCY_MS,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Throttle window for a given endpoint key.
    #[must_use]
    pub fn window_for(&self, key: &str) -> u64 {
        self.coalesce_windows
            .get(key)
            .copied()
            .unwrap_or(self.coalesce_window_ms)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        let parsed = Url::parse(&self.base_url)
            .map_err(|e| ClientError::Validation(format!("invalid base_url: {e}")))?;
        let scheme = parsed.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(ClientError::Validation(format!(
                "invalid base_url scheme '{scheme}', only 'http' and 'https' are allowed"
            )));
        }
        if parsed.host_str().is_none() {
            return Err(ClientError::Validation(
                "base_url must have a host".into(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ClientError::Validation(
                "request_timeout_ms must be > 0".into(),
            ));
        }
        if self.coalesce_produce_timeout_ms < self.request_timeout_ms {
            return Err(ClientError::Validation(
                "coalesce_produce_timeout_ms must cover at least one full request timeout".into(),
            ));
        }
        if self.max_replay_attempts == 0 {
            return Err(ClientError::Validation(
                "max_replay_attempts must be > 0".into(),
            ));
        }
        if self.max_queue_entries == 0 {
            return Err(ClientError::Validation(
                "max_queue_entries must be > 0".into(),
            ));
        }
        if self.offline_failure_threshold == 0 {
            return Err(ClientError::Validation(
                "offline_failure_threshold must be > 0".into(),
            ));
        }
        if !self.health_endpoint.starts_with('/') {
            return Err(ClientError::Validation(
                "health_endpoint must be an absolute path".into(),
            ));
        }
        Ok(())
    }
}
