#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod auth;
pub mod coalesce;
pub mod config;
pub mod demo;
pub mod queue;
pub mod router;
pub mod store;
pub mod transport;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use auth::{AuthSession, RefreshApi, TokenCoordinator, TokenGrant};
pub use coalesce::Coalescer;
pub use config::ClientConfig;
pub use demo::{DemoBackend, SimulatedBackend};
pub use queue::{ActionDispatcher, ActionPayload, FlushOutcome, FlushReport, OfflineQueue, QueuedAction};
pub use router::{Mode, RequestOptions, SourceRouter};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use transport::{Connectivity, HttpBackend, HttpRequest, HttpResponse, TransportClient};

#[cfg(feature = "reqwest-backend")]
pub use transport::ReqwestBackend;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_COALESCE_WINDOW_MS: u64 = 2_000;
pub const DEFAULT_PRODUCE_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_TOKEN_REFRESH_MARGIN_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_MAX_REPLAY_ATTEMPTS: u32 = 5;
pub const DEFAULT_MAX_QUEUE_ENTRIES: usize = 500;
pub const DEFAULT_OFFLINE_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_PROBE_DEBOUNCE_MS: u64 = 1_500;
pub const DEFAULT_DEMO_LATENCY_MS: u64 = 150;
pub const MAX_COALESCED_KEYS: usize = 256;

/// Unix timestamp in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(current_time_ms())
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    #[must_use]
    pub fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

#[must_use]
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Unique identifier for a queued action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId(String);

impl ActionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validated action tag - the set is open-ended (status-update, create-order,
/// payment, ...), only the shape is constrained.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionKind(String);

impl ActionKind {
    const MAX_LENGTH: usize = 64;

    pub fn new(kind: impl Into<String>) -> Result<Self, ClientError> {
        let kind = kind.into().trim().to_string();
        if kind.is_empty() {
            return Err(ClientError::Validation(
                "action kind cannot be empty".into(),
            ));
        }
        if kind.len() > Self::MAX_LENGTH {
            return Err(ClientError::Validation(format!(
                "action kind exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !kind
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ClientError::Validation(
                "action kind contains invalid characters (allowed: a-z, A-Z, 0-9, -, _, .)".into(),
            ));
        }
        Ok(Self(kind))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Reads go through the coalescer; everything else mutates remote state
    /// and is eligible for offline queueing.
    #[must_use]
    pub const fn is_mutating(self) -> bool {
        !matches!(self, Self::Get)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy for the resilience layer.
///
/// `Timeout` is deliberately distinct from `Network`: a client-side abort
/// must never be mistaken for connectivity loss.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("network unreachable: {0}")]
    Network(String),

    #[error("request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("authorization failed: {0}")]
    Auth(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl ClientError {
    /// Connectivity-class failures are absorbed by the router (cache
    /// fallback for reads, offline queueing for mutations); everything else
    /// surfaces to the caller.
    #[must_use]
    pub const fn is_connectivity(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout { .. })
    }

    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Api { status: 401, .. })
    }

    #[must_use]
    pub fn from_status(status: u16, body: &[u8]) -> Self {
        let message = serde_json::from_slice::<ApiErrorBody>(body)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or_else(|| format!("HTTP error: {status}"));
        Self::Api { status, message }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    code: Option<String>,
}

/// Outcome of a routed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiResponse {
    /// Live (or demo) response.
    Fresh(serde_json::Value),
    /// Last-known-good snapshot served because the live fetch failed.
    Stale(serde_json::Value),
    /// Mutation accepted into the offline queue for later replay.
    Queued { action_id: ActionId },
}

impl ApiResponse {
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }

    #[must_use]
    pub const fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }

    /// The payload, if the request produced one.
    #[must_use]
    pub const fn value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Fresh(v) | Self::Stale(v) => Some(v),
            Self::Queued { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_kind_validation() {
        assert!(ActionKind::new("status-update").is_ok());
        assert!(ActionKind::new("create_order.v2").is_ok());
        assert!(ActionKind::new("").is_err());
        assert!(ActionKind::new("   ").is_err());
        assert!(ActionKind::new("bad kind").is_err());
        assert!(ActionKind::new("a".repeat(65)).is_err());
    }

    #[test]
    fn action_kind_trims_whitespace() {
        let kind = ActionKind::new("  payment  ").unwrap();
        assert_eq!(kind.as_str(), "payment");
    }

    #[test]
    fn method_mutating_split() {
        assert!(!Method::Get.is_mutating());
        assert!(Method::Post.is_mutating());
        assert!(Method::Put.is_mutating());
        assert!(Method::Patch.is_mutating());
        assert!(Method::Delete.is_mutating());
    }

    #[test]
    fn connectivity_classification() {
        assert!(ClientError::Network("down".into()).is_connectivity());
        assert!(ClientError::Timeout { elapsed_ms: 10_000 }.is_connectivity());
        assert!(!ClientError::Api {
            status: 500,
            message: "boom".into()
        }
        .is_connectivity());
        assert!(!ClientError::Auth("expired".into()).is_connectivity());
    }

    #[test]
    fn error_from_status_parses_json_body() {
        let err = ClientError::from_status(422, br#"{"message":"name is required"}"#);
        assert_eq!(
            err,
            ClientError::Api {
                status: 422,
                message: "name is required".into()
            }
        );
    }

    #[test]
    fn error_from_status_falls_back_on_opaque_body() {
        let err = ClientError::from_status(502, b"<html>bad gateway</html>");
        assert_eq!(
            err,
            ClientError::Api {
                status: 502,
                message: "HTTP error: 502".into()
            }
        );
    }

    #[test]
    fn unauthorized_detection() {
        assert!(ClientError::from_status(401, b"").is_unauthorized());
        assert!(!ClientError::from_status(403, b"").is_unauthorized());
    }

    #[test]
    fn unix_time_arithmetic() {
        let t = UnixTimeMs(1_000);
        assert_eq!(t.add_millis(500).as_millis(), 1_500);
        assert_eq!(UnixTimeMs(2_000).elapsed_since(t), 1_000);
        assert_eq!(t.elapsed_since(UnixTimeMs(2_000)), 0);
    }

    #[test]
    fn api_response_accessors() {
        let fresh = ApiResponse::Fresh(serde_json::json!({"ok": true}));
        assert!(!fresh.is_stale());
        assert!(fresh.value().is_some());

        let queued = ApiResponse::Queued {
            action_id: ActionId::generate(),
        };
        assert!(queued.is_queued());
        assert!(queued.value().is_none());
    }
}
