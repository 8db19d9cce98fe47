use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::store::{keys, read_json, write_json, KeyValueStore};
use crate::{ClientError, UnixTimeMs};

/// Current credential state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<UnixTimeMs>,
}

impl AuthSession {
    /// True when the access token exists and its remaining validity exceeds
    /// the safety margin. A token without a known expiry is taken at face
    /// value until the server rejects it.
    #[must_use]
    pub fn is_fresh(&self, now: UnixTimeMs, margin_ms: u64) -> bool {
        match (&self.access_token, self.expires_at) {
            (Some(_), Some(expires_at)) => now.add_millis(margin_ms).0 < expires_at.0,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Result of a successful refresh exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub expires_at: Option<UnixTimeMs>,
    /// Some servers rotate the refresh token on every exchange.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// The refresh network call, kept behind a seam so the coordinator never
/// depends on the transport that depends on it.
#[async_trait]
pub trait RefreshApi: Send + Sync {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenGrant, ClientError>;
}

/// Owns the access token and the single in-flight refresh.
///
/// Refreshers serialize on an async mutex; a generation counter lets late
/// arrivals observe the completed refresh instead of issuing their own, so N
/// concurrent callers produce exactly one refresh network call and share its
/// outcome.
pub struct TokenCoordinator {
    store: Arc<dyn KeyValueStore>,
    api: Arc<dyn RefreshApi>,
    session: RwLock<AuthSession>,
    refresh_gate: Mutex<()>,
    generation: AtomicU64,
    refreshes_dispatched: AtomicU64,
    refresh_margin_ms: u64,
    on_session_expired: Option<Box<dyn Fn() + Send + Sync>>,
}

impl TokenCoordinator {
    /// Builds the coordinator from the persisted auth keys.
    pub async fn load(
        store: Arc<dyn KeyValueStore>,
        api: Arc<dyn RefreshApi>,
        refresh_margin_ms: u64,
    ) -> Result<Self, ClientError> {
        let session = AuthSession {
            access_token: store.get(keys::ACCESS_TOKEN).await?,
            refresh_token: store.get(keys::REFRESH_TOKEN).await?,
            expires_at: read_json(store.as_ref(), keys::TOKEN_EXPIRES_AT).await?,
        };

        Ok(Self {
            store,
            api,
            session: RwLock::new(session),
            refresh_gate: Mutex::new(()),
            generation: AtomicU64::new(0),
            refreshes_dispatched: AtomicU64::new(0),
            refresh_margin_ms,
            on_session_expired: None,
        })
    }

    /// Registers the login-redirect hook, invoked only when a refresh fails
    /// with a definitive rejection of the refresh token.
    #[must_use]
    pub fn with_session_expired_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_session_expired = Some(Box::new(hook));
        self
    }

    /// Monotonic refresh generation. Callers snapshot it next to the token
    /// they were handed; `handle_unauthorized` uses it to tell "my token is
    /// stale" apart from "someone already replaced it".
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Number of refresh network calls actually dispatched.
    #[must_use]
    pub fn refreshes_dispatched(&self) -> u64 {
        self.refreshes_dispatched.load(Ordering::SeqCst)
    }

    pub async fn current_token(&self) -> Option<String> {
        self.session.read().await.access_token.clone()
    }

    /// Installs a freshly issued session (login flows) and persists it.
    pub async fn install_session(&self, new_session: AuthSession) -> Result<(), ClientError> {
        {
            let mut session = self.session.write().await;
            *session = new_session.clone();
        }
        self.persist_session(&new_session).await?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Returns a token fit for use: the current one when its remaining
    /// validity exceeds the margin, otherwise the outcome of a (shared)
    /// refresh. `None` means the layer holds no credentials at all.
    pub async fn get_valid_token(&self, now: UnixTimeMs) -> Option<String> {
        let seen_generation = self.generation();
        {
            let session = self.session.read().await;
            if session.is_fresh(now, self.refresh_margin_ms) {
                return session.access_token.clone();
            }
        }
        self.refresh_shared(seen_generation).await
    }

    /// Invoked by the transport after an authorization failure. Forces a
    /// refresh unless the generation already moved past the caller's, in
    /// which case the replacement token is returned directly.
    pub async fn handle_unauthorized(&self, seen_generation: u64) -> Option<String> {
        self.refresh_shared(seen_generation).await
    }

    /// Single-flight refresh. Never fails toward the caller: a refresh that
    /// cannot run or does not succeed leaves the prior token in place so
    /// in-flight requests can still attempt to proceed.
    #[instrument(skip(self))]
    async fn refresh_shared(&self, seen_generation: u64) -> Option<String> {
        let _gate = self.refresh_gate.lock().await;

        if self.generation() != seen_generation {
            // A refresh completed while this caller waited on the gate.
            return self.session.read().await.access_token.clone();
        }

        // Latest persisted value, not the in-memory copy: another surface of
        // the app may have rotated the refresh token since startup.
        let refresh_token = match self.store.get(keys::REFRESH_TOKEN).await {
            Ok(token) => token,
            Err(e) => {
                warn!("reading refresh token failed: {e}");
                self.session.read().await.refresh_token.clone()
            }
        };

        let Some(refresh_token) = refresh_token else {
            debug!("no refresh token on record; keeping existing access token");
            self.generation.fetch_add(1, Ordering::SeqCst);
            return self.session.read().await.access_token.clone();
        };

        self.refreshes_dispatched.fetch_add(1, Ordering::SeqCst);
        let outcome = self.api.exchange(&refresh_token).await;

        let token = match outcome {
            Ok(grant) => {
                let updated = {
                    let mut session = self.session.write().await;
                    session.access_token = Some(grant.access_token.clone());
                    if grant.expires_at.is_some() {
                        session.expires_at = grant.expires_at;
                    }
                    if let Some(rotated) = grant.refresh_token {
                        session.refresh_token = Some(rotated);
                    }
                    session.clone()
                };
                if let Err(e) = self.persist_session(&updated).await {
                    // The token is usable in memory; losing the persisted
                    // copy costs a refresh on next load, not correctness.
                    warn!("persisting refreshed session failed: {e}");
                }
                info!("access token refreshed");
                Some(grant.access_token)
            }
            Err(e) => {
                if is_definitive_rejection(&e) {
                    warn!("refresh token rejected by server: {e}");
                    if let Some(hook) = &self.on_session_expired {
                        hook();
                    }
                } else {
                    warn!("token refresh failed, continuing with prior token: {e}");
                }
                self.session.read().await.access_token.clone()
            }
        };

        self.generation.fetch_add(1, Ordering::SeqCst);
        token
    }

    async fn persist_session(&self, session: &AuthSession) -> Result<(), ClientError> {
        match &session.access_token {
            Some(token) => self.store.set(keys::ACCESS_TOKEN, token.clone()).await?,
            None => self.store.remove(keys::ACCESS_TOKEN).await?,
        }
        match &session.refresh_token {
            Some(token) => self.store.set(keys::REFRESH_TOKEN, token.clone()).await?,
            None => self.store.remove(keys::REFRESH_TOKEN).await?,
        }
        match session.expires_at {
            Some(at) => write_json(self.store.as_ref(), keys::TOKEN_EXPIRES_AT, &at).await?,
            None => self.store.remove(keys::TOKEN_EXPIRES_AT).await?,
        }
        Ok(())
    }
}

impl std::fmt::Debug for TokenCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCoordinator")
            .field("generation", &self.generation())
            .field("refresh_margin_ms", &self.refresh_margin_ms)
            .finish_non_exhaustive()
    }
}

/// The server explicitly rejected the refresh token, as opposed to a
/// transient failure reaching it.
fn is_definitive_rejection(error: &ClientError) -> bool {
    matches!(
        error,
        ClientError::Api {
            status: 400 | 401 | 403,
            ..
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn make_now() -> UnixTimeMs {
        UnixTimeMs(1_700_000_000_000)
    }

    struct ScriptedRefresh {
        calls: AtomicU64,
        delay_ms: u64,
        result: Result<TokenGrant, ClientError>,
    }

    impl ScriptedRefresh {
        fn succeeding(token: &str) -> Self {
            Self {
                calls: AtomicU64::new(0),
                delay_ms: 0,
                result: Ok(TokenGrant {
                    access_token: token.into(),
                    expires_at: Some(make_now().add_millis(3_600_000)),
                    refresh_token: None,
                }),
            }
        }

        fn failing(error: ClientError) -> Self {
            Self {
                calls: AtomicU64::new(0),
                delay_ms: 0,
                result: Err(error),
            }
        }

        fn with_delay(mut self, delay_ms: u64) -> Self {
            self.delay_ms = delay_ms;
            self
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RefreshApi for ScriptedRefresh {
        async fn exchange(&self, _refresh_token: &str) -> Result<TokenGrant, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.result.clone()
        }
    }

    async fn seeded_store(access: Option<&str>, refresh: Option<&str>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        if let Some(token) = access {
            store.set(keys::ACCESS_TOKEN, token.into()).await.unwrap();
        }
        if let Some(token) = refresh {
            store.set(keys::REFRESH_TOKEN, token.into()).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn fresh_token_skips_refresh() {
        let store = seeded_store(Some("tok-1"), Some("ref-1")).await;
        write_json(
            store.as_ref(),
            keys::TOKEN_EXPIRES_AT,
            &make_now().add_millis(3_600_000),
        )
        .await
        .unwrap();

        let api = Arc::new(ScriptedRefresh::succeeding("tok-2"));
        let coordinator = TokenCoordinator::load(store, api.clone(), 300_000)
            .await
            .unwrap();

        let token = coordinator.get_valid_token(make_now()).await;
        assert_eq!(token.as_deref(), Some("tok-1"));
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn expired_token_triggers_refresh_and_persists() {
        let store = seeded_store(Some("tok-old"), Some("ref-1")).await;
        write_json(
            store.as_ref(),
            keys::TOKEN_EXPIRES_AT,
            &make_now().add_millis(10_000),
        )
        .await
        .unwrap();

        let api = Arc::new(ScriptedRefresh::succeeding("tok-new"));
        let coordinator = TokenCoordinator::load(store.clone(), api.clone(), 300_000)
            .await
            .unwrap();

        let token = coordinator.get_valid_token(make_now()).await;
        assert_eq!(token.as_deref(), Some("tok-new"));
        assert_eq!(api.calls(), 1);
        assert_eq!(
            store.get(keys::ACCESS_TOKEN).await.unwrap().as_deref(),
            Some("tok-new")
        );
    }

    #[tokio::test]
    async fn missing_refresh_token_degrades_gracefully() {
        let store = seeded_store(Some("tok-stale"), None).await;
        let api = Arc::new(ScriptedRefresh::succeeding("unreachable"));
        let coordinator = TokenCoordinator::load(store, api.clone(), 300_000)
            .await
            .unwrap();

        // No expiry either, so the token is not fresh by expiry; force the
        // unauthorized path instead.
        let generation = coordinator.generation();
        let token = coordinator.handle_unauthorized(generation).await;

        assert_eq!(token.as_deref(), Some("tok-stale"));
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_refresh() {
        let store = seeded_store(Some("tok-old"), Some("ref-1")).await;
        write_json(store.as_ref(), keys::TOKEN_EXPIRES_AT, &UnixTimeMs(0))
            .await
            .unwrap();

        let api = Arc::new(ScriptedRefresh::succeeding("tok-new").with_delay(50));
        let coordinator = Arc::new(
            TokenCoordinator::load(store, api.clone(), 300_000)
                .await
                .unwrap(),
        );

        let now = make_now();
        let (a, b, c) = tokio::join!(
            coordinator.get_valid_token(now),
            coordinator.get_valid_token(now),
            coordinator.get_valid_token(now),
        );

        assert_eq!(a.as_deref(), Some("tok-new"));
        assert_eq!(b.as_deref(), Some("tok-new"));
        assert_eq!(c.as_deref(), Some("tok-new"));
        assert_eq!(api.calls(), 1);
        assert_eq!(coordinator.refreshes_dispatched(), 1);
    }

    #[tokio::test]
    async fn transient_refresh_failure_keeps_prior_token() {
        let store = seeded_store(Some("tok-old"), Some("ref-1")).await;
        let api = Arc::new(ScriptedRefresh::failing(ClientError::Network(
            "dns".into(),
        )));
        let expired = Arc::new(AtomicBool::new(false));
        let expired_flag = expired.clone();
        let coordinator = TokenCoordinator::load(store, api.clone(), 300_000)
            .await
            .unwrap()
            .with_session_expired_hook(move || expired_flag.store(true, Ordering::SeqCst));

        let generation = coordinator.generation();
        let token = coordinator.handle_unauthorized(generation).await;

        assert_eq!(token.as_deref(), Some("tok-old"));
        assert_eq!(api.calls(), 1);
        assert!(!expired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn definitive_rejection_fires_session_expired_hook() {
        let store = seeded_store(Some("tok-old"), Some("ref-dead")).await;
        let api = Arc::new(ScriptedRefresh::failing(ClientError::Api {
            status: 401,
            message: "invalid refresh token".into(),
        }));
        let expired = Arc::new(AtomicBool::new(false));
        let expired_flag = expired.clone();
        let coordinator = TokenCoordinator::load(store, api.clone(), 300_000)
            .await
            .unwrap()
            .with_session_expired_hook(move || expired_flag.store(true, Ordering::SeqCst));

        let generation = coordinator.generation();
        let token = coordinator.handle_unauthorized(generation).await;

        // Prior token still returned; the redirect is a side effect, not a
        // hard failure of in-flight requests.
        assert_eq!(token.as_deref(), Some("tok-old"));
        assert!(expired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stale_generation_skips_second_refresh() {
        let store = seeded_store(Some("tok-old"), Some("ref-1")).await;
        let api = Arc::new(ScriptedRefresh::succeeding("tok-new"));
        let coordinator = TokenCoordinator::load(store, api.clone(), 300_000)
            .await
            .unwrap();

        let generation = coordinator.generation();
        let first = coordinator.handle_unauthorized(generation).await;
        assert_eq!(first.as_deref(), Some("tok-new"));
        assert_eq!(api.calls(), 1);

        // Same pre-refresh generation presented again: the refresh already
        // happened, so no new network call is made.
        let second = coordinator.handle_unauthorized(generation).await;
        assert_eq!(second.as_deref(), Some("tok-new"));
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn install_session_persists_all_fields() {
        let store = seeded_store(None, None).await;
        let api = Arc::new(ScriptedRefresh::succeeding("unused"));
        let coordinator = TokenCoordinator::load(store.clone(), api, 300_000)
            .await
            .unwrap();

        coordinator
            .install_session(AuthSession {
                access_token: Some("tok-login".into()),
                refresh_token: Some("ref-login".into()),
                expires_at: Some(make_now().add_millis(3_600_000)),
            })
            .await
            .unwrap();

        assert_eq!(
            store.get(keys::ACCESS_TOKEN).await.unwrap().as_deref(),
            Some("tok-login")
        );
        assert_eq!(
            store.get(keys::REFRESH_TOKEN).await.unwrap().as_deref(),
            Some("ref-login")
        );
        assert_eq!(
            coordinator.current_token().await.as_deref(),
            Some("tok-login")
        );
    }
}
