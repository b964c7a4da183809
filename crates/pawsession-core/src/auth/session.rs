use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::credentials::{is_token_key, CredentialStore, StoredTokens, REFRESH_TOKEN_KEY};
use super::error::{AuthError, RenewalError};
use super::renewal::SingleFlight;
use super::scheduler::RenewalScheduler;
use super::token::{is_expired_at, token_expiry};
use crate::api::{ApiClient, AuthBackend};
use crate::config::Config;
use crate::models::{TokenPair, User};

pub type RenewalResult = Result<TokenPair, RenewalError>;

/// Mutable session state, the Rust side of the dashboard's auth context.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<User>,
    pub token_expiry: Option<DateTime<Utc>>,
    pub is_authenticated: bool,
    pub loading: bool,
    pub error: Option<String>,
}

impl SessionState {
    pub fn token_expiry_millis(&self) -> Option<i64> {
        self.token_expiry.map(|t| t.timestamp_millis())
    }

    pub fn is_expired(&self) -> bool {
        is_expired_at(self.token_expiry, Utc::now())
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> Option<i64> {
        self.token_expiry
            .map(|exp| (exp - Utc::now()).num_minutes().max(0))
    }
}

/// Read-only view of the session for display. Never carries tokens.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionSnapshot {
    pub user: Option<User>,
    pub is_authenticated: bool,
    pub loading: bool,
    pub error: Option<String>,
    pub token_expiry_millis: Option<i64>,
    pub minutes_until_expiry: Option<i64>,
    pub has_refresh_token: bool,
}

pub(super) struct SessionInner {
    pub(super) backend: Arc<dyn AuthBackend>,
    pub(super) store: CredentialStore,
    pub(super) state: RwLock<SessionState>,
    renewal: SingleFlight<RenewalResult>,
    scheduler: RenewalScheduler,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().ok().and_then(|w| w.take()) {
            watcher.abort();
        }
    }
}

/// Explicit session context shared by everything that needs auth.
///
/// Clone is cheap; all clones see the same session. Background work (the
/// renewal timer and the storage watcher) holds only weak references, so
/// dropping the last clone tears it down.
#[derive(Clone)]
pub struct SessionContext {
    pub(super) inner: Arc<SessionInner>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("store", &self.inner.store)
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

impl SessionContext {
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        store: CredentialStore,
        renew_before: chrono::Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                backend,
                store,
                state: RwLock::new(SessionState::default()),
                renewal: SingleFlight::new(),
                scheduler: RenewalScheduler::new(renew_before),
                watcher: Mutex::new(None),
            }),
        }
    }

    /// HTTP backend and file-backed credential store as configured
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let client = ApiClient::from_config(config)?;
        let store = CredentialStore::from_config(config)?;
        Ok(Self::new(Arc::new(client), store, config.renew_before()))
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    // ===== Accessors =====

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.inner.state.read().await;
        SessionSnapshot {
            user: state.user.clone(),
            is_authenticated: state.is_authenticated,
            loading: state.loading,
            error: state.error.clone(),
            token_expiry_millis: state.token_expiry_millis(),
            minutes_until_expiry: state.minutes_until_expiry(),
            has_refresh_token: state.refresh_token.is_some(),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.inner.state.read().await.clone()
    }

    pub async fn user(&self) -> Option<User> {
        self.inner.state.read().await.user.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.state.read().await.is_authenticated
    }

    pub async fn error(&self) -> Option<String> {
        self.inner.state.read().await.error.clone()
    }

    /// Current access token, falling back to storage
    pub async fn access_token(&self) -> Option<String> {
        let token = self.inner.state.read().await.access_token.clone();
        token.or_else(|| self.inner.store.read(super::credentials::ACCESS_TOKEN_KEY))
    }

    /// When the proactive renewal will fire, if armed
    pub fn next_renewal(&self) -> Option<DateTime<Utc>> {
        self.inner.scheduler.next_fire()
    }

    // ===== Operations =====

    /// Log in with email and password.
    ///
    /// Empty fields fail without a network call. On success the tokens are
    /// persisted, the user is set and proactive renewal is armed.
    pub async fn login(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            let err = AuthError::MissingCredentials;
            self.inner.state.write().await.error = Some(err.to_string());
            return Err(err);
        }

        self.set_loading(true).await;
        let response = match self.inner.backend.login(email, password).await {
            Ok(response) => response,
            Err(e) => {
                let message = e.user_message();
                warn!(email = email, error = %e, "Login failed");
                let mut state = self.inner.state.write().await;
                state.loading = false;
                state.error = Some(message.clone());
                return Err(AuthError::LoginFailed(message));
            }
        };

        if let Err(e) = self.inner.store.save_tokens(&response.tokens) {
            // The session still works for this process
            warn!(error = %e, "Failed to persist tokens after login");
        }

        let expiry = token_expiry(&response.tokens.access_token);
        {
            let mut state = self.inner.state.write().await;
            state.access_token = Some(response.tokens.access_token);
            state.refresh_token = Some(response.tokens.refresh_token);
            state.token_expiry = expiry;
            state.user = Some(response.user.clone());
            state.is_authenticated = true;
            state.loading = false;
            state.error = None;
        }
        self.inner.schedule_renewal(expiry);

        info!(user = response.user.display_name(), "Logged in");
        Ok(response.user)
    }

    /// Restore the session from storage and fetch the current user.
    ///
    /// An expired (or missing) access token is renewed first when a refresh
    /// token is stored. Failures are recorded in `error` and returned, but
    /// never clear the session. That includes storage that can't be read.
    pub async fn load_user(&self) -> Result<Option<User>, AuthError> {
        self.set_loading(true).await;
        let result = match self.inner.store.read_tokens() {
            Ok(stored) => self.restore(stored).await,
            Err(e) => Err(AuthError::Storage(e)),
        };

        let mut state = self.inner.state.write().await;
        state.loading = false;
        match &result {
            Ok(_) => state.error = None,
            Err(e) => {
                warn!(error = %e, "Failed to load user");
                state.error = Some(e.to_string());
            }
        }
        result
    }

    async fn restore(&self, mut stored: StoredTokens) -> Result<Option<User>, AuthError> {
        if stored.access_token.is_none() && stored.refresh_token.is_none() {
            let held = self.held_tokens().await;
            if held.access_token.is_none() && held.refresh_token.is_none() {
                debug!("No stored tokens");
                self.reset_local(true).await;
                return Ok(None);
            }
            // Persisting failed earlier; memory is the only copy left
            warn!("Storage has no tokens, continuing with the in-memory session");
            stored = held;
        }

        let expiry = stored.access_token.as_deref().and_then(token_expiry);

        {
            let mut state = self.inner.state.write().await;
            state.access_token = stored.access_token.clone();
            state.refresh_token = stored.refresh_token.clone();
            state.token_expiry = expiry;
        }

        let access_valid =
            stored.access_token.is_some() && !is_expired_at(expiry, Utc::now());
        if access_valid {
            self.inner.schedule_renewal(expiry);
        } else if stored.refresh_token.is_some() {
            debug!("Access token expired or missing, renewing before fetching user");
            self.renew().await?;
        } else {
            return Err(AuthError::SessionExpired);
        }

        let backend = Arc::clone(&self.inner.backend);
        let user = self
            .authorized(move |token| {
                let backend = Arc::clone(&backend);
                async move { backend.current_user(&token).await }
            })
            .await?;

        {
            let mut state = self.inner.state.write().await;
            state.user = Some(user.clone());
            state.is_authenticated = true;
        }
        debug!(user = user.display_name(), "User loaded");
        Ok(Some(user))
    }

    /// Best-effort server logout, then unconditionally clear local state.
    pub async fn logout(&self) {
        if let Some(token) = self.access_token().await {
            if let Err(e) = self.inner.backend.logout(&token).await {
                warn!(error = %e, "Server logout failed, clearing local session anyway");
            }
        }

        if let Err(e) = self.inner.store.clear_tokens() {
            warn!(error = %e, "Failed to clear stored tokens");
        }
        self.reset_local(false).await;
        info!("Logged out");
    }

    /// Exchange the refresh token for a new pair.
    ///
    /// Concurrent callers (timer, interceptor, explicit refresh) share one
    /// in-flight call. Failure leaves the session untouched.
    ///
    /// The refresh call runs to completion even if every caller stops
    /// waiting, so a token the server has already rotated is still stored.
    pub async fn renew(&self) -> RenewalResult {
        let weak = Arc::downgrade(&self.inner);
        let outcome = self
            .inner
            .renewal
            .run(move || async move {
                let Some(inner) = weak.upgrade() else {
                    return Err(RenewalError::Failed("session was dropped".to_string()));
                };
                inner.perform_renewal().await
            })
            .await;
        outcome.unwrap_or_else(|e| {
            warn!(error = %e, "Renewal task ended abnormally");
            Err(RenewalError::Failed(e.to_string()))
        })
    }

    /// `GET /validate-token` through the interceptor
    pub async fn validate_token(&self) -> Result<serde_json::Value, AuthError> {
        let backend = Arc::clone(&self.inner.backend);
        self.authorized(move |token| {
            let backend = Arc::clone(&backend);
            async move { backend.validate_token(&token).await }
        })
        .await
    }

    /// Re-run `load_user` whenever another handle on the same storage
    /// changes a token key. Replaces any previous watcher.
    pub fn watch_storage(&self) {
        let mut changes = self.inner.store.subscribe();
        let origin = self.inner.store.origin();
        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) if change.origin != origin && is_token_key(&change.key) => {
                        // A login or renewal elsewhere writes both keys; reload once
                        while changes.try_recv().is_ok() {}
                        let Some(inner) = weak.upgrade() else { break };
                        debug!(key = %change.key, origin = change.origin, "Tokens changed elsewhere, reloading");
                        let ctx = SessionContext { inner };
                        match ctx.inner.store.read_tokens() {
                            Ok(stored)
                                if stored.access_token.is_none()
                                    && stored.refresh_token.is_none() =>
                            {
                                info!("Logged out elsewhere, ending this session");
                                ctx.reset_local(false).await;
                            }
                            _ => {
                                let _ = ctx.load_user().await;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Storage watcher lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let previous = self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop background work: the renewal timer and the storage watcher.
    pub fn shutdown(&self) {
        self.inner.scheduler.cancel();
        if let Some(watcher) = self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            watcher.abort();
        }
    }

    async fn held_tokens(&self) -> StoredTokens {
        let state = self.inner.state.read().await;
        StoredTokens {
            access_token: state.access_token.clone(),
            refresh_token: state.refresh_token.clone(),
        }
    }

    /// Drop the in-memory session and its timer without touching storage
    async fn reset_local(&self, loading: bool) {
        self.inner.scheduler.cancel();
        *self.inner.state.write().await = SessionState {
            loading,
            ..SessionState::default()
        };
    }

    async fn set_loading(&self, loading: bool) {
        self.inner.state.write().await.loading = loading;
    }
}

impl SessionInner {
    /// Refresh token from storage (it may have been rotated elsewhere),
    /// else from memory
    pub(super) async fn refresh_token(&self) -> Option<String> {
        match self.store.read(REFRESH_TOKEN_KEY) {
            Some(token) => Some(token),
            None => self.state.read().await.refresh_token.clone(),
        }
    }

    async fn perform_renewal(self: &Arc<Self>) -> RenewalResult {
        let refresh_token = self
            .refresh_token()
            .await
            .ok_or(RenewalError::NoRefreshToken)?;

        info!("Renewing access token");
        let tokens = match self.backend.refresh(&refresh_token).await {
            Ok(tokens) => tokens,
            Err(e) => {
                let err = RenewalError::from(e);
                warn!(error = %err, "Token renewal failed");
                return Err(err);
            }
        };

        if let Err(e) = self.store.save_tokens(&tokens) {
            warn!(error = %e, "Failed to persist renewed tokens");
        }

        let expiry = token_expiry(&tokens.access_token);
        {
            let mut state = self.state.write().await;
            state.access_token = Some(tokens.access_token.clone());
            state.refresh_token = Some(tokens.refresh_token.clone());
            state.token_expiry = expiry;
        }
        match expiry {
            Some(exp) if self.scheduler.is_due(exp, Utc::now()) => {
                // Re-arming would fire at once and renew in a loop
                warn!(
                    expiry = %exp,
                    lead_secs = self.scheduler.lead().num_seconds(),
                    "Renewed token expires inside the renewal window, leaving it to the next 401"
                );
                self.scheduler.cancel();
            }
            _ => self.schedule_renewal(expiry),
        }

        debug!(expiry = ?expiry, "Access token renewed");
        Ok(tokens)
    }

    /// Re-arm the proactive timer for a new expiry. Tokens with no readable
    /// expiry are renewed reactively only.
    fn schedule_renewal(self: &Arc<Self>, expiry: Option<DateTime<Utc>>) {
        let Some(expiry) = expiry else {
            debug!("Access token has no expiry, proactive renewal disabled");
            self.scheduler.cancel();
            return;
        };

        let weak = Arc::downgrade(self);
        self.scheduler.schedule(expiry, move || async move {
            let Some(inner) = weak.upgrade() else { return };
            let ctx = SessionContext { inner };
            if let Err(e) = ctx.renew().await {
                // Not retried; the next expiry change reschedules
                warn!(error = %e, "Proactive token renewal failed");
            }
        });
    }
}
