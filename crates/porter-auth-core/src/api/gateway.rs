//! Outbound request wrapper for the Porter backend.
//!
//! Every request goes through `RequestGateway`, which reads the access token
//! from the `CredentialStore` right before sending and attaches it as a bearer
//! token. A 401 from any endpoint ends the session: the store is cleared and
//! the registered `SessionExpiredListener`s are told, then the error goes back
//! to the caller.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{header, Client, Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use crate::auth::flight::SingleFlight;
use crate::auth::CredentialStore;
use crate::config::{Config, DEFAULT_REQUEST_TIMEOUT_SECS};
use crate::models::{AuthResponse, LoginRequest, RefreshRequest, RefreshResponse, SignupRequest};

use super::ApiError;

/// Logout is best effort; don't keep the user waiting on it.
const LOGOUT_TIMEOUT_SECS: u64 = 5;

/// Told when the gateway ends a session because the backend answered 401.
///
/// Called synchronously, after the credential store has been cleared, at most
/// once per cleared session.
pub trait SessionExpiredListener: Send + Sync {
    fn session_expired(&self);

    /// A listener that returns false is dropped from the gateway.
    fn is_alive(&self) -> bool {
        true
    }
}

impl<F> SessionExpiredListener for F
where
    F: Fn() + Send + Sync,
{
    fn session_expired(&self) {
        self()
    }
}

/// Request wrapper bound to one backend origin and one credential store.
/// Share it behind an `Arc`; reqwest's `Client` pools connections internally.
pub struct RequestGateway {
    client: Client,
    base_url: String,
    store: CredentialStore,
    listeners: Mutex<Vec<Arc<dyn SessionExpiredListener>>>,
    refresh: SingleFlight,
}

impl RequestGateway {
    pub fn new(base_url: impl Into<String>, store: CredentialStore) -> Result<Self> {
        Self::with_timeout(base_url, store, Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        store: CredentialStore,
        timeout: Duration,
    ) -> Result<Self> {
        let mut default_headers = header::HeaderMap::new();
        default_headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(default_headers)
            .build()
            .context("Failed to build HTTP client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "Request gateway created");

        Ok(Self {
            client,
            base_url,
            store,
            listeners: Mutex::new(Vec::new()),
            refresh: SingleFlight::new(),
        })
    }

    pub fn from_config(config: &Config, store: CredentialStore) -> Result<Self> {
        Self::with_timeout(config.api_base_url(), store, config.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionExpiredListener>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|l| l.is_alive());
        listeners.push(listener);
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Headers for the next request. The token is read from the store at
    /// this moment, never from a value captured earlier.
    fn auth_headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = self.store.access_token() {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {}", token))
                    .context("Access token is not a valid header value")?,
            );
        }
        Ok(headers)
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        Ok(self
            .client
            .request(method, self.url(path))
            .headers(self.auth_headers()?))
    }

    /// Clear the session and notify listeners, once per session.
    fn end_session(&self, path: &str) {
        if !self.store.expire() {
            debug!(path = path, "Authorization failure with no active session");
            return;
        }
        self.notify_expired(path);
    }

    /// `end_session` for work that started under session `generation`. A
    /// session stored since then is left alone.
    fn end_session_if(&self, path: &str, generation: u64) {
        if !self.store.expire_if(generation) {
            debug!(path = path, "Authorization failure for a session that already ended");
            return;
        }
        self.notify_expired(path);
    }

    fn notify_expired(&self, path: &str) {
        info!(path = path, "Session ended by authorization failure");

        // Clone out so listeners can register or call back into the gateway
        let listeners = {
            let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners.retain(|l| l.is_alive());
            listeners.clone()
        };
        for listener in listeners {
            listener.session_expired();
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(&self, path: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == reqwest::StatusCode::UNAUTHORIZED {
            // Never starts a refresh, so a 401 during a refresh can't loop
            self.end_session(path);
            return Err(ApiError::Unauthorized.into());
        }

        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, &body).into())
    }

    async fn dispatch(&self, path: &str, request: RequestBuilder) -> Result<Response> {
        debug!(path = path, "Sending request");
        let response = request
            .send()
            .await
            .map_err(ApiError::from)
            .with_context(|| format!("Failed to send request to {}", path))?;
        self.check_response(path, response).await
    }

    async fn parse_json<T: DeserializeOwned>(path: &str, response: Response) -> Result<T> {
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
            .with_context(|| format!("Failed to parse JSON response from {}", path))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.dispatch(path, self.request(Method::GET, path)?).await?;
        Self::parse_json(path, response).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let request = self.request(Method::POST, path)?.json(body);
        let response = self.dispatch(path, request).await?;
        Self::parse_json(path, response).await
    }

    /// Send a request and only care about the status.
    pub async fn send_empty(&self, method: Method, path: &str) -> Result<()> {
        self.dispatch(path, self.request(method, path)?).await?;
        Ok(())
    }

    // ===== Auth endpoints =====

    /// POST /auth/login. Does not persist anything.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthResponse> {
        self.post("/auth/login", &LoginRequest { email, password }).await
    }

    /// POST /auth/signup. Does not persist anything.
    pub async fn signup(&self, email: &str, password: &str, name: &str) -> Result<AuthResponse> {
        self.post("/auth/signup", &SignupRequest { email, password, name })
            .await
    }

    /// POST /auth/logout with the current token, if any.
    pub async fn logout(&self) -> Result<()> {
        let path = "/auth/logout";
        let request = self
            .request(Method::POST, path)?
            .timeout(Duration::from_secs(LOGOUT_TIMEOUT_SECS));
        self.dispatch(path, request).await?;
        Ok(())
    }

    /// GET /auth/verify. Ok means the backend still accepts the token.
    pub async fn verify(&self) -> Result<()> {
        self.send_empty(Method::GET, "/auth/verify").await
    }

    /// POST /auth/refresh and store the new access token.
    ///
    /// Only one refresh runs at a time; a concurrent call fails with
    /// `ApiError::RefreshInFlight`. If the backend rejects the refresh token
    /// the session is ended. Network and server errors leave the session
    /// alone so the caller can retry. A refresh that completes after the
    /// session was cleared or replaced stores nothing and fails with
    /// `ApiError::SessionChanged`.
    pub async fn refresh_token(&self) -> Result<String> {
        let Some(_guard) = self.refresh.try_begin() else {
            return Err(ApiError::RefreshInFlight.into());
        };
        let generation = self.store.generation();
        let Some(refresh_token) = self.store.refresh_token() else {
            return Err(ApiError::NoRefreshToken.into());
        };

        let path = "/auth/refresh";
        let result: Result<RefreshResponse> = self
            .post(path, &RefreshRequest { refresh_token: &refresh_token })
            .await;

        match result {
            Ok(response) => {
                let stored = self
                    .store
                    .replace_access_token_if(generation, &response.token)
                    .context("Failed to store refreshed token")?;
                if !stored {
                    info!("Session ended during refresh, discarding new token");
                    return Err(ApiError::SessionChanged.into());
                }
                debug!("Access token refreshed");
                Ok(response.token)
            }
            Err(e) => {
                if matches!(e.downcast_ref::<ApiError>(), Some(ApiError::Rejected { .. })) {
                    warn!(error = %e, "Refresh token rejected");
                    self.end_session_if(path, generation);
                }
                Err(e)
            }
        }
    }
}
