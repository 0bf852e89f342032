//! The session controller.
//!
//! `SessionController` is the only thing that moves the session between
//! states. It validates forms, calls the backend through the
//! `RequestGateway`, persists the result in the `CredentialStore` and
//! broadcasts every applied transition.
//!
//! Login, signup and verification share one single-flight guard: a second
//! call while one is pending fails with `SessionError::Busy`. Logout is not
//! guarded. It bumps the session epoch so an in-flight login or verification
//! notices the session was torn down and discards its result.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, RequestGateway, SessionExpiredListener};
use crate::models::{AuthResponse, UserProfile};
use crate::storage::StorageError;
use crate::validation::{self, ValidationResult};

use super::flight::SingleFlight;
use super::state::{SessionState, SessionStatus, SessionTransition};

pub const SESSION_EXPIRED_MESSAGE: &str = "Session expired. Please log in again.";
pub const CONNECTION_FAILURE_MESSAGE: &str =
    "Unable to connect to server. Check your internet connection.";
pub const MALFORMED_RESPONSE_MESSAGE: &str = "Unexpected response from server. Please try again.";
pub const STORAGE_FAILURE_MESSAGE: &str = "Unable to save session.";
pub const SERVER_FAILURE_MESSAGE: &str = "Server error. Please try again later.";

const TRANSITION_CHANNEL_CAPACITY: usize = 32;

// ===== Errors =====

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Form has errors: {0}")]
    Validation(ValidationResult),

    #[error("Another sign-in or verification is already in progress")]
    Busy,

    #[error("Not allowed while {0}")]
    InvalidState(SessionStatus),

    #[error("{message}")]
    Rejected {
        message: String,
        #[source]
        detail: anyhow::Error,
    },

    #[error("Session expired")]
    Expired,

    #[error("Session ended while the request was in flight")]
    Superseded,

    #[error("{message}")]
    Transport {
        message: String,
        #[source]
        detail: anyhow::Error,
    },

    #[error("Failed to persist session: {0}")]
    Storage(#[from] StorageError),
}

impl SessionError {
    /// Text suitable for showing to the user as-is.
    pub fn user_message(&self) -> &str {
        match self {
            SessionError::Validation(_) => "Please correct the highlighted fields.",
            SessionError::Busy => "Please wait for the current request to finish.",
            SessionError::InvalidState(SessionStatus::Authenticated) => "You are already signed in.",
            SessionError::InvalidState(_) => "Please wait for the current request to finish.",
            SessionError::Rejected { message, .. } | SessionError::Transport { message, .. } => {
                message.as_str()
            }
            SessionError::Expired => SESSION_EXPIRED_MESSAGE,
            SessionError::Superseded => "Sign-in was cancelled.",
            SessionError::Storage(_) => STORAGE_FAILURE_MESSAGE,
        }
    }

    /// Classify a failed login/signup exchange.
    fn from_auth_failure(kind: AuthKind, detail: anyhow::Error) -> Self {
        let (rejected, message) = match detail.downcast_ref::<ApiError>() {
            Some(api @ (ApiError::Rejected { .. } | ApiError::Unauthorized)) => (
                true,
                api.server_message().unwrap_or(kind.failure_message()).to_string(),
            ),
            Some(ApiError::NetworkError(_)) => (false, CONNECTION_FAILURE_MESSAGE.to_string()),
            Some(ApiError::InvalidResponse(_)) => (false, MALFORMED_RESPONSE_MESSAGE.to_string()),
            _ => (false, kind.failure_message().to_string()),
        };

        if rejected {
            SessionError::Rejected { message, detail }
        } else {
            SessionError::Transport { message, detail }
        }
    }

    /// Classify a failed verification. Any refusal by the backend means the
    /// token is gone.
    fn from_verify_failure(detail: anyhow::Error) -> Self {
        let message = match detail.downcast_ref::<ApiError>() {
            Some(ApiError::Unauthorized | ApiError::Rejected { .. }) => {
                return SessionError::Expired
            }
            Some(ApiError::InvalidResponse(_)) => MALFORMED_RESPONSE_MESSAGE,
            Some(ApiError::ServerError(_)) => SERVER_FAILURE_MESSAGE,
            _ => CONNECTION_FAILURE_MESSAGE,
        };
        SessionError::Transport {
            message: message.to_string(),
            detail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthKind {
    Login,
    Signup,
}

impl AuthKind {
    fn label(&self) -> &'static str {
        match self {
            AuthKind::Login => "login",
            AuthKind::Signup => "signup",
        }
    }

    fn failure_message(&self) -> &'static str {
        match self {
            AuthKind::Login => "Login failed. Please try again.",
            AuthKind::Signup => "Signup failed. Please try again.",
        }
    }
}

// ===== Shared state =====

struct Inner {
    gateway: Arc<RequestGateway>,
    state: Mutex<SessionState>,
    flight: SingleFlight,
    /// Bumped whenever the session is torn down (logout, expiry).
    epoch: AtomicU64,
    transitions: broadcast::Sender<SessionTransition>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Replace the state if the transition table allows it.
    ///
    /// A same-status replacement only updates the fields and is not
    /// broadcast. Returns true when a transition was applied.
    fn apply(&self, state: &mut SessionState, next: SessionState) -> bool {
        let from = state.status();
        let to = next.status();
        if from == to {
            *state = next;
            return false;
        }
        if !from.can_transition_to(to) {
            warn!(from = %from, to = %to, "Ignoring disallowed session transition");
            return false;
        }

        *state = next;
        debug!(from = %from, to = %to, "Session transition");
        // No subscribers is fine
        let _ = self.transitions.send(SessionTransition { from, to });
        true
    }

    fn begin_authentication(&self) -> Result<u64, SessionError> {
        let mut state = self.lock_state();
        let status = state.status();
        if !status.accepts_credentials() {
            return Err(SessionError::InvalidState(status));
        }
        self.apply(&mut state, SessionState::authenticating());
        Ok(self.epoch())
    }

    /// Commit the outcome of a login/signup exchange. The state lock is held
    /// across the epoch check and the store write, so a concurrent logout
    /// either lands before (and the result is discarded) or after.
    fn finish_authentication(
        &self,
        kind: AuthKind,
        epoch: u64,
        outcome: anyhow::Result<AuthResponse>,
    ) -> Result<UserProfile, SessionError> {
        let mut state = self.lock_state();
        if self.epoch() != epoch {
            info!(kind = kind.label(), "Discarding result, session ended while in flight");
            return Err(SessionError::Superseded);
        }
        let store = self.gateway.store();

        match outcome {
            Ok(AuthResponse {
                token,
                refresh_token,
                user,
            }) => {
                if let Err(e) = store.persist_session(&token, refresh_token.as_deref(), &user) {
                    error!(kind = kind.label(), error = %e, "Failed to persist session");
                    self.apply(&mut state, SessionState::failed(STORAGE_FAILURE_MESSAGE));
                    return Err(SessionError::Storage(e));
                }
                self.apply(&mut state, SessionState::authenticated(Some(user.clone())));
                info!(kind = kind.label(), user_id = %user.id, "Signed in");
                Ok(user)
            }
            Err(e) => {
                error!(kind = kind.label(), error = ?e, "Authentication failed");
                let failure = SessionError::from_auth_failure(kind, e);
                store.clear();
                self.apply(&mut state, SessionState::failed(failure.user_message()));
                Err(failure)
            }
        }
    }

    /// End the session unless logout or expiry already did since `epoch`.
    fn end_session_since(&self, epoch: u64) {
        let mut state = self.lock_state();
        if self.epoch() != epoch {
            debug!("Session already ended");
            return;
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.gateway.store().clear();
        if state.status() != SessionStatus::Unauthenticated {
            self.apply(&mut state, SessionState::unauthenticated());
        }
    }
}

/// Registered on the gateway. Holds the controller weakly so a dropped
/// controller turns the callback into a no-op.
struct ExpiryListener(Weak<Inner>);

impl SessionExpiredListener for ExpiryListener {
    fn session_expired(&self) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        let mut state = inner.lock_state();
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        if inner.apply(&mut state, SessionState::expired(SESSION_EXPIRED_MESSAGE)) {
            info!("Session expired");
        }
    }

    fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

async fn verify_stored_session(
    inner: Weak<Inner>,
    gateway: Arc<RequestGateway>,
    epoch: u64,
) -> Result<(), SessionError> {
    if !gateway.store().has_token() {
        if let Some(inner) = inner.upgrade() {
            inner.end_session_since(epoch);
        }
        return Err(SessionError::Expired);
    }

    let outcome = gateway.verify().await;

    let Some(inner) = inner.upgrade() else {
        debug!("Session controller dropped before verification finished");
        return outcome.map_err(SessionError::from_verify_failure);
    };

    match outcome {
        Ok(()) => {
            debug!("Stored session verified");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "Session verification failed");
            inner.end_session_since(epoch);
            Err(SessionError::from_verify_failure(e))
        }
    }
}

// ===== Controller =====

pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// Probe the credential store and start in the matching state.
    ///
    /// With a stored token the session starts Authenticated with the cached
    /// profile; call `spawn_verification` to confirm it with the backend.
    pub fn new(gateway: Arc<RequestGateway>) -> Self {
        let store = gateway.store();
        let state = if store.has_token() {
            debug!("Stored token found, starting authenticated");
            SessionState::authenticated(store.user_profile())
        } else {
            SessionState::unauthenticated()
        };

        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            gateway: Arc::clone(&gateway),
            state: Mutex::new(state),
            flight: SingleFlight::new(),
            epoch: AtomicU64::new(0),
            transitions,
        });
        gateway.add_listener(Arc::new(ExpiryListener(Arc::downgrade(&inner))));

        Self { inner }
    }

    /// `new` followed by `spawn_verification`: the startup sequence for a
    /// host. The handle is `None` when there was no stored session to check.
    pub fn start(
        gateway: Arc<RequestGateway>,
    ) -> (Self, Option<JoinHandle<Result<(), SessionError>>>) {
        let controller = Self::new(gateway);
        let check = controller.spawn_verification();
        (controller, check)
    }

    /// Verify the stored session in the background.
    ///
    /// Returns `None` when the session isn't Authenticated or another
    /// operation already holds the guard. The task only holds the controller
    /// weakly.
    pub fn spawn_verification(&self) -> Option<JoinHandle<Result<(), SessionError>>> {
        if !self.is_authenticated() {
            return None;
        }
        let guard = self.inner.flight.try_begin()?;
        let weak = Arc::downgrade(&self.inner);
        let gateway = Arc::clone(&self.inner.gateway);
        let epoch = self.inner.epoch();

        Some(tokio::spawn(async move {
            let _guard = guard;
            verify_stored_session(weak, gateway, epoch).await
        }))
    }

    /// Ask the backend whether the stored token is still good. Any failure
    /// ends the session.
    pub async fn verify_session(&self) -> Result<(), SessionError> {
        let _guard = self.inner.flight.try_begin().ok_or(SessionError::Busy)?;
        verify_stored_session(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.gateway),
            self.inner.epoch(),
        )
        .await
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<UserProfile, SessionError> {
        let form = validation::validate_login_form(email, password);
        if !form.is_valid() {
            return Err(SessionError::Validation(form));
        }
        self.authenticate(AuthKind::Login, self.inner.gateway.login(email, password))
            .await
    }

    /// Register a new account. The confirmation field is the caller's
    /// concern; see `validation::validate_signup_form`.
    pub async fn signup(
        &self,
        email: &str,
        password: &str,
        name: &str,
    ) -> Result<UserProfile, SessionError> {
        let form = validation::validate_signup_fields(email, password);
        if !form.is_valid() {
            return Err(SessionError::Validation(form));
        }
        self.authenticate(AuthKind::Signup, self.inner.gateway.signup(email, password, name))
            .await
    }

    async fn authenticate<F>(&self, kind: AuthKind, exchange: F) -> Result<UserProfile, SessionError>
    where
        F: Future<Output = anyhow::Result<AuthResponse>>,
    {
        let _guard = self.inner.flight.try_begin().ok_or(SessionError::Busy)?;
        let epoch = self.inner.begin_authentication()?;
        debug!(kind = kind.label(), "Authenticating");

        let outcome = exchange.await;
        self.inner.finish_authentication(kind, epoch, outcome)
    }

    /// Best-effort remote logout, then clear everything locally. Always ends
    /// Unauthenticated with an empty store.
    pub async fn logout(&self) {
        {
            let _state = self.inner.lock_state();
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        }

        let store = self.inner.gateway.store();
        if store.has_token() {
            if let Err(e) = self.inner.gateway.logout().await {
                warn!(error = %e, "Remote logout failed, clearing local session anyway");
            }
        }

        let mut state = self.inner.lock_state();
        store.clear();
        self.inner.apply(&mut state, SessionState::unauthenticated());
        info!("Logged out");
    }

    pub fn clear_error(&self) {
        self.inner.lock_state().clear_error();
    }

    // ===== Accessors =====

    pub fn state(&self) -> SessionState {
        self.inner.lock_state().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.lock_state().status()
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.inner.lock_state().profile().cloned()
    }

    pub fn is_authenticated(&self) -> bool {
        self.status() == SessionStatus::Authenticated
    }

    /// Whether a login, signup or verification is pending.
    pub fn is_busy(&self) -> bool {
        self.inner.flight.is_busy()
    }

    pub fn gateway(&self) -> &Arc<RequestGateway> {
        &self.inner.gateway
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionTransition> {
        self.inner.transitions.subscribe()
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state())
            .finish()
    }
}
