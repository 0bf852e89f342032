//! Session status and the transitions allowed between them.

use std::fmt;

use serde::Serialize;

use crate::models::UserProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Failed,
}

impl SessionStatus {
    /// The transition table.
    ///
    /// - Unauthenticated -> Authenticating (login/signup)
    /// - Authenticating -> Authenticated | Failed | Unauthenticated
    /// - Authenticated -> Unauthenticated (logout, expiry, failed verification)
    /// - Failed -> Authenticating | Unauthenticated
    ///
    /// Authenticated is only entered from Authenticating, or directly at
    /// startup when a stored token exists.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Unauthenticated, Authenticating)
                | (Authenticating, Authenticated)
                | (Authenticating, Failed)
                | (Authenticating, Unauthenticated)
                | (Authenticated, Unauthenticated)
                | (Failed, Authenticating)
                | (Failed, Unauthenticated)
        )
    }

    /// Whether login/signup may start from this status.
    pub fn accepts_credentials(&self) -> bool {
        matches!(self, SessionStatus::Unauthenticated | SessionStatus::Failed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::Unauthenticated => "signed out",
            SessionStatus::Authenticating => "signing in",
            SessionStatus::Authenticated => "signed in",
            SessionStatus::Failed => "sign-in failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Snapshot of the session as the UI should render it.
///
/// Constructed only through the named constructors, so a profile can only
/// accompany Authenticated and an error only Unauthenticated or Failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    status: SessionStatus,
    profile: Option<UserProfile>,
    error: Option<String>,
}

impl SessionState {
    pub fn unauthenticated() -> Self {
        Self {
            status: SessionStatus::Unauthenticated,
            profile: None,
            error: None,
        }
    }

    pub(crate) fn expired(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::unauthenticated()
        }
    }

    pub(crate) fn authenticating() -> Self {
        Self {
            status: SessionStatus::Authenticating,
            profile: None,
            error: None,
        }
    }

    /// The profile may be missing when the stored one was unreadable.
    pub(crate) fn authenticated(profile: Option<UserProfile>) -> Self {
        Self {
            status: SessionStatus::Authenticated,
            profile,
            error: None,
        }
    }

    pub(crate) fn failed(message: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Failed,
            profile: None,
            error: Some(message.into()),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn profile(&self) -> Option<&UserProfile> {
        self.profile.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.status == SessionStatus::Authenticated
    }

    pub(crate) fn clear_error(&mut self) -> bool {
        self.error.take().is_some()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::unauthenticated()
    }
}

/// An applied status change, broadcast to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionTransition {
    pub from: SessionStatus,
    pub to: SessionStatus,
}
