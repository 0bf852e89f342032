//! Session state for the Porter client.
//!
//! - `CredentialStore`: cached, durable token and profile storage
//! - `SessionController`: login/signup/logout/verify and the state machine
//! - `SessionState`/`SessionStatus`: what the UI renders

pub mod credentials;
pub(crate) mod flight;
pub mod session;
pub mod state;

pub use credentials::{CredentialStore, ProfileRecord};
pub use session::{SessionController, SessionError, SESSION_EXPIRED_MESSAGE};
pub use state::{SessionState, SessionStatus, SessionTransition};
