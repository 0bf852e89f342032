//! Core library for porter-auth.
//!
//! Client-side session management for the Porter web front-end:
//! - `validation`: pure form validation run before any network call
//! - `storage`: durable key/value backends (file, keyring, memory)
//! - `auth`: the `CredentialStore` and the `SessionController` state machine
//! - `api`: the `RequestGateway` that attaches bearer tokens and handles 401s
//! - `config`: base origin, storage backend and timeouts

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod storage;
pub mod validation;

pub use api::{ApiError, RequestGateway, SessionExpiredListener};
pub use auth::{
    CredentialStore, SessionController, SessionError, SessionState, SessionStatus,
    SessionTransition,
};
pub use config::Config;
pub use models::{UserId, UserProfile};
pub use validation::{Field, ValidationResult};
