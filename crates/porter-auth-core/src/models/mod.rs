//! Data models shared by the gateway, the credential store and the session
//! controller.
//!
//! - `user`: the `UserProfile` returned by the backend and persisted locally
//! - `auth`: request and response bodies for the `/auth/*` endpoints

pub mod auth;
pub mod user;

pub use auth::{AuthResponse, ErrorBody, LoginRequest, RefreshRequest, RefreshResponse, SignupRequest};
pub use user::{UserId, UserProfile};
