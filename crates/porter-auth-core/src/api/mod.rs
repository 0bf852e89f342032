//! REST API access for the Porter backend.
//!
//! This module provides the `RequestGateway`, which every outbound call goes
//! through. It attaches the stored bearer token and turns a 401 from any
//! endpoint into a cleared session.

pub mod error;
pub mod gateway;

pub use error::ApiError;
pub use gateway::{RequestGateway, SessionExpiredListener};
