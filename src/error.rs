//! Error taxonomy for remote calls and authentication

use thiserror::Error;

/// Errors from remote reads/writes against the card service.
///
/// Network and malformed-response variants are transient: callers retry at
/// the next poll or cycle boundary. `Unauthenticated` routes into the
/// session guard's recovery path instead.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Malformed(String),

    #[error("session expired")]
    Unauthenticated,
}

/// Errors from the login handshake.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("network error during login: {0}")]
    Network(#[from] reqwest::Error),

    #[error("csrf token not found on login page")]
    MissingCsrf,

    #[error("login rejected: no session cookie returned")]
    Rejected,
}
