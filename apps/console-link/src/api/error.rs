use crate::auth::error::SessionError;
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request failed ({status}): {detail}")]
    Status { status: StatusCode, detail: String },
    #[error("session expired: {0}")]
    SessionExpired(#[from] RefreshFailure),
    #[error("session store error: {0}")]
    Session(#[from] SessionError),
    #[error("invalid endpoint path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("invalid header value for {0}")]
    InvalidHeader(String),
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Http(err) => err.status(),
            _ => None,
        }
    }
}

/// Why a token refresh could not produce a new access token. Shared by the
/// request that triggered the refresh and every request queued behind it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshFailure {
    #[error("no refresh token stored")]
    MissingRefreshToken,
    #[error("refresh rejected ({status}): {detail}")]
    Rejected { status: u16, detail: String },
    #[error("refresh request failed: {0}")]
    Transport(String),
    #[error("refreshed credentials could not be stored: {0}")]
    Store(String),
}
