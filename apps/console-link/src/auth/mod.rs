pub mod error;
pub mod gate;
pub mod session;

use crate::api::error::ApiError;
use crate::auth::error::SessionError;
use crate::auth::gate::{AuthGateClient, LoginResponse};
use crate::auth::session::{Session, SessionStore};

pub use gate::{LOGIN_PATH, REFRESH_PATH};
pub use session::{FileSessionStore, MemorySessionStore};

/// Exchanges credentials for a token pair and makes it the current session.
pub async fn login(
    gate: &AuthGateClient,
    store: &dyn SessionStore,
    username: &str,
    password: &str,
) -> Result<LoginResponse, ApiError> {
    let tokens = gate.login(username, password).await?;
    store.save(Session::new(
        tokens.access_token.clone(),
        tokens.refresh_token.clone(),
    ))?;
    tracing::info!(target: "console_link::auth", username, "logged in");
    Ok(tokens)
}

pub fn logout(store: &dyn SessionStore) -> Result<(), SessionError> {
    store.clear()?;
    tracing::info!(target: "console_link::auth", "logged out");
    Ok(())
}

/// Where the pipeline sends the user once the session cannot be recovered.
pub trait LoginRedirect: Send + Sync {
    fn redirect_to_login(&self, reason: &str);
}

impl<F> LoginRedirect for F
where
    F: Fn(&str) + Send + Sync,
{
    fn redirect_to_login(&self, reason: &str) {
        (self)(reason)
    }
}

/// Redirect that only logs; used when no interactive surface is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRedirect;

impl LoginRedirect for LogRedirect {
    fn redirect_to_login(&self, reason: &str) {
        tracing::warn!(
            target: "console_link::auth",
            reason,
            "session expired; log in again"
        );
    }
}
