use crate::api::error::{ApiError, RefreshFailure};
use crate::api::refresh::{Admission, RefreshGate, RefreshOutcome};
use crate::auth::gate::{self, AuthGateClient, LoginResponse};
use crate::auth::session::{Session, SessionStore};
use crate::auth::{self, LogRedirect, LoginRedirect};
use crate::config::ClientConfig;
use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, Request, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Authenticated HTTP pipeline.
///
/// Every request gets the API key and the current bearer token attached. A
/// 401 on anything but the auth endpoints triggers at most one token refresh
/// for the whole client, after which the request is replayed exactly once
/// with the new token.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: Client,
    gate: AuthGateClient,
    api_key: Option<(HeaderName, HeaderValue)>,
    session: Arc<dyn SessionStore>,
    refresh: Arc<RefreshGate>,
    redirect: Arc<dyn LoginRedirect>,
}

pub struct ApiClientBuilder {
    config: ClientConfig,
    session: Arc<dyn SessionStore>,
    http: Option<Client>,
    redirect: Arc<dyn LoginRedirect>,
}

impl ApiClientBuilder {
    pub fn http_client(mut self, client: Client) -> Self {
        self.http = Some(client);
        self
    }

    pub fn redirect(mut self, redirect: impl LoginRedirect + 'static) -> Self {
        self.redirect = Arc::new(redirect);
        self
    }

    pub fn build(self) -> Result<ApiClient, ApiError> {
        let http = match self.http {
            Some(client) => client,
            None => Client::builder().timeout(REQUEST_TIMEOUT).build()?,
        };

        let api_key = match &self.config.api_key {
            Some(key) => {
                let name = HeaderName::from_bytes(self.config.api_key_header.as_bytes())
                    .map_err(|_| ApiError::InvalidHeader(self.config.api_key_header.clone()))?;
                let mut value = HeaderValue::from_str(key)
                    .map_err(|_| ApiError::InvalidHeader(self.config.api_key_header.clone()))?;
                value.set_sensitive(true);
                Some((name, value))
            }
            None => None,
        };

        Ok(ApiClient {
            inner: Arc::new(Inner {
                gate: AuthGateClient::new(http.clone(), self.config),
                http,
                api_key,
                session: self.session,
                refresh: RefreshGate::new(),
                redirect: self.redirect,
            }),
        })
    }
}

impl ApiClient {
    pub fn builder(config: ClientConfig, session: Arc<dyn SessionStore>) -> ApiClientBuilder {
        ApiClientBuilder {
            config,
            session,
            http: None,
            redirect: Arc::new(LogRedirect),
        }
    }

    pub fn new(config: ClientConfig, session: Arc<dyn SessionStore>) -> Result<Self, ApiError> {
        Self::builder(config, session).build()
    }

    pub fn config(&self) -> &ClientConfig {
        self.inner.gate.config()
    }

    pub fn session(&self) -> &Arc<dyn SessionStore> {
        &self.inner.session
    }

    pub fn refresh_in_flight(&self) -> bool {
        self.inner.refresh.is_refreshing()
    }

    pub fn url(&self, path: &str) -> Result<Url, ApiError> {
        gate::endpoint(&self.config().api_url, path)
    }

    /// Starts a request against `path`, relative to the API base. Send it with
    /// [`ApiClient::send`] so it goes through the pipeline.
    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        Ok(self.inner.http.request(method, self.url(path)?))
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ApiError> {
        auth::login(
            &self.inner.gate,
            self.inner.session.as_ref(),
            username,
            password,
        )
        .await
    }

    pub fn logout(&self) -> Result<(), ApiError> {
        auth::logout(self.inner.session.as_ref())?;
        Ok(())
    }

    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, ApiError> {
        self.execute(builder.build()?).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.send(self.request(Method::GET, path)?).await?;
        decode(response).await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .send(self.request(Method::POST, path)?.json(body))
            .await?;
        decode(response).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(self.request(Method::DELETE, path)?).await?;
        Ok(())
    }

    /// Runs `request` through the pipeline. Non-success statuses come back as
    /// [`ApiError::Status`]; a 401 is only surfaced once refreshing has been
    /// tried or is not applicable.
    pub async fn execute(&self, request: Request) -> Result<Response, ApiError> {
        // Streaming bodies cannot be cloned; such requests get no replay.
        let replay = request.try_clone();
        let target = request.url().clone();
        let sent_token = self.inner.session.access_token();

        let response = self.dispatch(request, sent_token.as_deref()).await?;
        if !gate::is_unauthorized(response.status()) || self.inner.gate.is_auth_endpoint(&target)
        {
            return check_status(response).await;
        }
        let Some(replay) = replay else {
            return check_status(response).await;
        };

        tracing::debug!(
            target: "console_link::api",
            url = %target,
            "request unauthorized; awaiting fresh credentials"
        );
        let token = self.fresh_token(sent_token.as_deref()).await?;

        // The replay is the retry: its outcome is final, 401 included.
        let response = self.dispatch(replay, Some(&token)).await?;
        check_status(response).await
    }

    fn authorize(&self, request: &mut Request, token: Option<&str>) -> Result<(), ApiError> {
        let headers = request.headers_mut();
        if let Some((name, value)) = &self.inner.api_key {
            headers.insert(name.clone(), value.clone());
        }
        match token {
            Some(token) => {
                let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| ApiError::InvalidHeader(AUTHORIZATION.to_string()))?;
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
            None => {
                headers.remove(AUTHORIZATION);
            }
        }
        Ok(())
    }

    async fn dispatch(&self, mut request: Request, token: Option<&str>) -> Result<Response, ApiError> {
        self.authorize(&mut request, token)?;
        Ok(self.inner.http.execute(request).await?)
    }

    async fn fresh_token(&self, stale: Option<&str>) -> Result<String, ApiError> {
        let leader = match self.inner.refresh.admit() {
            Admission::Follower(rx) => {
                let outcome = rx.await.unwrap_or_else(|_| {
                    Err(RefreshFailure::Transport("token refresh was abandoned".into()))
                });
                return outcome.map_err(ApiError::from);
            }
            Admission::Leader(leader) => leader,
        };

        // Another request already rotated the token after this one was sent.
        if let Some(current) = self.inner.session.access_token() {
            if stale != Some(current.as_str()) {
                leader.settle(Ok(current.clone()));
                return Ok(current);
            }
        }

        tracing::info!(target: "console_link::api", "refreshing access token");
        let outcome = self.refresh_session().await;
        match &outcome {
            Ok(_) => {
                let replayed = leader.settle(outcome.clone());
                tracing::info!(
                    target: "console_link::api",
                    replayed,
                    "access token refreshed"
                );
            }
            Err(failure) => {
                if let Err(err) = self.inner.session.clear() {
                    tracing::warn!(
                        target: "console_link::api",
                        error = %err,
                        "failed to clear session after refresh failure"
                    );
                }
                let rejected = leader.settle(outcome.clone());
                tracing::warn!(
                    target: "console_link::api",
                    error = %failure,
                    rejected,
                    "token refresh failed; session cleared"
                );
                self.inner.redirect.redirect_to_login(&failure.to_string());
            }
        }
        outcome.map_err(ApiError::from)
    }

    async fn refresh_session(&self) -> RefreshOutcome {
        let refresh_token = self
            .inner
            .session
            .refresh_token()
            .ok_or(RefreshFailure::MissingRefreshToken)?;
        let tokens = self.inner.gate.refresh(&refresh_token).await?;

        let stored = match tokens.refresh_token {
            Some(rotated) => self.inner.session.save(Session {
                access_token: Some(tokens.access_token.clone()),
                refresh_token: Some(rotated),
            }),
            None => self
                .inner
                .session
                .set_access_token(tokens.access_token.clone()),
        };
        stored.map_err(|err| RefreshFailure::Store(err.to_string()))?;
        Ok(tokens.access_token)
    }
}

async fn check_status(response: Response) -> Result<Response, ApiError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    Err(ApiError::Status {
        status,
        detail: gate::error_detail(response).await,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    response
        .json()
        .await
        .map_err(|err| ApiError::Decode(err.to_string()))
}
