use crate::api::error::{ApiError, RefreshFailure};
use crate::config::ClientConfig;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

pub const LOGIN_PATH: &str = "auth/login";
pub const REFRESH_PATH: &str = "auth/refresh";

/// Client for the two credential endpoints. Neither call goes through the
/// 401 retry logic.
#[derive(Debug, Clone)]
pub struct AuthGateClient {
    client: Client,
    config: ClientConfig,
}

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    /// Present only when the server rotates refresh tokens.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    detail: Option<Value>,
}

impl AuthGateClient {
    pub fn new(client: Client, config: ClientConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn login_url(&self) -> Result<Url, ApiError> {
        endpoint(&self.config.api_url, LOGIN_PATH)
    }

    pub fn refresh_url(&self) -> Result<Url, ApiError> {
        endpoint(&self.config.api_url, REFRESH_PATH)
    }

    /// True for the login and refresh endpoints, whose 401s must never
    /// trigger another refresh.
    pub fn is_auth_endpoint(&self, url: &Url) -> bool {
        [LOGIN_PATH, REFRESH_PATH].iter().any(|path| {
            endpoint(&self.config.api_url, path)
                .map(|auth| auth.path() == url.path())
                .unwrap_or(false)
        })
    }

    fn with_api_key(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.header(self.config.api_key_header.as_str(), key),
            None => builder,
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let url = self.login_url()?;
        let response = self
            .with_api_key(self.client.post(url))
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;

        if response.status().is_success() {
            return response
                .json()
                .await
                .map_err(|err| ApiError::Decode(err.to_string()));
        }

        let status = response.status();
        Err(ApiError::Status {
            status,
            detail: error_detail(response).await,
        })
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, RefreshFailure> {
        #[derive(Serialize)]
        struct RefreshRequest<'a> {
            refresh_token: &'a str,
        }

        let url = self
            .refresh_url()
            .map_err(|err| RefreshFailure::Transport(err.to_string()))?;
        let response = self
            .with_api_key(self.client.post(url))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|err| RefreshFailure::Transport(err.to_string()))?;

        if response.status().is_success() {
            return response
                .json()
                .await
                .map_err(|err| RefreshFailure::Transport(err.to_string()));
        }

        let status = response.status();
        Err(RefreshFailure::Rejected {
            status: status.as_u16(),
            detail: error_detail(response).await,
        })
    }
}

pub(crate) fn endpoint(base: &Url, path: &str) -> Result<Url, ApiError> {
    base.join(path.trim_start_matches('/'))
        .map_err(|err| ApiError::InvalidPath {
            path: path.to_string(),
            reason: err.to_string(),
        })
}

pub(crate) async fn error_detail(response: Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let body: ErrorBody = serde_json::from_str(&text).unwrap_or(ErrorBody {
        error: None,
        detail: Some(Value::String(text.clone())),
    });
    let detail = match body.detail {
        Some(Value::String(detail)) => Some(detail),
        Some(other) => Some(other.to_string()),
        None => None,
    };
    detail
        .filter(|detail| !detail.is_empty())
        .or(body.error)
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string()
        })
}

pub(crate) fn is_unauthorized(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(api: &str) -> AuthGateClient {
        let config = ClientConfig::for_server(api, "session.toml".into()).unwrap();
        AuthGateClient::new(Client::new(), config)
    }

    #[test]
    fn auth_endpoints_live_under_the_api_prefix() {
        let gate = gate("http://localhost:8000/api/v1");
        assert_eq!(
            gate.login_url().unwrap().as_str(),
            "http://localhost:8000/api/v1/auth/login"
        );
        assert_eq!(
            gate.refresh_url().unwrap().as_str(),
            "http://localhost:8000/api/v1/auth/refresh"
        );
    }

    #[test]
    fn recognises_auth_endpoints_only() {
        let gate = gate("http://localhost:8000/api/v1/");
        let refresh = Url::parse("http://localhost:8000/api/v1/auth/refresh").unwrap();
        let login = Url::parse("http://localhost:8000/api/v1/auth/login?next=x").unwrap();
        let tables = Url::parse("http://localhost:8000/api/v1/tables").unwrap();
        assert!(gate.is_auth_endpoint(&refresh));
        assert!(gate.is_auth_endpoint(&login));
        assert!(!gate.is_auth_endpoint(&tables));
    }
}
