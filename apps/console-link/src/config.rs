use directories::ProjectDirs;
use std::env;
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8000/api/v1/";
const DEFAULT_API_KEY_HEADER: &str = "apikey";
const SESSION_FILE_NAME: &str = "session.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {var}: {reason}")]
    InvalidUrl { var: &'static str, reason: String },
    #[error("unable to determine a config directory; set CONSOLE_SESSION_FILE")]
    NoConfigDir,
}

/// Endpoints and credentials shared by the HTTP pipeline and the realtime
/// channel.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base for every REST path. Always ends with `/` so relative joins keep
    /// the version prefix.
    pub api_url: Url,
    pub ws_url: Url,
    pub api_key: Option<String>,
    pub api_key_header: String,
    pub session_file: PathBuf,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_url = env::var("CONSOLE_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let api_url = parse_base_url("CONSOLE_API_URL", &api_url)?;

        let ws_url = match non_empty_var("CONSOLE_WS_URL") {
            Some(raw) => Url::parse(&raw).map_err(|err| ConfigError::InvalidUrl {
                var: "CONSOLE_WS_URL",
                reason: err.to_string(),
            })?,
            None => derive_ws_url(&api_url)?,
        };

        let session_file = match non_empty_var("CONSOLE_SESSION_FILE") {
            Some(path) => PathBuf::from(path),
            None => default_session_file()?,
        };

        Ok(Self {
            api_url,
            ws_url,
            api_key: non_empty_var("CONSOLE_API_KEY"),
            api_key_header: non_empty_var("CONSOLE_API_KEY_HEADER")
                .unwrap_or_else(|| DEFAULT_API_KEY_HEADER.to_string()),
            session_file,
        })
    }

    /// Builds a config for an explicit server, bypassing the environment.
    pub fn for_server(api_url: &str, session_file: PathBuf) -> Result<Self, ConfigError> {
        let api_url = parse_base_url("api url", api_url)?;
        let ws_url = derive_ws_url(&api_url)?;
        Ok(Self {
            api_url,
            ws_url,
            api_key: None,
            api_key_header: DEFAULT_API_KEY_HEADER.to_string(),
            session_file,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Replaces the API base and re-derives the websocket url from it.
    pub fn with_api_url(mut self, api_url: &str) -> Result<Self, ConfigError> {
        self.api_url = parse_base_url("api url", api_url)?;
        self.ws_url = derive_ws_url(&self.api_url)?;
        Ok(self)
    }

    pub fn with_ws_url(mut self, ws_url: &str) -> Result<Self, ConfigError> {
        self.ws_url = Url::parse(ws_url).map_err(|err| ConfigError::InvalidUrl {
            var: "ws url",
            reason: err.to_string(),
        })?;
        Ok(self)
    }

    pub fn with_session_file(mut self, session_file: impl Into<PathBuf>) -> Self {
        self.session_file = session_file.into();
        self
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

pub(crate) fn parse_base_url(var: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(raw).map_err(|err| ConfigError::InvalidUrl {
        var,
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl {
            var,
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// `http(s)://host/api/v1/` becomes `ws(s)://host/api/v1/ws`.
fn derive_ws_url(api_url: &Url) -> Result<Url, ConfigError> {
    let mut ws_url = api_url.join("ws").map_err(|err| ConfigError::InvalidUrl {
        var: "CONSOLE_WS_URL",
        reason: err.to_string(),
    })?;
    let scheme = if api_url.scheme() == "https" {
        "wss"
    } else {
        "ws"
    };
    ws_url
        .set_scheme(scheme)
        .map_err(|_| ConfigError::InvalidUrl {
            var: "CONSOLE_WS_URL",
            reason: format!("cannot derive websocket url from {api_url}"),
        })?;
    Ok(ws_url)
}

fn default_session_file() -> Result<PathBuf, ConfigError> {
    let dirs = ProjectDirs::from("dev", "console", "console-link").ok_or(ConfigError::NoConfigDir)?;
    Ok(dirs.config_dir().join(SESSION_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;

    static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    #[test]
    fn websocket_url_follows_api_scheme() {
        let config = ClientConfig::for_server("https://admin.example.com/api/v1", "s.toml".into())
            .unwrap();
        assert_eq!(config.api_url.as_str(), "https://admin.example.com/api/v1/");
        assert_eq!(config.ws_url.as_str(), "wss://admin.example.com/api/v1/ws");

        let local = ClientConfig::for_server("http://127.0.0.1:8000/", "s.toml".into()).unwrap();
        assert_eq!(local.ws_url.as_str(), "ws://127.0.0.1:8000/ws");
    }

    #[test]
    fn explicit_ws_url_survives_only_when_applied_last() {
        let config = ClientConfig::for_server("http://a.test/", "s.toml".into())
            .unwrap()
            .with_ws_url("ws://push.test/socket")
            .unwrap();
        assert_eq!(config.ws_url.as_str(), "ws://push.test/socket");

        let config = config.with_api_url("https://b.test/v2").unwrap();
        assert_eq!(config.api_url.as_str(), "https://b.test/v2/");
        assert_eq!(config.ws_url.as_str(), "wss://b.test/v2/ws");
    }

    #[test]
    fn rejects_non_http_api_urls() {
        let err = ClientConfig::for_server("ftp://example.com", "s.toml".into()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));
    }

    #[test]
    fn env_overrides_are_applied() {
        let _lock = ENV_MUTEX.lock().unwrap();
        env::set_var("CONSOLE_API_URL", "https://console.test/api");
        env::set_var("CONSOLE_WS_URL", "wss://push.console.test/socket");
        env::set_var("CONSOLE_API_KEY", "anon-key");
        env::set_var("CONSOLE_SESSION_FILE", "/tmp/console-session.toml");

        let config = ClientConfig::from_env().unwrap();
        assert_eq!(config.api_url.as_str(), "https://console.test/api/");
        assert_eq!(config.ws_url.as_str(), "wss://push.console.test/socket");
        assert_eq!(config.api_key.as_deref(), Some("anon-key"));
        assert_eq!(config.api_key_header, "apikey");
        assert_eq!(config.session_file, PathBuf::from("/tmp/console-session.toml"));

        for var in [
            "CONSOLE_API_URL",
            "CONSOLE_WS_URL",
            "CONSOLE_API_KEY",
            "CONSOLE_SESSION_FILE",
        ] {
            env::remove_var(var);
        }
    }
}
