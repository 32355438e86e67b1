use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error on {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("serialization error: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for SessionError {
    fn from(value: toml::de::Error) -> Self {
        SessionError::Toml(value.to_string())
    }
}

impl From<toml::ser::Error> for SessionError {
    fn from(value: toml::ser::Error) -> Self {
        SessionError::Toml(value.to_string())
    }
}
