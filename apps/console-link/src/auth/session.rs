use crate::auth::error::SessionError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// The access/refresh token pair for the signed-in user.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl Session {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token: Some(refresh_token.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Shared home of the current [`Session`].
///
/// Reads are served from memory so the realtime channel and the HTTP pipeline
/// never block on disk; writes go through to whatever backs the store.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Session;
    fn save(&self, session: Session) -> Result<(), SessionError>;
    fn set_access_token(&self, token: String) -> Result<(), SessionError>;
    fn clear(&self) -> Result<(), SessionError>;

    fn access_token(&self) -> Option<String> {
        self.load().access_token
    }

    fn refresh_token(&self) -> Option<String> {
        self.load().refresh_token
    }
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    session: RwLock<Session>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            session: RwLock::new(session),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Session {
        self.session.read().clone()
    }

    fn save(&self, session: Session) -> Result<(), SessionError> {
        *self.session.write() = session;
        Ok(())
    }

    fn set_access_token(&self, token: String) -> Result<(), SessionError> {
        self.session.write().access_token = Some(token);
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        *self.session.write() = Session::default();
        Ok(())
    }
}

/// On-disk layout. Key names match the browser storage keys the console web
/// client uses.
#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(
        rename = "refreshToken",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    refresh_token: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    updated_at: OffsetDateTime,
}

/// Session store persisted as a TOML file, so a login survives restarts.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    cached: RwLock<Session>,
}

impl FileSessionStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let path = path.into();
        let cached = match fs::read_to_string(&path) {
            Ok(contents) => {
                let file: SessionFile = toml::from_str(&contents)?;
                Session {
                    access_token: file.token,
                    refresh_token: file.refresh_token,
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Session::default(),
            Err(source) => return Err(SessionError::Io { path, source }),
        };
        Ok(Self {
            path,
            cached: RwLock::new(cached),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, session: &Session) -> Result<(), SessionError> {
        let file = SessionFile {
            token: session.access_token.clone(),
            refresh_token: session.refresh_token.clone(),
            updated_at: OffsetDateTime::now_utc(),
        };
        let contents = toml::to_string_pretty(&file)?;
        write_atomically(&self.path, contents.as_bytes()).map_err(|source| SessionError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Session {
        self.cached.read().clone()
    }

    fn save(&self, session: Session) -> Result<(), SessionError> {
        let mut guard = self.cached.write();
        self.persist(&session)?;
        *guard = session;
        Ok(())
    }

    fn set_access_token(&self, token: String) -> Result<(), SessionError> {
        let mut guard = self.cached.write();
        let mut next = guard.clone();
        next.access_token = Some(token);
        self.persist(&next)?;
        *guard = next;
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        let mut guard = self.cached.write();
        *guard = Session::default();
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(SessionError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        }
        tracing::debug!(
            target: "console_link::session",
            path = %self.path.display(),
            "cleared persisted session"
        );
        Ok(())
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("toml.tmp");
    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    fs::rename(&tmp, path)
}
