pub mod logging {
    use clap::ValueEnum;
    use std::fs::{File, OpenOptions};
    use std::path::{Path, PathBuf};
    use std::sync::OnceLock;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    /// Full `EnvFilter` directive string; replaces everything derived from
    /// the level.
    pub const FILTER_ENV: &str = "CONSOLE_LOG_FILTER";
    /// Keeps HTTP and websocket crates at the requested verbosity under
    /// `--log-level trace`.
    pub const TRACE_DEPS_ENV: &str = "CONSOLE_TRACE_DEPS";

    const OWN_TARGETS: &[&str] = &["console_link", "realtime_proto"];
    const NOISY_DEPENDENCIES: &[&str] = &[
        "hyper",
        "hyper_util",
        "h2",
        "mio",
        "reqwest",
        "rustls",
        "tokio_tungstenite",
        "tungstenite",
    ];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        fn as_directive(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        /// Appends to this file instead of writing to stderr.
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    /// Directives handed to `EnvFilter`, plus whether dependency output was
    /// capped so the caller can say so once logging is live.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct LogFilter {
        pub directives: String,
        pub quieted_dependencies: bool,
    }

    impl LogFilter {
        fn from_env(level: LogLevel) -> Self {
            let verbose_deps = std::env::var(TRACE_DEPS_ENV)
                .map(|value| !value.is_empty() && value != "0")
                .unwrap_or(false);
            Self::resolve(level, std::env::var(FILTER_ENV).ok(), verbose_deps)
        }

        pub(crate) fn resolve(
            level: LogLevel,
            override_directives: Option<String>,
            verbose_deps: bool,
        ) -> Self {
            if let Some(directives) = override_directives.filter(|d| !d.trim().is_empty()) {
                return Self {
                    directives,
                    quieted_dependencies: false,
                };
            }

            // Below debug every target shares one level.
            if level < LogLevel::Debug {
                return Self {
                    directives: level.as_directive().to_owned(),
                    quieted_dependencies: false,
                };
            }

            let mut directives = vec!["info".to_owned()];
            directives.extend(
                OWN_TARGETS
                    .iter()
                    .map(|target| format!("{target}={}", level.as_directive())),
            );
            let quieted_dependencies = level == LogLevel::Trace && !verbose_deps;
            if quieted_dependencies {
                directives.extend(NOISY_DEPENDENCIES.iter().map(|dep| format!("{dep}=info")));
            }
            Self {
                directives: directives.join(","),
                quieted_dependencies,
            }
        }
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let filter = LogFilter::from_env(config.level);
        let (writer, guard) = match &config.file {
            Some(path) => tracing_appender::non_blocking(open_append(path)?),
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(&filter.directives))
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level == LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;
        let _ = GUARD.set(guard);

        if filter.quieted_dependencies {
            tracing::debug!(
                target: "console_link::telemetry",
                "http and websocket crates capped at info; set {TRACE_DEPS_ENV}=1 or {FILTER_ENV} to lift"
            );
        }
        Ok(())
    }

    fn open_append(path: &Path) -> Result<File, InitError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| InitError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

}
