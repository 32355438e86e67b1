use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use console_link::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "console-link",
    about = "Authenticated API access and realtime subscriptions for the admin console",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "CONSOLE_API_URL",
        value_name = "URL",
        help = "Base URL of the console REST API"
    )]
    pub api_url: Option<String>,

    #[arg(
        long,
        global = true,
        env = "CONSOLE_WS_URL",
        value_name = "URL",
        help = "Realtime socket URL (derived from the API URL when omitted)"
    )]
    pub ws_url: Option<String>,

    #[arg(
        long,
        global = true,
        env = "CONSOLE_SESSION_FILE",
        value_name = "PATH",
        help = "Where the session tokens are stored"
    )]
    pub session_file: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "CONSOLE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "CONSOLE_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Exchange credentials for a session
    Login(LoginArgs),
    /// Forget the stored session
    Logout,
    /// Show the configured endpoints and whether a session is stored
    Status,
    /// Authenticated GET against an API path; prints the JSON body
    Get(GetArgs),
    /// Subscribe on the realtime channel and print messages as JSON lines
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
pub struct LoginArgs {
    #[arg(long, short = 'u', env = "CONSOLE_USERNAME")]
    pub username: String,

    #[arg(long, short = 'p', env = "CONSOLE_PASSWORD", hide_env_values = true)]
    pub password: String,
}

#[derive(Args, Debug)]
pub struct GetArgs {
    /// Path relative to the API base, e.g. `projects/42`
    pub path: String,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Subscription id, e.g. `tables_changes`
    pub subscription_id: String,

    #[arg(
        long,
        value_name = "JSON",
        help = "Subscription filter sent with the subscribe frame"
    )]
    pub filter: Option<String>,
}
