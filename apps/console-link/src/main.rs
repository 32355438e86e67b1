mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Command, GetArgs, LoginArgs, WatchArgs};
use console_link::api::ApiClient;
use console_link::auth::session::SessionStore;
use console_link::auth::FileSessionStore;
use console_link::config::ClientConfig;
use console_link::realtime::{ChannelOptions, RealtimeChannel};
use console_link::telemetry::logging;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialise logging")?;

    let config = resolve_config(&cli)?;
    let store = Arc::new(
        FileSessionStore::open(&config.session_file)
            .with_context(|| format!("failed to open session file {}", config.session_file.display()))?,
    );

    match cli.command {
        Command::Login(args) => login(config, store, args).await,
        Command::Logout => {
            store.clear()?;
            println!("logged out");
            Ok(())
        }
        Command::Status => status(&config, store.as_ref()),
        Command::Get(args) => get(config, store, args).await,
        Command::Watch(args) => watch(config, store, args).await,
    }
}

fn resolve_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = ClientConfig::from_env()?;
    if let Some(api_url) = &cli.api_url {
        config = config.with_api_url(api_url)?;
    }
    if let Some(ws_url) = &cli.ws_url {
        config = config.with_ws_url(ws_url)?;
    }
    if let Some(path) = &cli.session_file {
        config = config.with_session_file(path.clone());
    }
    Ok(config)
}

async fn login(config: ClientConfig, store: Arc<FileSessionStore>, args: LoginArgs) -> Result<()> {
    let client = ApiClient::new(config, store)?;
    let tokens = client
        .login(&args.username, &args.password)
        .await
        .context("login failed")?;
    println!(
        "logged in as {} ({} token)",
        args.username,
        tokens.token_type.as_deref().unwrap_or("bearer")
    );
    Ok(())
}

fn status(config: &ClientConfig, store: &FileSessionStore) -> Result<()> {
    let session = store.load();
    println!("api:      {}", config.api_url);
    println!("realtime: {}", config.ws_url);
    println!("session:  {}", store.path().display());
    println!(
        "access token:  {}",
        if session.access_token.is_some() { "stored" } else { "none" }
    );
    println!(
        "refresh token: {}",
        if session.refresh_token.is_some() { "stored" } else { "none" }
    );
    Ok(())
}

async fn get(config: ClientConfig, store: Arc<FileSessionStore>, args: GetArgs) -> Result<()> {
    let client = ApiClient::new(config, store)?;
    let body: Value = client.get_json(&args.path).await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn watch(config: ClientConfig, store: Arc<FileSessionStore>, args: WatchArgs) -> Result<()> {
    let filter = match &args.filter {
        Some(raw) => serde_json::from_str(raw).context("--filter is not valid JSON")?,
        None => Value::Null,
    };
    let Some(token) = store.access_token() else {
        bail!("no stored session; run `console-link login` first");
    };

    let channel = RealtimeChannel::spawn(
        ChannelOptions::new(config.ws_url.clone()).session(store.clone()),
    );
    let _listener = channel.add_listener(&args.subscription_id, |frame| {
        println!("{frame}");
    });

    let mut states = channel.state_changes();
    let state_log = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            info!(target: "console_link::watch", %state, "connection state");
        }
    });

    channel.subscribe(args.subscription_id.as_str(), filter)?;
    channel.connect(token)?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    channel.disconnect().await?;
    state_log.abort();
    Ok(())
}
