mod api;
mod auth;
mod config;
mod dates;
mod logging;
mod output;
mod realtime;

use std::io;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use dialoguer::Password;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::{ApiClient, ApiError};
use crate::auth::{AuthError, AuthStore};
use crate::config::Config;
use crate::output::{OutputError, OutputFormat, print_json};
use crate::realtime::{Controller, ErrorClass, SessionReport, StreamError, StreamOptions};

#[derive(Parser)]
#[command(
    name = "deskchat",
    version,
    about = "Deskchat CLI",
    after_help = "Examples:\n  deskchat auth login\n  deskchat doctor --json\n  deskchat events watch --all\n  deskchat events watch --chat-id abc --chat-id def --stop-after 5m\n  deskchat events watch --all --until tomorrow --json\n  deskchat events watch --chat-id abc --no-reconnect --plain"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, global = true, help = "Output JSON (one event per line when streaming)")]
    json: bool,

    #[arg(long, global = true, help = "Output tab separated values")]
    plain: bool,

    #[arg(short, long, global = true, help = "Log stream diagnostics to stderr")]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Manage the stored access token")]
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
    #[command(about = "Show the resolved configuration")]
    Doctor,
    #[command(about = "Stream live events")]
    Events {
        #[command(subcommand)]
        command: EventsCommand,
    },
}

#[derive(Subcommand)]
enum AuthCommand {
    #[command(about = "Verify and store an access token")]
    Login(AuthLoginArgs),
    #[command(about = "Clear the saved token")]
    Logout,
    #[command(about = "Show whether a token is available")]
    Status,
}

#[derive(Args)]
struct AuthLoginArgs {
    #[arg(long, help = "Access token (prompted for when omitted)")]
    token: Option<String>,
}

#[derive(Subcommand)]
enum EventsCommand {
    #[command(about = "Print events as they arrive, reconnecting when the stream drops")]
    Watch(EventsWatchArgs),
}

#[derive(Args)]
struct EventsWatchArgs {
    #[arg(
        long = "chat-id",
        value_name = "ID",
        action = ArgAction::Append,
        help = "Chat id to subscribe to (repeatable, \"*\" for all chats)"
    )]
    chat_ids: Vec<String>,

    #[arg(long, help = "Subscribe to every chat")]
    all: bool,

    #[arg(
        long,
        value_name = "DURATION",
        value_parser = dates::parse_duration,
        conflicts_with = "until",
        help = "Stop after this long (e.g. 30s, 5m, 2h)"
    )]
    stop_after: Option<Duration>,

    #[arg(long, value_name = "WHEN", help = "Stop at this time (e.g. 30m, tomorrow, 2026-01-27)")]
    until: Option<String>,

    #[arg(long, help = "Exit when the connection drops instead of reconnecting")]
    no_reconnect: bool,

    #[arg(long, value_name = "DURATION", value_parser = dates::parse_duration, help = "Wait between reconnect attempts")]
    reconnect_delay: Option<Duration>,

    #[arg(long, value_name = "DURATION", value_parser = dates::parse_duration, help = "Limit for connecting and subscribing")]
    handshake_timeout: Option<Duration>,

    #[arg(
        long,
        value_name = "DURATION",
        value_parser = dates::parse_duration,
        help = "Reconnect when no event arrives for this long"
    )]
    idle_timeout: Option<Duration>,

    #[arg(long, help = "Also print ready, subscriptions.updated and error events")]
    include_control: bool,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("no token found. Run `deskchat auth login` first.")]
    NotLoggedIn,
    #[error("token cannot be empty")]
    EmptyToken,
    #[error("invalid token: {0}. Nothing was stored.")]
    InvalidToken(ApiError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::Usage(_) | CliError::EmptyToken => 2,
            CliError::Stream(error) if error.class() == ErrorClass::Usage => 2,
            _ => 1,
        }
    }

    fn hint(&self) -> Option<&'static str> {
        match self {
            CliError::Stream(error) if error.class() == ErrorClass::Authentication => {
                Some("Run `deskchat auth login` to store a new token.")
            }
            CliError::Stream(error) if error.class() == ErrorClass::Capability => {
                Some("The server at DESKCHAT_BASE_URL does not offer live events.")
            }
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Err(error) = run(cli).await {
        eprintln!("{error}");
        if let Some(hint) = error.hint() {
            eprintln!("{hint}");
        }
        std::process::exit(error.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = Config::load().map_err(CliError::Usage)?;
    let auth_store = AuthStore::new(config.secrets_path.clone(), config.base_url.clone());
    let format = OutputFormat::resolve(cli.json, cli.plain);

    match cli.command {
        Command::Auth { command } => match command {
            AuthCommand::Login(args) => handle_login(args, &config, &auth_store).await,
            AuthCommand::Logout => {
                auth_store.clear_token()?;
                println!("Logged out.");
                Ok(())
            }
            AuthCommand::Status => handle_status(&auth_store, format),
        },
        Command::Doctor => handle_doctor(&config, &auth_store, format),
        Command::Events { command } => match command {
            EventsCommand::Watch(args) => handle_watch(args, &config, &auth_store, format).await,
        },
    }
}

async fn handle_login(args: AuthLoginArgs, config: &Config, auth_store: &AuthStore) -> Result<(), CliError> {
    let token = match args.token {
        Some(token) => token,
        None => Password::new().with_prompt("Access token").interact()?,
    };
    let token = token.trim();
    if token.is_empty() {
        return Err(CliError::EmptyToken);
    }

    let api = ApiClient::new(config.base_url.clone());
    let accounts = match api.list_accounts(token).await {
        Ok(accounts) => accounts,
        Err(error) if error.is_unauthorized() => return Err(CliError::InvalidToken(error)),
        Err(error) => return Err(error.into()),
    };
    auth_store.store_token(token)?;

    let networks: Vec<&str> = accounts
        .iter()
        .filter_map(|account| account.network.as_deref().or(account.account_id.as_deref()))
        .collect();
    if networks.is_empty() {
        println!("Logged in.");
    } else {
        println!("Logged in. Accounts: {}.", networks.join(", "));
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthStatus<'a> {
    logged_in: bool,
    source: Option<&'a str>,
    secrets_path: String,
}

fn handle_status(auth_store: &AuthStore, format: OutputFormat) -> Result<(), CliError> {
    let token = auth_store.load_token_with_source()?;
    let status = AuthStatus {
        logged_in: token.is_some(),
        source: token.as_ref().map(|(_, source)| source.as_str()),
        secrets_path: auth_store.path().display().to_string(),
    };

    if format == OutputFormat::Json {
        print_json(&status)?;
    } else if let Some(source) = status.source {
        println!("Logged in (token from {source}).");
    } else {
        println!("Not logged in. Run `deskchat auth login`.");
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DoctorReport {
    base_url: String,
    stream_url: Option<String>,
    data_dir: String,
    secrets_path: String,
    token_source: Option<&'static str>,
    reconnect_delay_ms: u128,
    handshake_timeout_ms: u128,
}

fn handle_doctor(config: &Config, auth_store: &AuthStore, format: OutputFormat) -> Result<(), CliError> {
    let token_source = auth_store
        .load_token_with_source()
        .unwrap_or_else(|error| {
            debug!(%error, "could not read the secrets file");
            None
        })
        .map(|(_, source)| source.as_str());
    let report = DoctorReport {
        base_url: config.base_url.clone(),
        stream_url: realtime::stream_url(&config.base_url).ok().map(|url| url.to_string()),
        data_dir: config.data_dir.display().to_string(),
        secrets_path: config.secrets_path.display().to_string(),
        token_source,
        reconnect_delay_ms: config.reconnect_delay.as_millis(),
        handshake_timeout_ms: config.handshake_timeout.as_millis(),
    };

    if format == OutputFormat::Json {
        print_json(&report)?;
        return Ok(());
    }

    println!("Base URL:          {}", report.base_url);
    println!(
        "Stream URL:        {}",
        report.stream_url.as_deref().unwrap_or("(unsupported base URL)")
    );
    println!("Data dir:          {}", report.data_dir);
    println!("Secrets:           {}", report.secrets_path);
    println!("Token:             {}", report.token_source.unwrap_or("none"));
    println!("Reconnect delay:   {}ms", report.reconnect_delay_ms);
    println!("Handshake timeout: {}ms", report.handshake_timeout_ms);
    Ok(())
}

async fn handle_watch(
    args: EventsWatchArgs,
    config: &Config,
    auth_store: &AuthStore,
    format: OutputFormat,
) -> Result<(), CliError> {
    let subscriptions = realtime::resolve(args.all, &args.chat_ids).map_err(StreamError::from)?;

    let stop_deadline = match (args.stop_after, args.until.as_deref()) {
        (Some(_), Some(_)) => {
            return Err(CliError::Usage("--stop-after cannot be combined with --until".to_string()));
        }
        (Some(after), None) => Instant::now().checked_add(after),
        (None, Some(until)) => {
            let at = dates::parse_deadline(until, Utc::now()).map_err(CliError::Usage)?;
            instant_at(at, Utc::now())
        }
        (None, None) => None,
    };

    let options = StreamOptions {
        stop_deadline,
        reconnect: !args.no_reconnect,
        reconnect_delay: args.reconnect_delay.unwrap_or(config.reconnect_delay),
        handshake_timeout: args.handshake_timeout.unwrap_or(config.handshake_timeout),
        idle_timeout: args.idle_timeout,
        include_control: args.include_control,
    };
    options.validate().map_err(StreamError::from)?;

    let token = auth_store.load_token()?.ok_or(CliError::NotLoggedIn)?;

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("interrupted");
                cancel.cancel();
            }
        })
    };

    let controller = Controller::new(config.base_url.clone(), token, subscriptions, options, cancel);
    let mut sink = output::event_sink(format, io::stdout());
    let outcome = controller.run(sink.as_mut()).await;
    interrupt.abort();

    let report = outcome?;
    if format == OutputFormat::Human {
        eprintln!("{}", session_summary(&report));
    }
    Ok(())
}

fn session_summary(report: &SessionReport) -> String {
    let connections = if report.connects == 1 { "connection" } else { "connections" };
    let events = if report.events == 1 { "event" } else { "events" };
    format!(
        "Stream ended after {} {connections} and {} {events}.",
        report.connects, report.events
    )
}

/// Maps a wall-clock deadline onto the monotonic clock. Times already past
/// map to now. `None` when the deadline is too far out to represent.
fn instant_at(at: DateTime<Utc>, now: DateTime<Utc>) -> Option<Instant> {
    let remaining = (at - now).to_std().unwrap_or(Duration::ZERO);
    Instant::now().checked_add(remaining)
}
