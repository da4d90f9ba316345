//! universe - command-line client for the universe platform.
//!
//! Exercises the authenticated session end to end: inspect the supplied
//! tokens, trade the refresh token for a new access token, or send a GET or
//! POST and print the decrypted data.
//!
//! Tokens are taken from `--access`/`--refresh` or from
//! `UNIVERSE_ACCESS_TOKEN`/`UNIVERSE_REFRESH_TOKEN`. Everything else comes
//! from the config file and `UNIVERSE_*` overrides.

use std::io;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use universe_core::{ApiError, Config, Credential, Payload, Session};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(after_help = "Field values are parsed as JSON when possible (planet_id=34, flag=true), \
otherwise sent as strings. Set RUST_LOG to control log output.")]
struct Cli {
    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Access token
    #[arg(long, env = "UNIVERSE_ACCESS_TOKEN", hide_env_values = true, global = true)]
    access: Option<String>,

    /// Refresh token
    #[arg(long, env = "UNIVERSE_REFRESH_TOKEN", hide_env_values = true, global = true)]
    refresh: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Show the identity and expiry of the tokens
    Whoami,
    /// Exchange the refresh token and print the new access token
    Refresh,
    /// Send a GET with the given query fields
    Get {
        path: String,
        /// Query fields as key=value
        #[arg(value_parser = parse_field)]
        query: Vec<(String, Value)>,
    },
    /// Send a POST with query and body fields
    Post {
        path: String,
        /// Query fields as key=value
        #[arg(value_parser = parse_field)]
        query: Vec<(String, Value)>,
        /// Body fields as key=value
        #[arg(long, value_parser = parse_field, num_args = 1..)]
        body: Vec<(String, Value)>,
    },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(quiet: bool) {
    // RUST_LOG wins; otherwise warnings, or only errors with --quiet
    let fallback = if quiet { "error" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.quiet);

    let access = cli.access.unwrap_or_default();
    let refresh = cli.refresh.unwrap_or_default();

    let result = match cli.command {
        Command::Whoami => {
            whoami(&access, &refresh);
            return Ok(ExitCode::SUCCESS);
        }
        Command::Refresh => {
            let (_, session) = connect(&access, &refresh).await?;
            session.refresh().await?;
            println!("{}", session.access().raw());
            return Ok(ExitCode::SUCCESS);
        }
        Command::Get { path, query } => {
            let (config, session) = connect(&access, &refresh).await?;
            session.get(&config.endpoint(&path), &payload(query)).await
        }
        Command::Post { path, query, body } => {
            let (config, session) = connect(&access, &refresh).await?;
            let (query, body) = (payload(query), payload(body));
            session.post(&config.endpoint(&path), &query, &body).await
        }
    };

    Ok(report(result))
}

async fn connect(access: &str, refresh: &str) -> Result<(Config, Session)> {
    let config = Config::load().context("Failed to load configuration")?;
    let session = Session::connect(&config, access, refresh).await?;
    info!(identity = %session.identity(), "Session ready");
    Ok((config, session))
}

fn whoami(access: &str, refresh: &str) {
    for (kind, raw) in [("access", access), ("refresh", refresh)] {
        if raw.is_empty() {
            println!("{:<8} (not set)", kind);
            continue;
        }
        match raw.parse::<Credential>() {
            Ok(cred) => println!(
                "{:<8} {} type={} expires_in={}s{}",
                kind,
                cred.identity(),
                cred.token_type().as_str(),
                cred.seconds_until_expiry(),
                if cred.is_expired() { " (expired)" } else { "" }
            ),
            Err(e) => println!("{:<8} invalid: {}", kind, e),
        }
    }
}

fn report(result: Result<Value, ApiError>) -> ExitCode {
    match result {
        Ok(data) => {
            match serde_json::to_string_pretty(&data) {
                Ok(json) => println!("{}", json),
                Err(_) => println!("{}", data),
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("[{}] {}", err.code(), err);
            if let Some(detail) = err.diagnostic() {
                eprintln!("{}", detail);
            }
            ExitCode::FAILURE
        }
    }
}

/// Parse a `key=value` field. The value is taken as JSON when it parses,
/// otherwise as a plain string.
fn parse_field(field: &str) -> Result<(String, Value), String> {
    let (key, value) = field
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", field))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", field));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn payload(fields: Vec<(String, Value)>) -> Payload {
    fields.into_iter().collect()
}
