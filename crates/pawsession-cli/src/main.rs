//! pawsession - command-line session tool for the pet-services dashboard.
//!
//! Logs in against the clinic backend, keeps the tokens in the same
//! redundant stores the dashboard uses, and lets you poke authorized
//! endpoints with automatic token renewal.

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use pawsession_core::{Config, SessionContext};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

/// How often `keepalive` prints the session status
const KEEPALIVE_STATUS_INTERVAL_SECS: u64 = 60;

const LOG_FILE_PREFIX: &str = "pawsession.log";

const USAGE: &str = "\
Usage: pawsession [--log-file DIR] <command> [args]

Commands:
  login [email]     Log in (prompts for the password)
  whoami            Restore the session and show the current user
  status            Show the session state as JSON
  refresh           Renew the access token now
  validate          Ask the server whether the token is valid
  get <path>        Authorized GET of an API path, printed as JSON
  keepalive         Keep the session renewed until Ctrl+C
  logout            Log out and clear stored tokens
";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr; with `log_dir` they also go to a daily rolling file.
/// The returned guard must live until exit so buffered lines are flushed.
fn init_tracing(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

/// Pull `--log-file DIR` out of the argument list
fn take_log_dir(args: &mut Vec<String>) -> Result<Option<PathBuf>> {
    match args.iter().position(|a| a == "--log-file") {
        Some(i) => {
            if i + 1 >= args.len() {
                anyhow::bail!("--log-file needs a directory");
            }
            let dir = args.remove(i + 1);
            args.remove(i);
            Ok(Some(PathBuf::from(dir)))
        }
        None => Ok(None),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let log_dir = take_log_dir(&mut args)?;
    let _log_guard = init_tracing(log_dir.as_ref());

    let Some(command) = args.first().cloned() else {
        eprint!("{}", USAGE);
        return Ok(());
    };

    let mut config = Config::load().context("Failed to load config")?;
    info!(api_url = %config.api_url, command = %command, "pawsession starting");
    let session = SessionContext::from_config(&config)?;

    match command.as_str() {
        "login" => login(&session, &mut config, args.get(1).cloned()).await,
        "whoami" => whoami(&session).await,
        "status" => status(&session).await,
        "refresh" => refresh(&session).await,
        "validate" => validate(&session).await,
        "get" => {
            let path = args.get(1).context("get needs an API path")?;
            get(&session, path).await
        }
        "keepalive" => keepalive(&session).await,
        "logout" => {
            session.logout().await;
            println!("Logged out");
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print!("{}", USAGE);
            Ok(())
        }
        other => {
            eprint!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

async fn login(session: &SessionContext, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    let password = rpassword::prompt_password(format!("Password for {}: ", email))?;

    let user = session.login(&email, &password).await?;

    config.last_email = Some(email);
    if let Err(e) = config.save() {
        tracing::warn!(error = %e, "Failed to save config");
    }

    println!("Logged in as {}", user.display_name());
    if let Some(minutes) = session.snapshot().await.minutes_until_expiry {
        println!("Access token valid for {} more minutes", minutes);
    }
    Ok(())
}

async fn whoami(session: &SessionContext) -> Result<()> {
    match session.load_user().await? {
        Some(user) => {
            println!("{}", user.display_name());
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        None => println!("Not logged in"),
    }
    Ok(())
}

async fn status(session: &SessionContext) -> Result<()> {
    // Errors are recorded in the snapshot
    let _ = session.load_user().await;
    let snapshot = session.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn refresh(session: &SessionContext) -> Result<()> {
    session.renew().await?;
    let snapshot = session.snapshot().await;
    match snapshot.minutes_until_expiry {
        Some(minutes) => println!("Token renewed, valid for {} minutes", minutes),
        None => println!("Token renewed"),
    }
    Ok(())
}

async fn validate(session: &SessionContext) -> Result<()> {
    let response = session.validate_token().await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn get(session: &SessionContext, path: &str) -> Result<()> {
    let response = session.get(path).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// Hold the session open: proactive renewal runs on its timer and token
/// changes from other processes sharing this handle's storage are picked up.
async fn keepalive(session: &SessionContext) -> Result<()> {
    if session.load_user().await?.is_none() {
        anyhow::bail!("Not logged in");
    }
    session.watch_storage();

    let mut ticker = tokio::time::interval(Duration::from_secs(KEEPALIVE_STATUS_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = session.snapshot().await;
                let next = session
                    .next_renewal()
                    .map(|t| t.format("%H:%M:%S").to_string())
                    .unwrap_or_else(|| "not scheduled".to_string());
                println!(
                    "authenticated={} expires_in={}m next_renewal={}{}",
                    snapshot.is_authenticated,
                    snapshot.minutes_until_expiry.unwrap_or(0),
                    next,
                    snapshot.error.map(|e| format!(" error={}", e)).unwrap_or_default(),
                );
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping");
                break;
            }
        }
    }

    session.shutdown();
    Ok(())
}
