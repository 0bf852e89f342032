//! porter-auth - terminal front-end for the Porter session core.
//!
//! Runs one command per invocation (login, signup, logout, status, verify,
//! refresh) against the configured backend, persisting the session between
//! runs.

mod app;
mod prompt;

use std::io;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{bail, Result};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use porter_auth_core::Config;

use app::App;

/// Set to `1` to also write logs to a daily file under the data directory.
const LOG_FILE_ENV: &str = "PORTER_LOG_FILE";

const LOG_FILE_PREFIX: &str = "porter-auth.log";

const USAGE: &str = "\
Usage: porter-auth <command> [args]

Commands:
  login [email]    Sign in
  signup [email]   Create an account
  logout           Sign out and forget the stored session
  status [--json]  Show the current session and check it with the server
  verify           Check the stored session with the server
  refresh          Exchange the refresh token for a new access token
  help             Show this message";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Login { email: Option<String> },
    Signup { email: Option<String> },
    Logout,
    Status { json: bool },
    Verify,
    Refresh,
    Help,
}

impl Command {
    fn parse(args: &[String]) -> Result<Self> {
        let mut args = args.iter().map(String::as_str);
        let command = match args.next() {
            None | Some("help" | "--help" | "-h") => Command::Help,
            Some("login") => Command::Login {
                email: args.next().map(str::to_string),
            },
            Some("signup") => Command::Signup {
                email: args.next().map(str::to_string),
            },
            Some("logout") => Command::Logout,
            Some("status") => Command::Status {
                json: matches!(args.next(), Some("--json")),
            },
            Some("verify") => Command::Verify,
            Some("refresh") => Command::Refresh,
            Some(other) => bail!("Unknown command: {}\n\n{}", other, USAGE),
        };
        Ok(command)
    }
}

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` controls the level (default `warn`). The returned guard must be
/// kept alive for the file writer to flush.
fn init_tracing(data_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let file_enabled = std::env::var(LOG_FILE_ENV).is_ok_and(|v| v == "1");
    let (file_layer, guard) = match data_dir.filter(|_| file_enabled) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir.join("logs"), LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

async fn run(command: Command, config: Config) -> Result<()> {
    if command == Command::Help {
        println!("{}", USAGE);
        return Ok(());
    }

    let mut app = App::new(config)?;
    match command {
        Command::Login { email } => app.login(email).await,
        Command::Signup { email } => app.signup(email).await,
        Command::Logout => app.logout().await,
        Command::Status { json } => app.status(json).await,
        Command::Verify => app.verify().await,
        Command::Refresh => app.refresh().await,
        Command::Help => Ok(()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match Command::parse(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };

    let config = Config::load_or_default();
    let data_dir = config.data_dir().ok();
    let _log_guard = init_tracing(data_dir.as_deref());
    info!(command = ?command, "porter-auth starting");
    debug!(api_url = %config.api_base_url(), "Using backend");

    match run(command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
