//! finmgr - command-line client for the finmgr business-management service.
//!
//! Logs in, registers, and inspects the current session. The session token
//! is persisted between runs so later commands are authenticated.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use finmgr_core::models::ProfileUpdate;
use finmgr_core::{ApiClient, Config};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "finmgr", version, about = "Client for the finmgr service")]
struct Cli {
    /// Service base URL (overrides the config file)
    #[arg(long, env = "FM_API_BASE", global = true)]
    api_base: Option<String>,

    /// Also write logs to a daily-rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and store the session token
    Login {
        #[arg(long)]
        email: Option<String>,
    },
    /// Create an account, then log in
    Register {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        company: Option<String>,
    },
    /// Forget the stored session
    Logout,
    /// Show whether a session is stored
    Status,
    /// Show the logged-in user's profile
    Me,
    /// Change the account password
    ChangePassword,
    /// Change email and/or company name
    UpdateProfile {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        company: Option<String>,
    },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "finmgr.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
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

fn prompt_line(label: &str, default: Option<&str>) -> Result<String> {
    match default {
        Some(d) => eprint!("{} [{}]: ", label, d),
        None => eprint!("{}: ", label),
    }
    io::stderr().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let line = line.trim();
    match (line.is_empty(), default) {
        (true, Some(d)) => Ok(d.to_string()),
        _ => Ok(line.to_string()),
    }
}

fn prompt_password(label: &str) -> Result<String> {
    rpassword::prompt_password(format!("{}: ", label)).context("Failed to read password")
}

fn resolve_email(given: Option<String>, config: &Config) -> Result<String> {
    match given {
        Some(email) => Ok(email),
        None => prompt_line("Email", config.last_email.as_deref()),
    }
}

fn remember_email(email: &str) {
    if let Err(e) = Config::remember_email(email) {
        warn!(error = %e, "Failed to save config");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_dir.as_ref());

    let mut config = Config::load()?;
    if let Some(base) = cli.api_base {
        config.api_base = base;
    }
    info!(api_base = %config.api_base, "finmgr starting");

    let client = ApiClient::builder(&config).build()?;

    match cli.command {
        Command::Login { email } => {
            let email = resolve_email(email, &config)?;
            let password = prompt_password("Password")?;
            client.login(&email, &password).await?;
            remember_email(&email);
            println!("Logged in as {}", email);
        }
        Command::Register { email, company } => {
            let email = resolve_email(email, &config)?;
            let password = prompt_password("Password")?;
            let confirm = prompt_password("Confirm password")?;
            if password != confirm {
                anyhow::bail!("Passwords do not match");
            }
            client.register(&email, &password, company.as_deref()).await?;
            remember_email(&email);
            println!("Registered and logged in as {}", email);
        }
        Command::Logout => {
            client.logout().await;
            println!("Logged out");
        }
        Command::Status => match (client.is_authenticated().await, client.email().await) {
            (true, Some(email)) => println!("Logged in as {} ({})", email, client.base_url()),
            (true, None) => println!("Logged in ({})", client.base_url()),
            (false, _) => println!("Not logged in"),
        },
        Command::Me => {
            let user = client.me().await?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        Command::ChangePassword => {
            let current = prompt_password("Current password")?;
            let new = prompt_password("New password")?;
            client.change_password(&current, &new).await?;
            println!("Password changed");
        }
        Command::UpdateProfile { email, company } => {
            let update = ProfileUpdate {
                email,
                company_name: company,
            };
            if update.is_empty() {
                anyhow::bail!("Nothing to update: pass --email and/or --company");
            }
            client.update_profile(&update).await?;
            if let Some(ref email) = update.email {
                remember_email(email);
            }
            println!("Profile updated");
        }
    }

    Ok(())
}
