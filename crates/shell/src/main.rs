//! FileShell client
//!
//! Interactive shell for a remote file-management server.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use protocol::messages::LoginRequest;
use protocol::StaticKeypair;
use shell::config::Config;
use shell::connect::{connect, login, ConnectOptions};
use shell::{ExitReason, Shell, ShellSettings};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// FileShell - secure remote file-management shell.
#[derive(Parser, Debug)]
#[command(name = "fileshell")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Server host (overrides the config file)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Server port (overrides the config file)
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Account name; asked for interactively when omitted
    #[arg(short, long, global = true)]
    pub user: Option<String>,

    /// Subcommand to execute (defaults to `connect`)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Connect, log in and start the interactive shell
    Connect,

    /// Print this client's key fingerprint, generating the key on first use
    Fingerprint,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    let overrides = config.apply_env_overrides();
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.verbose {
        config.client.log_level = "debug".to_string();
    }
    config.validate()?;

    // Dropped on return from main, which flushes buffered log lines on every
    // exit path.
    let _guard = init_logging(&config.client.log_level, config.client.log_file.as_deref())?;
    for applied in &overrides {
        applied.log();
    }
    tracing::debug!(server = %config.server_address(), "FileShell client starting");

    let status = match cli.command.unwrap_or(Commands::Connect) {
        Commands::Fingerprint => {
            let keypair = load_identity(&config.client.identity_path)?;
            println!("Client key:  {}", keypair.public().to_hex());
            println!("Fingerprint: {}", keypair.public().fingerprint());
            0
        }
        Commands::Connect => exit_status(run_client(&config, cli.user).await?),
    };

    Ok(ExitCode::from(status))
}

/// Process exit status for how the shell ended: 1 when the session was
/// closed by a verification failure or a lost connection.
fn exit_status(reason: ExitReason) -> u8 {
    match reason {
        ExitReason::VerificationFailed | ExitReason::ConnectionLost => 1,
        ExitReason::UserExit | ExitReason::EndOfInput => 0,
    }
}

async fn run_client(config: &Config, user: Option<String>) -> anyhow::Result<ExitReason> {
    let keypair = load_identity(&config.client.identity_path)?;
    let options = ConnectOptions {
        address: config.server_address(),
        timeout: Duration::from_secs(config.server.connect_timeout),
        server_key: config.pinned_server_key()?,
    };

    let mut stdin = BufReader::new(tokio::io::stdin());
    let username = match user {
        Some(user) => user,
        None => read_username(&mut stdin).await?,
    };
    let password = tokio::task::spawn_blocking(|| rpassword::prompt_password("Password: "))
        .await
        .context("Password prompt task failed")?
        .context("Failed to read password")?;

    let channel = connect(&options, &keypair)
        .await
        .with_context(|| format!("Failed to connect to {}", options.address))?;

    if options.server_key.is_none() {
        if let Some(server) = protocol::SecureChannel::remote_static(&channel) {
            println!("Server key fingerprint: {}", server.fingerprint());
            println!("Set server.server_key to {} to pin it.", server.to_hex());
        }
    }

    let mut session = login(channel, LoginRequest::new(username, password)).await?;
    println!("Connected to {}. Type 'help' for commands.", options.address);

    let settings = ShellSettings {
        chunk_size: config.transfer.chunk_size,
        download_dir: config.transfer.download_dir.clone(),
    };
    let mut shell = Shell::new(&mut session, stdin, tokio::io::stdout(), settings);
    let reason = shell.run().await.context("Terminal I/O failed")?;

    tracing::debug!(?reason, "Shell exited");
    Ok(reason)
}

async fn read_username<R: AsyncBufRead + Unpin>(input: &mut R) -> anyhow::Result<String> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"Username: ").await?;
    stdout.flush().await?;

    let mut line = String::new();
    input.read_line(&mut line).await?;
    let username = line.trim().to_string();
    if username.is_empty() {
        anyhow::bail!("A username is required");
    }
    Ok(username)
}

fn load_identity(path: &Path) -> anyhow::Result<StaticKeypair> {
    StaticKeypair::load_or_generate(path)
        .with_context(|| format!("Failed to load client key: {}", path.display()))
}

/// Installs the global subscriber. Logs go to stderr so they never mix with
/// shell output, or to `log_file` when one is set. The returned guard must
/// live until exit so buffered lines are flushed.
fn init_logging(level: &str, log_file: Option<&Path>) -> anyhow::Result<WorkerGuard> {
    let filter = EnvFilter::try_from_env("FILESHELL_LOG_FILTER")
        .unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()));

    let (writer, guard) = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create log directory: {}", parent.display())
                })?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(log_file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(guard)
}
