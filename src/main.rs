//! Command-line client for gotty web terminals.
//!
//! # Usage
//!
//! ```bash
//! # Run a command and print its output
//! gotty-client --url http://localhost:8080 -u admin -p admin exec "uname -a"
//!
//! # Send without waiting for output
//! gotty-client exec --no-wait "touch /tmp/marker"
//!
//! # Stream terminal output for 10 seconds
//! gotty-client tail --seconds 10
//! ```
//!
//! Connection settings come from flags, `GOTTY_*` environment variables
//! (a `.env` file is honored), or `.gotty/config.toml`.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gotty_client::{ClientConfig, Credentials, GottyClient};

/// CLI arguments.
#[derive(Parser)]
#[command(name = "gotty-client")]
#[command(about = "Drive a remote shell through a gotty web terminal")]
#[command(version)]
struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    command: Commands,

    /// Web UI URL (e.g. http://localhost:8080).
    #[arg(long, env = "GOTTY_URL", global = true)]
    url: Option<String>,

    /// Basic auth username.
    #[arg(short, long, env = "GOTTY_USERNAME", global = true)]
    username: Option<String>,

    /// Basic auth password.
    #[arg(short, long, env = "GOTTY_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    /// Path to a TOML config file.
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Connection timeout in seconds.
    #[arg(long, value_name = "SECS", global = true)]
    timeout: Option<u64>,

    /// Skip the HTTP check of the web UI before connecting.
    #[arg(long, global = true)]
    no_preflight: bool,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Run a command and print its output.
    Exec {
        /// Command line to send.
        #[arg(value_name = "COMMAND")]
        command: String,

        /// Return as soon as the command is written.
        #[arg(long)]
        no_wait: bool,

        /// Response timeout in milliseconds.
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },

    /// Stream terminal output.
    Tail {
        /// Print the last N buffered lines when done.
        #[arg(long, value_name = "N")]
        lines: Option<usize>,

        /// How long to stream, in seconds.
        #[arg(long, value_name = "SECS", default_value_t = 5)]
        seconds: u64,
    },
}

impl Cli {
    /// Resolves the client configuration from file and flags.
    fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let mut config = match (&self.config, &self.url) {
            (Some(path), _) => ClientConfig::load_from_path(path)?,
            (None, Some(url)) => ClientConfig::new(url.as_str(), "", ""),
            (None, None) => ClientConfig::load()
                .context("No --url given and no config file found")?,
        };

        if let Some(url) = &self.url {
            config.webui_url = url.clone();
        }
        if self.username.is_some() || self.password.is_some() {
            let username = self
                .username
                .clone()
                .unwrap_or_else(|| config.credentials.username.clone());
            let password = self
                .password
                .clone()
                .unwrap_or_else(|| config.credentials.password.clone());
            config.credentials = Credentials::new(username, password);
        }
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
        if self.no_preflight {
            config.preflight = false;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    // Only log to stderr so logs never mix with terminal output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gotty_client=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let client = GottyClient::new(cli.client_config()?)?;

    if !client.connect().await {
        eprintln!("Error: failed to connect to {}", client.config().webui_url);
        return Ok(ExitCode::FAILURE);
    }

    let exit_code = match cli.command {
        Commands::Exec {
            command,
            no_wait,
            timeout_ms,
        } => {
            let response = client
                .execute_command(&command, !no_wait, timeout_ms.map(Duration::from_millis))
                .await;
            if let Some(data) = &response.data {
                print!("{}", data);
                std::io::stdout().flush().ok();
            }
            if response.success {
                ExitCode::SUCCESS
            } else {
                eprintln!("Error: {}", response.message);
                ExitCode::from(response.status_code.clamp(1, 255) as u8)
            }
        }
        Commands::Tail { lines, seconds } => {
            client.add_output_callback(|text| {
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
            });

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }

            if let Some(n) = lines {
                println!();
                for line in client.get_terminal_output(Some(n)) {
                    print!("{}", line);
                }
                std::io::stdout().flush().ok();
            }
            ExitCode::SUCCESS
        }
    };

    client.close().await;
    Ok(exit_code)
}
